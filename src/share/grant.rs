//! Grants: an owner lets someone else upload files to them.
//!
//! A grant expires through its own policy, counted in uploads. Files
//! uploaded through it get the grant's file policy and belong to the
//! grant's owner. A grant is removed only once it is expired and holds no
//! files.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Executor, Sqlite, SqliteConnection};
use tracing::info;
use uuid::Uuid;

use crate::config::Config;
use crate::datetime::http_date;
use crate::db::{Database, PublicUser, User, UserRepository};
use crate::expiry::{Expirable, ExpiryDefaults, ExpiryPolicy, ExpiryType};
use crate::file::{
    AggregateRefresher, ContentStore, DeletedFile, FileRecord, FileRepository, FileService,
    PendingBlobs, PublicFile, Upload,
};
use crate::{FransError, Result};

use super::password::{hash_password, verify_password};

const GRANT_COLUMNS: &str = "id, owner_id, comment, hashed_password, created_at, expiry_type, \
     expiry_total_days, expiry_days_since_last_upload, expiry_total_uploads, file_expiry_type, \
     file_expiry_total_days, file_expiry_days_since_last_download, file_expiry_total_downloads, \
     last_upload, times_uploaded, email_on_upload, creator_lang";

/// Grant entity.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Grant {
    pub id: String,
    pub owner_id: String,
    pub comment: Option<String>,
    pub hashed_password: String,
    pub created_at: DateTime<Utc>,
    #[sqlx(try_from = "String")]
    pub expiry_type: ExpiryType,
    pub expiry_total_days: i64,
    pub expiry_days_since_last_upload: i64,
    pub expiry_total_uploads: i64,
    #[sqlx(try_from = "String")]
    pub file_expiry_type: ExpiryType,
    pub file_expiry_total_days: i64,
    pub file_expiry_days_since_last_download: i64,
    pub file_expiry_total_downloads: i64,
    pub last_upload: Option<DateTime<Utc>>,
    pub times_uploaded: i64,
    /// Address notified when files are uploaded.
    pub email_on_upload: Option<String>,
    pub creator_lang: String,
}

impl Grant {
    /// Policy given to files uploaded through this grant.
    pub fn file_policy(&self) -> ExpiryPolicy {
        ExpiryPolicy::new(
            self.file_expiry_type,
            self.file_expiry_total_days,
            self.file_expiry_days_since_last_download,
            self.file_expiry_total_downloads,
        )
    }

    pub fn verify_password(&self, password: &str) -> Result<bool> {
        verify_password(password, &self.hashed_password)
    }
}

impl Expirable for Grant {
    fn policy(&self) -> ExpiryPolicy {
        ExpiryPolicy::new(
            self.expiry_type,
            self.expiry_total_days,
            self.expiry_days_since_last_upload,
            self.expiry_total_uploads,
        )
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn last_event(&self) -> Option<DateTime<Utc>> {
        self.last_upload
    }

    fn event_count(&self) -> i64 {
        self.times_uploaded
    }
}

/// A grant together with the files uploaded through it.
#[derive(Debug, Clone)]
pub struct GrantWithFiles {
    pub grant: Grant,
    pub files: Vec<FileRecord>,
}

impl GrantWithFiles {
    /// Whether the lifecycle sweep should delete this grant at `now`.
    pub fn should_delete(&self, defaults: &ExpiryDefaults, now: DateTime<Utc>) -> bool {
        self.files.is_empty() && self.grant.should_delete(defaults, now)
    }
}

/// New grant for creation.
#[derive(Debug, Clone)]
pub struct NewGrant {
    pub password: String,
    pub policy: ExpiryPolicy,
    pub file_policy: ExpiryPolicy,
    pub comment: Option<String>,
    pub email_on_upload: Option<String>,
    pub creator_lang: String,
}

impl NewGrant {
    pub fn new(password: impl Into<String>, policy: ExpiryPolicy, file_policy: ExpiryPolicy) -> Self {
        Self {
            password: password.into(),
            policy,
            file_policy,
            comment: None,
            email_on_upload: None,
            creator_lang: "en".to_string(),
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn with_email_on_upload(mut self, email: impl Into<String>) -> Self {
        self.email_on_upload = Some(email.into());
        self
    }

    pub fn with_creator_lang(mut self, lang: impl Into<String>) -> Self {
        self.creator_lang = lang.into();
        self
    }
}

/// Grant as shown to users.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicGrant {
    pub id: String,
    pub comment: Option<String>,
    pub estimated_expiry: Option<String>,
    pub owner: PublicUser,
    pub files: Vec<PublicFile>,
    pub created_at: String,
    pub times_uploaded: i64,
    pub last_upload: Option<String>,
}

/// Queries over `grants` and `grant_files`.
pub struct GrantRepository;

impl GrantRepository {
    /// Insert a grant row.
    pub async fn insert(
        conn: &mut SqliteConnection,
        owner_id: &str,
        new_grant: &NewGrant,
        hashed_password: &str,
    ) -> Result<Grant> {
        let id = Uuid::new_v4().to_string();
        let policy = &new_grant.policy;
        let file_policy = &new_grant.file_policy;

        sqlx::query(
            "INSERT INTO grants (id, owner_id, comment, hashed_password, created_at,
                 expiry_type, expiry_total_days, expiry_days_since_last_upload,
                 expiry_total_uploads, file_expiry_type, file_expiry_total_days,
                 file_expiry_days_since_last_download, file_expiry_total_downloads,
                 email_on_upload, creator_lang)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
        )
        .bind(&id)
        .bind(owner_id)
        .bind(&new_grant.comment)
        .bind(hashed_password)
        .bind(Utc::now())
        .bind(policy.expiry_type.as_str())
        .bind(policy.total_days)
        .bind(policy.days_since_last_event)
        .bind(policy.total_events)
        .bind(file_policy.expiry_type.as_str())
        .bind(file_policy.total_days)
        .bind(file_policy.days_since_last_event)
        .bind(file_policy.total_events)
        .bind(&new_grant.email_on_upload)
        .bind(&new_grant.creator_lang)
        .execute(&mut *conn)
        .await?;

        Self::get_by_id(&mut *conn, &id)
            .await?
            .ok_or_else(|| FransError::NotFound("grant".into()))
    }

    /// Get a grant by ID.
    pub async fn get_by_id<'e, E>(executor: E, id: &str) -> Result<Option<Grant>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let grant = sqlx::query_as::<_, Grant>(&format!(
            "SELECT {GRANT_COLUMNS} FROM grants WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(executor)
        .await?;
        Ok(grant)
    }

    /// List all grant IDs.
    pub async fn list_ids<'e, E>(executor: E) -> Result<Vec<String>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let ids = sqlx::query_scalar("SELECT id FROM grants ORDER BY created_at")
            .fetch_all(executor)
            .await?;
        Ok(ids)
    }

    /// List a user's grants, newest first.
    pub async fn list_by_owner<'e, E>(executor: E, owner_id: &str) -> Result<Vec<Grant>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let grants = sqlx::query_as::<_, Grant>(&format!(
            "SELECT {GRANT_COLUMNS} FROM grants WHERE owner_id = $1 ORDER BY created_at DESC"
        ))
        .bind(owner_id)
        .fetch_all(executor)
        .await?;
        Ok(grants)
    }

    /// Attach a file to a grant.
    pub async fn attach_file<'e, E>(executor: E, grant_id: &str, file_id: &str) -> Result<()>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query("INSERT INTO grant_files (grant_id, file_id) VALUES ($1, $2)")
            .bind(grant_id)
            .bind(file_id)
            .execute(executor)
            .await?;
        Ok(())
    }

    /// Count an upload batch.
    pub async fn record_upload<'e, E>(executor: E, id: &str, now: DateTime<Utc>) -> Result<bool>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let result = sqlx::query(
            "UPDATE grants SET times_uploaded = times_uploaded + 1, last_upload = $1
             WHERE id = $2",
        )
        .bind(now)
        .bind(id)
        .execute(executor)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete a grant row. Attached files must be deleted first.
    pub async fn delete<'e, E>(executor: E, id: &str) -> Result<bool>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let result = sqlx::query("DELETE FROM grants WHERE id = $1")
            .bind(id)
            .execute(executor)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Load a grant with its files.
    pub async fn load(conn: &mut SqliteConnection, id: &str) -> Result<Option<GrantWithFiles>> {
        let Some(grant) = Self::get_by_id(&mut *conn, id).await? else {
            return Ok(None);
        };
        let files = FileRepository::list_for_grant(&mut *conn, id).await?;
        Ok(Some(GrantWithFiles { grant, files }))
    }
}

/// Grant service.
pub struct GrantService<'a> {
    db: &'a Database,
    files: FileService<'a>,
    defaults: ExpiryDefaults,
    max_files: usize,
}

impl<'a> GrantService<'a> {
    pub fn new(db: &'a Database, store: &'a ContentStore, config: &Config) -> Self {
        Self {
            db,
            files: FileService::new(db, store, config.file_expiry()),
            defaults: config.grant_expiry(),
            max_files: config.files.max_files,
        }
    }

    pub fn defaults(&self) -> &ExpiryDefaults {
        &self.defaults
    }

    /// Create an empty grant.
    pub async fn create_grant(&self, owner: &User, new_grant: NewGrant) -> Result<Grant> {
        new_grant.policy.validate()?;
        new_grant.file_policy.validate()?;
        let hashed_password = hash_password(&new_grant.password)?;

        let mut tx = self.db.begin().await?;
        let grant = GrantRepository::insert(&mut tx, &owner.id, &new_grant, &hashed_password)
            .await?;
        UserRepository::increment_submitted_grants(&mut tx, &owner.id).await?;
        tx.commit().await?;

        info!(grant_id = %grant.id, owner = %owner.username, "grant created");
        Ok(grant)
    }

    /// Upload a batch of files through a grant.
    ///
    /// The whole batch counts as one upload. An expired grant accepts nothing.
    pub async fn upload_files(&self, grant_id: &str, uploads: Vec<Upload>) -> Result<Vec<FileRecord>> {
        if uploads.is_empty() {
            return Err(FransError::Validation("no files to upload".into()));
        }
        if uploads.len() > self.max_files {
            return Err(FransError::TooManyFiles {
                count: uploads.len(),
                max: self.max_files,
            });
        }

        let mut tx = self.db.begin().await?;
        let mut pending = self.files.store().pending();
        let result = self.upload_in(&mut tx, grant_id, uploads, &mut pending).await;
        let files = pending.settle(tx, result).await?;

        info!(grant_id, files = files.len(), "files uploaded through grant");
        Ok(files)
    }

    async fn upload_in(
        &self,
        conn: &mut SqliteConnection,
        grant_id: &str,
        uploads: Vec<Upload>,
        pending: &mut PendingBlobs,
    ) -> Result<Vec<FileRecord>> {
        let grant = GrantRepository::get_by_id(&mut *conn, grant_id)
            .await?
            .ok_or_else(|| FransError::NotFound("grant".into()))?;
        let now = Utc::now();
        if self.is_expired(&grant, now) {
            return Err(FransError::Permission("grant has expired".into()));
        }

        let mut files = Vec::with_capacity(uploads.len());
        for upload in uploads {
            let file = self
                .files
                .create_file(&mut *conn, upload, &grant.owner_id, grant.file_policy(), pending)
                .await?;
            GrantRepository::attach_file(&mut *conn, &grant.id, &file.id).await?;
            files.push(file);
        }
        GrantRepository::record_upload(&mut *conn, &grant.id, now).await?;
        Ok(files)
    }

    /// Get a grant with its files.
    pub async fn get(&self, id: &str) -> Result<GrantWithFiles> {
        let mut conn = self.db.pool().acquire().await?;
        GrantRepository::load(&mut conn, id)
            .await?
            .ok_or_else(|| FransError::NotFound("grant".into()))
    }

    /// List a user's grants with their files.
    pub async fn list(&self, user: &User) -> Result<Vec<GrantWithFiles>> {
        let mut conn = self.db.pool().acquire().await?;
        let grants = GrantRepository::list_by_owner(&mut *conn, &user.id).await?;

        let mut result = Vec::with_capacity(grants.len());
        for grant in grants {
            let files = FileRepository::list_for_grant(&mut *conn, &grant.id).await?;
            result.push(GrantWithFiles { grant, files });
        }
        Ok(result)
    }

    pub fn estimated_expiry(&self, grant: &Grant) -> Option<DateTime<Utc>> {
        grant.estimated_expiry(&self.defaults)
    }

    /// Whether the grant no longer accepts uploads.
    pub fn is_expired(&self, grant: &Grant, now: DateTime<Utc>) -> bool {
        grant.should_delete(&self.defaults, now)
    }

    pub fn should_delete(&self, grant: &GrantWithFiles, now: DateTime<Utc>) -> bool {
        grant.should_delete(&self.defaults, now)
    }

    /// Delete a grant and all its files on behalf of its owner or an admin.
    pub async fn delete_grant(&self, actor: &User, id: &str) -> Result<bool> {
        let Some(grant) = GrantRepository::get_by_id(self.db.pool(), id).await? else {
            return Ok(false);
        };
        if !actor.is_admin && actor.id != grant.owner_id {
            return Err(FransError::Permission(
                "only the owner may delete a grant".into(),
            ));
        }

        let mut tx = self.db.begin().await?;
        let mut pending = self.files.store().pending();
        let result = match self.delete_in(&mut tx, id, &mut pending).await {
            Ok(Some(_)) => {
                AggregateRefresher::refresh_or_log(&mut tx, &grant.owner_id).await;
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(e) => Err(e),
        };
        let deleted = pending.settle(tx, result).await?;

        if deleted {
            info!(grant_id = id, actor = %actor.username, "grant deleted");
        }
        Ok(deleted)
    }

    /// Delete a grant and its files inside the caller's transaction.
    ///
    /// Returns the deleted files, or `None` if the grant was already gone.
    pub async fn delete_in(
        &self,
        conn: &mut SqliteConnection,
        id: &str,
        pending: &mut PendingBlobs,
    ) -> Result<Option<Vec<DeletedFile>>> {
        let file_ids: Vec<String> =
            sqlx::query_scalar("SELECT file_id FROM grant_files WHERE grant_id = $1")
                .bind(id)
                .fetch_all(&mut *conn)
                .await?;

        let mut deleted = Vec::with_capacity(file_ids.len());
        for file_id in &file_ids {
            if let Some(file) = self.files.delete_in(&mut *conn, file_id, pending).await? {
                deleted.push(file);
            }
        }

        if !GrantRepository::delete(&mut *conn, id).await? {
            return Ok(None);
        }
        Ok(Some(deleted))
    }

    /// Public representation of a grant.
    pub fn to_public(&self, grant: &GrantWithFiles, owner: &User) -> PublicGrant {
        PublicGrant {
            id: grant.grant.id.clone(),
            comment: grant.grant.comment.clone(),
            estimated_expiry: self.estimated_expiry(&grant.grant).as_ref().map(http_date),
            owner: PublicUser::from(owner),
            files: grant.files.iter().map(|f| self.files.to_public(f)).collect(),
            created_at: http_date(&grant.grant.created_at),
            times_uploaded: grant.grant.times_uploaded,
            last_upload: grant.grant.last_upload.as_ref().map(http_date),
        }
    }
}
