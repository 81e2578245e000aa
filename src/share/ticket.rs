//! Tickets: an owner shares a set of files with a receiver.
//!
//! A ticket's own expiry is driven by the latest download across its files.
//! It is deleted once it holds no files, or once it has expired and none of
//! its files would survive on their own.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Executor, Sqlite, SqliteConnection};
use tracing::info;
use uuid::Uuid;

use crate::config::Config;
use crate::datetime::http_date;
use crate::db::{Database, PublicUser, User, UserRepository};
use crate::expiry::{self, Expirable, ExpiryDefaults, ExpiryPolicy, ExpiryType};
use crate::file::{
    AggregateRefresher, ContentStore, DeletedFile, FileRecord, FileRepository, FileService,
    PendingBlobs, PublicFile, Upload,
};
use crate::{FransError, Result};

use super::password::{hash_password, verify_password};

const TICKET_COLUMNS: &str = "id, owner_id, comment, hashed_password, created_at, expiry_type, \
     expiry_total_days, expiry_days_since_last_download, expiry_total_downloads, \
     email_on_download, creator_lang";

/// Ticket entity.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Ticket {
    pub id: String,
    pub owner_id: String,
    pub comment: Option<String>,
    pub hashed_password: String,
    pub created_at: DateTime<Utc>,
    #[sqlx(try_from = "String")]
    pub expiry_type: ExpiryType,
    pub expiry_total_days: i64,
    pub expiry_days_since_last_download: i64,
    pub expiry_total_downloads: i64,
    /// Address notified when a file is downloaded.
    pub email_on_download: Option<String>,
    pub creator_lang: String,
}

impl Ticket {
    pub fn policy(&self) -> ExpiryPolicy {
        ExpiryPolicy::new(
            self.expiry_type,
            self.expiry_total_days,
            self.expiry_days_since_last_download,
            self.expiry_total_downloads,
        )
    }

    pub fn verify_password(&self, password: &str) -> Result<bool> {
        verify_password(password, &self.hashed_password)
    }
}

/// A ticket together with its attached files.
#[derive(Debug, Clone)]
pub struct TicketWithFiles {
    pub ticket: Ticket,
    pub files: Vec<FileRecord>,
}

impl TicketWithFiles {
    /// Most recent download of any attached file.
    pub fn latest_download(&self) -> Option<DateTime<Utc>> {
        self.files.iter().filter_map(|f| f.last_download).max()
    }

    pub fn estimated_expiry(&self, defaults: &ExpiryDefaults) -> Option<DateTime<Utc>> {
        expiry::estimated_expiry(
            &self.ticket.policy(),
            defaults,
            self.ticket.created_at,
            self.latest_download(),
        )
    }

    /// Whether the lifecycle sweep should delete this ticket at `now`.
    pub fn should_delete(&self, defaults: &ExpiryDefaults, now: DateTime<Utc>) -> bool {
        if self.files.is_empty() {
            return true;
        }
        let expired = self
            .estimated_expiry(defaults)
            .is_some_and(|expiry| expiry < now);
        expired && self.files.iter().all(|f| f.should_delete(defaults, now))
    }
}

/// New ticket for creation.
#[derive(Debug, Clone)]
pub struct NewTicket {
    pub password: String,
    pub policy: ExpiryPolicy,
    pub comment: Option<String>,
    pub email_on_download: Option<String>,
    pub creator_lang: String,
}

impl NewTicket {
    pub fn new(password: impl Into<String>, policy: ExpiryPolicy) -> Self {
        Self {
            password: password.into(),
            policy,
            comment: None,
            email_on_download: None,
            creator_lang: "en".to_string(),
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn with_email_on_download(mut self, email: impl Into<String>) -> Self {
        self.email_on_download = Some(email.into());
        self
    }

    pub fn with_creator_lang(mut self, lang: impl Into<String>) -> Self {
        self.creator_lang = lang.into();
        self
    }
}

/// Ticket as shown to users.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicTicket {
    pub id: String,
    pub comment: Option<String>,
    pub estimated_expiry: Option<String>,
    pub owner: PublicUser,
    pub files: Vec<PublicFile>,
    pub created_at: String,
}

/// Queries over `tickets` and `ticket_files`.
pub struct TicketRepository;

impl TicketRepository {
    /// Insert a ticket row.
    pub async fn insert(
        conn: &mut SqliteConnection,
        owner_id: &str,
        new_ticket: &NewTicket,
        hashed_password: &str,
    ) -> Result<Ticket> {
        let id = Uuid::new_v4().to_string();
        let policy = &new_ticket.policy;

        sqlx::query(
            "INSERT INTO tickets (id, owner_id, comment, hashed_password, created_at,
                 expiry_type, expiry_total_days, expiry_days_since_last_download,
                 expiry_total_downloads, email_on_download, creator_lang)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(&id)
        .bind(owner_id)
        .bind(&new_ticket.comment)
        .bind(hashed_password)
        .bind(Utc::now())
        .bind(policy.expiry_type.as_str())
        .bind(policy.total_days)
        .bind(policy.days_since_last_event)
        .bind(policy.total_events)
        .bind(&new_ticket.email_on_download)
        .bind(&new_ticket.creator_lang)
        .execute(&mut *conn)
        .await?;

        Self::get_by_id(&mut *conn, &id)
            .await?
            .ok_or_else(|| FransError::NotFound("ticket".into()))
    }

    /// Get a ticket by ID.
    pub async fn get_by_id<'e, E>(executor: E, id: &str) -> Result<Option<Ticket>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let ticket = sqlx::query_as::<_, Ticket>(&format!(
            "SELECT {TICKET_COLUMNS} FROM tickets WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(executor)
        .await?;
        Ok(ticket)
    }

    /// List all ticket IDs.
    pub async fn list_ids<'e, E>(executor: E) -> Result<Vec<String>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let ids = sqlx::query_scalar("SELECT id FROM tickets ORDER BY created_at")
            .fetch_all(executor)
            .await?;
        Ok(ids)
    }

    /// List a user's tickets, newest first.
    pub async fn list_by_owner<'e, E>(executor: E, owner_id: &str) -> Result<Vec<Ticket>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let tickets = sqlx::query_as::<_, Ticket>(&format!(
            "SELECT {TICKET_COLUMNS} FROM tickets WHERE owner_id = $1 ORDER BY created_at DESC"
        ))
        .bind(owner_id)
        .fetch_all(executor)
        .await?;
        Ok(tickets)
    }

    /// Attach a file to a ticket.
    pub async fn attach_file<'e, E>(executor: E, ticket_id: &str, file_id: &str) -> Result<()>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query("INSERT INTO ticket_files (ticket_id, file_id) VALUES ($1, $2)")
            .bind(ticket_id)
            .bind(file_id)
            .execute(executor)
            .await?;
        Ok(())
    }

    /// Delete a ticket row. Attached files must be deleted first.
    pub async fn delete<'e, E>(executor: E, id: &str) -> Result<bool>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let result = sqlx::query("DELETE FROM tickets WHERE id = $1")
            .bind(id)
            .execute(executor)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Load a ticket with its files.
    pub async fn load(conn: &mut SqliteConnection, id: &str) -> Result<Option<TicketWithFiles>> {
        let Some(ticket) = Self::get_by_id(&mut *conn, id).await? else {
            return Ok(None);
        };
        let files = FileRepository::list_for_ticket(&mut *conn, id).await?;
        Ok(Some(TicketWithFiles { ticket, files }))
    }
}

/// Ticket service.
pub struct TicketService<'a> {
    db: &'a Database,
    files: FileService<'a>,
    max_files: usize,
}

impl<'a> TicketService<'a> {
    pub fn new(db: &'a Database, store: &'a ContentStore, config: &Config) -> Self {
        Self {
            db,
            files: FileService::new(db, store, config.file_expiry()),
            max_files: config.files.max_files,
        }
    }

    fn defaults(&self) -> &ExpiryDefaults {
        self.files.defaults()
    }

    /// Create a ticket holding `uploads`, all in one transaction.
    ///
    /// Files inherit the ticket's expiry policy.
    pub async fn create_ticket(
        &self,
        owner: &User,
        new_ticket: NewTicket,
        uploads: Vec<Upload>,
    ) -> Result<TicketWithFiles> {
        if uploads.len() > self.max_files {
            return Err(FransError::TooManyFiles {
                count: uploads.len(),
                max: self.max_files,
            });
        }
        new_ticket.policy.validate()?;
        let hashed_password = hash_password(&new_ticket.password)?;

        let mut tx = self.db.begin().await?;
        let mut pending = self.files.store().pending();
        let result = self
            .create_in(&mut tx, owner, &new_ticket, &hashed_password, uploads, &mut pending)
            .await;
        let created = pending.settle(tx, result).await?;

        info!(
            ticket_id = %created.ticket.id,
            owner = %owner.username,
            files = created.files.len(),
            "ticket created"
        );
        Ok(created)
    }

    async fn create_in(
        &self,
        conn: &mut SqliteConnection,
        owner: &User,
        new_ticket: &NewTicket,
        hashed_password: &str,
        uploads: Vec<Upload>,
        pending: &mut PendingBlobs,
    ) -> Result<TicketWithFiles> {
        let ticket =
            TicketRepository::insert(&mut *conn, &owner.id, new_ticket, hashed_password).await?;

        let mut files = Vec::with_capacity(uploads.len());
        for upload in uploads {
            let file = self
                .files
                .create_file(&mut *conn, upload, &owner.id, ticket.policy(), pending)
                .await?;
            TicketRepository::attach_file(&mut *conn, &ticket.id, &file.id).await?;
            files.push(file);
        }

        UserRepository::increment_submitted_tickets(&mut *conn, &owner.id).await?;
        Ok(TicketWithFiles { ticket, files })
    }

    /// Get a ticket with its files.
    pub async fn get(&self, id: &str) -> Result<TicketWithFiles> {
        let mut conn = self.db.pool().acquire().await?;
        TicketRepository::load(&mut conn, id)
            .await?
            .ok_or_else(|| FransError::NotFound("ticket".into()))
    }

    /// List a user's tickets with their files.
    pub async fn list(&self, user: &User) -> Result<Vec<TicketWithFiles>> {
        let mut conn = self.db.pool().acquire().await?;
        let tickets = TicketRepository::list_by_owner(&mut *conn, &user.id).await?;

        let mut result = Vec::with_capacity(tickets.len());
        for ticket in tickets {
            let files = FileRepository::list_for_ticket(&mut *conn, &ticket.id).await?;
            result.push(TicketWithFiles { ticket, files });
        }
        Ok(result)
    }

    pub fn estimated_expiry(&self, ticket: &TicketWithFiles) -> Option<DateTime<Utc>> {
        ticket.estimated_expiry(self.defaults())
    }

    pub fn should_delete(&self, ticket: &TicketWithFiles, now: DateTime<Utc>) -> bool {
        ticket.should_delete(self.defaults(), now)
    }

    /// Delete a ticket and all its files on behalf of its owner or an admin.
    pub async fn delete_ticket(&self, actor: &User, id: &str) -> Result<bool> {
        let Some(ticket) = TicketRepository::get_by_id(self.db.pool(), id).await? else {
            return Ok(false);
        };
        if !actor.is_admin && actor.id != ticket.owner_id {
            return Err(FransError::Permission(
                "only the owner may delete a ticket".into(),
            ));
        }

        let mut tx = self.db.begin().await?;
        let mut pending = self.files.store().pending();
        let result = match self.delete_in(&mut tx, id, &mut pending).await {
            Ok(Some(_)) => {
                AggregateRefresher::refresh_or_log(&mut tx, &ticket.owner_id).await;
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(e) => Err(e),
        };
        let deleted = pending.settle(tx, result).await?;

        if deleted {
            info!(ticket_id = id, actor = %actor.username, "ticket deleted");
        }
        Ok(deleted)
    }

    /// Delete a ticket and its files inside the caller's transaction.
    ///
    /// Returns the deleted files, or `None` if the ticket was already gone.
    /// The caller refreshes aggregates and settles `pending`.
    pub async fn delete_in(
        &self,
        conn: &mut SqliteConnection,
        id: &str,
        pending: &mut PendingBlobs,
    ) -> Result<Option<Vec<DeletedFile>>> {
        let file_ids: Vec<String> =
            sqlx::query_scalar("SELECT file_id FROM ticket_files WHERE ticket_id = $1")
                .bind(id)
                .fetch_all(&mut *conn)
                .await?;

        let mut deleted = Vec::with_capacity(file_ids.len());
        for file_id in &file_ids {
            if let Some(file) = self.files.delete_in(&mut *conn, file_id, pending).await? {
                deleted.push(file);
            }
        }

        if !TicketRepository::delete(&mut *conn, id).await? {
            return Ok(None);
        }
        Ok(Some(deleted))
    }

    /// Public representation of a ticket.
    pub fn to_public(&self, ticket: &TicketWithFiles, owner: &User) -> PublicTicket {
        PublicTicket {
            id: ticket.ticket.id.clone(),
            comment: ticket.ticket.comment.clone(),
            estimated_expiry: self.estimated_expiry(ticket).as_ref().map(http_date),
            owner: PublicUser::from(owner),
            files: ticket.files.iter().map(|f| self.files.to_public(f)).collect(),
            created_at: http_date(&ticket.ticket.created_at),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::NewUser;
    use chrono::{Duration, TimeZone};
    use tempfile::TempDir;

    const DEFAULTS: ExpiryDefaults = ExpiryDefaults {
        total_days: 30,
        days_since_last_event: 7,
        total_events: 10,
    };

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn ticket(policy: ExpiryPolicy) -> Ticket {
        Ticket {
            id: "t1".into(),
            owner_id: "u1".into(),
            comment: None,
            hashed_password: String::new(),
            created_at: t0(),
            expiry_type: policy.expiry_type,
            expiry_total_days: policy.total_days,
            expiry_days_since_last_download: policy.days_since_last_event,
            expiry_total_downloads: policy.total_events,
            email_on_download: None,
            creator_lang: "en".into(),
        }
    }

    fn file(policy: ExpiryPolicy, last_download: Option<DateTime<Utc>>, times: i64) -> FileRecord {
        FileRecord {
            id: Uuid::new_v4().to_string(),
            name: "f".into(),
            owner_id: "u1".into(),
            blob_hash: "00".repeat(64),
            size: 1,
            created_at: t0(),
            last_download,
            times_downloaded: times,
            expiry_type: policy.expiry_type,
            expiry_total_days: policy.total_days,
            expiry_days_since_last_download: policy.days_since_last_event,
            expiry_total_downloads: policy.total_events,
        }
    }

    #[test]
    fn test_latest_download_across_files() {
        let twf = TicketWithFiles {
            ticket: ticket(ExpiryPolicy::auto()),
            files: vec![
                file(ExpiryPolicy::auto(), None, 0),
                file(ExpiryPolicy::auto(), Some(t0() + Duration::days(3)), 1),
                file(ExpiryPolicy::auto(), Some(t0() + Duration::days(20)), 1),
                file(ExpiryPolicy::auto(), None, 0),
            ],
        };
        assert_eq!(twf.latest_download(), Some(t0() + Duration::days(20)));
        assert_eq!(twf.estimated_expiry(&DEFAULTS), Some(t0() + Duration::days(27)));
    }

    #[test]
    fn test_ticket_without_files_is_deleted() {
        let twf = TicketWithFiles {
            ticket: ticket(ExpiryPolicy::none()),
            files: vec![],
        };
        assert!(twf.should_delete(&DEFAULTS, t0()));
    }

    #[test]
    fn test_ticket_kept_while_a_file_survives() {
        // The ticket's own policy lapsed, but its file never expires
        let twf = TicketWithFiles {
            ticket: ticket(ExpiryPolicy::custom(1, 1, 1)),
            files: vec![file(ExpiryPolicy::none(), None, 0)],
        };
        let now = t0() + Duration::days(40);
        assert!(twf.estimated_expiry(&DEFAULTS).unwrap() < now);
        assert!(!twf.should_delete(&DEFAULTS, now));
    }

    #[test]
    fn test_expired_ticket_with_expired_files_is_deleted() {
        let twf = TicketWithFiles {
            ticket: ticket(ExpiryPolicy::auto()),
            files: vec![file(ExpiryPolicy::auto(), None, 0)],
        };
        assert!(!twf.should_delete(&DEFAULTS, t0() + Duration::days(29)));
        assert!(twf.should_delete(&DEFAULTS, t0() + Duration::days(31)));
    }

    #[test]
    fn test_none_ticket_with_files_is_kept() {
        let twf = TicketWithFiles {
            ticket: ticket(ExpiryPolicy::none()),
            files: vec![file(ExpiryPolicy::none(), None, 0)],
        };
        assert_eq!(twf.estimated_expiry(&DEFAULTS), None);
        assert!(!twf.should_delete(&DEFAULTS, t0() + Duration::days(10_000)));
    }

    struct Fixture {
        db: Database,
        store: ContentStore,
        config: Config,
        owner: User,
        _dir: TempDir,
    }

    impl Fixture {
        fn service(&self) -> TicketService<'_> {
            TicketService::new(&self.db, &self.store, &self.config)
        }
    }

    async fn setup() -> Fixture {
        let db = Database::open_in_memory().await.unwrap();
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.files.max_files = 2;
        let store = ContentStore::new(dir.path(), 1024).unwrap();
        let owner = UserRepository::new(db.pool())
            .create(&NewUser::new("owner", "Owner"))
            .await
            .unwrap();
        Fixture {
            db,
            store,
            config,
            owner,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_create_ticket_with_files() {
        let fx = setup().await;
        let service = fx.service();

        let created = service
            .create_ticket(
                &fx.owner,
                NewTicket::new("secret", ExpiryPolicy::custom(5, 2, 3)).with_comment("hi"),
                vec![
                    Upload::from_bytes("a.txt", b"aaa".to_vec()),
                    Upload::from_bytes("b.txt", b"bbbb".to_vec()),
                ],
            )
            .await
            .unwrap();

        assert_eq!(created.files.len(), 2);
        assert!(created.files.iter().all(|f| f.expiry_type == ExpiryType::Custom));
        assert!(created.ticket.verify_password("secret").unwrap());
        assert!(!created.ticket.verify_password("wrong").unwrap());

        let loaded = service.get(&created.ticket.id).await.unwrap();
        assert_eq!(loaded.files.len(), 2);
        assert_eq!(service.list(&fx.owner).await.unwrap().len(), 1);
        assert_eq!(loaded.ticket.comment.as_deref(), Some("hi"));

        let owner = UserRepository::new(fx.db.pool())
            .get_by_id(&fx.owner.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(owner.submitted_tickets, 1);
        assert_eq!(owner.total_data_size, 7);

        // The owner of the ticket may now read its files
        assert!(FileRepository::user_has_access(fx.db.pool(), &owner, &created.files[0].id)
            .await
            .unwrap());

        let public = service.to_public(&loaded, &owner);
        assert_eq!(public.files.len(), 2);
        assert_eq!(public.owner.name, "Owner");
    }

    #[tokio::test]
    async fn test_create_ticket_too_many_files() {
        let fx = setup().await;
        let uploads = (0..3)
            .map(|i| Upload::from_bytes(format!("{i}.txt"), vec![i as u8]))
            .collect();

        let result = fx
            .service()
            .create_ticket(&fx.owner, NewTicket::new("pw", ExpiryPolicy::auto()), uploads)
            .await;
        assert!(matches!(result, Err(FransError::TooManyFiles { count: 3, max: 2 })));
    }

    #[tokio::test]
    async fn test_failed_upload_rolls_back_ticket() {
        let fx = setup().await;
        let result = fx
            .service()
            .create_ticket(
                &fx.owner,
                NewTicket::new("pw", ExpiryPolicy::auto()),
                vec![
                    Upload::from_bytes("ok.txt", b"fine".to_vec()),
                    Upload::from_bytes("big.bin", vec![0u8; 4096]),
                ],
            )
            .await;
        assert!(matches!(result, Err(FransError::FileTooLarge { .. })));

        let ids = TicketRepository::list_ids(fx.db.pool()).await.unwrap();
        assert!(ids.is_empty());
        let files = FileRepository::list_by_owner(fx.db.pool(), &fx.owner.id)
            .await
            .unwrap();
        assert!(files.is_empty());
    }

    #[tokio::test]
    async fn test_delete_ticket_releases_files() {
        let fx = setup().await;
        let service = fx.service();
        let created = service
            .create_ticket(
                &fx.owner,
                NewTicket::new("pw", ExpiryPolicy::auto()),
                vec![Upload::from_bytes("a.txt", b"payload".to_vec())],
            )
            .await
            .unwrap();
        let path = fx.store.path(&created.files[0].blob_hash);
        assert!(path.exists());

        let stranger = UserRepository::new(fx.db.pool())
            .create(&NewUser::new("stranger", "Stranger"))
            .await
            .unwrap();
        assert!(matches!(
            service.delete_ticket(&stranger, &created.ticket.id).await,
            Err(FransError::Permission(_))
        ));

        assert!(service.delete_ticket(&fx.owner, &created.ticket.id).await.unwrap());
        assert!(!path.exists());
        assert!(matches!(
            service.get(&created.ticket.id).await,
            Err(FransError::NotFound(_))
        ));

        let owner = UserRepository::new(fx.db.pool())
            .get_by_id(&fx.owner.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(owner.total_data_size, 0);
        // Lifetime counter is not decremented
        assert_eq!(owner.submitted_tickets, 1);
    }
}
