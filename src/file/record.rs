//! File records: per-share metadata pointing at a blob.

use chrono::{DateTime, Utc};
use sqlx::{Executor, Sqlite, SqliteConnection};
use uuid::Uuid;

use crate::db::User;
use crate::expiry::{Expirable, ExpiryPolicy, ExpiryType};
use crate::{FransError, Result};

/// Columns of a file record, joined with the size of its blob.
const FILE_SELECT: &str = "SELECT f.id, f.name, f.owner_id, f.blob_hash, b.size, f.created_at, \
     f.last_download, f.times_downloaded, f.expiry_type, f.expiry_total_days, \
     f.expiry_days_since_last_download, f.expiry_total_downloads \
     FROM files f JOIN blobs b ON b.hash = f.blob_hash";

/// A shared file.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FileRecord {
    /// UUID.
    pub id: String,
    /// Display name.
    pub name: String,
    pub owner_id: String,
    /// Hash of the referenced blob.
    pub blob_hash: String,
    /// Size of the referenced blob in bytes.
    pub size: i64,
    pub created_at: DateTime<Utc>,
    pub last_download: Option<DateTime<Utc>>,
    pub times_downloaded: i64,
    #[sqlx(try_from = "String")]
    pub expiry_type: ExpiryType,
    pub expiry_total_days: i64,
    pub expiry_days_since_last_download: i64,
    pub expiry_total_downloads: i64,
}

impl Expirable for FileRecord {
    fn policy(&self) -> ExpiryPolicy {
        ExpiryPolicy::new(
            self.expiry_type,
            self.expiry_total_days,
            self.expiry_days_since_last_download,
            self.expiry_total_downloads,
        )
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn last_event(&self) -> Option<DateTime<Utc>> {
        self.last_download
    }

    fn event_count(&self) -> i64 {
        self.times_downloaded
    }
}

/// New file record for creation.
#[derive(Debug, Clone)]
pub struct NewFileRecord {
    pub name: String,
    pub owner_id: String,
    pub blob_hash: String,
    pub policy: ExpiryPolicy,
}

/// Row removed by [`FileRepository::delete`].
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct DeletedFile {
    pub id: String,
    pub owner_id: String,
    pub blob_hash: String,
}

/// Queries over the `files` table.
///
/// Single-statement queries accept any executor (pool or transaction);
/// callers that must stay inside a transaction pass `&mut *tx`.
pub struct FileRepository;

impl FileRepository {
    /// Insert a file record referencing an existing blob.
    pub async fn insert(conn: &mut SqliteConnection, new_file: &NewFileRecord) -> Result<FileRecord> {
        let id = Uuid::new_v4().to_string();
        let policy = &new_file.policy;

        sqlx::query(
            "INSERT INTO files (id, name, owner_id, blob_hash, created_at, expiry_type,
                 expiry_total_days, expiry_days_since_last_download, expiry_total_downloads)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(&id)
        .bind(&new_file.name)
        .bind(&new_file.owner_id)
        .bind(&new_file.blob_hash)
        .bind(Utc::now())
        .bind(policy.expiry_type.as_str())
        .bind(policy.total_days)
        .bind(policy.days_since_last_event)
        .bind(policy.total_events)
        .execute(&mut *conn)
        .await?;

        Self::get_by_id(&mut *conn, &id)
            .await?
            .ok_or_else(|| FransError::NotFound("file".into()))
    }

    /// Get a file record by ID.
    pub async fn get_by_id<'e, E>(executor: E, id: &str) -> Result<Option<FileRecord>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let file = sqlx::query_as::<_, FileRecord>(&format!("{FILE_SELECT} WHERE f.id = $1"))
            .bind(id)
            .fetch_optional(executor)
            .await?;
        Ok(file)
    }

    /// List a user's files, newest first.
    pub async fn list_by_owner<'e, E>(executor: E, owner_id: &str) -> Result<Vec<FileRecord>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let files = sqlx::query_as::<_, FileRecord>(&format!(
            "{FILE_SELECT} WHERE f.owner_id = $1 ORDER BY f.created_at DESC"
        ))
        .bind(owner_id)
        .fetch_all(executor)
        .await?;
        Ok(files)
    }

    /// List the files attached to a ticket.
    pub async fn list_for_ticket<'e, E>(executor: E, ticket_id: &str) -> Result<Vec<FileRecord>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let files = sqlx::query_as::<_, FileRecord>(&format!(
            "{FILE_SELECT} JOIN ticket_files tf ON tf.file_id = f.id
             WHERE tf.ticket_id = $1 ORDER BY f.created_at, f.name"
        ))
        .bind(ticket_id)
        .fetch_all(executor)
        .await?;
        Ok(files)
    }

    /// List the files uploaded through a grant.
    pub async fn list_for_grant<'e, E>(executor: E, grant_id: &str) -> Result<Vec<FileRecord>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let files = sqlx::query_as::<_, FileRecord>(&format!(
            "{FILE_SELECT} JOIN grant_files gf ON gf.file_id = f.id
             WHERE gf.grant_id = $1 ORDER BY f.created_at, f.name"
        ))
        .bind(grant_id)
        .fetch_all(executor)
        .await?;
        Ok(files)
    }

    /// Files that may be eligible for deletion by the file sweep.
    ///
    /// Downloaded files can hit any trigger. Never-downloaded files can only
    /// expire by age, which requires an `auto` or `custom` policy.
    pub async fn list_sweep_candidates<'e, E>(executor: E) -> Result<Vec<FileRecord>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let files = sqlx::query_as::<_, FileRecord>(&format!(
            "{FILE_SELECT} WHERE f.times_downloaded > 0 OR f.expiry_type IN ('auto', 'custom')"
        ))
        .fetch_all(executor)
        .await?;
        Ok(files)
    }

    /// Count a download: increment the counter and set the last-download time.
    ///
    /// Returns `false` if the file does not exist.
    pub async fn record_download<'e, E>(executor: E, id: &str, now: DateTime<Utc>) -> Result<bool>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let result = sqlx::query(
            "UPDATE files SET times_downloaded = times_downloaded + 1, last_download = $1
             WHERE id = $2",
        )
        .bind(now)
        .bind(id)
        .execute(executor)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete a file row, returning what it pointed at.
    ///
    /// Returns `None` if the row was already gone. The blob must be released
    /// by the caller in the same transaction.
    pub async fn delete(conn: &mut SqliteConnection, id: &str) -> Result<Option<DeletedFile>> {
        let deleted = sqlx::query_as::<_, DeletedFile>(
            "DELETE FROM files WHERE id = $1 RETURNING id, owner_id, blob_hash",
        )
        .bind(id)
        .fetch_optional(conn)
        .await?;
        Ok(deleted)
    }

    /// Number of file rows referencing a blob.
    pub async fn count_by_blob<'e, E>(executor: E, blob_hash: &str) -> Result<i64>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM files WHERE blob_hash = $1")
            .bind(blob_hash)
            .fetch_one(executor)
            .await?;
        Ok(count)
    }

    /// Whether `user` may read the bytes of a file.
    ///
    /// Admins may read everything; other users only files attached to one of
    /// their tickets or grants.
    pub async fn user_has_access<'e, E>(executor: E, user: &User, file_id: &str) -> Result<bool>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        if user.is_admin {
            return Ok(true);
        }

        let allowed: bool = sqlx::query_scalar(
            "SELECT EXISTS(
                 SELECT 1 FROM ticket_files tf JOIN tickets t ON t.id = tf.ticket_id
                 WHERE tf.file_id = $1 AND t.owner_id = $2
                 UNION ALL
                 SELECT 1 FROM grant_files gf JOIN grants g ON g.id = gf.grant_id
                 WHERE gf.file_id = $1 AND g.owner_id = $2
             )",
        )
        .bind(file_id)
        .bind(&user.id)
        .fetch_one(executor)
        .await?;
        Ok(allowed)
    }
}
