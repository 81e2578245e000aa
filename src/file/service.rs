//! File service.
//!
//! High-level file operations used by the upload, download and admin paths:
//! - Create a file from an upload stream (dedup through the content store)
//! - Download with access control and download counting
//! - Manual deletion with blob release and aggregate refresh

use std::fmt;
use std::io::Cursor;

use chrono::Utc;
use serde::Serialize;
use sqlx::SqliteConnection;
use tokio::io::AsyncRead;
use tracing::{debug, info};

use crate::datetime::http_date;
use crate::db::{Database, User};
use crate::expiry::{Expirable, ExpiryDefaults, ExpiryPolicy};
use crate::{FransError, Result};

use super::aggregate::AggregateRefresher;
use super::record::{DeletedFile, FileRecord, FileRepository, NewFileRecord};
use super::store::{ContentStore, PendingBlobs};
use super::MAX_FILENAME_LENGTH;

/// An incoming file: display name, optional declared size and a byte stream.
pub struct Upload {
    pub name: String,
    /// Size announced by the client, checked before reading.
    pub size: Option<u64>,
    reader: Box<dyn AsyncRead + Send + Unpin>,
}

impl Upload {
    pub fn new(name: impl Into<String>, reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self {
            name: name.into(),
            size: None,
            reader: Box::new(reader),
        }
    }

    /// Upload from an in-memory buffer.
    pub fn from_bytes(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        let bytes = bytes.into();
        let size = bytes.len() as u64;
        Self::new(name, Cursor::new(bytes)).with_size(size)
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }
}

impl fmt::Debug for Upload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Upload")
            .field("name", &self.name)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// File as shown to users.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PublicFile {
    pub id: String,
    pub sha512: String,
    pub size: i64,
    pub name: String,
    pub created_at: String,
    pub times_downloaded: i64,
    pub last_downloaded: Option<String>,
    pub estimated_expiry: Option<String>,
}

/// File service for creating, downloading and deleting files.
pub struct FileService<'a> {
    db: &'a Database,
    store: &'a ContentStore,
    defaults: ExpiryDefaults,
}

impl<'a> FileService<'a> {
    /// Create a new FileService using the file expiry defaults.
    pub fn new(db: &'a Database, store: &'a ContentStore, defaults: ExpiryDefaults) -> Self {
        Self {
            db,
            store,
            defaults,
        }
    }

    pub fn store(&self) -> &ContentStore {
        self.store
    }

    pub fn defaults(&self) -> &ExpiryDefaults {
        &self.defaults
    }

    /// Create a file from an upload inside the caller's transaction.
    ///
    /// The owner's total data size is refreshed in the same transaction. The
    /// bytes are stored once the caller settles `pending`.
    pub async fn create_file(
        &self,
        conn: &mut SqliteConnection,
        upload: Upload,
        owner_id: &str,
        policy: ExpiryPolicy,
        pending: &mut PendingBlobs,
    ) -> Result<FileRecord> {
        validate_file_name(&upload.name)?;
        policy.validate()?;

        let staged = self.store.stage(upload.reader, upload.size).await?;
        let blob = self.store.put(&mut *conn, staged, pending).await?;

        let file = FileRepository::insert(
            &mut *conn,
            &NewFileRecord {
                name: upload.name,
                owner_id: owner_id.to_string(),
                blob_hash: blob.hash,
                policy,
            },
        )
        .await?;

        AggregateRefresher::refresh(&mut *conn, owner_id).await?;
        debug!(file_id = %file.id, owner_id, size = file.size, "file created");
        Ok(file)
    }

    /// Get a file by ID.
    pub async fn get(&self, id: &str) -> Result<FileRecord> {
        FileRepository::get_by_id(self.db.pool(), id)
            .await?
            .ok_or_else(|| FransError::NotFound("file".into()))
    }

    /// Whether `user` may read the bytes of a file.
    pub async fn user_can_read(&self, user: &User, id: &str) -> Result<bool> {
        FileRepository::user_has_access(self.db.pool(), user, id).await
    }

    /// Count a download and return the updated record.
    pub async fn record_download(&self, id: &str) -> Result<FileRecord> {
        if !FileRepository::record_download(self.db.pool(), id, Utc::now()).await? {
            return Err(FransError::NotFound("file".into()));
        }
        self.get(id).await
    }

    /// Download a file: check access, count the download and open the blob.
    pub async fn download(&self, user: &User, id: &str) -> Result<(FileRecord, tokio::fs::File)> {
        if !self.user_can_read(user, id).await? {
            return Err(FransError::Permission(
                "no ticket or grant gives access to this file".into(),
            ));
        }
        let file = self.record_download(id).await?;
        let content = self.store.open(&file.blob_hash).await?;
        Ok((file, content))
    }

    /// Delete a file on behalf of its owner or an admin.
    ///
    /// Returns `false` if the file was already gone.
    pub async fn delete_file(&self, actor: &User, id: &str) -> Result<bool> {
        let file = match FileRepository::get_by_id(self.db.pool(), id).await? {
            Some(file) => file,
            None => return Ok(false),
        };
        if !actor.is_admin && actor.id != file.owner_id {
            return Err(FransError::Permission("only the owner may delete a file".into()));
        }

        let mut tx = self.db.begin().await?;
        let mut pending = self.store.pending();
        let result = match self.delete_in(&mut tx, id, &mut pending).await {
            Ok(Some(deleted)) => {
                AggregateRefresher::refresh_or_log(&mut tx, &deleted.owner_id).await;
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(e) => Err(e),
        };
        let deleted = pending.settle(tx, result).await?;

        if deleted {
            info!(file_id = id, actor = %actor.username, "file deleted");
        }
        Ok(deleted)
    }

    /// Delete a file row and release its blob inside the caller's transaction.
    ///
    /// The caller refreshes the owner's aggregate and settles `pending`.
    pub async fn delete_in(
        &self,
        conn: &mut SqliteConnection,
        id: &str,
        pending: &mut PendingBlobs,
    ) -> Result<Option<DeletedFile>> {
        let Some(deleted) = FileRepository::delete(&mut *conn, id).await? else {
            return Ok(None);
        };
        self.store.release(&mut *conn, &deleted.blob_hash, pending).await?;
        Ok(Some(deleted))
    }

    /// Public representation of a file.
    pub fn to_public(&self, file: &FileRecord) -> PublicFile {
        PublicFile {
            id: file.id.clone(),
            sha512: file.blob_hash.clone(),
            size: file.size,
            name: file.name.clone(),
            created_at: http_date(&file.created_at),
            times_downloaded: file.times_downloaded,
            last_downloaded: file.last_download.as_ref().map(http_date),
            estimated_expiry: file.estimated_expiry(&self.defaults).as_ref().map(http_date),
        }
    }
}

fn validate_file_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(FransError::Validation("file name must not be empty".into()));
    }
    if name.chars().count() > MAX_FILENAME_LENGTH {
        return Err(FransError::Validation(format!(
            "file name must be at most {MAX_FILENAME_LENGTH} characters"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{NewUser, UserRepository};
    use crate::expiry::ExpiryType;
    use chrono::{Duration, TimeZone};
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    const DEFAULTS: ExpiryDefaults = ExpiryDefaults {
        total_days: 30,
        days_since_last_event: 7,
        total_events: 10,
    };

    struct Fixture {
        db: Database,
        store: ContentStore,
        owner: User,
        _dir: TempDir,
    }

    impl Fixture {
        fn service(&self) -> FileService<'_> {
            FileService::new(&self.db, &self.store, DEFAULTS)
        }

        async fn create(&self, name: &str, content: &[u8], policy: ExpiryPolicy) -> FileRecord {
            let service = self.service();
            let mut tx = self.db.begin().await.unwrap();
            let mut pending = self.store.pending();
            let result = service
                .create_file(
                    &mut tx,
                    Upload::from_bytes(name, content),
                    &self.owner.id,
                    policy,
                    &mut pending,
                )
                .await;
            pending.settle(tx, result).await.unwrap()
        }

        async fn owner_total(&self) -> i64 {
            UserRepository::new(self.db.pool())
                .get_by_id(&self.owner.id)
                .await
                .unwrap()
                .unwrap()
                .total_data_size
        }
    }

    async fn setup() -> Fixture {
        let db = Database::open_in_memory().await.unwrap();
        let dir = TempDir::new().unwrap();
        let store = ContentStore::new(dir.path().join("files"), 1024).unwrap();
        let owner = UserRepository::new(db.pool())
            .create(&NewUser::new("owner", "Owner"))
            .await
            .unwrap();
        Fixture {
            db,
            store,
            owner,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_create_file_refreshes_owner_total() {
        let fx = setup().await;
        let file = fx.create("a.txt", b"0123456789", ExpiryPolicy::auto()).await;

        assert_eq!(file.name, "a.txt");
        assert_eq!(file.size, 10);
        assert_eq!(file.times_downloaded, 0);
        assert_eq!(file.expiry_type, ExpiryType::Auto);
        assert_eq!(fx.owner_total().await, 10);
    }

    #[tokio::test]
    async fn test_create_file_too_large() {
        let fx = setup().await;
        let service = fx.service();
        let mut tx = fx.db.begin().await.unwrap();
        let mut pending = fx.store.pending();

        let result = service
            .create_file(
                &mut tx,
                Upload::from_bytes("big.bin", vec![0u8; 2048]),
                &fx.owner.id,
                ExpiryPolicy::auto(),
                &mut pending,
            )
            .await;

        assert!(matches!(
            result,
            Err(FransError::FileTooLarge {
                size: 2048,
                max: 1024
            })
        ));
    }

    #[tokio::test]
    async fn test_create_file_rejects_empty_name() {
        let fx = setup().await;
        let service = fx.service();
        let mut tx = fx.db.begin().await.unwrap();
        let mut pending = fx.store.pending();

        let result = service
            .create_file(
                &mut tx,
                Upload::from_bytes(" ", b"x".to_vec()),
                &fx.owner.id,
                ExpiryPolicy::auto(),
                &mut pending,
            )
            .await;
        assert!(matches!(result, Err(FransError::Validation(_))));
    }

    #[tokio::test]
    async fn test_record_download() {
        let fx = setup().await;
        let file = fx.create("a.txt", b"abc", ExpiryPolicy::single()).await;
        let service = fx.service();

        let updated = service.record_download(&file.id).await.unwrap();
        assert_eq!(updated.times_downloaded, 1);
        assert!(updated.last_download.is_some());

        let updated = service.record_download(&file.id).await.unwrap();
        assert_eq!(updated.times_downloaded, 2);

        assert!(matches!(
            service.record_download("missing").await,
            Err(FransError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_download_requires_access() {
        let fx = setup().await;
        let file = fx.create("a.txt", b"secret", ExpiryPolicy::auto()).await;
        let service = fx.service();

        let users = UserRepository::new(fx.db.pool());
        let stranger = users.create(&NewUser::new("stranger", "Stranger")).await.unwrap();
        let admin = users
            .create(&NewUser::new("admin", "Admin").with_admin(true))
            .await
            .unwrap();

        // Owning the file row alone does not grant access; tickets and grants do
        assert!(!service.user_can_read(&stranger, &file.id).await.unwrap());
        assert!(matches!(
            service.download(&stranger, &file.id).await,
            Err(FransError::Permission(_))
        ));

        let (record, mut content) = service.download(&admin, &file.id).await.unwrap();
        let mut bytes = Vec::new();
        content.read_to_end(&mut bytes).await.unwrap();
        assert_eq!(bytes, b"secret");
        assert_eq!(record.times_downloaded, 1);
    }

    #[tokio::test]
    async fn test_delete_shared_blob() {
        let fx = setup().await;
        let first = fx.create("one.txt", b"shared", ExpiryPolicy::auto()).await;
        let second = fx.create("two.txt", b"shared", ExpiryPolicy::auto()).await;
        assert_eq!(first.blob_hash, second.blob_hash);
        assert_eq!(fx.owner_total().await, 12);

        let service = fx.service();
        let path = fx.store.path(&first.blob_hash);

        assert!(service.delete_file(&fx.owner, &first.id).await.unwrap());
        assert!(path.exists());
        assert_eq!(fx.owner_total().await, 6);

        assert!(service.delete_file(&fx.owner, &second.id).await.unwrap());
        assert!(!path.exists());
        assert!(ContentStore::get(fx.db.pool(), &first.blob_hash)
            .await
            .unwrap()
            .is_none());
        assert_eq!(fx.owner_total().await, 0);

        // Already gone
        assert!(!service.delete_file(&fx.owner, &second.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_requires_owner_or_admin() {
        let fx = setup().await;
        let file = fx.create("a.txt", b"mine", ExpiryPolicy::auto()).await;
        let other = UserRepository::new(fx.db.pool())
            .create(&NewUser::new("other", "Other"))
            .await
            .unwrap();

        let result = fx.service().delete_file(&other, &file.id).await;
        assert!(matches!(result, Err(FransError::Permission(_))));
        assert!(fx.store.path(&file.blob_hash).exists());
    }

    #[tokio::test]
    async fn test_to_public() {
        let fx = setup().await;
        let created = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let file = FileRecord {
            id: "f1".into(),
            name: "report.pdf".into(),
            owner_id: fx.owner.id.clone(),
            blob_hash: "ab".repeat(64),
            size: 42,
            created_at: created,
            last_download: Some(created + Duration::days(20)),
            times_downloaded: 3,
            expiry_type: ExpiryType::Auto,
            expiry_total_days: 0,
            expiry_days_since_last_download: 0,
            expiry_total_downloads: 0,
        };

        let public = fx.service().to_public(&file);
        assert_eq!(public.sha512, file.blob_hash);
        assert_eq!(public.created_at, "Mon, 01 Jan 2024 00:00:00 GMT");
        assert_eq!(
            public.last_downloaded.as_deref(),
            Some("Sun, 21 Jan 2024 00:00:00 GMT")
        );
        assert_eq!(
            public.estimated_expiry.as_deref(),
            Some("Sun, 28 Jan 2024 00:00:00 GMT")
        );

        let json = serde_json::to_value(&public).unwrap();
        assert_eq!(json["timesDownloaded"], 3);
        assert_eq!(json["name"], "report.pdf");
    }
}
