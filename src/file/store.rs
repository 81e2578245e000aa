//! Content-addressed blob storage.
//!
//! Every distinct byte sequence is stored exactly once, named by the hex
//! SHA-512 of its content. Blobs are sharded by the first two hex digits:
//!
//! ```text
//! {root}/
//! ├── 3a/
//! │   └── 3a9f...e1   (128 hex chars)
//! ├── c0/
//! │   └── c07d...42
//! └── tmp/            (uploads being hashed)
//! ```
//!
//! A blob row exists in `blobs` while at least one file row references it.
//! Changes to the bytes on disk never run ahead of the database: staged
//! uploads are moved into place, and released blobs unlinked, only once the
//! transaction that changed the rows has committed. See [`PendingBlobs`].

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha512};
use sqlx::{Executor, Sqlite, SqliteConnection};
use tempfile::TempPath;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::record::FileRepository;
use crate::db::{DbPool, DbTransaction};
use crate::{FransError, Result};

/// Read buffer size while staging uploads.
const CHUNK_SIZE: usize = 64 * 1024;

/// Name of the staging directory below the root.
const TMP_DIR: &str = "tmp";

/// A stored blob.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Blob {
    /// Hex SHA-512 of the content.
    pub hash: String,
    /// Size in bytes.
    pub size: i64,
    pub created_at: DateTime<Utc>,
}

/// Upload that has been hashed and written to the staging directory.
///
/// The staged file is removed when this value is dropped unless it was moved
/// into place after its transaction committed.
#[derive(Debug)]
pub struct StagedBlob {
    hash: String,
    size: u64,
    path: TempPath,
}

impl StagedBlob {
    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Staged upload waiting for its transaction to commit.
#[derive(Debug)]
struct Placement {
    staged: StagedBlob,
    target: PathBuf,
}

impl Placement {
    fn place(self) -> Result<()> {
        let StagedBlob { hash, size, path } = self.staged;
        match path.persist_noclobber(&self.target) {
            Ok(()) => {
                debug!(hash = %hash, size, "blob stored");
                Ok(())
            }
            // Identical content is already in place
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => {
                error!(hash = %hash, error = %e.error, "could not store committed blob");
                Err(e.error.into())
            }
        }
    }
}

/// Released blob with a second link next to it.
///
/// The content-addressed path stays readable until the releasing transaction
/// has committed.
#[derive(Debug)]
struct PendingRemoval {
    hash: String,
    original: PathBuf,
    aside: PathBuf,
}

impl PendingRemoval {
    /// Unlink the bytes for good.
    fn finish(self) {
        match fs::remove_file(&self.original) {
            Ok(()) => debug!(hash = %self.hash, "blob removed"),
            Err(e) => warn!(
                hash = %self.hash,
                path = %self.original.display(),
                error = %e,
                "could not remove released blob"
            ),
        }
        self.drop_link();
    }

    /// Keep the blob; only the extra link goes.
    fn restore(self) {
        self.drop_link();
        debug!(hash = %self.hash, "blob kept after rollback");
    }

    fn drop_link(&self) {
        if let Err(e) = fs::remove_file(&self.aside) {
            warn!(
                hash = %self.hash,
                path = %self.aside.display(),
                error = %e,
                "could not remove blob link"
            );
        }
    }
}

/// Disk changes of one transaction, applied when it is settled.
#[derive(Debug)]
#[must_use = "pending blob changes must be settled"]
pub struct PendingBlobs {
    commit_lock: Arc<Mutex<()>>,
    placements: Vec<Placement>,
    removals: Vec<PendingRemoval>,
}

impl PendingBlobs {
    /// Number of blobs to be stored after commit.
    pub fn placements(&self) -> usize {
        self.placements.len()
    }

    /// Number of blobs to be unlinked after commit.
    pub fn removals(&self) -> usize {
        self.removals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.placements.is_empty() && self.removals.is_empty()
    }

    /// Commit `tx` if `result` is `Ok`, otherwise roll it back.
    ///
    /// After a successful commit staged uploads are moved into place and
    /// released blobs unlinked. Otherwise staged uploads are discarded and
    /// released blobs stay where they are. The commit and the disk changes
    /// run under the store's commit lock.
    ///
    /// A blob that cannot be moved into place after the commit is reported
    /// as an error; [`ContentStore::verify`] lists it as missing.
    pub async fn settle<T>(self, tx: DbTransaction, result: Result<T>) -> Result<T> {
        let commit_lock = Arc::clone(&self.commit_lock);
        let _guard = commit_lock.lock().await;

        match result {
            Ok(value) => match tx.commit().await {
                Ok(()) => {
                    self.apply()?;
                    Ok(value)
                }
                Err(e) => {
                    self.discard();
                    Err(e.into())
                }
            },
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "rollback failed");
                }
                self.discard();
                Err(e)
            }
        }
    }

    fn apply(self) -> Result<()> {
        for removal in self.removals {
            removal.finish();
        }

        let mut first_error = None;
        for placement in self.placements {
            if let Err(e) = placement.place() {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn discard(self) {
        for removal in self.removals {
            removal.restore();
        }
        // Dropping the staged paths deletes them
        drop(self.placements);
    }
}

/// Result of comparing blob rows with the files on disk.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ConsistencyReport {
    /// Blob rows with no file on disk.
    pub missing_files: Vec<String>,
    /// Files on disk with no blob row.
    pub orphaned_files: Vec<PathBuf>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.missing_files.is_empty() && self.orphaned_files.is_empty()
    }
}

/// Deduplicating content store.
#[derive(Debug, Clone)]
pub struct ContentStore {
    root: PathBuf,
    tmp_dir: PathBuf,
    max_size: u64,
    commit_lock: Arc<Mutex<()>>,
}

impl ContentStore {
    /// Open a store at `root`, creating it and its staging directory.
    pub fn new(root: impl Into<PathBuf>, max_size: u64) -> Result<Self> {
        let root = root.into();
        let tmp_dir = root.join(TMP_DIR);
        fs::create_dir_all(&tmp_dir)?;

        Ok(Self {
            root,
            tmp_dir,
            max_size,
            commit_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Start collecting the disk changes of a transaction.
    pub fn pending(&self) -> PendingBlobs {
        PendingBlobs {
            commit_lock: Arc::clone(&self.commit_lock),
            placements: Vec::new(),
            removals: Vec::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Largest accepted upload in bytes.
    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// On-disk location of a blob.
    pub fn path(&self, hash: &str) -> PathBuf {
        self.root.join(Self::shard(hash)).join(hash)
    }

    fn shard(hash: &str) -> &str {
        hash.get(..2).unwrap_or(hash)
    }

    /// Hash `reader` while writing it to the staging directory.
    ///
    /// `declared_size` (e.g. from a multipart header) is checked before any
    /// byte is read; the actual byte count is enforced while streaming.
    pub async fn stage<R>(&self, mut reader: R, declared_size: Option<u64>) -> Result<StagedBlob>
    where
        R: AsyncRead + Unpin,
    {
        if let Some(size) = declared_size {
            if size > self.max_size {
                return Err(FransError::FileTooLarge {
                    size,
                    max: self.max_size,
                });
            }
        }

        let (file, path) = tempfile::Builder::new()
            .prefix("upload-")
            .tempfile_in(&self.tmp_dir)?
            .into_parts();
        let mut file = tokio::fs::File::from_std(file);

        let mut hasher = Sha512::new();
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut size: u64 = 0;

        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            size += n as u64;
            if size > self.max_size {
                return Err(FransError::FileTooLarge {
                    size,
                    max: self.max_size,
                });
            }
            hasher.update(&buf[..n]);
            file.write_all(&buf[..n]).await?;
        }

        file.flush().await?;
        file.sync_all().await?;

        Ok(StagedBlob {
            hash: hex::encode(hasher.finalize()),
            size,
            path,
        })
    }

    /// Register a staged blob, reusing an existing row with the same hash.
    ///
    /// The bytes are moved into place when `pending` is settled after a
    /// successful commit. If identical content is already stored by then, the
    /// staged copy is discarded.
    pub async fn put(
        &self,
        conn: &mut SqliteConnection,
        staged: StagedBlob,
        pending: &mut PendingBlobs,
    ) -> Result<Blob> {
        let size = i64::try_from(staged.size)
            .map_err(|_| FransError::Validation(format!("blob size {} overflows", staged.size)))?;

        sqlx::query(
            "INSERT INTO blobs (hash, size, created_at) VALUES ($1, $2, $3)
             ON CONFLICT(hash) DO NOTHING",
        )
        .bind(&staged.hash)
        .bind(size)
        .bind(Utc::now())
        .execute(&mut *conn)
        .await?;

        let blob = Self::get(&mut *conn, &staged.hash)
            .await?
            .ok_or_else(|| FransError::Consistency(format!("blob {} vanished", staged.hash)))?;

        let target = self.path(&staged.hash);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        pending.placements.push(Placement { staged, target });

        Ok(blob)
    }

    /// Get a blob row by hash.
    pub async fn get<'e, E>(executor: E, hash: &str) -> Result<Option<Blob>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let blob = sqlx::query_as::<_, Blob>(
            "SELECT hash, size, created_at FROM blobs WHERE hash = $1",
        )
        .bind(hash)
        .fetch_optional(executor)
        .await?;
        Ok(blob)
    }

    /// Drop a blob once no file row references it any more.
    ///
    /// Must run inside the transaction that deleted the referencing row, after
    /// the delete. Returns whether the blob was released; its bytes are
    /// unlinked when `pending` is settled after a successful commit.
    ///
    /// The blob is linked aside within its shard right away, so a missing
    /// file or an unwritable shard fails the transaction instead of leaving
    /// bytes behind after the commit.
    pub async fn release(
        &self,
        conn: &mut SqliteConnection,
        hash: &str,
        pending: &mut PendingBlobs,
    ) -> Result<bool> {
        let remaining = FileRepository::count_by_blob(&mut *conn, hash).await?;
        if remaining > 0 {
            debug!(hash, remaining, "blob still referenced");
            return Ok(false);
        }

        let deleted = sqlx::query("DELETE FROM blobs WHERE hash = $1")
            .bind(hash)
            .execute(&mut *conn)
            .await?;
        if deleted.rows_affected() == 0 {
            return Ok(false);
        }

        pending.removals.push(self.link_aside(hash)?);
        Ok(true)
    }

    fn link_aside(&self, hash: &str) -> Result<PendingRemoval> {
        let original = self.path(hash);
        let aside = original.with_file_name(format!("{hash}.{}.released", Uuid::new_v4()));

        match fs::hard_link(&original, &aside) {
            Ok(()) => Ok(PendingRemoval {
                hash: hash.to_string(),
                original,
                aside,
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(FransError::Consistency(
                format!("blob {hash} has no file at {}", original.display()),
            )),
            Err(e) => Err(e.into()),
        }
    }

    /// Open a blob for reading.
    pub async fn open(&self, hash: &str) -> Result<tokio::fs::File> {
        let path = self.path(hash);
        match tokio::fs::File::open(&path).await {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(FransError::Consistency(
                format!("blob {hash} has no file at {}", path.display()),
            )),
            Err(e) => Err(e.into()),
        }
    }

    /// Compare blob rows with the files on disk. Nothing is modified.
    pub async fn verify(&self, pool: &DbPool) -> Result<ConsistencyReport> {
        let hashes: Vec<String> = sqlx::query_scalar("SELECT hash FROM blobs ORDER BY hash")
            .fetch_all(pool)
            .await?;

        let mut report = ConsistencyReport::default();
        for hash in &hashes {
            if !self.path(hash).is_file() {
                report.missing_files.push(hash.clone());
            }
        }

        for shard in fs::read_dir(&self.root)? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() || shard.file_name() == TMP_DIR {
                continue;
            }
            for entry in fs::read_dir(shard.path())? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                if hashes.binary_search(&name).is_err() {
                    report.orphaned_files.push(entry.path());
                }
            }
        }
        report.orphaned_files.sort();

        Ok(report)
    }
}
