//! Test helpers for integration tests.
//!
//! Provides a file-backed test environment with a database, a content store
//! and services wired to the same configuration.

#![allow(dead_code)]

use std::fs;

use chrono::{DateTime, Utc};
use tempfile::TempDir;

use frans::db::{NewUser, User, UserRepository};
use frans::expiry::ExpiryPolicy;
use frans::file::{ContentStore, FileRecord, FileRepository, FileService, Upload};
use frans::share::{GrantService, TicketService};
use frans::{Config, Database, LifecycleSweeper};

/// Largest upload accepted by the test store.
pub const MAX_SIZE: u64 = 1024 * 1024;

/// Database, content store and configuration rooted in a temporary directory.
pub struct TestEnv {
    pub db: Database,
    pub store: ContentStore,
    pub config: Config,
    dir: TempDir,
}

impl TestEnv {
    /// Create an environment with a file-backed database.
    pub async fn new() -> Self {
        let dir = TempDir::new().unwrap();

        let mut config = Config::default();
        config.database.path = dir.path().join("frans.db").to_string_lossy().into_owned();
        config.files.dir = dir.path().join("files").to_string_lossy().into_owned();
        config.files.max_size = MAX_SIZE;
        config.files.max_files = 10;
        config.expiry.total_days = 30;
        config.expiry.days_since_last_download = 7;
        config.expiry.total_downloads = 10;
        config.grant.expiry_total_days = 30;
        config.grant.expiry_days_since_last_upload = 7;
        config.grant.expiry_total_uploads = 10;

        let db = Database::open(&config.database.path).await.unwrap();
        let store = ContentStore::new(&config.files.dir, config.files.max_size).unwrap();

        Self {
            db,
            store,
            config,
            dir,
        }
    }

    pub fn files(&self) -> FileService<'_> {
        FileService::new(&self.db, &self.store, self.config.file_expiry())
    }

    pub fn tickets(&self) -> TicketService<'_> {
        TicketService::new(&self.db, &self.store, &self.config)
    }

    pub fn grants(&self) -> GrantService<'_> {
        GrantService::new(&self.db, &self.store, &self.config)
    }

    pub fn sweeper(&self) -> LifecycleSweeper {
        LifecycleSweeper::new(self.db.clone(), self.store.clone(), self.config.clone())
    }

    /// Create a regular user.
    pub async fn user(&self, username: &str) -> User {
        UserRepository::new(self.db.pool())
            .create(&NewUser::new(username, username))
            .await
            .unwrap()
    }

    /// Create an administrator.
    pub async fn admin(&self, username: &str) -> User {
        UserRepository::new(self.db.pool())
            .create(&NewUser::new(username, username).with_admin(true))
            .await
            .unwrap()
    }

    /// Reload a user to see updated counters.
    pub async fn reload(&self, user: &User) -> User {
        UserRepository::new(self.db.pool())
            .get_by_id(&user.id)
            .await
            .unwrap()
            .unwrap()
    }

    /// Create a standalone file in its own transaction.
    pub async fn create_file(
        &self,
        owner: &User,
        name: &str,
        content: &[u8],
        policy: ExpiryPolicy,
    ) -> FileRecord {
        let service = self.files();
        let mut tx = self.db.begin().await.unwrap();
        let mut pending = self.store.pending();
        let result = service
            .create_file(
                &mut tx,
                Upload::from_bytes(name, content.to_vec()),
                &owner.id,
                policy,
                &mut pending,
            )
            .await;
        pending.settle(tx, result).await.unwrap()
    }

    /// Total data size recomputed here from the live file rows.
    pub async fn independent_total(&self, user: &User) -> i64 {
        FileRepository::list_by_owner(self.db.pool(), &user.id)
            .await
            .unwrap()
            .iter()
            .map(|f| f.size)
            .sum()
    }

    /// Number of rows in a table.
    pub async fn count(&self, table: &str) -> i64 {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(self.db.pool())
            .await
            .unwrap()
    }

    /// Overwrite a timestamp column, e.g. to age an entity.
    pub async fn set_timestamp(
        &self,
        table: &str,
        column: &str,
        id: &str,
        value: DateTime<Utc>,
    ) {
        sqlx::query(&format!("UPDATE {table} SET {column} = $1 WHERE id = $2"))
            .bind(value)
            .bind(id)
            .execute(self.db.pool())
            .await
            .unwrap();
    }

    /// Number of blob files in the store, excluding the staging directory.
    pub fn blobs_on_disk(&self) -> usize {
        let mut count = 0;
        for shard in fs::read_dir(self.store.root()).unwrap() {
            let shard = shard.unwrap();
            if shard.file_name() == "tmp" || !shard.file_type().unwrap().is_dir() {
                continue;
            }
            count += fs::read_dir(shard.path()).unwrap().count();
        }
        count
    }

    /// Number of entries left in the staging directory.
    pub fn staging_entries(&self) -> usize {
        fs::read_dir(self.store.root().join("tmp")).unwrap().count()
    }

    pub fn path(&self) -> &std::path::Path {
        self.dir.path()
    }
}
