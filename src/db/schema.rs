//! Database schema and migrations.
//!
//! Migrations are applied in order when the database is opened; the
//! `schema_version` table records which ones have run.

/// Database migrations.
pub const MIGRATIONS: &[&str] = &[
    // v1: users
    r#"
CREATE TABLE users (
    id                  TEXT PRIMARY KEY,      -- UUID
    username            TEXT NOT NULL UNIQUE,
    full_name           TEXT NOT NULL,
    email               TEXT NOT NULL,
    is_admin            INTEGER NOT NULL DEFAULT 0,
    created_at          TEXT NOT NULL,
    submitted_tickets   INTEGER NOT NULL DEFAULT 0,
    submitted_grants    INTEGER NOT NULL DEFAULT 0,
    total_data_size     INTEGER NOT NULL DEFAULT 0   -- denormalized, see AggregateRefresher
);
"#,
    // v2: content-addressed blobs and the file records pointing at them
    r#"
CREATE TABLE blobs (
    hash        TEXT PRIMARY KEY,              -- hex SHA-512
    size        INTEGER NOT NULL,
    created_at  TEXT NOT NULL
);

CREATE TABLE files (
    id                                  TEXT PRIMARY KEY,
    name                                TEXT NOT NULL,
    owner_id                            TEXT NOT NULL REFERENCES users(id),
    blob_hash                           TEXT NOT NULL REFERENCES blobs(hash),
    created_at                          TEXT NOT NULL,
    last_download                       TEXT,
    times_downloaded                    INTEGER NOT NULL DEFAULT 0,
    expiry_type                         TEXT NOT NULL,   -- 'none', 'single', 'auto', 'custom'
    expiry_total_days                   INTEGER NOT NULL DEFAULT 0,
    expiry_days_since_last_download     INTEGER NOT NULL DEFAULT 0,
    expiry_total_downloads              INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX idx_files_blob_hash ON files(blob_hash);
CREATE INDEX idx_files_owner_id ON files(owner_id);
CREATE INDEX idx_files_times_downloaded ON files(times_downloaded);
CREATE INDEX idx_files_expiry_type ON files(expiry_type);
"#,
    // v3: tickets (share out)
    r#"
CREATE TABLE tickets (
    id                                  TEXT PRIMARY KEY,
    owner_id                            TEXT NOT NULL REFERENCES users(id),
    comment                             TEXT,
    hashed_password                     TEXT NOT NULL,   -- Argon2 PHC string
    created_at                          TEXT NOT NULL,
    expiry_type                         TEXT NOT NULL,
    expiry_total_days                   INTEGER NOT NULL DEFAULT 0,
    expiry_days_since_last_download     INTEGER NOT NULL DEFAULT 0,
    expiry_total_downloads              INTEGER NOT NULL DEFAULT 0,
    email_on_download                   TEXT,
    creator_lang                        TEXT NOT NULL DEFAULT 'en'
);

CREATE INDEX idx_tickets_owner_id ON tickets(owner_id);

CREATE TABLE ticket_files (
    ticket_id   TEXT NOT NULL REFERENCES tickets(id) ON DELETE CASCADE,
    file_id     TEXT NOT NULL REFERENCES files(id) ON DELETE CASCADE,
    PRIMARY KEY (ticket_id, file_id)
);

CREATE INDEX idx_ticket_files_file_id ON ticket_files(file_id);
"#,
    // v4: grants (share in)
    r#"
CREATE TABLE grants (
    id                                      TEXT PRIMARY KEY,
    owner_id                                TEXT NOT NULL REFERENCES users(id),
    comment                                 TEXT,
    hashed_password                         TEXT NOT NULL,
    created_at                              TEXT NOT NULL,
    expiry_type                             TEXT NOT NULL,
    expiry_total_days                       INTEGER NOT NULL DEFAULT 0,
    expiry_days_since_last_upload           INTEGER NOT NULL DEFAULT 0,
    expiry_total_uploads                    INTEGER NOT NULL DEFAULT 0,
    file_expiry_type                        TEXT NOT NULL,
    file_expiry_total_days                  INTEGER NOT NULL DEFAULT 0,
    file_expiry_days_since_last_download    INTEGER NOT NULL DEFAULT 0,
    file_expiry_total_downloads             INTEGER NOT NULL DEFAULT 0,
    last_upload                             TEXT,
    times_uploaded                          INTEGER NOT NULL DEFAULT 0,
    email_on_upload                         TEXT,
    creator_lang                            TEXT NOT NULL DEFAULT 'en'
);

CREATE INDEX idx_grants_owner_id ON grants(owner_id);

CREATE TABLE grant_files (
    grant_id    TEXT NOT NULL REFERENCES grants(id) ON DELETE CASCADE,
    file_id     TEXT NOT NULL REFERENCES files(id) ON DELETE CASCADE,
    PRIMARY KEY (grant_id, file_id)
);

CREATE INDEX idx_grant_files_file_id ON grant_files(file_id);
"#,
    // v5: ephemeral credentials
    r#"
CREATE TABLE sessions (
    id              TEXT PRIMARY KEY,          -- ID token
    user_id         TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    refresh_token   TEXT NOT NULL,
    expires_at      TEXT NOT NULL
);

CREATE INDEX idx_sessions_expires_at ON sessions(expires_at);

CREATE TABLE share_access_tokens (
    id          TEXT PRIMARY KEY,
    ticket_id   TEXT REFERENCES tickets(id) ON DELETE CASCADE,
    grant_id    TEXT REFERENCES grants(id) ON DELETE CASCADE,
    expires_at  TEXT NOT NULL
);

CREATE INDEX idx_share_access_tokens_expires_at ON share_access_tokens(expires_at);
"#,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_not_empty() {
        assert!(!MIGRATIONS.is_empty());
    }

    #[test]
    fn test_first_migration_contains_users_table() {
        assert!(MIGRATIONS[0].contains("CREATE TABLE users"));
        assert!(MIGRATIONS[0].contains("total_data_size"));
    }

    #[test]
    fn test_files_reference_blobs() {
        let sql = MIGRATIONS[1];
        assert!(sql.contains("CREATE TABLE blobs"));
        assert!(sql.contains("blob_hash                           TEXT NOT NULL REFERENCES blobs(hash)"));
        assert!(sql.contains("idx_files_blob_hash"));
    }

    #[test]
    fn test_join_tables_cascade() {
        assert!(MIGRATIONS[2].contains("CREATE TABLE ticket_files"));
        assert!(MIGRATIONS[3].contains("CREATE TABLE grant_files"));
        for sql in &MIGRATIONS[2..4] {
            assert!(sql.contains("REFERENCES files(id) ON DELETE CASCADE"));
        }
    }
}
