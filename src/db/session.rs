//! Ephemeral credentials: login sessions and share access tokens.
//!
//! Both are plain rows with an expiry timestamp. They are removed by the
//! session sweep once expired and carry no references to blobs.

use chrono::{DateTime, Duration, Utc};

use super::DbPool;
use crate::Result;

/// Login session issued by the identity provider.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Session {
    /// ID token.
    pub id: String,
    pub user_id: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

/// New session for creation.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub id: String,
    pub user_id: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

/// Repository for session operations.
pub struct SessionRepository<'a> {
    pool: &'a DbPool,
}

impl<'a> SessionRepository<'a> {
    /// Create a new repository instance.
    pub fn new(pool: &'a DbPool) -> Self {
        Self { pool }
    }

    /// Store a session.
    pub async fn create(&self, session: &NewSession) -> Result<()> {
        sqlx::query(
            "INSERT INTO sessions (id, user_id, refresh_token, expires_at)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(&session.id)
        .bind(&session.user_id)
        .bind(&session.refresh_token)
        .bind(session.expires_at)
        .execute(self.pool)
        .await?;
        Ok(())
    }

    /// Get a session by its ID token.
    pub async fn get(&self, id: &str) -> Result<Option<Session>> {
        let session = sqlx::query_as::<_, Session>(
            "SELECT id, user_id, refresh_token, expires_at FROM sessions WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(self.pool)
        .await?;
        Ok(session)
    }

    /// Delete a session (logout).
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM sessions WHERE id = $1")
            .bind(id)
            .execute(self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete sessions that expired strictly before `now`.
    ///
    /// Returns the number of deleted sessions.
    pub async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM sessions WHERE expires_at < $1")
            .bind(now)
            .execute(self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

/// Short-lived token granting access to a shared ticket or grant.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ShareAccessToken {
    pub id: String,
    pub ticket_id: Option<String>,
    pub grant_id: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// Repository for share access token operations.
pub struct ShareAccessTokenRepository<'a> {
    pool: &'a DbPool,
    lifetime: Duration,
}

impl<'a> ShareAccessTokenRepository<'a> {
    /// Create a new repository issuing tokens valid for `lifetime_secs` seconds.
    pub fn new(pool: &'a DbPool, lifetime_secs: i64) -> Self {
        Self {
            pool,
            lifetime: Duration::seconds(lifetime_secs),
        }
    }

    /// Issue a token for a ticket.
    pub async fn create_for_ticket(&self, ticket_id: &str) -> Result<ShareAccessToken> {
        self.create(Some(ticket_id), None).await
    }

    /// Issue a token for a grant.
    pub async fn create_for_grant(&self, grant_id: &str) -> Result<ShareAccessToken> {
        self.create(None, Some(grant_id)).await
    }

    async fn create(
        &self,
        ticket_id: Option<&str>,
        grant_id: Option<&str>,
    ) -> Result<ShareAccessToken> {
        let token = ShareAccessToken {
            id: hex::encode(rand::random::<[u8; 32]>()),
            ticket_id: ticket_id.map(str::to_string),
            grant_id: grant_id.map(str::to_string),
            expires_at: Utc::now() + self.lifetime,
        };

        sqlx::query(
            "INSERT INTO share_access_tokens (id, ticket_id, grant_id, expires_at)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(&token.id)
        .bind(&token.ticket_id)
        .bind(&token.grant_id)
        .bind(token.expires_at)
        .execute(self.pool)
        .await?;

        Ok(token)
    }

    /// Get a token if it exists and has not expired yet.
    pub async fn get_valid(&self, id: &str) -> Result<Option<ShareAccessToken>> {
        let token = sqlx::query_as::<_, ShareAccessToken>(
            "SELECT id, ticket_id, grant_id, expires_at
             FROM share_access_tokens WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(self.pool)
        .await?;
        Ok(token.filter(|t| t.expires_at >= Utc::now()))
    }

    /// Delete tokens that expired strictly before `now`.
    pub async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM share_access_tokens WHERE expires_at < $1")
            .bind(now)
            .execute(self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
