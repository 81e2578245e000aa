//! Per-user total data size.
//!
//! `users.total_data_size` is denormalized. It is always recomputed from the
//! live file rows, never adjusted incrementally.

use sqlx::SqliteConnection;
use tracing::{error, info};

use crate::db::Database;
use crate::{FransError, Result};

/// Recomputes `users.total_data_size`.
pub struct AggregateRefresher;

impl AggregateRefresher {
    /// Recompute a user's total inside the caller's transaction.
    ///
    /// Returns the new total in bytes.
    pub async fn refresh(conn: &mut SqliteConnection, user_id: &str) -> Result<i64> {
        // One statement, so a fresh transaction starts out as a writer
        let total: Option<i64> = sqlx::query_scalar(
            "UPDATE users SET total_data_size = (
                 SELECT COALESCE(SUM(b.size), 0)
                 FROM files f JOIN blobs b ON b.hash = f.blob_hash
                 WHERE f.owner_id = users.id
             )
             WHERE id = $1
             RETURNING total_data_size",
        )
        .bind(user_id)
        .fetch_optional(&mut *conn)
        .await?;

        total.ok_or_else(|| FransError::NotFound("user".into()))
    }

    /// Like [`refresh`](Self::refresh), but a failure is only logged.
    ///
    /// Used after deletions, which must not be undone because a counter
    /// could not be updated.
    pub async fn refresh_or_log(conn: &mut SqliteConnection, user_id: &str) -> Option<i64> {
        match Self::refresh(conn, user_id).await {
            Ok(total) => Some(total),
            Err(e) => {
                error!(user_id, error = %e, "could not refresh total data size");
                None
            }
        }
    }

    /// Recompute one user in a transaction of its own.
    pub async fn refresh_user(db: &Database, user_id: &str) -> Result<i64> {
        let mut tx = db.begin().await?;
        let total = Self::refresh(&mut tx, user_id).await?;
        tx.commit().await?;
        Ok(total)
    }

    /// Recompute every user, one transaction per user.
    ///
    /// Returns the number of users refreshed. Failures are logged and skipped.
    pub async fn refresh_all(db: &Database) -> Result<usize> {
        let user_ids: Vec<String> = sqlx::query_scalar("SELECT id FROM users")
            .fetch_all(db.pool())
            .await?;

        let mut refreshed = 0;
        for user_id in &user_ids {
            match Self::refresh_user(db, user_id).await {
                Ok(_) => refreshed += 1,
                Err(e) => error!(user_id = %user_id, error = %e, "could not refresh total data size"),
            }
        }

        info!(refreshed, total = user_ids.len(), "refreshed user data sizes");
        Ok(refreshed)
    }
}
