//! User model and repository.
//!
//! Users own files, tickets and grants. `total_data_size` is a denormalized
//! counter maintained by [`crate::file::AggregateRefresher`].

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqliteConnection;
use uuid::Uuid;

use super::DbPool;
use crate::{FransError, Result};

const USER_COLUMNS: &str = "id, username, full_name, email, is_admin, created_at, \
     submitted_tickets, submitted_grants, total_data_size";

/// User entity.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct User {
    pub id: String,
    pub username: String,
    pub full_name: String,
    pub email: String,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
    /// Number of tickets ever created, including deleted ones.
    pub submitted_tickets: i64,
    /// Number of grants ever created, including deleted ones.
    pub submitted_grants: i64,
    /// Sum of blob sizes over the user's live files, in bytes.
    pub total_data_size: i64,
}

/// New user for creation.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub full_name: String,
    pub email: String,
    pub is_admin: bool,
}

impl NewUser {
    pub fn new(username: impl Into<String>, full_name: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            full_name: full_name.into(),
            email: String::new(),
            is_admin: false,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = email.into();
        self
    }

    pub fn with_admin(mut self, is_admin: bool) -> Self {
        self.is_admin = is_admin;
        self
    }
}

/// User as shown to other users.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PublicUser {
    pub id: String,
    pub name: String,
    pub is_admin: bool,
    pub email: String,
}

impl From<&User> for PublicUser {
    fn from(user: &User) -> Self {
        Self {
            id: user.id.clone(),
            name: user.full_name.clone(),
            is_admin: user.is_admin,
            email: user.email.clone(),
        }
    }
}

/// User as shown on the admin overview.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminViewUser {
    #[serde(flatten)]
    pub user: PublicUser,
    pub active_tickets: i64,
    pub submitted_tickets: i64,
    pub active_grants: i64,
    pub submitted_grants: i64,
    pub total_data_size: i64,
}

/// Repository for user operations.
pub struct UserRepository<'a> {
    pool: &'a DbPool,
}

impl<'a> UserRepository<'a> {
    /// Create a new repository instance.
    pub fn new(pool: &'a DbPool) -> Self {
        Self { pool }
    }

    /// Create a new user.
    pub async fn create(&self, new_user: &NewUser) -> Result<User> {
        if new_user.username.trim().is_empty() {
            return Err(FransError::Validation("username must not be empty".into()));
        }

        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO users (id, username, full_name, email, is_admin, created_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&id)
        .bind(&new_user.username)
        .bind(&new_user.full_name)
        .bind(&new_user.email)
        .bind(new_user.is_admin)
        .bind(Utc::now())
        .execute(self.pool)
        .await?;

        self.get_by_id(&id)
            .await?
            .ok_or_else(|| FransError::NotFound("user".into()))
    }

    /// Get a user by ID.
    pub async fn get_by_id(&self, id: &str) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(self.pool)
        .await?;
        Ok(user)
    }

    /// Get a user by username.
    pub async fn get_by_username(&self, username: &str) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE username = $1"
        ))
        .bind(username)
        .fetch_optional(self.pool)
        .await?;
        Ok(user)
    }

    /// List all users ordered by username.
    pub async fn list(&self) -> Result<Vec<User>> {
        let users = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users ORDER BY username"
        ))
        .fetch_all(self.pool)
        .await?;
        Ok(users)
    }

    /// Build the admin overview entry for a user.
    pub async fn admin_view(&self, user: &User) -> Result<AdminViewUser> {
        let (active_tickets, active_grants): (i64, i64) = sqlx::query_as(
            "SELECT (SELECT COUNT(*) FROM tickets WHERE owner_id = $1),
                    (SELECT COUNT(*) FROM grants WHERE owner_id = $1)",
        )
        .bind(&user.id)
        .fetch_one(self.pool)
        .await?;

        Ok(AdminViewUser {
            user: PublicUser::from(user),
            active_tickets,
            submitted_tickets: user.submitted_tickets,
            active_grants,
            submitted_grants: user.submitted_grants,
            total_data_size: user.total_data_size,
        })
    }

    /// Bump the lifetime ticket counter inside the caller's transaction.
    pub async fn increment_submitted_tickets(conn: &mut SqliteConnection, id: &str) -> Result<()> {
        sqlx::query("UPDATE users SET submitted_tickets = submitted_tickets + 1 WHERE id = $1")
            .bind(id)
            .execute(conn)
            .await?;
        Ok(())
    }

    /// Bump the lifetime grant counter inside the caller's transaction.
    pub async fn increment_submitted_grants(conn: &mut SqliteConnection, id: &str) -> Result<()> {
        sqlx::query("UPDATE users SET submitted_grants = submitted_grants + 1 WHERE id = $1")
            .bind(id)
            .execute(conn)
            .await?;
        Ok(())
    }
}
