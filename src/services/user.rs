use crate::db::Database;
use crate::error::{AppError, Result};
use crate::models::{StorageUsageResponse, User, UserResponse, UserRole};
use crate::services::QuotaService;

/// User service
pub struct UserService;

impl UserService {
    /// Get user by ID
    pub async fn get_user(db: &Database, user_id: &str) -> Result<User> {
        let user: User = sqlx::query_as("SELECT * FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(db.pool())
            .await?
            .ok_or_else(|| AppError::NotFound("User not found".to_string()))?;

        Ok(user)
    }

    /// Register a principal on first sight. Known principals are only read,
    /// their stored username and role are never rewritten here.
    pub async fn ensure_user(
        db: &Database,
        user_id: &str,
        username: &str,
        role: UserRole,
    ) -> Result<User> {
        let existing: Option<User> = sqlx::query_as("SELECT * FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(db.pool())
            .await?;
        if let Some(user) = existing {
            return Ok(user);
        }

        let now = chrono::Utc::now().to_rfc3339();
        let inserted = sqlx::query(
            r#"
            INSERT INTO users (id, username, role, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(username)
        .bind(role.as_str())
        .bind(&now)
        .execute(db.pool())
        .await?;

        if inserted.rows_affected() > 0 {
            tracing::info!("Registered user {} as {}", user_id, role.as_str());
        }

        Self::get_user(db, user_id).await
    }

    /// Change a user's role (admin only)
    pub async fn set_role(db: &Database, user_id: &str, role: UserRole) -> Result<UserResponse> {
        let result = sqlx::query("UPDATE users SET role = ? WHERE id = ?")
            .bind(role.as_str())
            .bind(user_id)
            .execute(db.pool())
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound("User not found".to_string()));
        }

        tracing::info!("User {} role set to {}", user_id, role.as_str());
        let user = Self::get_user(db, user_id).await?;
        Ok(UserResponse::from(user))
    }

    /// Get storage usage against the configured quota
    pub async fn get_storage_usage(
        db: &Database,
        user_id: &str,
        limit: i64,
    ) -> Result<StorageUsageResponse> {
        let used = QuotaService::usage(db.pool(), user_id).await?;

        Ok(StorageUsageResponse {
            used_bytes: used,
            limit_bytes: limit,
            percentage: if limit > 0 {
                (used as f64 / limit as f64 * 100.0).round().min(255.0) as u8
            } else {
                0
            },
        })
    }
}
