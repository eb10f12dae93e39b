use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;

use crate::error::Result;

/// Database connection pool wrapper
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection
    pub async fn new(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// Get the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                username TEXT NOT NULL DEFAULT '',
                role TEXT NOT NULL DEFAULT 'user',
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // One row per logical reference; rows sharing a hash share one blob
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS files (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                filename TEXT NOT NULL,
                blob_path TEXT NOT NULL,
                hash TEXT NOT NULL,
                size INTEGER NOT NULL,
                mime_type TEXT NOT NULL,
                is_master INTEGER NOT NULL DEFAULT 0,
                reference_count INTEGER NOT NULL DEFAULT 0,
                is_public INTEGER NOT NULL DEFAULT 0,
                download_count INTEGER NOT NULL DEFAULT 0,
                uploaded_at TEXT NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_files_user_id ON files(user_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_files_hash ON files(hash)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_files_master_candidates ON files(size, mime_type) WHERE is_master = 1",
        )
        .execute(&self.pool)
        .await?;

        // At most one master per digest, concurrent first uploads race on this index
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_files_master_hash ON files(hash) WHERE is_master = 1",
        )
        .execute(&self.pool)
        .await?;

        tracing::info!("Database migrations completed");
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;

    #[tokio::test]
    async fn test_second_master_for_same_hash_is_rejected() {
        let (_dir, db) = temp_database().await;
        insert_user(&db, "u1", "user").await;

        let insert = |id: &'static str| {
            sqlx::query(
                "INSERT INTO files (id, user_id, filename, blob_path, hash, size, mime_type, is_master, reference_count, uploaded_at)
                 VALUES (?, 'u1', 'a.txt', 'p', 'h', 1, 'text/plain', 1, 1, '2024-01-01T00:00:00Z')",
            )
            .bind(id)
        };

        insert("f1").execute(db.pool()).await.unwrap();
        let err = insert("f2").execute(db.pool()).await.unwrap_err();
        assert!(crate::error::is_unique_violation(&err));
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let (_dir, db) = temp_database().await;
        db.run_migrations().await.unwrap();
    }
}
