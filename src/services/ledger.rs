//! Reference ledger for deduplicated content.
//!
//! Per digest there is exactly one master record while any record with that
//! digest exists. The master owns the physical blob and carries
//! `reference_count`, the number of records (itself included) sharing the
//! digest. Every function here runs on a connection inside a transaction and
//! issues its first write before reading ledger state, so SQLite holds the
//! write lock for the whole read-modify-write.

use sqlx::SqliteConnection;

use crate::error::{is_unique_violation, AppError, Result};
use crate::models::FileRecord;

/// Fields of a record about to be inserted
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub id: String,
    pub user_id: String,
    pub filename: String,
    pub hash: String,
    pub size: i64,
    pub mime_type: String,
    pub uploaded_at: String,
}

/// Result of trying to create a master
#[derive(Debug)]
pub enum MasterInsert {
    Inserted(FileRecord),
    /// Another master already holds this digest
    DigestTaken,
}

/// What happened to the content when a record was removed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Removal {
    /// A duplicate was dropped, the master's count went down by one
    DuplicateReleased { master_id: String, reference_count: i64 },
    /// The master was dropped and a duplicate took over the blob
    MasterPromoted { promoted_id: String, reference_count: i64 },
    /// The last reference was dropped, the blob must be removed
    BlobReleased { blob_path: String },
}

impl Removal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Removal::DuplicateReleased { .. } => "duplicate_released",
            Removal::MasterPromoted { .. } => "master_promoted",
            Removal::BlobReleased { .. } => "blob_released",
        }
    }
}

pub struct ReferenceLedger;

impl ReferenceLedger {
    /// Insert a new master with `reference_count = 1` for freshly written content
    pub async fn insert_master(
        conn: &mut SqliteConnection,
        record: &NewRecord,
        blob_path: &str,
    ) -> Result<MasterInsert> {
        let inserted = sqlx::query_as::<_, FileRecord>(
            r#"
            INSERT INTO files (id, user_id, filename, blob_path, hash, size, mime_type, is_master, reference_count, uploaded_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 1, 1, ?)
            RETURNING *
            "#,
        )
        .bind(&record.id)
        .bind(&record.user_id)
        .bind(&record.filename)
        .bind(blob_path)
        .bind(&record.hash)
        .bind(record.size)
        .bind(&record.mime_type)
        .bind(&record.uploaded_at)
        .fetch_one(&mut *conn)
        .await;

        match inserted {
            Ok(master) => {
                tracing::info!(file_id = %master.id, digest = %master.hash, "New master record");
                Ok(MasterInsert::Inserted(master))
            }
            Err(e) if is_unique_violation(&e) => {
                tracing::debug!(digest = %record.hash, "Digest already has a master");
                Ok(MasterInsert::DigestTaken)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Link a duplicate to the current master of `record.hash`.
    ///
    /// Returns the inserted duplicate, or `None` when no master exists for the
    /// digest any more (the caller then treats the upload as new content).
    pub async fn link_duplicate(
        conn: &mut SqliteConnection,
        record: &NewRecord,
    ) -> Result<Option<FileRecord>> {
        let master: Option<FileRecord> = sqlx::query_as(
            "UPDATE files SET reference_count = reference_count + 1 WHERE hash = ? AND is_master = 1 RETURNING *",
        )
        .bind(&record.hash)
        .fetch_optional(&mut *conn)
        .await?;

        let Some(master) = master else {
            return Ok(None);
        };

        let duplicate: FileRecord = sqlx::query_as(
            r#"
            INSERT INTO files (id, user_id, filename, blob_path, hash, size, mime_type, is_master, reference_count, uploaded_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 0, 0, ?)
            RETURNING *
            "#,
        )
        .bind(&record.id)
        .bind(&record.user_id)
        .bind(&record.filename)
        .bind(&master.blob_path)
        .bind(&record.hash)
        .bind(master.size)
        .bind(&record.mime_type)
        .bind(&record.uploaded_at)
        .fetch_one(&mut *conn)
        .await?;

        tracing::info!(
            file_id = %duplicate.id,
            master_id = %master.id,
            digest = %master.hash,
            reference_count = master.reference_count,
            "Linked duplicate record"
        );
        Ok(Some(duplicate))
    }

    /// Remove one record and rebalance the ledger for its digest.
    ///
    /// Returns `None` if the record does not exist.
    pub async fn remove_reference(
        conn: &mut SqliteConnection,
        file_id: &str,
    ) -> Result<Option<Removal>> {
        let removed: Option<FileRecord> =
            sqlx::query_as("DELETE FROM files WHERE id = ? RETURNING *")
                .bind(file_id)
                .fetch_optional(&mut *conn)
                .await?;

        let Some(removed) = removed else {
            return Ok(None);
        };

        let removal = if !removed.is_master {
            Self::release_duplicate(conn, &removed).await?
        } else if removed.reference_count > 1 {
            Self::promote_successor(conn, &removed).await?
        } else {
            Self::release_blob(conn, &removed).await?
        };

        Ok(Some(removal))
    }

    async fn release_duplicate(
        conn: &mut SqliteConnection,
        removed: &FileRecord,
    ) -> Result<Removal> {
        let master: Option<FileRecord> = sqlx::query_as(
            "UPDATE files SET reference_count = reference_count - 1 WHERE hash = ? AND is_master = 1 RETURNING *",
        )
        .bind(&removed.hash)
        .fetch_optional(&mut *conn)
        .await?;

        let master = master.ok_or_else(|| {
            AppError::Inconsistency(format!(
                "duplicate {} has no master for digest {}",
                removed.id, removed.hash
            ))
        })?;
        if master.reference_count < 1 {
            return Err(AppError::Inconsistency(format!(
                "master {} reference count dropped to {}",
                master.id, master.reference_count
            )));
        }

        tracing::info!(
            file_id = %removed.id,
            master_id = %master.id,
            reference_count = master.reference_count,
            "Released duplicate record"
        );
        Ok(Removal::DuplicateReleased {
            master_id: master.id,
            reference_count: master.reference_count,
        })
    }

    /// Hand the blob to any remaining duplicate; no ordering is implied
    async fn promote_successor(
        conn: &mut SqliteConnection,
        removed: &FileRecord,
    ) -> Result<Removal> {
        let successor: Option<FileRecord> =
            sqlx::query_as("SELECT * FROM files WHERE hash = ? AND is_master = 0 LIMIT 1")
                .bind(&removed.hash)
                .fetch_optional(&mut *conn)
                .await?;

        let successor = successor.ok_or_else(|| {
            AppError::Inconsistency(format!(
                "master {} claims {} references but no duplicate exists for digest {}",
                removed.id, removed.reference_count, removed.hash
            ))
        })?;

        let reference_count = removed.reference_count - 1;
        sqlx::query("UPDATE files SET is_master = 1, blob_path = ?, reference_count = ? WHERE id = ?")
            .bind(&removed.blob_path)
            .bind(reference_count)
            .bind(&successor.id)
            .execute(&mut *conn)
            .await?;

        tracing::info!(
            file_id = %removed.id,
            promoted_id = %successor.id,
            digest = %removed.hash,
            reference_count,
            "Promoted duplicate to master"
        );
        Ok(Removal::MasterPromoted {
            promoted_id: successor.id,
            reference_count,
        })
    }

    async fn release_blob(conn: &mut SqliteConnection, removed: &FileRecord) -> Result<Removal> {
        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM files WHERE hash = ?")
            .bind(&removed.hash)
            .fetch_one(&mut *conn)
            .await?;

        if remaining > 0 {
            return Err(AppError::Inconsistency(format!(
                "master {} was the sole reference but {} records remain for digest {}",
                removed.id, remaining, removed.hash
            )));
        }

        tracing::info!(file_id = %removed.id, digest = %removed.hash, "Released last reference");
        Ok(Removal::BlobReleased {
            blob_path: removed.blob_path.clone(),
        })
    }
}
