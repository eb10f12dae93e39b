use bytes::Bytes;
use chrono::Utc;
use sqlx::{QueryBuilder, Sqlite};
use std::io::SeekFrom;
use tokio::io::{AsyncRead, AsyncSeek, AsyncSeekExt};
use uuid::Uuid;

use crate::db::Database;
use crate::error::{AppError, Result};
use crate::models::{
    CurrentUser, DedupSummary, FileEntry, FileFilter, FileListResponse, FileResponse,
    PrivacyResponse, PublicFileListResponse, UploadResponse, UploadStatus,
};
use crate::services::{
    DuplicateResolver, MasterInsert, NewRecord, QuotaService, ReferenceLedger, Removal,
};
use crate::storage::{generate_blob_path, BlobStore};

/// Attempts to settle an upload that keeps losing races against concurrent
/// inserts or deletes of the same digest
const MAX_UPLOAD_ATTEMPTS: usize = 4;

const ENTRY_COLUMNS: &str = "SELECT f.id, f.user_id, f.filename, f.hash, f.size, f.mime_type, \
     f.is_master, f.reference_count, f.is_public, f.download_count, f.uploaded_at, \
     u.username AS uploader \
     FROM files f JOIN users u ON f.user_id = u.id WHERE 1=1";

/// Outcome of the new-content path
enum NewContent {
    Stored(UploadResponse),
    /// A concurrent upload became master first
    DigestTaken,
}

/// File service
pub struct FileService;

impl FileService {
    /// Upload a file.
    ///
    /// New content is quota-checked, written to the blob store and recorded
    /// as a master. Content matching an existing master only adds a duplicate
    /// record and is not quota-checked.
    pub async fn upload_file<R>(
        db: &Database,
        storage: &dyn BlobStore,
        quota_bytes: i64,
        user_id: &str,
        file_name: String,
        content_type: Option<String>,
        reader: &mut R,
        declared_size: u64,
    ) -> Result<UploadResponse>
    where
        R: AsyncRead + AsyncSeek + Send + Unpin,
    {
        // Validate file name
        if file_name.is_empty() || file_name.contains('/') || file_name.contains('\\') {
            return Err(AppError::BadRequest("Invalid file name".to_string()));
        }
        let size = i64::try_from(declared_size)
            .map_err(|_| AppError::BadRequest("File too large".to_string()))?;
        let mime_type = Self::media_type(&file_name, content_type);

        let candidates = DuplicateResolver::find_candidates(db, size, &mime_type).await?;
        let resolution = DuplicateResolver::resolve(reader, declared_size, candidates).await?;

        let record = NewRecord {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            filename: file_name,
            hash: resolution.digest,
            size,
            mime_type,
            uploaded_at: Utc::now().to_rfc3339(),
        };

        let mut try_link = resolution.matched.is_some();
        for attempt in 1..=MAX_UPLOAD_ATTEMPTS {
            if try_link {
                if let Some(response) = Self::link_duplicate(db, &record).await? {
                    return Ok(response);
                }
                tracing::debug!(digest = %record.hash, attempt, "Master vanished, storing as new content");
            }

            match Self::store_new_content(db, storage, quota_bytes, &record, reader).await? {
                NewContent::Stored(response) => return Ok(response),
                NewContent::DigestTaken => {
                    tracing::info!(digest = %record.hash, attempt, "Lost master race, linking instead");
                    try_link = true;
                }
            }
        }

        Err(AppError::Internal(format!(
            "Upload of digest {} did not settle after {} attempts",
            record.hash, MAX_UPLOAD_ATTEMPTS
        )))
    }

    /// Prefer the declared media type, otherwise guess from the file name
    fn media_type(file_name: &str, content_type: Option<String>) -> String {
        content_type
            .map(|ct| ct.trim().to_lowercase())
            .filter(|ct| !ct.is_empty())
            .unwrap_or_else(|| {
                mime_guess::from_path(file_name)
                    .first_or_octet_stream()
                    .essence_str()
                    .to_string()
            })
    }

    async fn link_duplicate(db: &Database, record: &NewRecord) -> Result<Option<UploadResponse>> {
        let mut tx = db.pool().begin().await?;
        let Some(duplicate) = ReferenceLedger::link_duplicate(&mut tx, record).await? else {
            tx.rollback().await?;
            return Ok(None);
        };
        tx.commit().await?;

        Ok(Some(UploadResponse {
            id: duplicate.id,
            filename: duplicate.filename,
            status: UploadStatus::LinkedDuplicate,
            digest: duplicate.hash,
            size: duplicate.size,
            mime_type: duplicate.mime_type,
        }))
    }

    async fn store_new_content<R>(
        db: &Database,
        storage: &dyn BlobStore,
        quota_bytes: i64,
        record: &NewRecord,
        reader: &mut R,
    ) -> Result<NewContent>
    where
        R: AsyncRead + AsyncSeek + Send + Unpin,
    {
        // Reject before touching the blob store
        QuotaService::check(db.pool(), &record.user_id, record.size, quota_bytes)
            .await?
            .into_result()
            .map_err(|e| {
                tracing::warn!(user_id = %record.user_id, "Upload rejected by quota: {}", e);
                e
            })?;

        let blob_path = generate_blob_path(&record.filename);
        reader.seek(SeekFrom::Start(0)).await?;
        let written = match storage.put_reader(&blob_path, reader).await {
            Ok(written) => written,
            Err(e) => {
                Self::discard_blob(storage, &blob_path).await;
                return Err(e);
            }
        };
        if written != record.size as u64 {
            Self::discard_blob(storage, &blob_path).await;
            return Err(AppError::Storage(format!(
                "Wrote {} bytes for a {} byte upload",
                written, record.size
            )));
        }

        match Self::record_master(db, quota_bytes, record, &blob_path).await {
            Ok(Some(response)) => Ok(NewContent::Stored(response)),
            Ok(None) => {
                Self::discard_blob(storage, &blob_path).await;
                Ok(NewContent::DigestTaken)
            }
            Err(e) => {
                Self::discard_blob(storage, &blob_path).await;
                Err(e)
            }
        }
    }

    /// Insert the master and re-validate the quota in the same transaction,
    /// so concurrent uploads by one user cannot jointly exceed it
    async fn record_master(
        db: &Database,
        quota_bytes: i64,
        record: &NewRecord,
        blob_path: &str,
    ) -> Result<Option<UploadResponse>> {
        let mut tx = db.pool().begin().await?;

        let master = match ReferenceLedger::insert_master(&mut tx, record, blob_path).await? {
            MasterInsert::Inserted(master) => master,
            MasterInsert::DigestTaken => {
                tx.rollback().await?;
                return Ok(None);
            }
        };

        let used = QuotaService::usage(&mut *tx, &record.user_id).await?;
        if used > quota_bytes {
            tx.rollback().await?;
            tracing::warn!(user_id = %record.user_id, used, quota_bytes, "Concurrent uploads exceeded quota");
            return Err(AppError::QuotaExceeded {
                limit: quota_bytes,
                attempted: used,
            });
        }

        tx.commit().await?;

        Ok(Some(UploadResponse {
            id: master.id,
            filename: master.filename,
            status: UploadStatus::New,
            digest: master.hash,
            size: master.size,
            mime_type: master.mime_type,
        }))
    }

    async fn discard_blob(storage: &dyn BlobStore, blob_path: &str) {
        if let Err(e) = storage.delete(blob_path).await {
            tracing::error!("Failed to discard blob {}: {}", blob_path, e);
        }
    }

    /// Delete one record owned by `user_id`.
    ///
    /// Only the owner of the record may delete it, whether it is a master or
    /// a duplicate. The blob is removed after the ledger commit when the last
    /// reference goes away.
    pub async fn delete_file(
        db: &Database,
        storage: &dyn BlobStore,
        user_id: &str,
        file_id: &str,
    ) -> Result<Removal> {
        let file = Self::get_entry(db, file_id).await?;

        // Check ownership
        if file.user_id != user_id {
            return Err(AppError::Forbidden("Access denied".to_string()));
        }

        let mut tx = db.pool().begin().await?;
        let removal = ReferenceLedger::remove_reference(&mut tx, file_id)
            .await?
            .ok_or_else(|| AppError::NotFound("File not found".to_string()))?;
        tx.commit().await?;

        if let Removal::BlobReleased { blob_path } = &removal {
            storage.delete(blob_path).await.map_err(|e| {
                tracing::error!("Record {} removed but blob {} remains: {}", file_id, blob_path, e);
                e
            })?;
        }

        Ok(removal)
    }

    /// List a user's own files with the deduplication summary
    pub async fn list_owned(
        db: &Database,
        user_id: &str,
        filter: FileFilter,
    ) -> Result<FileListResponse> {
        let filter = filter.owner(user_id);
        Self::list_with_summary(db, &filter).await
    }

    /// List every file (admin only)
    pub async fn list_all(
        db: &Database,
        current_user: &CurrentUser,
        filter: FileFilter,
    ) -> Result<FileListResponse> {
        if !current_user.is_admin() {
            return Err(AppError::Forbidden("Admin access required".to_string()));
        }
        Self::list_with_summary(db, &filter).await
    }

    /// List public files
    pub async fn list_public(db: &Database) -> Result<PublicFileListResponse> {
        let filter = FileFilter::new().public(true);
        let entries = Self::query_entries(db, &filter).await?;
        let total = entries.len() as i64;

        Ok(PublicFileListResponse {
            files: entries.into_iter().map(FileResponse::from).collect(),
            total,
        })
    }

    async fn list_with_summary(db: &Database, filter: &FileFilter) -> Result<FileListResponse> {
        let entries = Self::query_entries(db, filter).await?;
        let summary = DedupSummary::from_entries(&entries);

        Ok(FileListResponse {
            files: entries.into_iter().map(FileResponse::from).collect(),
            summary,
        })
    }

    /// Run a filtered listing query, newest first
    pub async fn query_entries(db: &Database, filter: &FileFilter) -> Result<Vec<FileEntry>> {
        let mut qb = QueryBuilder::<Sqlite>::new(ENTRY_COLUMNS);
        filter.push_conditions(&mut qb);
        qb.push(" ORDER BY f.uploaded_at DESC, f.id");

        let entries = qb.build_query_as::<FileEntry>().fetch_all(db.pool()).await?;
        Ok(entries)
    }

    async fn get_entry(db: &Database, file_id: &str) -> Result<FileEntry> {
        let mut qb = QueryBuilder::<Sqlite>::new(ENTRY_COLUMNS);
        qb.push(" AND f.id = ").push_bind(file_id.to_string());

        qb.build_query_as::<FileEntry>()
            .fetch_optional(db.pool())
            .await?
            .ok_or_else(|| AppError::NotFound("File not found".to_string()))
    }

    /// Owner, admin, or anyone for public files
    fn can_read(entry: &FileEntry, current_user: &CurrentUser) -> bool {
        entry.is_public || current_user.is_admin() || entry.user_id == current_user.id
    }

    /// Get file details
    pub async fn get_file(
        db: &Database,
        current_user: &CurrentUser,
        file_id: &str,
    ) -> Result<FileResponse> {
        let entry = Self::get_entry(db, file_id).await?;
        if !Self::can_read(&entry, current_user) {
            return Err(AppError::Forbidden("Access denied".to_string()));
        }
        Ok(FileResponse::from(entry))
    }

    /// Read file content and count the download
    pub async fn download_file(
        db: &Database,
        storage: &dyn BlobStore,
        current_user: &CurrentUser,
        file_id: &str,
    ) -> Result<(FileResponse, Bytes)> {
        let entry = Self::get_entry(db, file_id).await?;
        if !Self::can_read(&entry, current_user) {
            return Err(AppError::Forbidden("Access denied".to_string()));
        }

        let blob_path: String = sqlx::query_scalar("SELECT blob_path FROM files WHERE id = ?")
            .bind(file_id)
            .fetch_optional(db.pool())
            .await?
            .ok_or_else(|| AppError::NotFound("File not found".to_string()))?;

        let data = storage.get(&blob_path).await.map_err(|e| match e {
            AppError::NotFound(_) => {
                AppError::Inconsistency(format!("Blob {} of file {} is missing", blob_path, file_id))
            }
            other => other,
        })?;

        sqlx::query("UPDATE files SET download_count = download_count + 1 WHERE id = ?")
            .bind(file_id)
            .execute(db.pool())
            .await?;

        let mut response = FileResponse::from(entry);
        response.download_count += 1;
        Ok((response, data))
    }

    /// Flip a file between public and private
    pub async fn toggle_privacy(
        db: &Database,
        user_id: &str,
        file_id: &str,
    ) -> Result<PrivacyResponse> {
        let entry = Self::get_entry(db, file_id).await?;

        // Check ownership
        if entry.user_id != user_id {
            return Err(AppError::Forbidden("Access denied".to_string()));
        }

        let is_public: bool =
            sqlx::query_scalar("UPDATE files SET is_public = NOT is_public WHERE id = ? RETURNING is_public")
                .bind(file_id)
                .fetch_optional(db.pool())
                .await?
                .ok_or_else(|| AppError::NotFound("File not found".to_string()))?;

        Ok(PrivacyResponse {
            id: file_id.to_string(),
            is_public,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::{insert_user, temp_database};
    use crate::models::{FileQuery, FileRecord, UserRole};
    use crate::storage::LocalBlobStore;
    use std::io::Cursor;
    use std::sync::Arc;
    use tempfile::TempDir;

    const QUOTA: i64 = 1000;

    struct Fixture {
        _db_dir: TempDir,
        blob_dir: TempDir,
        db: Database,
        storage: Arc<LocalBlobStore>,
    }

    async fn fixture() -> Fixture {
        let (db_dir, db) = temp_database().await;
        for user in ["alice", "bob", "carol"] {
            insert_user(&db, user, "user").await;
        }
        insert_user(&db, "root", "admin").await;
        let blob_dir = TempDir::new().unwrap();
        let storage = Arc::new(LocalBlobStore::new(blob_dir.path()));
        Fixture {
            _db_dir: db_dir,
            blob_dir,
            db,
            storage,
        }
    }

    impl Fixture {
        async fn upload(&self, user: &str, name: &str, data: &[u8]) -> Result<UploadResponse> {
            let mut cursor = Cursor::new(data.to_vec());
            FileService::upload_file(
                &self.db,
                self.storage.as_ref(),
                QUOTA,
                user,
                name.to_string(),
                None,
                &mut cursor,
                data.len() as u64,
            )
            .await
        }

        async fn records(&self, digest: &str) -> Vec<FileRecord> {
            sqlx::query_as("SELECT * FROM files WHERE hash = ?")
                .bind(digest)
                .fetch_all(self.db.pool())
                .await
                .unwrap()
        }

        fn blob_count(&self) -> usize {
            fn walk(dir: &std::path::Path) -> usize {
                std::fs::read_dir(dir)
                    .unwrap()
                    .map(|e| e.unwrap().path())
                    .map(|p| if p.is_dir() { walk(&p) } else { 1 })
                    .sum()
            }
            walk(self.blob_dir.path())
        }
    }

    fn user(id: &str, role: UserRole) -> CurrentUser {
        CurrentUser {
            id: id.to_string(),
            role,
        }
    }

    #[tokio::test]
    async fn test_identical_uploads_share_one_blob() {
        let f = fixture().await;

        let first = f.upload("alice", "a.txt", b"same bytes").await.unwrap();
        let second = f.upload("bob", "b.txt", b"same bytes").await.unwrap();

        assert_eq!(first.status, UploadStatus::New);
        assert_eq!(second.status, UploadStatus::LinkedDuplicate);
        assert_eq!(first.digest, second.digest);

        let records = f.records(&first.digest).await;
        assert_eq!(records.len(), 2);
        let master = records.iter().find(|r| r.is_master).unwrap();
        let duplicate = records.iter().find(|r| !r.is_master).unwrap();
        assert_eq!(master.reference_count, 2);
        assert_eq!(master.blob_path, duplicate.blob_path);
        assert_eq!(duplicate.filename, "b.txt");
        assert_eq!(f.blob_count(), 1);
    }

    #[tokio::test]
    async fn test_same_user_uploading_twice_is_deduplicated() {
        let f = fixture().await;
        f.upload("alice", "a.txt", b"again").await.unwrap();
        let second = f.upload("alice", "a-copy.txt", b"again").await.unwrap();

        assert_eq!(second.status, UploadStatus::LinkedDuplicate);
        assert_eq!(f.blob_count(), 1);
    }

    #[tokio::test]
    async fn test_different_media_type_still_deduplicates() {
        let f = fixture().await;
        let first = f.upload("alice", "notes.txt", b"plain words").await.unwrap();
        let second = f.upload("bob", "notes.md", b"plain words").await.unwrap();

        assert_eq!(second.status, UploadStatus::LinkedDuplicate);
        assert_eq!(f.records(&first.digest).await.len(), 2);
        assert_eq!(f.blob_count(), 1);
    }

    #[tokio::test]
    async fn test_delete_duplicate_keeps_blob() {
        let f = fixture().await;
        let first = f.upload("alice", "a.txt", b"shared").await.unwrap();
        let second = f.upload("bob", "b.txt", b"shared").await.unwrap();

        let removal = FileService::delete_file(&f.db, f.storage.as_ref(), "bob", &second.id)
            .await
            .unwrap();
        assert_eq!(
            removal,
            Removal::DuplicateReleased {
                master_id: first.id.clone(),
                reference_count: 1
            }
        );

        let records = f.records(&first.digest).await;
        assert_eq!(records.len(), 1);
        assert!(records[0].is_master);
        assert!(f.storage.exists(&records[0].blob_path).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_master_promotes_duplicate() {
        let f = fixture().await;
        let master = f.upload("alice", "a.txt", b"promote me").await.unwrap();
        let a = f.upload("bob", "b.txt", b"promote me").await.unwrap();
        let b = f.upload("carol", "c.txt", b"promote me").await.unwrap();

        let blob_path = f.records(&master.digest).await[0].blob_path.clone();

        let removal = FileService::delete_file(&f.db, f.storage.as_ref(), "alice", &master.id)
            .await
            .unwrap();
        let (promoted_id, reference_count) = match removal {
            Removal::MasterPromoted { promoted_id, reference_count } => (promoted_id, reference_count),
            other => panic!("expected promotion, got {:?}", other),
        };
        assert!(promoted_id == a.id || promoted_id == b.id);
        assert_eq!(reference_count, 2);

        let records = f.records(&master.digest).await;
        assert_eq!(records.len(), 2);
        let masters: Vec<_> = records.iter().filter(|r| r.is_master).collect();
        assert_eq!(masters.len(), 1);
        assert_eq!(masters[0].id, promoted_id);
        assert_eq!(masters[0].reference_count, 2);
        assert!(records.iter().all(|r| r.blob_path == blob_path));

        let content = f.storage.get(&blob_path).await.unwrap();
        assert_eq!(content.as_ref(), b"promote me");
    }

    #[tokio::test]
    async fn test_delete_last_reference_removes_blob() {
        let f = fixture().await;
        let upload = f.upload("alice", "solo.txt", b"only one").await.unwrap();
        let blob_path = f.records(&upload.digest).await[0].blob_path.clone();

        let removal = FileService::delete_file(&f.db, f.storage.as_ref(), "alice", &upload.id)
            .await
            .unwrap();
        assert_eq!(removal, Removal::BlobReleased { blob_path: blob_path.clone() });

        assert!(f.records(&upload.digest).await.is_empty());
        assert!(!f.storage.exists(&blob_path).await.unwrap());
        assert_eq!(f.blob_count(), 0);
    }

    #[tokio::test]
    async fn test_delete_requires_record_owner() {
        let f = fixture().await;
        let master = f.upload("alice", "a.txt", b"mine").await.unwrap();
        let duplicate = f.upload("bob", "b.txt", b"mine").await.unwrap();

        // The master's owner cannot delete someone else's duplicate, nor can an admin
        for (user, id) in [("alice", &duplicate.id), ("bob", &master.id), ("root", &master.id)] {
            let result = FileService::delete_file(&f.db, f.storage.as_ref(), user, id).await;
            assert!(matches!(result, Err(AppError::Forbidden(_))));
        }

        // Deleting a duplicate never needs the master's owner
        FileService::delete_file(&f.db, f.storage.as_ref(), "bob", &duplicate.id)
            .await
            .unwrap();

        let missing = FileService::delete_file(&f.db, f.storage.as_ref(), "bob", &duplicate.id).await;
        assert!(matches!(missing, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_quota_boundary() {
        let f = fixture().await;
        f.upload("alice", "first.bin", &[1u8; 400]).await.unwrap();

        // Exactly the remaining 600 bytes fits
        f.upload("alice", "fill.bin", &[2u8; 600]).await.unwrap();
        let usage = QuotaService::usage(f.db.pool(), "alice").await.unwrap();
        assert_eq!(usage, QUOTA);

        f.upload("bob", "base.bin", &[3u8; 400]).await.unwrap();
        let err = f.upload("bob", "over.bin", &[4u8; 601]).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::QuotaExceeded { limit: QUOTA, attempted } if attempted == QUOTA + 1
        ));
        // Rejected upload left nothing behind
        assert_eq!(QuotaService::usage(f.db.pool(), "bob").await.unwrap(), 400);
        assert_eq!(f.blob_count(), 3);
    }

    #[tokio::test]
    async fn test_duplicate_link_bypasses_quota() {
        let f = fixture().await;
        f.upload("alice", "big.bin", &[9u8; 900]).await.unwrap();
        f.upload("bob", "filler.bin", &[8u8; 900]).await.unwrap();

        // Bob is at 900 of 1000, but linking to alice's content always succeeds
        let linked = f.upload("bob", "copy.bin", &[9u8; 900]).await.unwrap();
        assert_eq!(linked.status, UploadStatus::LinkedDuplicate);
        assert_eq!(QuotaService::usage(f.db.pool(), "bob").await.unwrap(), 1800);
    }

    #[tokio::test]
    async fn test_size_mismatch_is_rejected_without_side_effects() {
        let f = fixture().await;
        let mut cursor = Cursor::new(b"12345".to_vec());
        let result = FileService::upload_file(
            &f.db,
            f.storage.as_ref(),
            QUOTA,
            "alice",
            "x.txt".to_string(),
            None,
            &mut cursor,
            4,
        )
        .await;
        assert!(matches!(result, Err(AppError::BadRequest(_))));
        assert_eq!(f.blob_count(), 0);
    }

    /// Persists the bytes, then reports the write as failed
    struct SyncFailingStore {
        inner: LocalBlobStore,
    }

    #[async_trait::async_trait]
    impl BlobStore for SyncFailingStore {
        async fn put_reader(
            &self,
            path: &str,
            reader: &mut (dyn AsyncRead + Send + Unpin),
        ) -> Result<u64> {
            self.inner.put_reader(path, reader).await?;
            Err(AppError::Storage("sync failed".to_string()))
        }

        async fn get(&self, path: &str) -> Result<Bytes> {
            self.inner.get(path).await
        }

        async fn delete(&self, path: &str) -> Result<()> {
            self.inner.delete(path).await
        }

        async fn exists(&self, path: &str) -> Result<bool> {
            self.inner.exists(path).await
        }

        fn storage_type(&self) -> &'static str {
            "failing"
        }
    }

    #[tokio::test]
    async fn test_failed_blob_write_leaves_nothing_behind() {
        let f = fixture().await;
        let store = SyncFailingStore {
            inner: LocalBlobStore::new(f.blob_dir.path()),
        };

        let data = b"never durable";
        let mut cursor = Cursor::new(data.to_vec());
        let result = FileService::upload_file(
            &f.db,
            &store,
            QUOTA,
            "alice",
            "lost.txt".to_string(),
            None,
            &mut cursor,
            data.len() as u64,
        )
        .await;

        assert!(matches!(result, Err(AppError::Storage(_))));
        assert_eq!(f.blob_count(), 0);
        assert_eq!(QuotaService::usage(f.db.pool(), "alice").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_invalid_file_name() {
        let f = fixture().await;
        let result = f.upload("alice", "../evil", b"x").await;
        assert!(matches!(result, Err(AppError::BadRequest(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_identical_uploads_elect_one_master() {
        let f = Arc::new(fixture().await);
        let data = vec![42u8; 512];

        let mut handles = Vec::new();
        for user in ["alice", "bob", "carol", "root"] {
            let f = Arc::clone(&f);
            let data = data.clone();
            handles.push(tokio::spawn(async move {
                f.upload(user, &format!("{}.bin", user), &data).await
            }));
        }

        let mut digest = None;
        let mut new_count = 0;
        for handle in handles {
            let upload = handle.await.unwrap().unwrap();
            if upload.status == UploadStatus::New {
                new_count += 1;
            }
            digest = Some(upload.digest);
        }

        let records = f.records(&digest.unwrap()).await;
        assert_eq!(records.len(), 4);
        let masters: Vec<_> = records.iter().filter(|r| r.is_master).collect();
        assert_eq!(masters.len(), 1);
        assert_eq!(new_count, 1);
        assert_eq!(masters[0].reference_count, 4);
        assert!(records.iter().all(|r| r.blob_path == masters[0].blob_path));
        assert_eq!(f.blob_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_uploads_by_one_user_respect_quota() {
        let f = Arc::new(fixture().await);

        let mut handles = Vec::new();
        for i in 0..4u8 {
            let f = Arc::clone(&f);
            handles.push(tokio::spawn(async move {
                f.upload("alice", &format!("{}.bin", i), &[i; 400]).await
            }));
        }

        let mut accepted = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => accepted += 1,
                Err(AppError::QuotaExceeded { .. }) => {}
                Err(e) => panic!("unexpected error: {}", e),
            }
        }

        assert_eq!(accepted, 2);
        assert_eq!(QuotaService::usage(f.db.pool(), "alice").await.unwrap(), 800);
        assert_eq!(f.blob_count(), 2);
    }

    #[tokio::test]
    async fn test_list_owned_with_summary() {
        let f = fixture().await;
        f.upload("alice", "a.txt", b"shared content").await.unwrap();
        f.upload("alice", "a2.txt", b"shared content").await.unwrap();
        f.upload("alice", "other.txt", b"xyz").await.unwrap();
        f.upload("bob", "b.txt", b"bob only").await.unwrap();

        let listing = FileService::list_owned(&f.db, "alice", FileFilter::new())
            .await
            .unwrap();
        assert_eq!(listing.files.len(), 3);
        assert!(listing.files.iter().all(|file| file.uploader_id == "alice"));
        assert_eq!(listing.summary.original_bytes, 14 + 14 + 3);
        assert_eq!(listing.summary.dedup_bytes, 14 + 3);
        assert_eq!(listing.summary.saved_bytes, 14);

        // Owner is forced even if the filter names someone else
        let listing = FileService::list_owned(&f.db, "alice", FileFilter::new().owner("bob"))
            .await
            .unwrap();
        assert!(listing.files.iter().all(|file| file.uploader_id == "alice"));
    }

    #[tokio::test]
    async fn test_list_filters_by_digest_and_search() {
        let f = fixture().await;
        let up = f.upload("alice", "report.txt", b"quarterly").await.unwrap();
        f.upload("alice", "holiday.txt", b"beach").await.unwrap();

        let by_digest = FileService::list_owned(&f.db, "alice", FileFilter::new().digest(&up.digest))
            .await
            .unwrap();
        assert_eq!(by_digest.files.len(), 1);
        assert_eq!(by_digest.files[0].id, up.id);

        let search = FileFilter {
            search: Some("REPORT".to_string()),
            ..FileFilter::default()
        };
        let by_name = FileService::list_owned(&f.db, "alice", search).await.unwrap();
        assert_eq!(by_name.files.len(), 1);
        assert_eq!(by_name.files[0].filename, "report.txt");
    }

    #[tokio::test]
    async fn test_list_duplicates_from_query() {
        let f = fixture().await;
        let up = f.upload("alice", "a.txt", b"twice").await.unwrap();
        let copy = f.upload("alice", "b.txt", b"twice").await.unwrap();
        f.upload("alice", "c.txt", b"other").await.unwrap();

        let filter = FileFilter::from_query(FileQuery {
            digest: Some(up.digest.to_uppercase()),
            master: Some(false),
            ..FileQuery::default()
        })
        .unwrap();
        let listing = FileService::list_owned(&f.db, "alice", filter).await.unwrap();
        assert_eq!(listing.files.len(), 1);
        assert_eq!(listing.files[0].id, copy.id);
        assert_eq!(listing.files[0].reference_count, None);

        let masters = FileService::list_owned(&f.db, "alice", FileFilter::new().digest(&up.digest).master(true))
            .await
            .unwrap();
        assert_eq!(masters.files.len(), 1);
        assert_eq!(masters.files[0].reference_count, Some(2));
    }

    #[tokio::test]
    async fn test_list_all_requires_admin() {
        let f = fixture().await;
        f.upload("alice", "a.txt", b"one").await.unwrap();
        f.upload("bob", "b.txt", b"one").await.unwrap();

        let denied = FileService::list_all(&f.db, &user("alice", UserRole::User), FileFilter::new()).await;
        assert!(matches!(denied, Err(AppError::Forbidden(_))));

        let listing = FileService::list_all(&f.db, &user("root", UserRole::Admin), FileFilter::new())
            .await
            .unwrap();
        assert_eq!(listing.files.len(), 2);
        assert_eq!(listing.summary.saved_bytes, 3);
    }

    #[tokio::test]
    async fn test_privacy_and_download() {
        let f = fixture().await;
        let up = f.upload("alice", "a.txt", b"hello world").await.unwrap();
        let bob = user("bob", UserRole::User);

        let denied = FileService::download_file(&f.db, f.storage.as_ref(), &bob, &up.id).await;
        assert!(matches!(denied, Err(AppError::Forbidden(_))));

        let toggled = FileService::toggle_privacy(&f.db, "bob", &up.id).await;
        assert!(matches!(toggled, Err(AppError::Forbidden(_))));

        let toggled = FileService::toggle_privacy(&f.db, "alice", &up.id).await.unwrap();
        assert!(toggled.is_public);

        let (meta, data) = FileService::download_file(&f.db, f.storage.as_ref(), &bob, &up.id)
            .await
            .unwrap();
        assert_eq!(data.as_ref(), b"hello world");
        assert_eq!(meta.download_count, 1);

        let public = FileService::list_public(&f.db).await.unwrap();
        assert_eq!(public.total, 1);
        assert_eq!(public.files[0].download_count, 1);
        assert_eq!(public.files[0].uploader, "alice-name");

        let details = FileService::get_file(&f.db, &bob, &up.id).await.unwrap();
        assert_eq!(details.digest, up.digest);
    }
}
