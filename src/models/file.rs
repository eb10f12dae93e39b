use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// File record - one row per logical reference to stored content
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct FileRecord {
    pub id: String,
    pub user_id: String,
    pub filename: String,
    /// Physical location, identical for every record sharing `hash`
    pub blob_path: String,
    pub hash: String,
    pub size: i64,
    pub mime_type: String,
    pub is_master: bool,
    /// Only meaningful on the master: number of records sharing `hash`
    pub reference_count: i64,
    pub is_public: bool,
    pub download_count: i64,
    pub uploaded_at: String,
}

/// File record joined with its uploader
#[derive(Debug, Clone, FromRow)]
pub struct FileEntry {
    pub id: String,
    pub user_id: String,
    pub filename: String,
    pub hash: String,
    pub size: i64,
    pub mime_type: String,
    pub is_master: bool,
    pub reference_count: i64,
    pub is_public: bool,
    pub download_count: i64,
    pub uploaded_at: String,
    pub uploader: String,
}

/// File response, the blob path stays server-side
#[derive(Debug, Clone, Serialize)]
pub struct FileResponse {
    pub id: String,
    pub filename: String,
    pub size: i64,
    pub mime_type: String,
    pub digest: String,
    pub uploader_id: String,
    pub uploader: String,
    /// Master records are the ones that occupy physical storage
    pub is_master: bool,
    /// Records sharing this content; absent on duplicates
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_count: Option<i64>,
    pub is_public: bool,
    pub download_count: i64,
    pub uploaded_at: String,
}

impl From<FileEntry> for FileResponse {
    fn from(entry: FileEntry) -> Self {
        Self {
            id: entry.id,
            filename: entry.filename,
            size: entry.size,
            mime_type: entry.mime_type,
            digest: entry.hash,
            uploader_id: entry.user_id,
            uploader: entry.uploader,
            is_master: entry.is_master,
            reference_count: entry.is_master.then_some(entry.reference_count),
            is_public: entry.is_public,
            download_count: entry.download_count,
            uploaded_at: entry.uploaded_at,
        }
    }
}

/// How an upload was stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    New,
    LinkedDuplicate,
}

/// Upload response
#[derive(Debug, Clone, Serialize)]
pub struct UploadResponse {
    pub id: String,
    pub filename: String,
    pub status: UploadStatus,
    pub digest: String,
    pub size: i64,
    pub mime_type: String,
}

/// Deduplication savings over a listing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DedupSummary {
    pub original_bytes: i64,
    pub dedup_bytes: i64,
    pub saved_bytes: i64,
}

impl DedupSummary {
    /// Every record counts toward the original size, only masters toward the stored size
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a FileEntry>) -> Self {
        let mut summary = Self::default();
        for entry in entries {
            summary.original_bytes += entry.size;
            if entry.is_master {
                summary.dedup_bytes += entry.size;
            }
        }
        summary.saved_bytes = summary.original_bytes - summary.dedup_bytes;
        summary
    }
}

/// File list response
#[derive(Debug, Serialize)]
pub struct FileListResponse {
    pub files: Vec<FileResponse>,
    pub summary: DedupSummary,
}

/// Public file list response
#[derive(Debug, Serialize)]
pub struct PublicFileListResponse {
    pub files: Vec<FileResponse>,
    pub total: i64,
}

/// Privacy toggle response
#[derive(Debug, Serialize)]
pub struct PrivacyResponse {
    pub id: String,
    pub is_public: bool,
}

/// Delete response
#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub id: String,
    pub outcome: String,
}

/// Storage usage for the current user
#[derive(Debug, Serialize)]
pub struct StorageUsageResponse {
    pub used_bytes: i64,
    pub limit_bytes: i64,
    pub percentage: u8,
}

/// Set role request
#[derive(Debug, Deserialize)]
pub struct SetRoleRequest {
    pub role: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(size: i64, is_master: bool) -> FileEntry {
        FileEntry {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: "u".to_string(),
            filename: "f".to_string(),
            hash: "h".to_string(),
            size,
            mime_type: "text/plain".to_string(),
            is_master,
            reference_count: 1,
            is_public: false,
            download_count: 0,
            uploaded_at: String::new(),
            uploader: "u".to_string(),
        }
    }

    #[test]
    fn test_dedup_summary() {
        let entries = vec![entry(100, true), entry(100, false), entry(40, true)];
        let summary = DedupSummary::from_entries(&entries);
        assert_eq!(summary.original_bytes, 240);
        assert_eq!(summary.dedup_bytes, 140);
        assert_eq!(summary.saved_bytes, 100);
    }

    #[test]
    fn test_upload_status_serializes_snake_case() {
        let json = serde_json::to_string(&UploadStatus::LinkedDuplicate).unwrap();
        assert_eq!(json, "\"linked_duplicate\"");
    }

    #[test]
    fn test_reference_count_only_on_masters() {
        let mut master = entry(10, true);
        master.reference_count = 3;
        assert_eq!(FileResponse::from(master).reference_count, Some(3));
        assert_eq!(FileResponse::from(entry(10, false)).reference_count, None);
    }
}
