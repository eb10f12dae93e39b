//! Content hashing and duplicate resolution.
//!
//! The digest is SHA-256 over the full upload, hex encoded. Candidates are
//! pre-filtered by the caller on `(size, mime_type)` among master records,
//! digest equality decides.

use sha2::{Digest, Sha256};
use std::io::SeekFrom;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};

use crate::db::Database;
use crate::error::{AppError, Result};
use crate::models::FileRecord;

const READ_CHUNK: usize = 64 * 1024;

/// Digest and byte length of one pass over a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentDigest {
    pub digest: String,
    pub size: u64,
}

/// Outcome of duplicate resolution
#[derive(Debug, Clone)]
pub struct Resolution {
    pub digest: String,
    /// Existing master holding the same content, if any
    pub matched: Option<FileRecord>,
}

/// Streams content through SHA-256
pub struct ContentHasher;

impl ContentHasher {
    /// Hash the whole reader once, then rewind it to the start
    pub async fn digest_reader<R>(reader: &mut R) -> Result<ContentDigest>
    where
        R: AsyncRead + AsyncSeek + Unpin + ?Sized,
    {
        reader.seek(SeekFrom::Start(0)).await?;

        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; READ_CHUNK];
        let mut size = 0u64;
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            size += n as u64;
        }

        reader.seek(SeekFrom::Start(0)).await?;

        Ok(ContentDigest {
            digest: hex::encode(hasher.finalize()),
            size,
        })
    }
}

/// Decides whether an upload is new content or a copy of an existing master
pub struct DuplicateResolver;

impl DuplicateResolver {
    /// Hash the upload and match it against `candidates`; first match wins.
    /// The reader is left rewound for the physical write.
    pub async fn resolve<R>(
        reader: &mut R,
        declared_size: u64,
        candidates: Vec<FileRecord>,
    ) -> Result<Resolution>
    where
        R: AsyncRead + AsyncSeek + Unpin + ?Sized,
    {
        let content = ContentHasher::digest_reader(reader).await?;
        if content.size != declared_size {
            return Err(AppError::BadRequest(format!(
                "Declared size {} does not match received {} bytes",
                declared_size, content.size
            )));
        }

        let matched = Self::match_digest(&content.digest, candidates);
        Ok(Resolution {
            digest: content.digest,
            matched,
        })
    }

    /// Pick the first candidate whose digest equals `digest`
    pub fn match_digest(digest: &str, candidates: Vec<FileRecord>) -> Option<FileRecord> {
        candidates.into_iter().find(|c| c.hash == digest)
    }

    /// Master records sharing declared size and media type
    pub async fn find_candidates(
        db: &Database,
        size: i64,
        mime_type: &str,
    ) -> Result<Vec<FileRecord>> {
        let candidates: Vec<FileRecord> = sqlx::query_as(
            "SELECT * FROM files WHERE is_master = 1 AND size = ? AND mime_type = ?",
        )
        .bind(size)
        .bind(mime_type)
        .fetch_all(db.pool())
        .await?;

        Ok(candidates)
    }
}
