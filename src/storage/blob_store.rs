use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncRead;

use crate::error::Result;

/// Physical blob store. Knows nothing about deduplication, callers decide
/// when a path is written or removed.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stream a reader to `path`, returns the number of bytes written
    async fn put_reader(
        &self,
        path: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<u64>;

    /// Write in-memory data to `path`
    async fn put(&self, path: &str, data: Bytes) -> Result<()> {
        let mut reader: &[u8] = &data;
        self.put_reader(path, &mut reader).await?;
        Ok(())
    }

    /// Read a blob
    async fn get(&self, path: &str) -> Result<Bytes>;

    /// Delete a blob; deleting a missing path is not an error
    async fn delete(&self, path: &str) -> Result<()>;

    /// Check if a blob exists
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Get the storage type name
    fn storage_type(&self) -> &'static str;
}
