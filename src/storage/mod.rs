pub mod blob_store;
pub mod local;

pub use blob_store::*;
pub use local::*;

use chrono::Utc;
use uuid::Uuid;

/// Fresh unique relative path for a new blob: `YYYY/MM/<uuid>_<name>`
pub fn generate_blob_path(file_name: &str) -> String {
    let sanitized: String = file_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let sanitized = sanitized.trim_start_matches('.');
    let sanitized = if sanitized.is_empty() { "blob" } else { sanitized };

    format!(
        "{}/{}_{}",
        Utc::now().format("%Y/%m"),
        Uuid::new_v4().simple(),
        sanitized
    )
}
