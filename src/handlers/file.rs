use axum::{
    body::Body,
    extract::{Multipart, Path, Query, State},
    http::{header, StatusCode},
    response::Response,
    Extension, Json,
};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::error::{ApiResponse, AppError, Result};
use crate::models::{
    CurrentUser, DeleteResponse, FileFilter, FileListResponse, FileQuery, FileResponse,
    PrivacyResponse, UploadResponse,
};
use crate::services::FileService;
use crate::AppState;

/// List the caller's files
/// GET /api/files?search=&mimeType=&minSize=&maxSize=&startDate=&endDate=
pub async fn list_files(
    State(state): State<AppState>,
    Extension(current_user): Extension<CurrentUser>,
    Query(query): Query<FileQuery>,
) -> Result<Json<ApiResponse<FileListResponse>>> {
    let filter = FileFilter::from_query(query)?;
    let files = FileService::list_owned(&state.db, &current_user.id, filter).await?;
    Ok(Json(ApiResponse::success(files)))
}

/// Get a specific file
/// GET /api/files/:id
pub async fn get_file(
    State(state): State<AppState>,
    Extension(current_user): Extension<CurrentUser>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<FileResponse>>> {
    let file = FileService::get_file(&state.db, &current_user, &id).await?;
    Ok(Json(ApiResponse::success(file)))
}

/// Spooled upload in the temp dir, removed when dropped
struct TempUpload {
    path: PathBuf,
}

impl TempUpload {
    fn new() -> Self {
        Self {
            path: std::env::temp_dir().join(format!("filevault_upload_{}", Uuid::new_v4())),
        }
    }
}

impl Drop for TempUpload {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::error!("Failed to remove temp file {:?}: {}", self.path, e),
        }
    }
}

/// Upload a file
/// POST /api/files/upload
pub async fn upload_file(
    State(state): State<AppState>,
    Extension(current_user): Extension<CurrentUser>,
    mut multipart: Multipart,
) -> Result<Json<ApiResponse<UploadResponse>>> {
    let temp = TempUpload::new();
    let (file_name, content_type) = spool_multipart(&mut multipart, &temp).await?;

    let mut file = tokio::fs::File::open(&temp.path).await?;
    let declared_size = file.metadata().await?.len();

    let upload = FileService::upload_file(
        &state.db,
        state.storage.as_ref(),
        state.config.quota.quota_bytes(),
        &current_user.id,
        file_name,
        content_type,
        &mut file,
        declared_size,
    )
    .await?;

    tracing::info!(
        user_id = %current_user.id,
        file_id = %upload.id,
        status = ?upload.status,
        "File uploaded"
    );
    Ok(Json(ApiResponse::success(upload)))
}

/// Write the single `file` field to `temp`, returning its name and content type
async fn spool_multipart(
    multipart: &mut Multipart,
    temp: &TempUpload,
) -> Result<(String, Option<String>)> {
    let mut received: Option<(Option<String>, Option<String>)> = None;

    // Process multipart fields
    while let Some(mut field) = multipart.next_field().await.map_err(|e| {
        AppError::BadRequest(format!("Failed to process multipart: {}", e))
    })? {
        if field.name() != Some("file") {
            continue;
        }
        if received.is_some() {
            return Err(AppError::BadRequest("Only one file per upload".to_string()));
        }

        received = Some((
            field.file_name().map(|s| s.to_string()),
            field.content_type().map(|s| s.to_string()),
        ));

        let mut file = tokio::fs::File::create(&temp.path).await.map_err(|e| {
            AppError::Internal(format!("Failed to create temp file: {}", e))
        })?;

        while let Some(chunk) = field.chunk().await.map_err(|e| {
            AppError::BadRequest(format!("Failed to read file chunk: {}", e))
        })? {
            file.write_all(&chunk).await.map_err(|e| {
                AppError::Internal(format!("Failed to write to temp file: {}", e))
            })?;
        }

        file.flush().await.map_err(|e| {
            AppError::Internal(format!("Failed to flush temp file: {}", e))
        })?;
    }

    let (file_name, content_type) =
        received.ok_or_else(|| AppError::BadRequest("No file provided".to_string()))?;
    let file_name =
        file_name.ok_or_else(|| AppError::BadRequest("No file name provided".to_string()))?;
    Ok((file_name, content_type))
}

/// Download a file
/// GET /api/files/:id/download
pub async fn download_file(
    State(state): State<AppState>,
    Extension(current_user): Extension<CurrentUser>,
    Path(id): Path<String>,
) -> Result<Response> {
    let (file, data) =
        FileService::download_file(&state.db, state.storage.as_ref(), &current_user, &id).await?;

    let fallback_name = file.filename.replace(['"', '\\'], "_");
    let encoded_name = urlencoding::encode(&file.filename);

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, file.mime_type)
        .header(header::CONTENT_LENGTH, data.len())
        .header(
            header::CONTENT_DISPOSITION,
            format!(
                "attachment; filename=\"{}\"; filename*=UTF-8''{}",
                fallback_name, encoded_name
            ),
        )
        .body(Body::from(data))
        .map_err(|e| AppError::Internal(format!("Failed to build response: {}", e)))?;

    Ok(response)
}

/// Toggle public visibility
/// POST /api/files/:id/privacy
pub async fn toggle_privacy(
    State(state): State<AppState>,
    Extension(current_user): Extension<CurrentUser>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<PrivacyResponse>>> {
    let privacy = FileService::toggle_privacy(&state.db, &current_user.id, &id).await?;
    Ok(Json(ApiResponse::success(privacy)))
}

/// Delete a file
/// DELETE /api/files/:id
pub async fn delete_file(
    State(state): State<AppState>,
    Extension(current_user): Extension<CurrentUser>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<DeleteResponse>>> {
    let removal =
        FileService::delete_file(&state.db, state.storage.as_ref(), &current_user.id, &id).await?;
    tracing::info!(user_id = %current_user.id, file_id = %id, outcome = removal.as_str(), "File deleted");

    Ok(Json(ApiResponse::success(DeleteResponse {
        id,
        outcome: removal.as_str().to_string(),
    })))
}
