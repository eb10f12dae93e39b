use axum::{extract::State, Json};

use crate::error::{ApiResponse, Result};
use crate::models::PublicFileListResponse;
use crate::services::FileService;
use crate::AppState;

/// List public files, no authentication
/// GET /api/public/files
pub async fn list_public_files(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<PublicFileListResponse>>> {
    let files = FileService::list_public(&state.db).await?;
    Ok(Json(ApiResponse::success(files)))
}
