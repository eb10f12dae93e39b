use axum::{extract::State, Extension, Json};

use crate::error::{ApiResponse, Result};
use crate::models::{CurrentUser, StorageUsageResponse, UserResponse};
use crate::services::UserService;
use crate::AppState;

/// Get current user
/// GET /api/user/profile
pub async fn get_profile(
    State(state): State<AppState>,
    Extension(current_user): Extension<CurrentUser>,
) -> Result<Json<ApiResponse<UserResponse>>> {
    let user = UserService::get_user(&state.db, &current_user.id).await?;
    Ok(Json(ApiResponse::success(UserResponse::from(user))))
}

/// Get storage usage
/// GET /api/user/storage
pub async fn get_storage_usage(
    State(state): State<AppState>,
    Extension(current_user): Extension<CurrentUser>,
) -> Result<Json<ApiResponse<StorageUsageResponse>>> {
    let usage = UserService::get_storage_usage(
        &state.db,
        &current_user.id,
        state.config.quota.quota_bytes(),
    )
    .await?;
    Ok(Json(ApiResponse::success(usage)))
}
