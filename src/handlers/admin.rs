use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};

use crate::error::{ApiResponse, AppError, Result};
use crate::models::{
    CurrentUser, FileFilter, FileListResponse, FileQuery, SetRoleRequest, UserResponse, UserRole,
};
use crate::services::{FileService, UserService};
use crate::AppState;

/// Check if user is admin
fn require_admin(user: &CurrentUser) -> Result<()> {
    if !user.is_admin() {
        return Err(AppError::Forbidden("Admin access required".to_string()));
    }
    Ok(())
}

/// List every file with the deduplication summary
/// GET /api/admin/files
pub async fn list_all_files(
    State(state): State<AppState>,
    Extension(current_user): Extension<CurrentUser>,
    Query(query): Query<FileQuery>,
) -> Result<Json<ApiResponse<FileListResponse>>> {
    let filter = FileFilter::from_query(query)?;
    let files = FileService::list_all(&state.db, &current_user, filter).await?;
    Ok(Json(ApiResponse::success(files)))
}

/// Change a user's role
/// PUT /api/admin/users/:id/role
pub async fn set_user_role(
    State(state): State<AppState>,
    Extension(current_user): Extension<CurrentUser>,
    Path(user_id): Path<String>,
    Json(req): Json<SetRoleRequest>,
) -> Result<Json<ApiResponse<UserResponse>>> {
    require_admin(&current_user)?;

    let role = UserRole::parse(&req.role)
        .ok_or_else(|| AppError::BadRequest(format!("Unknown role: {}", req.role)))?;

    if user_id == current_user.id && !role.is_admin() {
        return Err(AppError::BadRequest("Cannot demote yourself".to_string()));
    }

    let user = UserService::set_role(&state.db, &user_id, role).await?;
    Ok(Json(ApiResponse::success(user)))
}
