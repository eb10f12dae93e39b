use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

use crate::error::AppError;
use crate::models::{CurrentUser, UserRole};
use crate::services::{AuthService, UserService};
use crate::AppState;

/// Authentication middleware
/// Validates the bearer token, applies the per-principal rate limit and
/// resolves the principal's stored role
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    // Get Authorization header
    let auth_header = request
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok());

    let token = match auth_header {
        Some(header) if header.starts_with("Bearer ") => &header[7..],
        _ => {
            return Err(AppError::Unauthorized(
                "Missing or invalid Authorization header".to_string(),
            ));
        }
    };

    // Validate token
    let claims = AuthService::validate_token(token, &state.config.auth)?;

    // Admission comes before any database access
    if !state.rate_limiter.allow(&claims.sub) {
        return Err(AppError::RateLimited);
    }

    // First sight registers the principal; afterwards the stored role wins over the claim
    let claimed_role = UserRole::parse(&claims.role).unwrap_or(UserRole::User);
    let user = UserService::ensure_user(&state.db, &claims.sub, &claims.username, claimed_role)
        .await?;

    let current_user = CurrentUser {
        role: user.get_role(),
        id: user.id,
    };

    // Insert current user into request extensions
    request.extensions_mut().insert(current_user);

    Ok(next.run(request).await)
}
