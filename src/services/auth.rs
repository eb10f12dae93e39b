use jsonwebtoken::{decode, DecodingKey, Validation};

use crate::config::AuthConfig;
use crate::error::{AppError, Result};
use crate::models::Claims;

/// Bearer token handling. Tokens are minted by an external identity
/// provider sharing the HMAC secret; this service only needs to read them.
pub struct AuthService;

impl AuthService {
    /// Validate access token and extract claims
    pub fn validate_token(token: &str, config: &AuthConfig) -> Result<Claims> {
        let mut validation = Validation::default();
        validation.validate_exp = true;

        let token_data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(config.jwt_secret.as_bytes()),
            &validation,
        )
        .map_err(|e| {
            tracing::debug!("Rejected token: {}", e);
            AppError::Unauthorized("Invalid token".to_string())
        })?;

        if token_data.claims.sub.is_empty() {
            return Err(AppError::Unauthorized("Invalid token".to_string()));
        }

        Ok(token_data.claims)
    }
}

#[cfg(test)]
impl AuthService {
    /// Sign a token for `user_id` valid for `ttl`
    pub fn issue_token(
        user_id: &str,
        username: &str,
        role: crate::models::UserRole,
        ttl: chrono::Duration,
        config: &AuthConfig,
    ) -> Result<String> {
        let claims = Claims {
            sub: user_id.to_string(),
            username: username.to_string(),
            role: role.as_str().to_string(),
            exp: (chrono::Utc::now() + ttl).timestamp().max(0) as usize,
        };

        let token = jsonwebtoken::encode(
            &jsonwebtoken::Header::default(),
            &claims,
            &jsonwebtoken::EncodingKey::from_secret(config.jwt_secret.as_bytes()),
        )?;

        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UserRole;
    use chrono::Duration;

    fn config(secret: &str) -> AuthConfig {
        AuthConfig {
            jwt_secret: secret.to_string(),
        }
    }

    #[test]
    fn test_issue_and_validate() {
        let config = config("s3cret");
        let token =
            AuthService::issue_token("u1", "alice", UserRole::Admin, Duration::hours(1), &config)
                .unwrap();

        let claims = AuthService::validate_token(&token, &config).unwrap();
        assert_eq!(claims.sub, "u1");
        assert_eq!(claims.username, "alice");
        assert_eq!(claims.role, "admin");
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = AuthService::issue_token(
            "u1",
            "alice",
            UserRole::User,
            Duration::hours(1),
            &config("one"),
        )
        .unwrap();

        let result = AuthService::validate_token(&token, &config("two"));
        assert!(matches!(result, Err(AppError::Unauthorized(_))));
    }

    #[test]
    fn test_expired_token_rejected() {
        let config = config("s3cret");
        let token =
            AuthService::issue_token("u1", "alice", UserRole::User, Duration::hours(-2), &config)
                .unwrap();

        let result = AuthService::validate_token(&token, &config);
        assert!(matches!(result, Err(AppError::Unauthorized(_))));
    }
}
