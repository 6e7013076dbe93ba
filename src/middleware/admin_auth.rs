//! Admin Authentication Middleware
//!
//! Guards `/admin` routes with a static bearer token from config. Without a
//! configured token every admin request is refused.

use crate::models::ErrorResponse;
use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::warn;

/// The configured admin token, if any.
#[derive(Clone, Debug, Default)]
pub struct AdminToken(Option<Arc<str>>);

impl AdminToken {
    pub fn new(token: Option<&str>) -> Self {
        Self(
            token
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(Arc::from),
        )
    }

    pub fn is_configured(&self) -> bool {
        self.0.is_some()
    }

    fn matches(&self, candidate: &str) -> bool {
        match &self.0 {
            Some(expected) => expected.as_bytes().ct_eq(candidate.as_bytes()).into(),
            None => false,
        }
    }
}

pub async fn require_admin(
    State(token): State<AdminToken>,
    req: Request,
    next: Next,
) -> Result<Response, AdminAuthError> {
    if !token.is_configured() {
        return Err(AdminAuthError::Disabled);
    }

    let presented = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .ok_or(AdminAuthError::MissingToken)?
        .strip_prefix("Bearer ")
        .ok_or(AdminAuthError::InvalidFormat)?;

    if !token.matches(presented.trim()) {
        warn!(path = %req.uri().path(), "Rejected admin request with wrong token");
        return Err(AdminAuthError::InvalidToken);
    }

    Ok(next.run(req).await)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminAuthError {
    /// No admin token configured.
    Disabled,
    MissingToken,
    InvalidFormat,
    InvalidToken,
}

impl IntoResponse for AdminAuthError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AdminAuthError::Disabled => (
                StatusCode::FORBIDDEN,
                "Admin API disabled: no admin token configured",
            ),
            AdminAuthError::MissingToken => {
                (StatusCode::UNAUTHORIZED, "Missing authorization token")
            }
            AdminAuthError::InvalidFormat => (
                StatusCode::UNAUTHORIZED,
                "Invalid authorization format. Use: Bearer {token}",
            ),
            AdminAuthError::InvalidToken => (StatusCode::UNAUTHORIZED, "Invalid admin token"),
        };

        (status, Json(ErrorResponse::new(message, "Unauthorized"))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_responses() {
        assert_eq!(
            AdminAuthError::Disabled.into_response().status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            AdminAuthError::MissingToken.into_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AdminAuthError::InvalidToken.into_response().status(),
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn test_blank_token_counts_as_unconfigured() {
        assert!(!AdminToken::new(None).is_configured());
        assert!(!AdminToken::new(Some("  ")).is_configured());

        let token = AdminToken::new(Some("s3cret"));
        assert!(token.matches("s3cret"));
        assert!(!token.matches("s3cre"));
        assert!(!token.matches("S3CRET"));
        assert!(!token.matches("s3cret-and-more"));
        assert!(!token.matches(""));
    }
}
