use axum::extract::{FromRef, FromRequestParts};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use std::future::Future;
use subtle::ConstantTimeEq;

use crate::config::CoreConfig;
use crate::error::AppError;

/// Validated admin principal. Token issuance lives outside the core; this
/// extractor only checks the presented bearer token against the configured
/// admin key.
#[derive(Debug, Clone)]
pub struct AdminUser {
    pub source: &'static str,
}

#[derive(Debug, Clone)]
pub struct AdminAuth(pub AdminUser);

impl<S> FromRequestParts<S> for AdminAuth
where
    CoreConfig: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AppError;

    fn from_request_parts(
        parts: &mut Parts,
        state: &S,
    ) -> impl Future<Output = Result<Self, Self::Rejection>> + Send {
        let config = CoreConfig::from_ref(state);
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);

        async move {
            let Some(expected) = config.admin_api_key.as_deref() else {
                return Err(AppError::unauthorized(
                    "Admin API key is not configured; contact an administrator",
                ));
            };
            let token =
                token.ok_or_else(|| AppError::unauthorized("Missing or invalid token"))?;
            if !tokens_match(&token, expected) {
                return Err(AppError::forbidden("Invalid admin token"));
            }
            Ok(AdminAuth(AdminUser { source: "api_key" }))
        }
    }
}

fn tokens_match(presented: &str, expected: &str) -> bool {
    presented.as_bytes().ct_eq(expected.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_comparison() {
        assert!(tokens_match("secret", "secret"));
        assert!(!tokens_match("secret", "secres"));
        assert!(!tokens_match("secret", "secre"));
        assert!(!tokens_match("", "x"));
    }
}
