//! Caller authentication.
//!
//! Application users present the bearer JWT issued by the clinic's auth
//! provider (HS256, user id in `sub`). Scheduled-trigger callers present a
//! shared secret instead.

use crate::Context;
use crate::errors::error_response;
use axum::extract::FromRequestParts;
use axum::http::{HeaderMap, StatusCode, header, request::Parts};
use axum::response::Response;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use uuid::Uuid;

#[derive(Debug, serde::Deserialize)]
struct Claims {
    sub: Uuid,
}

/// An authenticated application user.
#[derive(Debug, Clone, Copy)]
pub struct AuthUser {
    pub id: Uuid,
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

pub fn verify_jwt(token: &str, secret: &SecretString) -> Result<AuthUser, jsonwebtoken::errors::Error> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_aud = false;
    let data = jsonwebtoken::decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.expose_secret().as_bytes()),
        &validation,
    )?;
    Ok(AuthUser {
        id: data.claims.sub,
    })
}

impl FromRequestParts<Arc<Context>> for AuthUser {
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut Parts,
        ctx: &Arc<Context>,
    ) -> Result<Self, Self::Rejection> {
        let Some(secret) = ctx.config.jwt_secret.as_ref() else {
            tracing::error!("AUTH_JWT_SECRET is not configured");
            return Err(error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "authentication is not configured",
            ));
        };
        let Some(token) = bearer_token(&parts.headers) else {
            return Err(error_response(StatusCode::UNAUTHORIZED, "Unauthorized"));
        };
        verify_jwt(token, secret).map_err(|e| {
            tracing::debug!("rejected bearer token: {e}");
            error_response(StatusCode::UNAUTHORIZED, "Unauthorized")
        })
    }
}

/// Checks the shared cron secret, given either as a bearer token or as the
/// `secret` query parameter.
///
/// The request passes if either of them matches, so an unrelated
/// `Authorization` header does not shadow a correct query parameter.
pub fn check_cron_secret(
    headers: &HeaderMap,
    query_secret: Option<&str>,
    expected: Option<&SecretString>,
) -> Result<(), Response> {
    let Some(expected) = expected else {
        tracing::error!("CRON_SECRET is not configured");
        return Err(error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "CRON_SECRET is not configured",
        ));
    };
    let matches = |presented: Option<&str>| {
        presented.is_some_and(|presented| {
            bool::from(
                presented
                    .as_bytes()
                    .ct_eq(expected.expose_secret().as_bytes()),
            )
        })
    };
    if matches(bearer_token(headers)) || matches(query_secret) {
        Ok(())
    } else {
        Err(error_response(StatusCode::UNAUTHORIZED, "Unauthorized"))
    }
}
