//! Binding a LINE identity to an application user.
//!
//! A signed-in user asks for a short-lived code, then sends it to the
//! official account from LINE. The webhook consumes the code and stores the
//! binding.

use crate::Context;
use crate::auth::AuthUser;
use crate::db::Connection;
use crate::db::line_accounts::LinkCode;
use crate::errors::AppError;
use axum::Json;
use axum::extract::State;
use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;
use regex::Regex;
use std::sync::{Arc, LazyLock};
use uuid::Uuid;

pub const CODE_PREFIX: &str = "LINK-";
pub const CODE_VALIDITY_MINUTES: i64 = 10;

static CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^LINK-[0-9A-F]{6}$").unwrap());

pub fn generate_code() -> String {
    let n: u32 = rand::thread_rng().gen_range(0..=0xFF_FFFF);
    format!("{CODE_PREFIX}{n:06X}")
}

/// Recognizes a linking code in an inbound chat message.
pub fn parse_code(text: &str) -> Option<String> {
    let candidate = text.trim().to_ascii_uppercase();
    CODE_RE.is_match(&candidate).then_some(candidate)
}

/// Codes drawn before giving up on finding one nobody else holds.
const MAX_CODE_ATTEMPTS: usize = 5;

/// Creates a fresh code for `user_id`, invalidating any earlier one.
pub async fn issue_code(
    conn: &mut dyn Connection,
    user_id: Uuid,
    now: DateTime<Utc>,
) -> anyhow::Result<LinkCode> {
    issue_code_from(conn, user_id, now, generate_code).await
}

async fn issue_code_from(
    conn: &mut dyn Connection,
    user_id: Uuid,
    now: DateTime<Utc>,
    mut generate: impl FnMut() -> String,
) -> anyhow::Result<LinkCode> {
    for _ in 0..MAX_CODE_ATTEMPTS {
        let code = LinkCode {
            code: generate(),
            user_id,
            expires_at: now + TimeDelta::minutes(CODE_VALIDITY_MINUTES),
        };
        if conn.insert_link_code(&code).await? {
            tracing::info!(user = %user_id, "issued LINE link code");
            return Ok(code);
        }
        tracing::debug!("link code collision, drawing another");
    }
    anyhow::bail!("no free link code after {MAX_CODE_ATTEMPTS} attempts")
}

pub async fn link_code(
    State(ctx): State<Arc<Context>>,
    user: AuthUser,
) -> Result<Json<serde_json::Value>, AppError> {
    let mut conn = ctx.db.connection().await?;
    let code = issue_code(&mut *conn, user.id, Utc::now()).await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "code": code.code,
        "expiresAt": code.expires_at,
        "expiresInSeconds": CODE_VALIDITY_MINUTES * 60,
    })))
}

pub async fn status(
    State(ctx): State<Arc<Context>>,
    user: AuthUser,
) -> Result<Json<serde_json::Value>, AppError> {
    let mut conn = ctx.db.connection().await?;
    let account = conn.line_accounts_for(&[user.id]).await?.pop();
    Ok(Json(match account {
        Some(account) => serde_json::json!({
            "success": true,
            "linked": true,
            "displayName": account.display_name,
            "linkedAt": account.linked_at,
        }),
        None => serde_json::json!({ "success": true, "linked": false }),
    }))
}

pub async fn unlink(
    State(ctx): State<Arc<Context>>,
    user: AuthUser,
) -> Result<Json<serde_json::Value>, AppError> {
    let mut conn = ctx.db.connection().await?;
    let removed = conn.unlink_line_account(user.id).await?;
    if removed {
        tracing::info!(user = %user.id, "unlinked LINE account");
    }
    Ok(Json(serde_json::json!({ "success": true, "removed": removed })))
}
