//! Inbound events from the LINE platform.
//!
//! Once the signature checks out the platform always gets a 200, even when
//! handling an individual event fails; failures are traced instead.

use crate::Context;
use crate::config::NotificationSettings;
use crate::db::Connection;
use crate::db::line_accounts::{LinkOutcome, PendingLink};
use crate::errors::error_response;
use crate::line::{Message, linking};
use crate::utils::deserialize_payload;
use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use base64::prelude::*;
use chrono::Utc;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use sha2::Sha256;
use std::fmt;
use std::sync::Arc;

pub const SIGNATURE_HEADER: &str = "x-line-signature";

#[derive(Debug, Deserialize)]
pub struct WebhookBody {
    #[serde(default)]
    pub events: Vec<WebhookEvent>,
}

#[derive(Debug, Deserialize)]
pub struct Source {
    #[serde(rename = "userId")]
    pub user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WebhookEvent {
    Follow {
        #[serde(rename = "replyToken")]
        reply_token: Option<String>,
        source: Source,
    },
    Unfollow {
        source: Source,
    },
    Message {
        #[serde(rename = "replyToken")]
        reply_token: Option<String>,
        source: Source,
        message: InboundMessage,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InboundMessage {
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug)]
pub struct SignatureError;

impl fmt::Display for SignatureError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "failed to validate payload signature")
    }
}

impl std::error::Error for SignatureError {}

/// Checks `signature` (base64 HMAC-SHA256 of the raw body keyed with the
/// channel secret).
pub fn check_signature(
    secret: &SecretString,
    signature: &str,
    body: &[u8],
) -> Result<(), SignatureError> {
    let signature = match BASE64_STANDARD.decode(signature.trim()) {
        Ok(s) => s,
        Err(e) => {
            tracing::trace!("base64 decode failed for {signature:?}: {e:?}");
            return Err(SignatureError);
        }
    };
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.expose_secret().as_bytes())
        .map_err(|_| SignatureError)?;
    mac.update(body);
    mac.verify_slice(&signature).map_err(|_| SignatureError)
}

pub async fn webhook(
    State(ctx): State<Arc<Context>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(secret) = ctx.config.line_channel_secret.as_ref() else {
        tracing::error!("LINE_CHANNEL_SECRET is not configured");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "LINE channel secret is not configured",
        );
    };
    let Some(signature) = headers.get(SIGNATURE_HEADER) else {
        tracing::error!("X-Line-Signature header must be set");
        return error_response(StatusCode::BAD_REQUEST, "X-Line-Signature header must be set");
    };
    let Ok(signature) = signature.to_str() else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "X-Line-Signature header must be ASCII",
        );
    };
    if let Err(err) = check_signature(secret, signature, &body) {
        tracing::warn!("LINE webhook: {err}");
        return error_response(StatusCode::FORBIDDEN, "Wrong signature");
    }

    let payload = match deserialize_payload::<WebhookBody>(&body) {
        Ok(payload) => payload,
        Err(err) => {
            tracing::error!("LINE webhook: {err:#}");
            return ok();
        }
    };
    if let Err(err) = process_events(&ctx, payload.events).await {
        tracing::error!("LINE webhook: {err:?}");
    }
    ok()
}

fn ok() -> Response {
    Json(serde_json::json!({ "success": true })).into_response()
}

async fn process_events(ctx: &Context, events: Vec<WebhookEvent>) -> anyhow::Result<()> {
    let mut conn = ctx.db.connection().await?;
    let token = access_token(ctx, &mut *conn).await;
    for event in events {
        if let Err(err) = handle_event(ctx, &mut *conn, token.as_ref(), event).await {
            tracing::error!("failed to handle LINE event: {err:?}");
        }
    }
    Ok(())
}

/// The channel access token for replies; a malformed settings table falls
/// back to the environment.
async fn access_token(ctx: &Context, conn: &mut dyn Connection) -> Option<SecretString> {
    match NotificationSettings::load(conn, &ctx.config).await {
        Ok(settings) => settings.line_channel_access_token,
        Err(err) => {
            tracing::warn!("using LINE token from environment: {err:#}");
            ctx.config
                .line_channel_access_token
                .as_ref()
                .map(|t| SecretString::from(t.expose_secret().to_string()))
        }
    }
}

async fn handle_event(
    ctx: &Context,
    conn: &mut dyn Connection,
    token: Option<&SecretString>,
    event: WebhookEvent,
) -> anyhow::Result<()> {
    match event {
        WebhookEvent::Follow {
            reply_token,
            source,
        } => {
            let Some(line_user_id) = source.user_id else {
                return Ok(());
            };
            let display_name = match token {
                Some(token) => match ctx.line.get_profile(token, &line_user_id).await {
                    Ok(profile) => Some(profile.display_name),
                    Err(err) => {
                        tracing::warn!("failed to fetch LINE profile: {err}");
                        None
                    }
                },
                None => None,
            };
            conn.record_pending_link(&PendingLink {
                line_user_id,
                display_name,
                followed_at: Utc::now(),
            })
            .await?;
            reply(ctx, token, reply_token.as_deref(), &follow_greeting(&ctx.config.app_url)).await;
        }
        WebhookEvent::Unfollow { source } => {
            if let Some(line_user_id) = source.user_id {
                conn.remove_pending_link(&line_user_id).await?;
            }
        }
        WebhookEvent::Message {
            reply_token,
            source,
            message: InboundMessage::Text { text },
        } => {
            let (Some(line_user_id), Some(code)) = (source.user_id, linking::parse_code(&text))
            else {
                return Ok(());
            };
            let display_name = conn
                .get_pending_link(&line_user_id)
                .await?
                .and_then(|p| p.display_name);
            let outcome = conn
                .consume_link_code(&code, &line_user_id, display_name.as_deref(), Utc::now())
                .await?;
            let text = match outcome {
                LinkOutcome::Linked { user_id } => {
                    tracing::info!(user = %user_id, "linked LINE account");
                    "Your LINE account is now linked. You will receive clinic notifications here."
                }
                LinkOutcome::Expired => {
                    "This code has expired. Please generate a new code in the app and send it again."
                }
                LinkOutcome::NotFound => {
                    "This code was not found or has already been used. Please generate a new code in the app."
                }
            };
            reply(ctx, token, reply_token.as_deref(), text).await;
        }
        WebhookEvent::Message { .. } | WebhookEvent::Other => {}
    }
    Ok(())
}

fn follow_greeting(app_url: &str) -> String {
    format!(
        "Thanks for adding the clinic account!\n\n\
         To receive notifications here, open {}/settings/notifications, \
         generate a linking code and send it in this chat (format {}XXXXXX).",
        app_url.trim_end_matches('/'),
        linking::CODE_PREFIX,
    )
}

async fn reply(ctx: &Context, token: Option<&SecretString>, reply_token: Option<&str>, text: &str) {
    let (Some(token), Some(reply_token)) = (token, reply_token) else {
        tracing::warn!("cannot reply on LINE: missing access token or reply token");
        return;
    };
    if let Err(err) = ctx
        .line
        .reply_message(token, reply_token, &[Message::text(text)])
        .await
    {
        tracing::warn!("LINE reply failed: {err}");
    }
}
