//! Subscription management endpoints used by the web client.

use crate::Context;
use crate::auth::AuthUser;
use crate::db::subscriptions::NewPushSubscription;
use crate::errors::{AppError, error_response};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;

/// The browser's `PushSubscription.toJSON()` shape.
#[derive(Debug, Deserialize)]
pub struct BrowserSubscription {
    pub endpoint: String,
    pub keys: SubscriptionKeys,
}

#[derive(Debug, Deserialize)]
pub struct SubscriptionKeys {
    pub p256dh: String,
    pub auth: String,
}

#[derive(Debug, Deserialize)]
pub struct SubscribeRequest {
    pub subscription: BrowserSubscription,
}

#[derive(Debug, Deserialize)]
pub struct UnsubscribeRequest {
    pub endpoint: String,
}

pub async fn subscribe(
    State(ctx): State<Arc<Context>>,
    user: AuthUser,
    headers: HeaderMap,
    Json(req): Json<SubscribeRequest>,
) -> Result<Response, AppError> {
    let BrowserSubscription { endpoint, keys } = req.subscription;
    if !endpoint.starts_with("https://") || keys.p256dh.is_empty() || keys.auth.is_empty() {
        return Ok(error_response(
            StatusCode::BAD_REQUEST,
            "invalid push subscription",
        ));
    }
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let mut conn = ctx.db.connection().await?;
    let stored = conn
        .upsert_push_subscription(&NewPushSubscription {
            user_id: user.id,
            endpoint,
            p256dh: keys.p256dh,
            auth: keys.auth,
            user_agent,
        })
        .await?;
    tracing::info!(
        user = %user.id,
        endpoint = stored.endpoint_host(),
        "push subscription stored"
    );
    Ok(Json(serde_json::json!({ "success": true, "id": stored.id })).into_response())
}

pub async fn unsubscribe(
    State(ctx): State<Arc<Context>>,
    user: AuthUser,
    Json(req): Json<UnsubscribeRequest>,
) -> Result<Response, AppError> {
    let mut conn = ctx.db.connection().await?;
    let removed = conn.delete_push_subscription(user.id, &req.endpoint).await?;
    Ok(Json(serde_json::json!({ "success": true, "removed": removed })).into_response())
}

pub async fn vapid_key(State(ctx): State<Arc<Context>>) -> Response {
    match ctx.push.public_key() {
        Some(key) => Json(serde_json::json!({ "publicKey": key })).into_response(),
        None => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "push notifications are not configured",
        ),
    }
}
