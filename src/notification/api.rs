use crate::Context;
use crate::auth::AuthUser;
use crate::config::NotificationSettings;
use crate::db::directory::Role;
use crate::errors::{AppError, error_response};
use crate::notification::dispatch;
use crate::notification::events::EventRequest;
use crate::utils::deserialize_payload;
use axum::Json;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use std::sync::Arc;

const DEFAULT_LOG_LIMIT: i64 = 50;
const MAX_LOG_LIMIT: i64 = 500;

/// `POST /notifications/trigger`
pub async fn trigger(
    State(ctx): State<Arc<Context>>,
    user: AuthUser,
    body: Bytes,
) -> Result<Response, AppError> {
    let request = match deserialize_payload::<EventRequest>(&body) {
        Ok(request) => request,
        Err(e) => return Ok(error_response(StatusCode::BAD_REQUEST, format!("{e:#}"))),
    };
    let kind = request.kind();
    tracing::info!(user = %user.id, kind, "notification trigger");

    let mut conn = ctx.db.connection().await?;
    let settings = NotificationSettings::load(&mut *conn, &ctx.config).await?;
    let (event, targeting) = request.into_notification();
    match dispatch(&ctx, &mut *conn, &settings, &event, &targeting).await {
        Ok(result) => Ok(Json(serde_json::json!({
            "success": true,
            "type": kind,
            "result": result,
        }))
        .into_response()),
        Err(e) => Ok(e.into_response()),
    }
}

#[derive(Debug, Deserialize)]
pub struct LogQuery {
    #[serde(default)]
    pub limit: Option<i64>,
}

/// `GET /notifications/logs`, administrators only.
pub async fn logs(
    State(ctx): State<Arc<Context>>,
    user: AuthUser,
    Query(query): Query<LogQuery>,
) -> Result<Response, AppError> {
    let mut conn = ctx.db.connection().await?;
    let is_admin = conn
        .get_users(&[user.id])
        .await?
        .iter()
        .any(|u| u.active && u.role == Role::Admin);
    if !is_admin {
        return Ok(error_response(StatusCode::FORBIDDEN, "Forbidden"));
    }
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LOG_LIMIT)
        .clamp(1, MAX_LOG_LIMIT);
    let logs = conn.get_notification_logs(limit).await?;
    Ok(Json(serde_json::json!({ "success": true, "logs": logs })).into_response())
}
