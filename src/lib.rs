#![allow(clippy::new_without_default)]

use axum::Router;
use axum::http::HeaderName;
use axum::routing::{delete, get, post};
use std::sync::Arc;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

pub mod auth;
pub mod config;
pub mod cron;
pub mod db;
pub mod errors;
pub mod line;
pub mod logger;
pub mod notification;
pub mod push;
pub mod scheduler;
pub mod utils;

#[cfg(test)]
mod tests;

/// Everything a request handler needs.
pub struct Context {
    pub db: db::Pool,
    pub config: config::Config,
    pub push: Arc<dyn push::PushSender>,
    pub line: Arc<dyn line::LineApi>,
}

impl Context {
    /// Wires up the production senders for `config`.
    pub fn from_config(config: config::Config) -> anyhow::Result<Context> {
        let line = line::LineClient::new(config.line_api_url.clone(), config.delivery_timeout)?;
        Ok(Context {
            db: db::Pool::open(&config.database_url),
            push: Arc::new(push::WebPushSender::new(&config)),
            line: Arc::new(line),
            config,
        })
    }
}

async fn health() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({ "status": "ok" }))
}

/// The HTTP surface of the service.
pub fn app(ctx: Arc<Context>) -> Router {
    let request_id_header = HeaderName::from_static("x-request-id");

    Router::new()
        .route("/health", get(health))
        .route("/cron/check", get(cron::check).post(cron::check))
        .route("/cron/morning", get(cron::morning).post(cron::morning))
        .route("/cron/evening", get(cron::evening).post(cron::evening))
        .route("/cron/daily", get(cron::daily).post(cron::daily))
        .route("/notifications/trigger", post(notification::api::trigger))
        .route("/notifications/logs", get(notification::api::logs))
        .route("/push/subscribe", post(push::api::subscribe))
        .route("/push/unsubscribe", post(push::api::unsubscribe))
        .route("/push/vapid-key", get(push::api::vapid_key))
        .route("/line/webhook", post(line::webhook::webhook))
        .route("/line/link-code", post(line::linking::link_code))
        .route("/line/status", get(line::linking::status))
        .route("/line/link", delete(line::linking::unlink))
        .layer(CatchPanicLayer::new())
        .layer(PropagateRequestIdLayer::new(request_id_header.clone()))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(SetRequestIdLayer::new(request_id_header, MakeRequestUuid))
        .with_state(ctx)
}
