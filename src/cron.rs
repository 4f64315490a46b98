//! Endpoints hit by the external scheduler.
//!
//! All of them require the shared cron secret and answer with
//! `{success, type, results, timestamp}`.

use crate::Context;
use crate::auth::check_cron_secret;
use crate::errors::{AppError, error_response};
use crate::scheduler::{self, DigestKind, ManualTarget, RunOutcome};
use axum::Json;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Default, Deserialize)]
pub struct CronQuery {
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default, rename = "type")]
    pub target: Option<String>,
}

fn respond<'a>(kind: &str, outcomes: impl IntoIterator<Item = (DigestKind, &'a RunOutcome)>) -> Response {
    let outcomes: BTreeMap<DigestKind, &RunOutcome> = outcomes.into_iter().collect();
    let failed = outcomes
        .values()
        .filter(|o| matches!(o, RunOutcome::Failed { .. }))
        .count();
    // Only a run where every digest failed is reported as an error.
    let status = if failed > 0 && failed == outcomes.len() {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    };
    let results: BTreeMap<&str, &RunOutcome> =
        outcomes.into_iter().map(|(k, o)| (k.as_str(), o)).collect();
    (
        status,
        Json(serde_json::json!({
            "success": failed == 0,
            "type": kind,
            "results": results,
            "timestamp": Utc::now(),
        })),
    )
        .into_response()
}

pub async fn check(
    State(ctx): State<Arc<Context>>,
    headers: HeaderMap,
    Query(query): Query<CronQuery>,
) -> Result<Response, AppError> {
    if let Err(resp) =
        check_cron_secret(&headers, query.secret.as_deref(), ctx.config.cron_secret.as_ref())
    {
        return Ok(resp);
    }
    let results = scheduler::run_check(&ctx, Utc::now()).await?;
    Ok(respond(
        "check",
        [
            (DigestKind::Morning, &results.morning),
            (DigestKind::Evening, &results.evening),
        ],
    ))
}

async fn scheduled(
    ctx: Arc<Context>,
    headers: HeaderMap,
    query: CronQuery,
    kind: DigestKind,
) -> Result<Response, AppError> {
    if let Err(resp) =
        check_cron_secret(&headers, query.secret.as_deref(), ctx.config.cron_secret.as_ref())
    {
        return Ok(resp);
    }
    let outcome = scheduler::run_scheduled(&ctx, kind, Utc::now()).await?;
    Ok(respond(kind.as_str(), [(kind, &outcome)]))
}

pub async fn morning(
    State(ctx): State<Arc<Context>>,
    headers: HeaderMap,
    Query(query): Query<CronQuery>,
) -> Result<Response, AppError> {
    scheduled(ctx, headers, query, DigestKind::Morning).await
}

pub async fn evening(
    State(ctx): State<Arc<Context>>,
    headers: HeaderMap,
    Query(query): Query<CronQuery>,
) -> Result<Response, AppError> {
    scheduled(ctx, headers, query, DigestKind::Evening).await
}

/// Manual override; `?type=morning|evening|both` (default `both`).
pub async fn daily(
    State(ctx): State<Arc<Context>>,
    headers: HeaderMap,
    Query(query): Query<CronQuery>,
) -> Result<Response, AppError> {
    if let Err(resp) =
        check_cron_secret(&headers, query.secret.as_deref(), ctx.config.cron_secret.as_ref())
    {
        return Ok(resp);
    }
    let target = match query.target.as_deref().unwrap_or("both").parse::<ManualTarget>() {
        Ok(target) => target,
        Err(e) => return Ok(error_response(StatusCode::BAD_REQUEST, e.to_string())),
    };
    let outcomes = scheduler::run_manual(&ctx, target, Utc::now()).await?;
    let kind = match target {
        ManualTarget::Morning => "morning",
        ManualTarget::Evening => "evening",
        ManualTarget::Both => "both",
    };
    Ok(respond(kind, outcomes.iter().map(|(k, o)| (*k, o))))
}
