//! Scheduled morning and evening digests.
//!
//! The trigger is stateless: it is invoked periodically (by an external cron
//! or the optional in-process ticker) and decides from the clock and the
//! persisted send markers whether a digest is due. A digest is claimed by
//! atomically moving its marker to today's date before anything is sent,
//! so concurrent invocations send it at most once per day.

use crate::Context;
use crate::config::NotificationSettings;
use crate::db::Connection;
use crate::db::notification_log::{DeliveryStatus, LogChannel, NewLogEntry};
use crate::notification::digest::{self, DigestReport};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// How long after the configured time a digest may still go out.
pub const SEND_WINDOW_MINUTES: i64 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestKind {
    /// Today's cases.
    Morning,
    /// Tomorrow's cases.
    Evening,
}

impl DigestKind {
    pub const ALL: [DigestKind; 2] = [DigestKind::Morning, DigestKind::Evening];

    pub fn as_str(&self) -> &'static str {
        match self {
            DigestKind::Morning => "morning",
            DigestKind::Evening => "evening",
        }
    }

    pub fn target_time(&self, settings: &NotificationSettings) -> NaiveTime {
        match self {
            DigestKind::Morning => settings.morning_time,
            DigestKind::Evening => settings.evening_time,
        }
    }

    /// The day whose cases the digest covers, given the local date it is
    /// sent on.
    pub fn case_date(&self, today: NaiveDate) -> NaiveDate {
        match self {
            DigestKind::Morning => today,
            DigestKind::Evening => today.succ_opt().unwrap_or(today),
        }
    }
}

impl fmt::Display for DigestKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DigestKind {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<DigestKind, Self::Err> {
        Ok(match s {
            "morning" => DigestKind::Morning,
            "evening" => DigestKind::Evening,
            _ => anyhow::bail!("unknown digest `{s}`, expected `morning` or `evening`"),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestState {
    Idle,
    Due,
    Sent(NaiveDate),
}

/// Where a digest stands at local time `now`.
///
/// It is due when `0 <= now - target < 15 minutes` on a day it has not been
/// sent yet.
pub fn evaluate(now: NaiveDateTime, target: NaiveTime, last_sent: Option<NaiveDate>) -> DigestState {
    let today = now.date();
    if last_sent == Some(today) {
        return DigestState::Sent(today);
    }
    let elapsed = now.time().signed_duration_since(target);
    if elapsed >= TimeDelta::zero() && elapsed < TimeDelta::minutes(SEND_WINDOW_MINUTES) {
        DigestState::Due
    } else {
        DigestState::Idle
    }
}

/// What became of one digest in a trigger invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Disabled,
    NotDue,
    AlreadySent { date: NaiveDate },
    Sent { report: DigestReport },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckResults {
    pub morning: RunOutcome,
    pub evening: RunOutcome,
}

impl CheckResults {
    fn set(&mut self, kind: DigestKind, outcome: RunOutcome) {
        match kind {
            DigestKind::Morning => self.morning = outcome,
            DigestKind::Evening => self.evening = outcome,
        }
    }

    fn all(outcome: RunOutcome) -> CheckResults {
        CheckResults {
            morning: outcome.clone(),
            evening: outcome,
        }
    }
}

/// Which digests a manual run sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ManualTarget {
    Morning,
    Evening,
    Both,
}

impl ManualTarget {
    pub fn kinds(&self) -> &'static [DigestKind] {
        match self {
            ManualTarget::Morning => &[DigestKind::Morning],
            ManualTarget::Evening => &[DigestKind::Evening],
            ManualTarget::Both => &DigestKind::ALL,
        }
    }
}

impl std::str::FromStr for ManualTarget {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<ManualTarget, Self::Err> {
        Ok(match s {
            "morning" => ManualTarget::Morning,
            "evening" => ManualTarget::Evening,
            "both" => ManualTarget::Both,
            _ => anyhow::bail!("unknown digest `{s}`, expected `morning`, `evening` or `both`"),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Scheduled,
    Manual,
}

impl Trigger {
    fn as_str(&self) -> &'static str {
        match self {
            Trigger::Scheduled => "scheduled",
            Trigger::Manual => "manual",
        }
    }
}

fn local(ctx: &Context, now: DateTime<Utc>) -> NaiveDateTime {
    now.with_timezone(&ctx.config.timezone).naive_local()
}

/// The time-window check, run every few minutes.
pub async fn run_check(ctx: &Context, now: DateTime<Utc>) -> anyhow::Result<CheckResults> {
    let mut conn = ctx.db.connection().await?;
    let settings = NotificationSettings::load(&mut *conn, &ctx.config).await?;
    if !settings.enabled {
        tracing::debug!("daily notifications are disabled");
        return Ok(CheckResults::all(RunOutcome::Disabled));
    }

    let now_local = local(ctx, now);
    let today = now_local.date();
    let mut results = CheckResults::all(RunOutcome::NotDue);
    for kind in DigestKind::ALL {
        let last_sent = conn.get_daily_marker(kind).await?;
        let outcome = match evaluate(now_local, kind.target_time(&settings), last_sent) {
            DigestState::Idle => RunOutcome::NotDue,
            DigestState::Sent(date) => RunOutcome::AlreadySent { date },
            DigestState::Due => {
                claim_and_send(ctx, &mut *conn, &settings, kind, today, last_sent).await?
            }
        };
        results.set(kind, outcome);
    }
    Ok(results)
}

/// Sends `kind` if it has not gone out today, regardless of the time.
pub async fn run_scheduled(
    ctx: &Context,
    kind: DigestKind,
    now: DateTime<Utc>,
) -> anyhow::Result<RunOutcome> {
    let mut conn = ctx.db.connection().await?;
    let settings = NotificationSettings::load(&mut *conn, &ctx.config).await?;
    if !settings.enabled {
        return Ok(RunOutcome::Disabled);
    }
    let today = local(ctx, now).date();
    let last_sent = conn.get_daily_marker(kind).await?;
    if last_sent == Some(today) {
        return Ok(RunOutcome::AlreadySent { date: today });
    }
    claim_and_send(ctx, &mut *conn, &settings, kind, today, last_sent).await
}

/// Administrative override: sends the requested digests now, ignoring the
/// enabled flag, the time window and the send markers. Markers are left
/// untouched.
pub async fn run_manual(
    ctx: &Context,
    target: ManualTarget,
    now: DateTime<Utc>,
) -> anyhow::Result<Vec<(DigestKind, RunOutcome)>> {
    let mut conn = ctx.db.connection().await?;
    let settings = NotificationSettings::load(&mut *conn, &ctx.config).await?;
    let today = local(ctx, now).date();
    let mut outcomes = Vec::new();
    for &kind in target.kinds() {
        tracing::info!(%kind, "manual digest run");
        let outcome = match send(ctx, &mut *conn, &settings, kind, today, Trigger::Manual).await {
            Ok(report) => RunOutcome::Sent { report },
            Err(error) => RunOutcome::Failed { error },
        };
        outcomes.push((kind, outcome));
    }
    Ok(outcomes)
}

async fn claim_and_send(
    ctx: &Context,
    conn: &mut dyn Connection,
    settings: &NotificationSettings,
    kind: DigestKind,
    today: NaiveDate,
    previous: Option<NaiveDate>,
) -> anyhow::Result<RunOutcome> {
    if !conn.claim_daily_marker(kind, today).await? {
        tracing::info!(%kind, "digest already claimed by another invocation");
        return Ok(RunOutcome::AlreadySent { date: today });
    }
    match send(ctx, conn, settings, kind, today, Trigger::Scheduled).await {
        Ok(report) => Ok(RunOutcome::Sent { report }),
        Err(error) => {
            // Nothing was sent, so let a later invocation retry today.
            conn.restore_daily_marker(kind, today, previous).await?;
            Ok(RunOutcome::Failed { error })
        }
    }
}

/// Runs one digest and writes its summary entry. Errors mean nothing was
/// sent.
async fn send(
    ctx: &Context,
    conn: &mut dyn Connection,
    settings: &NotificationSettings,
    kind: DigestKind,
    today: NaiveDate,
    trigger: Trigger,
) -> Result<DigestReport, String> {
    let case_date = kind.case_date(today);
    let report = match digest::run(ctx, conn, settings, kind, case_date).await {
        Ok(report) => report,
        Err(e) => {
            tracing::error!(%kind, trigger = trigger.as_str(), "digest not sent: {e}");
            return Err(e.to_string());
        }
    };

    let message = format!(
        "{} {} digest for {case_date}: {} sent, {} failed",
        trigger.as_str(),
        kind,
        report.totals.sent(),
        report.totals.failed()
    );
    let entry = NewLogEntry::new(
        None,
        LogChannel::System,
        &format!("daily_{kind}"),
        &format!("Daily {kind} digest"),
        &message,
        DeliveryStatus::Sent,
    )
    .metadata(serde_json::json!({
        "trigger": trigger.as_str(),
        "date": today,
        "case_date": case_date,
        "cases": report.cases,
        "audiences": report.audiences,
        "totals": report.totals,
    }));
    if let Err(e) = conn.record_notification(&entry).await {
        tracing::error!("failed to record digest summary: {e:?}");
    }
    tracing::info!("{message}");
    Ok(report)
}

/// Evaluates the schedule every `interval` until the process exits.
pub async fn run_ticker(ctx: std::sync::Arc<Context>, interval: std::time::Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match run_check(&ctx, Utc::now()).await {
            Ok(results) => tracing::trace!("scheduled check: {results:?}"),
            Err(e) => tracing::error!("scheduled check failed: {e:?}"),
        }
    }
}
