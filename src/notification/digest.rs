//! Content of the morning and evening case digests.
//!
//! One digest run sends a different notification to each audience: stock
//! staff see materials still pending, customer service see the patients to
//! confirm, and every dentist with cases on that day gets their own list.

use crate::Context;
use crate::config::NotificationSettings;
use crate::db::Connection;
use crate::db::directory::{CaseSummary, MaterialStatus, Role};
use crate::line::{ACCENT_INFO, ACCENT_SUCCESS};
use crate::notification::dispatch::{
    Channels, Deliveries, check_channels, load_deliveries, record, send_all,
};
use crate::notification::{DeliveryResult, DispatchError, NotificationEvent, Targeting};
use crate::notification::resolve_recipients;
use crate::scheduler::DigestKind;
use crate::utils::pluralize;
use chrono::NaiveDate;
use futures::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Rows listed on a card before the rest is summarized.
const MAX_LISTED_CASES: usize = 10;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Audiences {
    pub stock_staff: DeliveryResult,
    pub customer_service: DeliveryResult,
    pub dentists: DeliveryResult,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DigestReport {
    pub kind: DigestKind,
    pub case_date: NaiveDate,
    pub cases: usize,
    pub audiences: Audiences,
    pub totals: DeliveryResult,
    /// Audiences that could not be reached because of storage failures.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

fn heading(kind: DigestKind) -> &'static str {
    match kind {
        DigestKind::Morning => "Today's surgery schedule",
        DigestKind::Evening => "Tomorrow's surgery schedule",
    }
}

fn day(date: NaiveDate) -> String {
    date.format("%a %d/%m/%Y").to_string()
}

fn time_label(case: &CaseSummary) -> String {
    case.surgery_time
        .map(|t| t.format("%H:%M").to_string())
        .unwrap_or_else(|| "--:--".to_string())
}

fn listed<'a>(
    cases: impl ExactSizeIterator<Item = &'a CaseSummary>,
    row: impl Fn(&CaseSummary) -> (String, String),
) -> Vec<(String, String)> {
    let total = cases.len();
    let mut fields: Vec<_> = cases.take(MAX_LISTED_CASES).map(row).collect();
    if total > MAX_LISTED_CASES {
        fields.push(("".into(), format!("and {} more", total - MAX_LISTED_CASES)));
    }
    fields
}

fn digest_event(kind: DigestKind, date: NaiveDate, title: String, body: String) -> NotificationEvent {
    NotificationEvent::new(
        &format!("daily_{kind}"),
        title,
        body,
        format!("/cases?date={}", date.format("%Y-%m-%d")),
        format!("daily-{kind}-{}", date.format("%Y-%m-%d")),
    )
    .with_data(serde_json::json!({ "digest": kind, "date": date }))
}

pub fn stock_staff_event(kind: DigestKind, date: NaiveDate, cases: &[CaseSummary]) -> NotificationEvent {
    let pending: Vec<&CaseSummary> = cases
        .iter()
        .filter(|c| c.material_status == MaterialStatus::Pending)
        .collect();
    let body = if cases.is_empty() {
        format!("No surgeries scheduled for {}.", day(date))
    } else {
        format!(
            "{} {} on {}, {} awaiting materials.",
            cases.len(),
            pluralize("case", cases.len()),
            day(date),
            pending.len()
        )
    };
    let fields = listed(pending.into_iter(), |c| {
        (
            time_label(c),
            format!("{} {}", c.case_number, c.procedure),
        )
    });
    let accent = if fields.is_empty() { ACCENT_SUCCESS } else { ACCENT_INFO };
    digest_event(kind, date, format!("{}: materials", heading(kind)), body).as_card(accent, fields)
}

pub fn customer_service_event(
    kind: DigestKind,
    date: NaiveDate,
    cases: &[CaseSummary],
) -> NotificationEvent {
    let body = if cases.is_empty() {
        format!("No patients to confirm for {}.", day(date))
    } else {
        format!(
            "{} {} to confirm for {}.",
            cases.len(),
            pluralize("patient", cases.len()),
            day(date)
        )
    };
    let fields = listed(cases.iter(), |c| {
        (time_label(c), format!("{} ({})", c.patient_name, c.case_number))
    });
    digest_event(kind, date, format!("{}: patients", heading(kind)), body)
        .as_card(ACCENT_INFO, fields)
}

pub fn dentist_event(kind: DigestKind, date: NaiveDate, cases: &[&CaseSummary]) -> NotificationEvent {
    let body = format!(
        "You have {} {} on {}.",
        cases.len(),
        pluralize("case", cases.len()),
        day(date)
    );
    let fields = listed(cases.iter().copied(), |c| {
        (time_label(c), format!("{} - {}", c.patient_name, c.procedure))
    });
    digest_event(kind, date, heading(kind).to_string(), body).as_card(ACCENT_INFO, fields)
}

#[derive(Debug, Clone, Copy)]
enum Audience {
    StockStaff,
    CustomerService,
    Dentists,
}

impl Audience {
    fn as_str(&self) -> &'static str {
        match self {
            Audience::StockStaff => "stock_staff",
            Audience::CustomerService => "customer_service",
            Audience::Dentists => "dentists",
        }
    }
}

/// One event of the digest together with where it goes.
struct Batch {
    audience: Audience,
    event: NotificationEvent,
    deliveries: Deliveries,
}

/// Looks up the subscriptions and LINE accounts of one audience. A storage
/// failure is recorded and the audience is left out so the others still go
/// out.
async fn prepare(
    conn: &mut dyn Connection,
    channels: Channels<'_>,
    audience: Audience,
    event: NotificationEvent,
    recipients: anyhow::Result<BTreeSet<Uuid>>,
    errors: &mut Vec<String>,
) -> Option<Batch> {
    let recipients = match recipients {
        Ok(r) if r.is_empty() => return None,
        Ok(r) => r,
        Err(e) => {
            tracing::error!("digest: resolving {} failed: {e:?}", audience.as_str());
            errors.push(format!("{}: {e:#}", audience.as_str()));
            return None;
        }
    };
    match load_deliveries(conn, channels, &recipients).await {
        Ok(deliveries) => Some(Batch {
            audience,
            event,
            deliveries,
        }),
        Err(e) => {
            tracing::error!("digest: loading {} failed: {e}", audience.as_str());
            errors.push(format!("{}: {e}", audience.as_str()));
            None
        }
    }
}

/// Runs the digest of `kind` for the cases on `case_date`.
///
/// Every audience is resolved first and then all deliveries of the run go
/// out together. Fails only before anything was sent: on missing channel
/// configuration or when the schedule cannot be read.
pub async fn run(
    ctx: &Context,
    conn: &mut dyn Connection,
    settings: &NotificationSettings,
    kind: DigestKind,
    case_date: NaiveDate,
) -> Result<DigestReport, DispatchError> {
    let channels = check_channels(ctx, settings)?;
    let cases = conn
        .cases_scheduled_on(case_date)
        .await
        .map_err(DispatchError::Storage)?;
    tracing::info!(%kind, %case_date, cases = cases.len(), "running digest");

    let mut batches = Vec::new();
    let mut errors = Vec::new();

    if settings.audiences.stock_staff {
        let event = stock_staff_event(kind, case_date, &cases);
        let recipients = resolve_recipients(conn, &Targeting::roles(&[Role::StockStaff])).await;
        batches.extend(
            prepare(conn, channels, Audience::StockStaff, event, recipients, &mut errors).await,
        );
    }

    if settings.audiences.customer_service {
        let event = customer_service_event(kind, case_date, &cases);
        let recipients =
            resolve_recipients(conn, &Targeting::roles(&[Role::CustomerService])).await;
        batches.extend(
            prepare(
                conn,
                channels,
                Audience::CustomerService,
                event,
                recipients,
                &mut errors,
            )
            .await,
        );
    }

    if settings.audiences.dentists {
        let mut by_dentist: BTreeMap<Uuid, Vec<&CaseSummary>> = BTreeMap::new();
        for case in &cases {
            if let Some(dentist) = case.dentist_id {
                by_dentist.entry(dentist).or_default().push(case);
            }
        }
        let ids: Vec<Uuid> = by_dentist.keys().copied().collect();
        let active: BTreeSet<Uuid> = if ids.is_empty() {
            BTreeSet::new()
        } else {
            match conn.get_users(&ids).await {
                Ok(users) => users.into_iter().filter(|u| u.active).map(|u| u.id).collect(),
                Err(e) => {
                    tracing::error!("digest: loading dentists failed: {e:?}");
                    errors.push(format!("dentists: {e:#}"));
                    BTreeSet::new()
                }
            }
        };
        for (dentist, their_cases) in &by_dentist {
            if !active.contains(dentist) {
                continue;
            }
            let event = dentist_event(kind, case_date, their_cases);
            batches.extend(
                prepare(
                    conn,
                    channels,
                    Audience::Dentists,
                    event,
                    Ok(BTreeSet::from([*dentist])),
                    &mut errors,
                )
                .await,
            );
        }
    }

    let sent = join_all(
        batches
            .iter()
            .map(|b| send_all(ctx, channels, &b.event, &b.deliveries)),
    )
    .await;

    let mut audiences = Audiences::default();
    for (batch, attempts) in batches.iter().zip(sent) {
        let result = record(conn, &batch.event, batch.deliveries.recipients(), attempts).await;
        match batch.audience {
            Audience::StockStaff => audiences.stock_staff += result,
            Audience::CustomerService => audiences.customer_service += result,
            Audience::Dentists => audiences.dentists += result,
        }
    }

    let mut totals = audiences.stock_staff;
    totals += audiences.customer_service;
    totals += audiences.dentists;

    Ok(DigestReport {
        kind,
        case_date,
        cases: cases.len(),
        audiences,
        totals,
        errors,
    })
}
