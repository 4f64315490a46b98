//! Keys of the generic `settings` table.
//!
//! Values are stored as JSON. The typed view lives in
//! [`crate::config::NotificationSettings`]; the daily send markers are kept
//! separate because they are written with a conditional update rather than
//! read as part of a snapshot.

use crate::scheduler::DigestKind;
use anyhow::Context as _;
use chrono::NaiveDate;

pub const ENABLED: &str = "daily_notification_enabled";
pub const MORNING_TIME: &str = "daily_notification_morning_time";
pub const EVENING_TIME: &str = "daily_notification_evening_time";
pub const PUSH_ENABLED: &str = "push_notification_enabled";
pub const LINE_ENABLED: &str = "line_notification_enabled";
pub const LINE_CHANNEL_ACCESS_TOKEN: &str = "line_channel_access_token";
pub const NOTIFY_STOCK_STAFF: &str = "daily_notification_stock_staff";
pub const NOTIFY_CUSTOMER_SERVICE: &str = "daily_notification_customer_service";
pub const NOTIFY_DENTISTS: &str = "daily_notification_dentists";

pub fn marker_key(kind: DigestKind) -> &'static str {
    match kind {
        DigestKind::Morning => "daily_notification_last_morning",
        DigestKind::Evening => "daily_notification_last_evening",
    }
}

pub fn marker_value(date: NaiveDate) -> serde_json::Value {
    serde_json::Value::String(date.format("%Y-%m-%d").to_string())
}

pub fn parse_marker(value: &serde_json::Value) -> anyhow::Result<NaiveDate> {
    let s = value
        .as_str()
        .with_context(|| format!("send marker must be a date string, got {value}"))?;
    NaiveDate::parse_from_str(s, "%Y-%m-%d").with_context(|| format!("invalid send marker `{s}`"))
}
