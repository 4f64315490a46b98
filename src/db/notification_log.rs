//! The `notification_logs` table is an append-only audit trail of every
//! delivery attempt. Rows are never updated or deleted here.

use crate::utils::truncate_chars;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Longest message text kept in a log row.
pub const MAX_LOGGED_MESSAGE_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogChannel {
    Push,
    Line,
    /// Run summaries written by the scheduled trigger.
    System,
}

impl LogChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogChannel::Push => "push",
            LogChannel::Line => "line",
            LogChannel::System => "system",
        }
    }
}

impl std::str::FromStr for LogChannel {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<LogChannel, Self::Err> {
        Ok(match s {
            "push" => LogChannel::Push,
            "line" => LogChannel::Line,
            "system" => LogChannel::System,
            _ => anyhow::bail!("unknown log channel `{s}`"),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sent,
    Failed,
    Delivered,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Failed => "failed",
            DeliveryStatus::Delivered => "delivered",
        }
    }
}

impl std::str::FromStr for DeliveryStatus {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<DeliveryStatus, Self::Err> {
        Ok(match s {
            "sent" => DeliveryStatus::Sent,
            "failed" => DeliveryStatus::Failed,
            "delivered" => DeliveryStatus::Delivered,
            _ => anyhow::bail!("unknown delivery status `{s}`"),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewLogEntry {
    pub user_id: Option<Uuid>,
    pub channel: LogChannel,
    pub kind: String,
    pub title: String,
    pub message: String,
    pub status: DeliveryStatus,
    pub error: Option<String>,
    pub metadata: serde_json::Value,
}

impl NewLogEntry {
    pub fn new(
        user_id: Option<Uuid>,
        channel: LogChannel,
        kind: &str,
        title: &str,
        message: &str,
        status: DeliveryStatus,
    ) -> NewLogEntry {
        NewLogEntry {
            user_id,
            channel,
            kind: kind.to_string(),
            title: title.to_string(),
            message: truncate_chars(message, MAX_LOGGED_MESSAGE_CHARS).into_owned(),
            status,
            error: None,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub id: i64,
    pub user_id: Option<Uuid>,
    pub channel: LogChannel,
    pub kind: String,
    pub title: String,
    pub message: String,
    pub status: DeliveryStatus,
    pub error: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}
