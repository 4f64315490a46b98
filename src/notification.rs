//! Multi-channel notification fan-out.
//!
//! An event is addressed with a [`Targeting`], resolved to a deduplicated set
//! of users, and delivered to every active push subscription and linked LINE
//! identity those users have. Each attempt is recorded in the notification
//! log.

use crate::errors::error_response;
use crate::line::Card;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use std::fmt;
use std::ops::AddAssign;

pub mod api;
pub mod digest;
pub mod dispatch;
pub mod events;
pub mod recipients;

pub use dispatch::dispatch;
pub use recipients::{Targeting, resolve_recipients};

/// How the event is rendered on LINE.
#[derive(Debug, Clone, PartialEq)]
pub enum LineStyle {
    Text,
    Card {
        accent: &'static str,
        fields: Vec<(String, String)>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct NotificationEvent {
    pub kind: String,
    pub title: String,
    pub body: String,
    /// Application path the notification opens, e.g. `/cases/<id>`.
    pub url: String,
    /// Collapses repeated notifications about the same subject on a device.
    pub tag: String,
    pub data: serde_json::Value,
    pub line_style: LineStyle,
}

impl NotificationEvent {
    pub fn new(kind: &str, title: String, body: String, url: String, tag: String) -> Self {
        NotificationEvent {
            kind: kind.to_string(),
            title,
            body,
            url,
            tag,
            data: serde_json::Value::Null,
            line_style: LineStyle::Text,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn as_card(mut self, accent: &'static str, fields: Vec<(String, String)>) -> Self {
        self.line_style = LineStyle::Card { accent, fields };
        self
    }

    pub fn validate(&self) -> Result<(), DispatchError> {
        for (field, value) in [
            ("kind", &self.kind),
            ("title", &self.title),
            ("body", &self.body),
            ("tag", &self.tag),
        ] {
            if value.trim().is_empty() {
                return Err(DispatchError::Invalid(format!("`{field}` must not be empty")));
            }
        }
        Ok(())
    }

    /// Absolute link into the application.
    pub fn link(&self, app_url: &str) -> String {
        if self.url.starts_with("http://") || self.url.starts_with("https://") {
            self.url.clone()
        } else {
            format!(
                "{}/{}",
                app_url.trim_end_matches('/'),
                self.url.trim_start_matches('/')
            )
        }
    }

    pub fn line_message(&self, app_url: &str) -> crate::line::Message {
        let link = self.link(app_url);
        match &self.line_style {
            LineStyle::Text => {
                crate::line::Message::text(&format!("{}\n\n{}\n\n{link}", self.title, self.body))
            }
            LineStyle::Card { accent, fields } => Card {
                title: self.title.clone(),
                body: self.body.clone(),
                accent,
                fields: fields.clone(),
                link: Some(link),
            }
            .to_message(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChannelCounts {
    pub sent: usize,
    pub failed: usize,
}

impl AddAssign for ChannelCounts {
    fn add_assign(&mut self, rhs: Self) {
        self.sent += rhs.sent;
        self.failed += rhs.failed;
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeliveryResult {
    pub recipients: usize,
    pub push: ChannelCounts,
    pub line: ChannelCounts,
}

impl DeliveryResult {
    pub fn sent(&self) -> usize {
        self.push.sent + self.line.sent
    }

    pub fn failed(&self) -> usize {
        self.push.failed + self.line.failed
    }
}

impl AddAssign for DeliveryResult {
    fn add_assign(&mut self, rhs: Self) {
        self.recipients += rhs.recipients;
        self.push += rhs.push;
        self.line += rhs.line;
    }
}

/// Failures that stop a dispatch before anything is sent.
#[derive(Debug)]
pub enum DispatchError {
    /// The event or its targeting is malformed.
    Invalid(String),
    /// An enabled channel lacks the credential it needs.
    MissingCredential(&'static str),
    /// Every channel is switched off.
    NoChannels,
    NoRecipients,
    Storage(anyhow::Error),
}

impl DispatchError {
    pub fn status(&self) -> StatusCode {
        match self {
            DispatchError::Invalid(_) | DispatchError::NoChannels => StatusCode::BAD_REQUEST,
            DispatchError::NoRecipients => StatusCode::NOT_FOUND,
            DispatchError::MissingCredential(_) | DispatchError::Storage(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Whether the failure comes from configuration rather than input.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            DispatchError::MissingCredential(_) | DispatchError::NoChannels
        )
    }
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DispatchError::Invalid(msg) => write!(f, "invalid notification: {msg}"),
            DispatchError::MissingCredential(what) => write!(f, "{what} is not configured"),
            DispatchError::NoChannels => write!(f, "all notification channels are disabled"),
            DispatchError::NoRecipients => write!(f, "no recipients found"),
            DispatchError::Storage(err) => write!(f, "storage error: {err:#}"),
        }
    }
}

impl std::error::Error for DispatchError {}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("{self}");
        }
        error_response(status, self.to_string())
    }
}
