//! LINE Messaging API integration.
//!
//! Outbound delivery goes through [`LineApi`]; the inbound side is the
//! webhook in [`webhook`], which also drives the account-linking flow in
//! [`linking`].

use crate::utils::truncate_chars;
use reqwest::StatusCode;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod client;
pub mod linking;
pub mod webhook;

pub use client::LineClient;

/// Limit imposed by the platform on a text message.
pub const MAX_TEXT_CHARS: usize = 5000;
const MAX_ALT_TEXT_CHARS: usize = 400;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    Text {
        text: String,
    },
    Flex {
        #[serde(rename = "altText")]
        alt_text: String,
        contents: serde_json::Value,
    },
}

impl Message {
    pub fn text(text: &str) -> Message {
        Message::Text {
            text: truncate_chars(text, MAX_TEXT_CHARS).into_owned(),
        }
    }

    pub fn flex(alt_text: &str, contents: serde_json::Value) -> Message {
        Message::Flex {
            alt_text: truncate_chars(alt_text, MAX_ALT_TEXT_CHARS).into_owned(),
            contents,
        }
    }
}

/// A summary card rendered as a flex bubble.
#[derive(Debug, Clone, PartialEq)]
pub struct Card {
    pub title: String,
    pub body: String,
    /// Header background, as `#RRGGBB`.
    pub accent: &'static str,
    pub fields: Vec<(String, String)>,
    /// Absolute URL opened by the footer button.
    pub link: Option<String>,
}

pub const ACCENT_INFO: &str = "#1E88E5";
pub const ACCENT_SUCCESS: &str = "#43A047";
pub const ACCENT_URGENT: &str = "#E53935";

/// One label/value line of a card. The platform rejects text components
/// with an empty `text`, so an unlabeled row is a single text spanning the
/// width and an empty value is shown as a dash.
fn field_row(label: &str, value: &str) -> serde_json::Value {
    let value = if value.trim().is_empty() { "-" } else { value };
    if label.trim().is_empty() {
        return serde_json::json!({
            "type": "text",
            "text": value,
            "color": "#888888",
            "size": "sm",
            "wrap": true,
        });
    }
    serde_json::json!({
        "type": "box",
        "layout": "baseline",
        "spacing": "sm",
        "contents": [
            { "type": "text", "text": label, "color": "#888888", "size": "sm", "flex": 2 },
            { "type": "text", "text": value, "size": "sm", "flex": 5, "wrap": true },
        ],
    })
}

impl Card {
    pub fn to_message(&self) -> Message {
        let mut body = vec![serde_json::json!({
            "type": "text",
            "text": self.body,
            "wrap": true,
            "size": "sm",
        })];
        if !self.fields.is_empty() {
            body.push(serde_json::json!({ "type": "separator", "margin": "md" }));
        }
        body.extend(self.fields.iter().map(|(label, value)| field_row(label, value)));

        let mut bubble = serde_json::json!({
            "type": "bubble",
            "header": {
                "type": "box",
                "layout": "vertical",
                "backgroundColor": self.accent,
                "contents": [{
                    "type": "text",
                    "text": self.title,
                    "weight": "bold",
                    "color": "#FFFFFF",
                    "wrap": true,
                }],
            },
            "body": {
                "type": "box",
                "layout": "vertical",
                "spacing": "sm",
                "contents": body,
            },
        });
        if let Some(link) = &self.link {
            bubble["footer"] = serde_json::json!({
                "type": "box",
                "layout": "vertical",
                "contents": [{
                    "type": "button",
                    "style": "primary",
                    "color": self.accent,
                    "action": { "type": "uri", "label": "View details", "uri": link },
                }],
            });
        }
        Message::flex(&format!("{}: {}", self.title, self.body), bubble)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub user_id: String,
    pub display_name: String,
    #[serde(default)]
    pub picture_url: Option<String>,
}

/// A failed call to the Messaging API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineError {
    /// HTTP status, when the platform answered at all.
    pub status: Option<StatusCode>,
    pub message: String,
}

impl fmt::Display for LineError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "LINE API returned {status}: {}", self.message),
            None => write!(f, "LINE API request failed: {}", self.message),
        }
    }
}

impl std::error::Error for LineError {}

#[async_trait::async_trait]
pub trait LineApi: Send + Sync {
    async fn push_message(
        &self,
        token: &SecretString,
        to: &str,
        messages: &[Message],
    ) -> Result<(), LineError>;

    async fn reply_message(
        &self,
        token: &SecretString,
        reply_token: &str,
        messages: &[Message],
    ) -> Result<(), LineError>;

    async fn get_profile(&self, token: &SecretString, user_id: &str)
    -> Result<Profile, LineError>;
}
