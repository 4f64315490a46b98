use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// A confirmed binding between an internal user and a LINE identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LineAccount {
    pub user_id: Uuid,
    pub line_user_id: String,
    pub display_name: Option<String>,
    pub linked_at: DateTime<Utc>,
}

/// Someone who added the official account but has not linked it yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingLink {
    pub line_user_id: String,
    pub display_name: Option<String>,
    pub followed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkCode {
    pub code: String,
    pub user_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    Linked { user_id: Uuid },
    Expired,
    NotFound,
}
