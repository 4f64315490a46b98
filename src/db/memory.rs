//! In-process storage backend.
//!
//! Mirrors the semantics of the Postgres backend (conditional marker
//! writes, single-use link codes, unique push endpoints) so that the
//! orchestration code can be exercised without a database server.

use super::directory::{CaseSummary, Role, UserRecord};
use super::line_accounts::{LineAccount, LinkCode, LinkOutcome, PendingLink};
use super::notification_log::{LogEntry, NewLogEntry};
use super::settings::{marker_key, marker_value, parse_marker};
use super::subscriptions::{NewPushSubscription, PushSubscription};
use crate::db::Connection;
use crate::scheduler::DigestKind;
use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Default)]
struct State {
    users: Vec<UserRecord>,
    cases: Vec<CaseSummary>,
    settings: BTreeMap<String, serde_json::Value>,
    push_subscriptions: Vec<PushSubscription>,
    line_accounts: Vec<LineAccount>,
    pending_links: HashMap<String, PendingLink>,
    link_codes: HashMap<String, LinkCode>,
    logs: Vec<LogEntry>,
}

#[derive(Clone, Default)]
pub struct MemoryDb {
    state: Arc<Mutex<State>>,
}

impl MemoryDb {
    pub fn connection(&self) -> MemoryConnection {
        MemoryConnection { db: self.clone() }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_user(&self, user: UserRecord) {
        let mut state = self.lock();
        state.users.retain(|u| u.id != user.id);
        state.users.push(user);
    }

    pub fn add_case(&self, case: CaseSummary) {
        self.lock().cases.push(case);
    }

    pub fn set_setting(&self, key: &str, value: serde_json::Value) {
        self.lock().settings.insert(key.to_string(), value);
    }

    pub fn setting(&self, key: &str) -> Option<serde_json::Value> {
        self.lock().settings.get(key).cloned()
    }

    pub fn push_subscriptions(&self) -> Vec<PushSubscription> {
        self.lock().push_subscriptions.clone()
    }

    pub fn line_accounts(&self) -> Vec<LineAccount> {
        self.lock().line_accounts.clone()
    }

    pub fn pending_links(&self) -> Vec<PendingLink> {
        self.lock().pending_links.values().cloned().collect()
    }

    pub fn link_codes(&self) -> Vec<LinkCode> {
        self.lock().link_codes.values().cloned().collect()
    }

    /// All log entries, oldest first.
    pub fn notification_logs(&self) -> Vec<LogEntry> {
        self.lock().logs.clone()
    }
}

pub struct MemoryConnection {
    db: MemoryDb,
}

#[async_trait::async_trait]
impl Connection for MemoryConnection {
    async fn active_users_with_roles(&mut self, roles: &[Role]) -> Result<Vec<UserRecord>> {
        Ok(self
            .db
            .lock()
            .users
            .iter()
            .filter(|u| u.active && roles.contains(&u.role))
            .cloned()
            .collect())
    }

    async fn get_users(&mut self, ids: &[Uuid]) -> Result<Vec<UserRecord>> {
        Ok(self
            .db
            .lock()
            .users
            .iter()
            .filter(|u| ids.contains(&u.id))
            .cloned()
            .collect())
    }

    async fn cases_scheduled_on(&mut self, date: NaiveDate) -> Result<Vec<CaseSummary>> {
        let mut cases: Vec<CaseSummary> = self
            .db
            .lock()
            .cases
            .iter()
            .filter(|c| c.surgery_date == date)
            .cloned()
            .collect();
        cases.sort_by(|a, b| {
            // Cases without a time go last, like `NULLS LAST`.
            (a.surgery_time.is_none(), a.surgery_time, &a.case_number).cmp(&(
                b.surgery_time.is_none(),
                b.surgery_time,
                &b.case_number,
            ))
        });
        Ok(cases)
    }

    async fn load_settings(&mut self) -> Result<Vec<(String, serde_json::Value)>> {
        Ok(self
            .db
            .lock()
            .settings
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn get_daily_marker(&mut self, kind: DigestKind) -> Result<Option<NaiveDate>> {
        self.db
            .lock()
            .settings
            .get(marker_key(kind))
            .map(parse_marker)
            .transpose()
    }

    async fn claim_daily_marker(&mut self, kind: DigestKind, date: NaiveDate) -> Result<bool> {
        let mut state = self.db.lock();
        let value = marker_value(date);
        if state.settings.get(marker_key(kind)) == Some(&value) {
            return Ok(false);
        }
        state.settings.insert(marker_key(kind).to_string(), value);
        Ok(true)
    }

    async fn restore_daily_marker(
        &mut self,
        kind: DigestKind,
        claimed: NaiveDate,
        previous: Option<NaiveDate>,
    ) -> Result<()> {
        let mut state = self.db.lock();
        if state.settings.get(marker_key(kind)) != Some(&marker_value(claimed)) {
            return Ok(());
        }
        match previous {
            Some(previous) => {
                state
                    .settings
                    .insert(marker_key(kind).to_string(), marker_value(previous));
            }
            None => {
                state.settings.remove(marker_key(kind));
            }
        }
        Ok(())
    }

    async fn upsert_push_subscription(
        &mut self,
        subscription: &NewPushSubscription,
    ) -> Result<PushSubscription> {
        let mut state = self.db.lock();
        let now = Utc::now();
        if let Some(existing) = state
            .push_subscriptions
            .iter_mut()
            .find(|s| s.endpoint == subscription.endpoint)
        {
            existing.user_id = subscription.user_id;
            existing.p256dh = subscription.p256dh.clone();
            existing.auth = subscription.auth.clone();
            existing.user_agent = subscription.user_agent.clone();
            existing.active = true;
            existing.updated_at = now;
            return Ok(existing.clone());
        }
        let created = PushSubscription {
            id: Uuid::new_v4(),
            user_id: subscription.user_id,
            endpoint: subscription.endpoint.clone(),
            p256dh: subscription.p256dh.clone(),
            auth: subscription.auth.clone(),
            user_agent: subscription.user_agent.clone(),
            active: true,
            created_at: now,
            updated_at: now,
        };
        state.push_subscriptions.push(created.clone());
        Ok(created)
    }

    async fn delete_push_subscription(&mut self, user_id: Uuid, endpoint: &str) -> Result<bool> {
        let mut state = self.db.lock();
        let before = state.push_subscriptions.len();
        state
            .push_subscriptions
            .retain(|s| !(s.user_id == user_id && s.endpoint == endpoint));
        Ok(state.push_subscriptions.len() != before)
    }

    async fn active_push_subscriptions(
        &mut self,
        user_ids: &[Uuid],
    ) -> Result<Vec<PushSubscription>> {
        Ok(self
            .db
            .lock()
            .push_subscriptions
            .iter()
            .filter(|s| s.active && user_ids.contains(&s.user_id))
            .cloned()
            .collect())
    }

    async fn deactivate_push_subscription(&mut self, id: Uuid) -> Result<()> {
        let mut state = self.db.lock();
        if let Some(sub) = state.push_subscriptions.iter_mut().find(|s| s.id == id) {
            sub.active = false;
            sub.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn line_accounts_for(&mut self, user_ids: &[Uuid]) -> Result<Vec<LineAccount>> {
        Ok(self
            .db
            .lock()
            .line_accounts
            .iter()
            .filter(|a| user_ids.contains(&a.user_id))
            .cloned()
            .collect())
    }

    async fn unlink_line_account(&mut self, user_id: Uuid) -> Result<bool> {
        let mut state = self.db.lock();
        let before = state.line_accounts.len();
        state.line_accounts.retain(|a| a.user_id != user_id);
        Ok(state.line_accounts.len() != before)
    }

    async fn record_pending_link(&mut self, link: &PendingLink) -> Result<()> {
        self.db
            .lock()
            .pending_links
            .insert(link.line_user_id.clone(), link.clone());
        Ok(())
    }

    async fn get_pending_link(&mut self, line_user_id: &str) -> Result<Option<PendingLink>> {
        Ok(self.db.lock().pending_links.get(line_user_id).cloned())
    }

    async fn remove_pending_link(&mut self, line_user_id: &str) -> Result<()> {
        self.db.lock().pending_links.remove(line_user_id);
        Ok(())
    }

    async fn insert_link_code(&mut self, code: &LinkCode) -> Result<bool> {
        let mut state = self.db.lock();
        if state
            .link_codes
            .get(&code.code)
            .is_some_and(|c| c.user_id != code.user_id)
        {
            return Ok(false);
        }
        state.link_codes.retain(|_, c| c.user_id != code.user_id);
        state.link_codes.insert(code.code.clone(), code.clone());
        Ok(true)
    }

    async fn consume_link_code(
        &mut self,
        code: &str,
        line_user_id: &str,
        display_name: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<LinkOutcome> {
        let mut state = self.db.lock();
        let Some(link_code) = state.link_codes.remove(code) else {
            return Ok(LinkOutcome::NotFound);
        };
        if link_code.expires_at <= now {
            return Ok(LinkOutcome::Expired);
        }
        let user_id = link_code.user_id;
        state
            .line_accounts
            .retain(|a| a.user_id != user_id && a.line_user_id != line_user_id);
        state.line_accounts.push(LineAccount {
            user_id,
            line_user_id: line_user_id.to_string(),
            display_name: display_name.map(str::to_string),
            linked_at: now,
        });
        state.pending_links.remove(line_user_id);
        Ok(LinkOutcome::Linked { user_id })
    }

    async fn record_notification(&mut self, entry: &NewLogEntry) -> Result<()> {
        let mut state = self.db.lock();
        let id = state.logs.len() as i64 + 1;
        state.logs.push(LogEntry {
            id,
            user_id: entry.user_id,
            channel: entry.channel,
            kind: entry.kind.clone(),
            title: entry.title.clone(),
            message: entry.message.clone(),
            status: entry.status,
            error: entry.error.clone(),
            metadata: entry.metadata.clone(),
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn get_notification_logs(&mut self, limit: i64) -> Result<Vec<LogEntry>> {
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(self
            .db
            .lock()
            .logs
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }
}
