use self::directory::{CaseSummary, Role, UserRecord};
use self::line_accounts::{LineAccount, LinkCode, LinkOutcome, PendingLink};
use self::notification_log::{LogEntry, NewLogEntry};
use self::subscriptions::{NewPushSubscription, PushSubscription};
use crate::scheduler::DigestKind;
use anyhow::{Context as _, Result};
use chrono::{DateTime, NaiveDate, Utc};
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

pub mod directory;
pub mod line_accounts;
pub mod memory;
pub mod notification_log;
pub mod postgres;
pub mod settings;
pub mod subscriptions;

#[async_trait::async_trait]
pub trait Connection: Send + Sync {
    // User directory and case schedule (read-only projections)
    async fn active_users_with_roles(&mut self, roles: &[Role]) -> Result<Vec<UserRecord>>;
    async fn get_users(&mut self, ids: &[Uuid]) -> Result<Vec<UserRecord>>;
    async fn cases_scheduled_on(&mut self, date: NaiveDate) -> Result<Vec<CaseSummary>>;

    // Settings
    async fn load_settings(&mut self) -> Result<Vec<(String, serde_json::Value)>>;
    async fn get_daily_marker(&mut self, kind: DigestKind) -> Result<Option<NaiveDate>>;
    /// Atomically moves the marker of `kind` to `date`.
    ///
    /// Returns `false` without writing anything when the marker already
    /// holds `date`.
    async fn claim_daily_marker(&mut self, kind: DigestKind, date: NaiveDate) -> Result<bool>;
    /// Puts back `previous` if the marker still holds `claimed`.
    async fn restore_daily_marker(
        &mut self,
        kind: DigestKind,
        claimed: NaiveDate,
        previous: Option<NaiveDate>,
    ) -> Result<()>;

    // Push subscriptions
    async fn upsert_push_subscription(
        &mut self,
        subscription: &NewPushSubscription,
    ) -> Result<PushSubscription>;
    async fn delete_push_subscription(&mut self, user_id: Uuid, endpoint: &str) -> Result<bool>;
    async fn active_push_subscriptions(
        &mut self,
        user_ids: &[Uuid],
    ) -> Result<Vec<PushSubscription>>;
    async fn deactivate_push_subscription(&mut self, id: Uuid) -> Result<()>;

    // LINE accounts and linking
    async fn line_accounts_for(&mut self, user_ids: &[Uuid]) -> Result<Vec<LineAccount>>;
    async fn unlink_line_account(&mut self, user_id: Uuid) -> Result<bool>;
    async fn record_pending_link(&mut self, link: &PendingLink) -> Result<()>;
    async fn get_pending_link(&mut self, line_user_id: &str) -> Result<Option<PendingLink>>;
    async fn remove_pending_link(&mut self, line_user_id: &str) -> Result<()>;
    /// Stores `code`, replacing every earlier code of the same user.
    ///
    /// Returns `false` and changes nothing when another user holds the same
    /// code.
    async fn insert_link_code(&mut self, code: &LinkCode) -> Result<bool>;
    /// Deletes `code` and, if it was still valid at `now`, binds
    /// `line_user_id` to the code's owner in the same transaction.
    async fn consume_link_code(
        &mut self,
        code: &str,
        line_user_id: &str,
        display_name: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<LinkOutcome>;

    // Notification log
    async fn record_notification(&mut self, entry: &NewLogEntry) -> Result<()>;
    async fn get_notification_logs(&mut self, limit: i64) -> Result<Vec<LogEntry>>;
}

#[async_trait::async_trait]
pub trait ConnectionManager {
    type Connection;
    async fn open(&self) -> Result<Self::Connection>;
    async fn is_valid(&self, c: &mut Self::Connection) -> bool;
}

pub struct ConnectionPool<M: ConnectionManager> {
    connections: Arc<Mutex<Vec<M::Connection>>>,
    permits: Arc<Semaphore>,
    manager: M,
}

pub struct ManagedConnection<T> {
    conn: Option<T>,
    connections: Arc<Mutex<Vec<T>>>,
    #[allow(unused)]
    permit: OwnedSemaphorePermit,
}

impl<T> std::ops::Deref for ManagedConnection<T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().unwrap()
    }
}
impl<T> std::ops::DerefMut for ManagedConnection<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().unwrap()
    }
}

impl<T> Drop for ManagedConnection<T> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.connections
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(conn);
        }
    }
}

impl<T, M> ConnectionPool<M>
where
    T: Send,
    M: ConnectionManager<Connection = T>,
{
    fn new(manager: M) -> Self {
        ConnectionPool {
            connections: Arc::new(Mutex::new(Vec::with_capacity(16))),
            permits: Arc::new(Semaphore::new(16)),
            manager,
        }
    }

    async fn get(&self) -> Result<ManagedConnection<T>> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .context("connection pool closed")?;
        let conn = {
            let mut slots = self.connections.lock().unwrap_or_else(|e| e.into_inner());
            slots.pop()
        };
        if let Some(mut c) = conn {
            if self.manager.is_valid(&mut c).await {
                return Ok(ManagedConnection {
                    conn: Some(c),
                    permit,
                    connections: self.connections.clone(),
                });
            }
        }

        let conn = self.manager.open().await?;
        Ok(ManagedConnection {
            conn: Some(conn),
            connections: self.connections.clone(),
            permit,
        })
    }
}

pub enum Pool {
    Postgres(ConnectionPool<postgres::Postgres>),
    Memory(memory::MemoryDb),
}

impl Pool {
    pub async fn connection(&self) -> Result<Box<dyn Connection>> {
        match self {
            Pool::Postgres(p) => Ok(Box::new(p.get().await?)),
            Pool::Memory(db) => Ok(Box::new(db.connection())),
        }
    }

    /// Opens a pool for `uri`.
    ///
    /// `memory:` selects the in-process backend, which keeps nothing across
    /// restarts and is meant for local development.
    pub fn open(uri: &str) -> Pool {
        if uri.starts_with("memory") {
            Pool::Memory(memory::MemoryDb::default())
        } else {
            Pool::Postgres(ConnectionPool::new(postgres::Postgres::new(uri.into())))
        }
    }
}
