use super::directory::{CaseSummary, Role, UserRecord};
use super::line_accounts::{LineAccount, LinkCode, LinkOutcome, PendingLink};
use super::notification_log::{LogEntry, NewLogEntry};
use super::settings::{marker_key, marker_value, parse_marker};
use super::subscriptions::{NewPushSubscription, PushSubscription};
use crate::db::{Connection, ConnectionManager, ManagedConnection};
use crate::scheduler::DigestKind;
use anyhow::Context as _;
use anyhow::Result;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use tokio_postgres::types::Json;
use tracing::trace;
use uuid::Uuid;

pub struct Postgres(String, tokio::sync::OnceCell<()>);

impl Postgres {
    pub fn new(url: String) -> Self {
        Postgres(url, tokio::sync::OnceCell::new())
    }
}

pub async fn make_client(db_url: &str) -> Result<tokio_postgres::Client> {
    if db_url.contains("sslmode=require") {
        let connector = TlsConnector::builder()
            .build()
            .context("built TlsConnector")?;
        let connector = MakeTlsConnector::new(connector);

        let (db_client, connection) = match tokio_postgres::connect(db_url, connector).await {
            Ok(v) => v,
            Err(e) => {
                anyhow::bail!("failed to connect to DB: {}", e);
            }
        };
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!("database connection error: {}", e);
            }
        });

        Ok(db_client)
    } else {
        tracing::warn!("non-TLS connection to database");
        let (db_client, connection) =
            match tokio_postgres::connect(db_url, tokio_postgres::NoTls).await {
                Ok(v) => v,
                Err(e) => {
                    anyhow::bail!("failed to connect to DB: {}", e);
                }
            };
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!("database connection error: {}", e);
            }
        });

        Ok(db_client)
    }
}

// `users` and `surgical_cases` are owned by the clinic application; the
// statements below only create them on a fresh development database.
static MIGRATIONS: &[&str] = &[
    "
CREATE TABLE IF NOT EXISTS users (
    id UUID PRIMARY KEY,
    full_name TEXT NOT NULL,
    role TEXT NOT NULL,
    active BOOLEAN NOT NULL DEFAULT TRUE
);
",
    "
CREATE TABLE IF NOT EXISTS surgical_cases (
    id UUID DEFAULT gen_random_uuid() PRIMARY KEY,
    case_number TEXT NOT NULL,
    patient_name TEXT NOT NULL,
    dentist_id UUID REFERENCES users (id),
    surgery_date DATE NOT NULL,
    surgery_time TIME,
    procedure TEXT NOT NULL DEFAULT '',
    material_status TEXT NOT NULL DEFAULT 'pending',
    status TEXT NOT NULL DEFAULT 'scheduled'
);
",
    "
CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value JSONB NOT NULL,
    updated_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT now()
);
",
    "
CREATE TABLE push_subscriptions (
    id UUID DEFAULT gen_random_uuid() PRIMARY KEY,
    user_id UUID NOT NULL,
    endpoint TEXT NOT NULL UNIQUE,
    p256dh TEXT NOT NULL,
    auth TEXT NOT NULL,
    user_agent TEXT,
    active BOOLEAN NOT NULL DEFAULT TRUE,
    created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT now(),
    updated_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT now()
);
",
    "CREATE INDEX push_subscriptions_user_id_index ON push_subscriptions (user_id);",
    "
CREATE TABLE line_accounts (
    user_id UUID PRIMARY KEY,
    line_user_id TEXT NOT NULL UNIQUE,
    display_name TEXT,
    linked_at TIMESTAMP WITH TIME ZONE NOT NULL
);
",
    "
CREATE TABLE line_pending_links (
    line_user_id TEXT PRIMARY KEY,
    display_name TEXT,
    followed_at TIMESTAMP WITH TIME ZONE NOT NULL
);
",
    "
CREATE TABLE line_link_codes (
    code TEXT PRIMARY KEY,
    user_id UUID NOT NULL,
    expires_at TIMESTAMP WITH TIME ZONE NOT NULL
);
",
    "
CREATE TABLE notification_logs (
    id BIGSERIAL PRIMARY KEY,
    user_id UUID,
    channel TEXT NOT NULL,
    kind TEXT NOT NULL,
    title TEXT NOT NULL,
    message TEXT NOT NULL,
    status TEXT NOT NULL,
    error TEXT,
    metadata JSONB,
    created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT now()
);
",
    "CREATE INDEX notification_logs_created_at_index ON notification_logs (created_at DESC);",
];

#[async_trait::async_trait]
impl ConnectionManager for Postgres {
    type Connection = PostgresConnection;
    async fn open(&self) -> Result<Self::Connection> {
        let client = make_client(&self.0).await?;
        self.1
            .get_or_try_init(|| run_migrations(&client))
            .await
            .context("running migrations")?;
        Ok(PostgresConnection::new(client))
    }
    async fn is_valid(&self, conn: &mut Self::Connection) -> bool {
        !conn.client.is_closed()
    }
}

pub async fn run_migrations(client: &tokio_postgres::Client) -> Result<()> {
    client
        .execute(
            "CREATE TABLE IF NOT EXISTS database_versions (
                zero INTEGER PRIMARY KEY,
                migration_counter INTEGER
            );",
            &[],
        )
        .await
        .context("creating database versioning table")?;

    client
        .execute(
            "INSERT INTO database_versions (zero, migration_counter)
                VALUES (0, 0)
                ON CONFLICT DO NOTHING",
            &[],
        )
        .await
        .context("inserting initial database_versions")?;

    let migration_idx: i32 = client
        .query_one("SELECT migration_counter FROM database_versions", &[])
        .await
        .context("getting migration counter")?
        .get(0);
    let migration_idx = migration_idx as usize;

    for (idx, migration) in MIGRATIONS.iter().enumerate() {
        if idx >= migration_idx {
            client
                .execute(*migration, &[])
                .await
                .with_context(|| format!("executing {}th migration", idx))?;
            client
                .execute(
                    "UPDATE database_versions SET migration_counter = $1",
                    &[&(idx as i32 + 1)],
                )
                .await
                .with_context(|| format!("updating migration counter to {}", idx))?;
        }
    }

    Ok(())
}

pub struct PostgresConnection {
    client: tokio_postgres::Client,
}

impl PostgresConnection {
    pub fn new(client: tokio_postgres::Client) -> Self {
        PostgresConnection { client }
    }
}

#[async_trait::async_trait]
impl Connection for ManagedConnection<PostgresConnection> {
    async fn active_users_with_roles(&mut self, roles: &[Role]) -> Result<Vec<UserRecord>> {
        let roles: Vec<&str> = roles.iter().map(Role::as_str).collect();
        let rows = self
            .client
            .query(
                "SELECT id, full_name, role, active FROM users
                WHERE active AND role = ANY($1)",
                &[&roles],
            )
            .await
            .context("selecting users by role")?;
        rows.iter().map(deserialize_user).collect()
    }

    async fn get_users(&mut self, ids: &[Uuid]) -> Result<Vec<UserRecord>> {
        let rows = self
            .client
            .query(
                "SELECT id, full_name, role, active FROM users WHERE id = ANY($1)",
                &[&ids],
            )
            .await
            .context("selecting users by id")?;
        rows.iter().map(deserialize_user).collect()
    }

    async fn cases_scheduled_on(&mut self, date: NaiveDate) -> Result<Vec<CaseSummary>> {
        let rows = self
            .client
            .query(
                "SELECT id, case_number, patient_name, dentist_id, surgery_date, surgery_time,
                    procedure, material_status
                FROM surgical_cases
                WHERE surgery_date = $1 AND status <> 'cancelled'
                ORDER BY surgery_time ASC NULLS LAST, case_number ASC",
                &[&date],
            )
            .await
            .context("selecting cases for date")?;
        rows.iter().map(deserialize_case).collect()
    }

    async fn load_settings(&mut self) -> Result<Vec<(String, serde_json::Value)>> {
        let rows = self
            .client
            .query("SELECT key, value FROM settings", &[])
            .await
            .context("loading settings")?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let key: String = row.get(0);
                let value: Json<serde_json::Value> = row.get(1);
                (key, value.0)
            })
            .collect())
    }

    async fn get_daily_marker(&mut self, kind: DigestKind) -> Result<Option<NaiveDate>> {
        let row = self
            .client
            .query_opt(
                "SELECT value FROM settings WHERE key = $1",
                &[&marker_key(kind)],
            )
            .await
            .context("selecting send marker")?;
        match row {
            Some(row) => {
                let value: Json<serde_json::Value> = row.get(0);
                Ok(Some(parse_marker(&value.0)?))
            }
            None => Ok(None),
        }
    }

    async fn claim_daily_marker(&mut self, kind: DigestKind, date: NaiveDate) -> Result<bool> {
        trace!("claim_daily_marker(kind={}, date={})", kind, date);
        // The WHERE clause is re-evaluated against the latest row version
        // after a concurrent writer commits, so only one claim wins per date.
        let updated = self
            .client
            .execute(
                "INSERT INTO settings (key, value, updated_at) VALUES ($1, $2, now())
                ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = now()
                WHERE settings.value IS DISTINCT FROM EXCLUDED.value",
                &[&marker_key(kind), &Json(marker_value(date))],
            )
            .await
            .context("claiming send marker")?;
        Ok(updated == 1)
    }

    async fn restore_daily_marker(
        &mut self,
        kind: DigestKind,
        claimed: NaiveDate,
        previous: Option<NaiveDate>,
    ) -> Result<()> {
        trace!("restore_daily_marker(kind={}, previous={:?})", kind, previous);
        match previous {
            Some(previous) => {
                self.client
                    .execute(
                        "UPDATE settings SET value = $3, updated_at = now()
                        WHERE key = $1 AND value = $2",
                        &[
                            &marker_key(kind),
                            &Json(marker_value(claimed)),
                            &Json(marker_value(previous)),
                        ],
                    )
                    .await
                    .context("restoring send marker")?;
            }
            None => {
                self.client
                    .execute(
                        "DELETE FROM settings WHERE key = $1 AND value = $2",
                        &[&marker_key(kind), &Json(marker_value(claimed))],
                    )
                    .await
                    .context("removing send marker")?;
            }
        }
        Ok(())
    }

    async fn upsert_push_subscription(
        &mut self,
        subscription: &NewPushSubscription,
    ) -> Result<PushSubscription> {
        let row = self
            .client
            .query_one(
                "INSERT INTO push_subscriptions (user_id, endpoint, p256dh, auth, user_agent)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (endpoint) DO UPDATE SET
                    user_id = EXCLUDED.user_id,
                    p256dh = EXCLUDED.p256dh,
                    auth = EXCLUDED.auth,
                    user_agent = EXCLUDED.user_agent,
                    active = TRUE,
                    updated_at = now()
                RETURNING id, user_id, endpoint, p256dh, auth, user_agent, active,
                    created_at, updated_at",
                &[
                    &subscription.user_id,
                    &subscription.endpoint,
                    &subscription.p256dh,
                    &subscription.auth,
                    &subscription.user_agent,
                ],
            )
            .await
            .context("upserting push subscription")?;
        deserialize_subscription(&row)
    }

    async fn delete_push_subscription(&mut self, user_id: Uuid, endpoint: &str) -> Result<bool> {
        let deleted = self
            .client
            .execute(
                "DELETE FROM push_subscriptions WHERE user_id = $1 AND endpoint = $2",
                &[&user_id, &endpoint],
            )
            .await
            .context("deleting push subscription")?;
        Ok(deleted > 0)
    }

    async fn active_push_subscriptions(
        &mut self,
        user_ids: &[Uuid],
    ) -> Result<Vec<PushSubscription>> {
        let rows = self
            .client
            .query(
                "SELECT id, user_id, endpoint, p256dh, auth, user_agent, active,
                    created_at, updated_at
                FROM push_subscriptions
                WHERE active AND user_id = ANY($1)",
                &[&user_ids],
            )
            .await
            .context("selecting push subscriptions")?;
        rows.iter().map(deserialize_subscription).collect()
    }

    async fn deactivate_push_subscription(&mut self, id: Uuid) -> Result<()> {
        trace!("deactivate_push_subscription(id={})", id);
        self.client
            .execute(
                "UPDATE push_subscriptions SET active = FALSE, updated_at = now() WHERE id = $1",
                &[&id],
            )
            .await
            .context("deactivating push subscription")?;
        Ok(())
    }

    async fn line_accounts_for(&mut self, user_ids: &[Uuid]) -> Result<Vec<LineAccount>> {
        let rows = self
            .client
            .query(
                "SELECT user_id, line_user_id, display_name, linked_at
                FROM line_accounts WHERE user_id = ANY($1)",
                &[&user_ids],
            )
            .await
            .context("selecting line accounts")?;
        rows.iter().map(deserialize_line_account).collect()
    }

    async fn unlink_line_account(&mut self, user_id: Uuid) -> Result<bool> {
        let deleted = self
            .client
            .execute("DELETE FROM line_accounts WHERE user_id = $1", &[&user_id])
            .await
            .context("deleting line account")?;
        Ok(deleted > 0)
    }

    async fn record_pending_link(&mut self, link: &PendingLink) -> Result<()> {
        self.client
            .execute(
                "INSERT INTO line_pending_links (line_user_id, display_name, followed_at)
                VALUES ($1, $2, $3)
                ON CONFLICT (line_user_id) DO UPDATE SET
                    display_name = EXCLUDED.display_name,
                    followed_at = EXCLUDED.followed_at",
                &[&link.line_user_id, &link.display_name, &link.followed_at],
            )
            .await
            .context("inserting pending link")?;
        Ok(())
    }

    async fn get_pending_link(&mut self, line_user_id: &str) -> Result<Option<PendingLink>> {
        let row = self
            .client
            .query_opt(
                "SELECT line_user_id, display_name, followed_at
                FROM line_pending_links WHERE line_user_id = $1",
                &[&line_user_id],
            )
            .await
            .context("selecting pending link")?;
        row.as_ref().map(deserialize_pending_link).transpose()
    }

    async fn remove_pending_link(&mut self, line_user_id: &str) -> Result<()> {
        self.client
            .execute(
                "DELETE FROM line_pending_links WHERE line_user_id = $1",
                &[&line_user_id],
            )
            .await
            .context("deleting pending link")?;
        Ok(())
    }

    async fn insert_link_code(&mut self, code: &LinkCode) -> Result<bool> {
        let t = self
            .client
            .transaction()
            .await
            .context("begin transaction")?;
        t.execute(
            "DELETE FROM line_link_codes WHERE user_id = $1",
            &[&code.user_id],
        )
        .await
        .context("deleting previous link codes")?;
        let inserted = t
            .execute(
                "INSERT INTO line_link_codes (code, user_id, expires_at) VALUES ($1, $2, $3)
                ON CONFLICT (code) DO NOTHING",
                &[&code.code, &code.user_id, &code.expires_at],
            )
            .await
            .context("inserting link code")?;
        if inserted == 0 {
            t.rollback().await.context("transaction rollback failure")?;
            return Ok(false);
        }
        t.commit().await.context("transaction commit failure")?;
        Ok(true)
    }

    async fn consume_link_code(
        &mut self,
        code: &str,
        line_user_id: &str,
        display_name: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<LinkOutcome> {
        let t = self
            .client
            .transaction()
            .await
            .context("begin transaction")?;
        // Deleting first makes the code single-use even under concurrent
        // webhook deliveries: only one transaction gets the row back.
        let row = t
            .query_opt(
                "DELETE FROM line_link_codes WHERE code = $1 RETURNING user_id, expires_at",
                &[&code],
            )
            .await
            .context("consuming link code")?;
        let Some(row) = row else {
            t.commit().await.context("transaction commit failure")?;
            return Ok(LinkOutcome::NotFound);
        };
        let user_id: Uuid = row.try_get(0)?;
        let expires_at: DateTime<Utc> = row.try_get(1)?;
        if expires_at <= now {
            t.commit().await.context("transaction commit failure")?;
            return Ok(LinkOutcome::Expired);
        }

        t.execute(
            "DELETE FROM line_accounts WHERE line_user_id = $1 AND user_id <> $2",
            &[&line_user_id, &user_id],
        )
        .await
        .context("releasing previous binding")?;
        t.execute(
            "INSERT INTO line_accounts (user_id, line_user_id, display_name, linked_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id) DO UPDATE SET
                line_user_id = EXCLUDED.line_user_id,
                display_name = EXCLUDED.display_name,
                linked_at = EXCLUDED.linked_at",
            &[&user_id, &line_user_id, &display_name, &now],
        )
        .await
        .context("binding line account")?;
        t.execute(
            "DELETE FROM line_pending_links WHERE line_user_id = $1",
            &[&line_user_id],
        )
        .await
        .context("deleting pending link")?;
        t.commit().await.context("transaction commit failure")?;

        Ok(LinkOutcome::Linked { user_id })
    }

    async fn record_notification(&mut self, entry: &NewLogEntry) -> Result<()> {
        self.client
            .execute(
                "INSERT INTO notification_logs
                    (user_id, channel, kind, title, message, status, error, metadata)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
                &[
                    &entry.user_id,
                    &entry.channel.as_str(),
                    &entry.kind,
                    &entry.title,
                    &entry.message,
                    &entry.status.as_str(),
                    &entry.error,
                    &Json(&entry.metadata),
                ],
            )
            .await
            .context("inserting notification log")?;
        Ok(())
    }

    async fn get_notification_logs(&mut self, limit: i64) -> Result<Vec<LogEntry>> {
        let rows = self
            .client
            .query(
                "SELECT id, user_id, channel, kind, title, message, status, error, metadata,
                    created_at
                FROM notification_logs
                ORDER BY created_at DESC, id DESC
                LIMIT $1",
                &[&limit],
            )
            .await
            .context("selecting notification logs")?;
        rows.iter().map(deserialize_log_entry).collect()
    }
}

fn deserialize_user(row: &tokio_postgres::Row) -> Result<UserRecord> {
    let role: String = row.try_get(2)?;
    Ok(UserRecord {
        id: row.try_get(0)?,
        full_name: row.try_get(1)?,
        role: role.parse()?,
        active: row.try_get(3)?,
    })
}

fn deserialize_case(row: &tokio_postgres::Row) -> Result<CaseSummary> {
    let material_status: String = row.try_get(7)?;
    let surgery_time: Option<NaiveTime> = row.try_get(5)?;
    Ok(CaseSummary {
        id: row.try_get(0)?,
        case_number: row.try_get(1)?,
        patient_name: row.try_get(2)?,
        dentist_id: row.try_get(3)?,
        surgery_date: row.try_get(4)?,
        surgery_time,
        procedure: row.try_get(6)?,
        material_status: material_status.parse()?,
    })
}

fn deserialize_line_account(row: &tokio_postgres::Row) -> Result<LineAccount> {
    Ok(LineAccount {
        user_id: row.try_get(0)?,
        line_user_id: row.try_get(1)?,
        display_name: row.try_get(2)?,
        linked_at: row.try_get(3)?,
    })
}

fn deserialize_pending_link(row: &tokio_postgres::Row) -> Result<PendingLink> {
    Ok(PendingLink {
        line_user_id: row.try_get(0)?,
        display_name: row.try_get(1)?,
        followed_at: row.try_get(2)?,
    })
}

fn deserialize_subscription(row: &tokio_postgres::Row) -> Result<PushSubscription> {
    Ok(PushSubscription {
        id: row.try_get(0)?,
        user_id: row.try_get(1)?,
        endpoint: row.try_get(2)?,
        p256dh: row.try_get(3)?,
        auth: row.try_get(4)?,
        user_agent: row.try_get(5)?,
        active: row.try_get(6)?,
        created_at: row.try_get(7)?,
        updated_at: row.try_get(8)?,
    })
}

fn deserialize_log_entry(row: &tokio_postgres::Row) -> Result<LogEntry> {
    let channel: String = row.try_get(2)?;
    let status: String = row.try_get(6)?;
    let metadata: Option<Json<serde_json::Value>> = row.try_get(8)?;
    Ok(LogEntry {
        id: row.try_get(0)?,
        user_id: row.try_get(1)?,
        channel: channel.parse()?,
        kind: row.try_get(3)?,
        title: row.try_get(4)?,
        message: row.try_get(5)?,
        status: status.parse()?,
        error: row.try_get(7)?,
        metadata: metadata.map(|m| m.0).unwrap_or_default(),
        created_at: row.try_get(9)?,
    })
}
