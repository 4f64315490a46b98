use crate::Context;
use crate::config::NotificationSettings;
use crate::db::Connection;
use crate::db::line_accounts::LineAccount;
use crate::db::notification_log::{DeliveryStatus, LogChannel, NewLogEntry};
use crate::db::subscriptions::PushSubscription;
use crate::line::LineError;
use crate::notification::{
    ChannelCounts, DeliveryResult, DispatchError, NotificationEvent, Targeting, resolve_recipients,
};
use crate::push::{PushError, PushPayload};
use futures::future::join_all;
use secrecy::SecretString;
use std::collections::BTreeSet;
use uuid::Uuid;

/// The channels a dispatch may use, after checking their credentials.
#[derive(Debug, Clone, Copy)]
pub struct Channels<'a> {
    pub push: bool,
    pub line_token: Option<&'a SecretString>,
}

/// Fails if an enabled channel is missing its credential, or if no channel
/// is enabled at all.
pub fn check_channels<'a>(
    ctx: &Context,
    settings: &'a NotificationSettings,
) -> Result<Channels<'a>, DispatchError> {
    if !settings.push_enabled && !settings.line_enabled {
        return Err(DispatchError::NoChannels);
    }
    if settings.push_enabled && !ctx.push.is_configured() {
        return Err(DispatchError::MissingCredential("VAPID key pair"));
    }
    let line_token = if settings.line_enabled {
        match settings.line_channel_access_token.as_ref() {
            Some(token) => Some(token),
            None => return Err(DispatchError::MissingCredential("LINE channel access token")),
        }
    } else {
        None
    };
    Ok(Channels {
        push: settings.push_enabled,
        line_token,
    })
}

/// Sends `event` to everyone `targeting` resolves to.
pub async fn dispatch(
    ctx: &Context,
    conn: &mut dyn Connection,
    settings: &NotificationSettings,
    event: &NotificationEvent,
    targeting: &Targeting,
) -> Result<DeliveryResult, DispatchError> {
    event.validate()?;
    if targeting.is_empty() {
        return Err(DispatchError::Invalid(
            "at least one of `user_id`, `user_ids` or `roles` is required".into(),
        ));
    }
    let channels = check_channels(ctx, settings)?;
    let recipients = resolve_recipients(conn, targeting)
        .await
        .map_err(DispatchError::Storage)?;
    if recipients.is_empty() {
        return Err(DispatchError::NoRecipients);
    }
    deliver(ctx, conn, channels, event, &recipients).await
}

/// The push subscriptions and LINE identities one event goes to.
pub struct Deliveries {
    recipients: usize,
    subscriptions: Vec<PushSubscription>,
    accounts: Vec<LineAccount>,
}

impl Deliveries {
    pub fn recipients(&self) -> usize {
        self.recipients
    }
}

pub enum Attempt<'a> {
    Push(&'a PushSubscription, Result<(), PushError>),
    Line(&'a LineAccount, Result<(), LineError>),
}

/// Delivers to already resolved recipients.
///
/// Every delivery runs concurrently under its own timeout. A failed
/// delivery is counted and logged but never aborts the others.
pub async fn deliver(
    ctx: &Context,
    conn: &mut dyn Connection,
    channels: Channels<'_>,
    event: &NotificationEvent,
    recipients: &BTreeSet<Uuid>,
) -> Result<DeliveryResult, DispatchError> {
    let deliveries = load_deliveries(conn, channels, recipients).await?;
    let attempts = send_all(ctx, channels, event, &deliveries).await;
    Ok(record(conn, event, deliveries.recipients, attempts).await)
}

/// Looks up where `recipients` can be reached on the enabled channels.
pub async fn load_deliveries(
    conn: &mut dyn Connection,
    channels: Channels<'_>,
    recipients: &BTreeSet<Uuid>,
) -> Result<Deliveries, DispatchError> {
    let ids: Vec<Uuid> = recipients.iter().copied().collect();
    let subscriptions = if channels.push {
        conn.active_push_subscriptions(&ids)
            .await
            .map_err(DispatchError::Storage)?
    } else {
        Vec::new()
    };
    let accounts = if channels.line_token.is_some() {
        conn.line_accounts_for(&ids)
            .await
            .map_err(DispatchError::Storage)?
    } else {
        Vec::new()
    };
    Ok(Deliveries {
        recipients: recipients.len(),
        subscriptions,
        accounts,
    })
}

/// Starts every delivery of `event` at once and waits for all of them.
pub async fn send_all<'a>(
    ctx: &Context,
    channels: Channels<'_>,
    event: &NotificationEvent,
    deliveries: &'a Deliveries,
) -> Vec<Attempt<'a>> {
    let timeout = ctx.config.delivery_timeout;
    let payload = PushPayload::new(
        &event.title,
        &event.body,
        &event.url,
        &event.tag,
        event.data.clone(),
    );
    let messages = [event.line_message(&ctx.config.app_url)];

    let push_attempts = deliveries.subscriptions.iter().map(|sub| {
        let payload = &payload;
        async move {
            let res = tokio::time::timeout(timeout, ctx.push.send(sub, payload))
                .await
                .unwrap_or_else(|_| {
                    Err(PushError::Transient(format!(
                        "timed out after {}s",
                        timeout.as_secs_f32()
                    )))
                });
            Attempt::Push(sub, res)
        }
    });
    let line_attempts = deliveries.accounts.iter().filter_map(|account| {
        let token = channels.line_token?;
        let messages = &messages;
        Some(async move {
            let res = tokio::time::timeout(
                timeout,
                ctx.line.push_message(token, &account.line_user_id, messages),
            )
            .await
            .unwrap_or_else(|_| {
                Err(LineError {
                    status: None,
                    message: format!("timed out after {}s", timeout.as_secs_f32()),
                })
            });
            Attempt::Line(account, res)
        })
    });
    let (push_done, line_done) = futures::join!(join_all(push_attempts), join_all(line_attempts));
    push_done.into_iter().chain(line_done).collect()
}

/// Counts the attempts, deactivates gone subscriptions and writes one log
/// entry per attempt.
pub async fn record(
    conn: &mut dyn Connection,
    event: &NotificationEvent,
    recipients: usize,
    attempts: Vec<Attempt<'_>>,
) -> DeliveryResult {
    let mut result = DeliveryResult {
        recipients,
        push: ChannelCounts::default(),
        line: ChannelCounts::default(),
    };
    let mut entries = Vec::with_capacity(attempts.len());
    for attempt in attempts {
        match attempt {
            Attempt::Push(sub, res) => {
                let metadata = serde_json::json!({
                    "subscription_id": sub.id,
                    "endpoint_host": sub.endpoint_host(),
                    "tag": event.tag,
                    "data": event.data,
                });
                let entry = log_entry(event, sub.user_id, LogChannel::Push).metadata(metadata);
                match res {
                    Ok(()) => {
                        result.push.sent += 1;
                        entries.push(entry);
                    }
                    Err(err) => {
                        result.push.failed += 1;
                        if err.is_permanent() {
                            tracing::info!(
                                subscription = %sub.id,
                                "deactivating push subscription: {err}"
                            );
                            if let Err(e) = conn.deactivate_push_subscription(sub.id).await {
                                tracing::error!("failed to deactivate subscription {}: {e:?}", sub.id);
                            }
                        } else {
                            tracing::warn!(subscription = %sub.id, "push delivery failed: {err}");
                        }
                        entries.push(failed(entry, &err.to_string()));
                    }
                }
            }
            Attempt::Line(account, res) => {
                let mut metadata = serde_json::json!({
                    "line_user_id": account.line_user_id,
                    "tag": event.tag,
                    "data": event.data,
                });
                let entry = log_entry(event, account.user_id, LogChannel::Line);
                match res {
                    Ok(()) => {
                        result.line.sent += 1;
                        entries.push(entry.metadata(metadata));
                    }
                    Err(err) => {
                        result.line.failed += 1;
                        tracing::warn!(user = %account.user_id, "LINE delivery failed: {err}");
                        if let Some(status) = err.status {
                            metadata["http_status"] = status.as_u16().into();
                        }
                        entries.push(failed(entry.metadata(metadata), &err.to_string()));
                    }
                }
            }
        }
    }

    for entry in &entries {
        if let Err(e) = conn.record_notification(entry).await {
            tracing::error!("failed to record {} notification log: {e:?}", entry.channel.as_str());
        }
    }

    tracing::info!(
        kind = %event.kind,
        recipients = result.recipients,
        push_sent = result.push.sent,
        push_failed = result.push.failed,
        line_sent = result.line.sent,
        line_failed = result.line.failed,
        "dispatched notification"
    );
    result
}

fn log_entry(event: &NotificationEvent, user_id: Uuid, channel: LogChannel) -> NewLogEntry {
    NewLogEntry::new(
        Some(user_id),
        channel,
        &event.kind,
        &event.title,
        &event.body,
        DeliveryStatus::Sent,
    )
}

fn failed(mut entry: NewLogEntry, error: &str) -> NewLogEntry {
    entry.status = DeliveryStatus::Failed;
    entry.error(error)
}
