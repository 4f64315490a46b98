//! Shared fixtures: an in-memory [`Context`] with recording fakes in place
//! of the push service and the LINE API.

use crate::Context;
use crate::config::{AudienceToggles, Config, NotificationSettings};
use crate::db::Connection;
use crate::db::directory::{CaseSummary, MaterialStatus, Role, UserRecord};
use crate::db::line_accounts::LinkCode;
use crate::db::memory::MemoryDb;
use crate::db::settings as keys;
use crate::db::subscriptions::{NewPushSubscription, PushSubscription};
use crate::line::{LineApi, LineError, Message, Profile};
use crate::notification::{DeliveryResult, DispatchError, NotificationEvent, Targeting};
use crate::push::{PushError, PushPayload, PushSender};
use chrono::{NaiveDate, NaiveTime, TimeDelta, Utc};
use reqwest::StatusCode;
use secrecy::SecretString;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

pub const TEST_LINE_TOKEN: &str = "line-token";

#[derive(Default)]
struct PushState {
    sent: Vec<String>,
    gone: HashSet<String>,
    transient: HashSet<String>,
    hanging: HashSet<String>,
}

/// Records every delivered endpoint; failures are configured per endpoint.
pub struct FakePush {
    configured: bool,
    state: Mutex<PushState>,
}

impl Default for FakePush {
    fn default() -> Self {
        FakePush {
            configured: true,
            state: Mutex::default(),
        }
    }
}

impl FakePush {
    pub fn unconfigured() -> Self {
        FakePush {
            configured: false,
            state: Mutex::default(),
        }
    }

    pub fn gone(&self, endpoint: &str) {
        self.state.lock().unwrap().gone.insert(endpoint.to_string());
    }

    pub fn fail_transiently(&self, endpoint: &str) {
        self.state.lock().unwrap().transient.insert(endpoint.to_string());
    }

    pub fn hang(&self, endpoint: &str) {
        self.state.lock().unwrap().hanging.insert(endpoint.to_string());
    }

    pub fn sent_endpoints(&self) -> Vec<String> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn clear(&self) {
        self.state.lock().unwrap().sent.clear();
    }
}

#[async_trait::async_trait]
impl PushSender for FakePush {
    fn public_key(&self) -> Option<&str> {
        self.configured.then_some("BFakePublicKey")
    }

    async fn send(
        &self,
        subscription: &PushSubscription,
        _payload: &PushPayload,
    ) -> Result<(), PushError> {
        let hang = {
            let state = self.state.lock().unwrap();
            if state.gone.contains(&subscription.endpoint) {
                return Err(PushError::Permanent("410 Gone".into()));
            }
            if state.transient.contains(&subscription.endpoint) {
                return Err(PushError::Transient("503 Service Unavailable".into()));
            }
            state.hanging.contains(&subscription.endpoint)
        };
        if hang {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        self.state
            .lock()
            .unwrap()
            .sent
            .push(subscription.endpoint.clone());
        Ok(())
    }
}

#[derive(Default)]
struct LineState {
    pushed: Vec<(String, Vec<Message>)>,
    replies: Vec<(String, Vec<Message>)>,
    failures: HashMap<String, u16>,
}

#[derive(Default)]
pub struct FakeLine {
    state: Mutex<LineState>,
}

impl FakeLine {
    pub fn fail_for(&self, line_user_id: &str, status: u16) {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert(line_user_id.to_string(), status);
    }

    pub fn pushed(&self) -> Vec<(String, Vec<Message>)> {
        self.state.lock().unwrap().pushed.clone()
    }

    pub fn replies(&self) -> Vec<(String, Vec<Message>)> {
        self.state.lock().unwrap().replies.clone()
    }
}

#[async_trait::async_trait]
impl LineApi for FakeLine {
    async fn push_message(
        &self,
        _token: &SecretString,
        to: &str,
        messages: &[Message],
    ) -> Result<(), LineError> {
        let mut state = self.state.lock().unwrap();
        if let Some(status) = state.failures.get(to) {
            return Err(LineError {
                status: StatusCode::from_u16(*status).ok(),
                message: "rejected".into(),
            });
        }
        state.pushed.push((to.to_string(), messages.to_vec()));
        Ok(())
    }

    async fn reply_message(
        &self,
        _token: &SecretString,
        reply_token: &str,
        messages: &[Message],
    ) -> Result<(), LineError> {
        self.state
            .lock()
            .unwrap()
            .replies
            .push((reply_token.to_string(), messages.to_vec()));
        Ok(())
    }

    async fn get_profile(
        &self,
        _token: &SecretString,
        user_id: &str,
    ) -> Result<Profile, LineError> {
        Ok(Profile {
            user_id: user_id.to_string(),
            display_name: format!("Display {user_id}"),
            picture_url: None,
        })
    }
}

pub fn test_config() -> Config {
    Config {
        app_url: "https://clinic.example".to_string(),
        cron_secret: Some(SecretString::from("cron-secret".to_string())),
        jwt_secret: Some(SecretString::from("jwt-secret".to_string())),
        line_channel_secret: Some(SecretString::from("channel-secret".to_string())),
        delivery_timeout: Duration::from_millis(200),
        ..Config::default()
    }
}

/// Settings with both channels on, for calling the orchestrator directly.
pub fn test_settings() -> NotificationSettings {
    NotificationSettings {
        enabled: true,
        morning_time: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
        evening_time: NaiveTime::from_hms_opt(18, 0, 0).unwrap(),
        push_enabled: true,
        line_enabled: true,
        line_channel_access_token: Some(SecretString::from(TEST_LINE_TOKEN.to_string())),
        audiences: AudienceToggles {
            stock_staff: true,
            customer_service: true,
            dentists: true,
        },
    }
}

pub struct TestContext {
    pub ctx: Arc<Context>,
    pub db: MemoryDb,
    pub push: Arc<FakePush>,
    pub line: Arc<FakeLine>,
    pub settings: NotificationSettings,
}

impl TestContext {
    pub fn new() -> TestContext {
        TestContext::with(FakePush::default(), FakeLine::default())
    }

    pub fn with(push: FakePush, line: FakeLine) -> TestContext {
        let db = MemoryDb::default();
        let push = Arc::new(push);
        let line = Arc::new(line);
        let ctx = Arc::new(Context {
            db: crate::db::Pool::Memory(db.clone()),
            config: test_config(),
            push: push.clone(),
            line: line.clone(),
        });
        TestContext {
            ctx,
            db,
            push,
            line,
            settings: test_settings(),
        }
    }

    /// Stores the settings the scheduled trigger reads.
    pub fn enable_daily(&self) {
        self.db.set_setting(keys::ENABLED, serde_json::json!(true));
        self.db.set_setting(keys::PUSH_ENABLED, serde_json::json!(true));
        self.db.set_setting(keys::LINE_ENABLED, serde_json::json!(true));
        self.db
            .set_setting(keys::LINE_CHANNEL_ACCESS_TOKEN, serde_json::json!(TEST_LINE_TOKEN));
    }

    pub async fn dispatch(
        &self,
        event: &NotificationEvent,
        targeting: &Targeting,
    ) -> Result<DeliveryResult, DispatchError> {
        let mut conn = self.db.connection();
        crate::notification::dispatch(&self.ctx, &mut conn, &self.settings, event, targeting).await
    }
}

pub fn user(id: Uuid, role: Role) -> UserRecord {
    UserRecord {
        id,
        full_name: format!("{role} {}", &id.to_string()[..8]),
        role,
        active: true,
    }
}

pub fn directory(users: Vec<UserRecord>) -> MemoryDb {
    let db = MemoryDb::default();
    for u in users {
        db.add_user(u);
    }
    db
}

/// A pending case on `date` without a fixed time.
pub fn case(dentist_id: Option<Uuid>, date: NaiveDate) -> CaseSummary {
    let id = Uuid::new_v4();
    CaseSummary {
        id,
        case_number: format!("C-{}", &id.to_string()[..6]),
        patient_name: "Somchai Jaidee".to_string(),
        dentist_id,
        surgery_date: date,
        surgery_time: None,
        procedure: "Implant placement".to_string(),
        material_status: MaterialStatus::Pending,
    }
}

pub fn custom_event() -> NotificationEvent {
    NotificationEvent::new(
        "custom",
        "Heads up".into(),
        "Something happened".into(),
        "/".into(),
        "custom".into(),
    )
}

pub async fn subscribe(db: &MemoryDb, user_id: Uuid, endpoint: &str) -> PushSubscription {
    db.connection()
        .upsert_push_subscription(&NewPushSubscription {
            user_id,
            endpoint: endpoint.to_string(),
            p256dh: "p256dh".to_string(),
            auth: "auth".to_string(),
            user_agent: None,
        })
        .await
        .unwrap()
}

/// Links `line_user_id` to `user_id` through the regular code flow.
pub async fn link_line(db: &MemoryDb, user_id: Uuid, line_user_id: &str) {
    let mut conn = db.connection();
    let code = format!("LINK-{}", &Uuid::new_v4().simple().to_string()[..6].to_uppercase());
    conn.insert_link_code(&LinkCode {
        code: code.clone(),
        user_id,
        expires_at: Utc::now() + TimeDelta::minutes(10),
    })
    .await
    .unwrap();
    conn.consume_link_code(&code, line_user_id, None, Utc::now())
        .await
        .unwrap();
}
