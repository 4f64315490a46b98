//! End-to-end tests of the HTTP surface with the production LINE client.
//!
//! The service is wired exactly as `main` wires it, except that the LINE
//! client talks to [`LineStub`] and the database is the in-memory backend.
//! Push stays unconfigured so LINE is the only channel in play.

use crate::common::{LineStub, REJECTED_USER};
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use base64::prelude::*;
use chrono::{TimeDelta, Utc};
use clinic_notifier::config::Config;
use clinic_notifier::db::Pool;
use clinic_notifier::db::directory::{Role, UserRecord};
use clinic_notifier::db::line_accounts::LinkCode;
use clinic_notifier::db::memory::MemoryDb;
use clinic_notifier::db::notification_log::{DeliveryStatus, LogChannel};
use clinic_notifier::db::settings as keys;
use clinic_notifier::line::LineClient;
use clinic_notifier::push::WebPushSender;
use clinic_notifier::Context;
use clinic_notifier::db::Connection as _;
use hmac::{Hmac, Mac};
use jsonwebtoken::{EncodingKey, Header};
use secrecy::SecretString;
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use uuid::Uuid;

const LINE_TOKEN: &str = "stub-access-token";

struct TestServer {
    stub: LineStub,
    db: MemoryDb,
    ctx: Arc<Context>,
}

impl TestServer {
    async fn start() -> TestServer {
        let stub = LineStub::start().await;
        let config = Config {
            app_url: "https://clinic.example".to_string(),
            cron_secret: Some(SecretString::from("cron-secret".to_string())),
            jwt_secret: Some(SecretString::from("jwt-secret".to_string())),
            line_api_url: stub.url(),
            line_channel_secret: Some(SecretString::from("channel-secret".to_string())),
            delivery_timeout: Duration::from_secs(5),
            ..Config::default()
        };

        let db = MemoryDb::default();
        db.set_setting(keys::PUSH_ENABLED, serde_json::json!(false));
        db.set_setting(keys::LINE_ENABLED, serde_json::json!(true));
        db.set_setting(keys::LINE_CHANNEL_ACCESS_TOKEN, serde_json::json!(LINE_TOKEN));

        let line = LineClient::new(config.line_api_url.clone(), config.delivery_timeout).unwrap();
        let ctx = Arc::new(Context {
            db: Pool::Memory(db.clone()),
            push: Arc::new(WebPushSender::new(&config)),
            line: Arc::new(line),
            config,
        });
        TestServer { stub, db, ctx }
    }

    fn add_user(&self, role: Role) -> Uuid {
        let id = Uuid::new_v4();
        self.db.add_user(UserRecord {
            id,
            full_name: format!("{role} user"),
            role,
            active: true,
        });
        id
    }

    async fn link(&self, user_id: Uuid, line_user_id: &str) {
        let mut conn = self.db.connection();
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

    async fn call(&self, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let resp = clinic_notifier::app(self.ctx.clone())
            .oneshot(req)
            .await
            .unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        (
            status,
            serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null),
        )
    }
}

fn token_for(user_id: Uuid) -> String {
    let exp = (Utc::now() + TimeDelta::hours(1)).timestamp();
    jsonwebtoken::encode(
        &Header::default(),
        &serde_json::json!({ "sub": user_id, "exp": exp }),
        &EncodingKey::from_secret(b"jwt-secret"),
    )
    .unwrap()
}

fn trigger(user_id: Uuid, body: serde_json::Value) -> Request<Body> {
    Request::post("/notifications/trigger")
        .header(header::AUTHORIZATION, format!("Bearer {}", token_for(user_id)))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn signed_webhook(body: &str) -> Request<Body> {
    let mut mac = Hmac::<Sha256>::new_from_slice(b"channel-secret").unwrap();
    mac.update(body.as_bytes());
    let signature = BASE64_STANDARD.encode(mac.finalize().into_bytes());
    Request::post("/line/webhook")
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-line-signature", signature)
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn trigger_pushes_through_the_line_api() {
    let server = TestServer::start().await;
    let admin = server.add_user(Role::Admin);
    let dentist = server.add_user(Role::Dentist);
    server.link(dentist, "U-dentist").await;

    let (status, body) = server
        .call(trigger(
            admin,
            serde_json::json!({
                "type": "custom",
                "data": {
                    "user_ids": [dentist],
                    "title": "Schedule change",
                    "body": "Your 10:00 case moved to 11:00",
                    "url": "/cases",
                },
            }),
        ))
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["result"]["line"]["sent"], 1);
    assert_eq!(body["result"]["push"]["sent"], 0);

    let pushes = server.stub.requests_to("/v2/bot/message/push");
    assert_eq!(pushes.len(), 1);
    let push = &pushes[0];
    assert_eq!(
        push.authorization.as_deref(),
        Some(format!("Bearer {LINE_TOKEN}").as_str())
    );
    let json = push.json();
    assert_eq!(json["to"], "U-dentist");
    let text = json["messages"][0]["text"].as_str().unwrap();
    assert!(text.contains("Schedule change"));
    assert!(text.contains("https://clinic.example/cases"));

    let logs = server.db.notification_logs();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].channel, LogChannel::Line);
    assert_eq!(logs[0].status, DeliveryStatus::Sent);
    assert_eq!(logs[0].user_id, Some(dentist));
}

#[tokio::test]
async fn rejected_pushes_are_logged_with_the_api_status() {
    let server = TestServer::start().await;
    let admin = server.add_user(Role::Admin);
    let ok = server.add_user(Role::StockStaff);
    let rejected = server.add_user(Role::StockStaff);
    server.link(ok, "U-stock").await;
    server.link(rejected, REJECTED_USER).await;

    let (status, body) = server
        .call(trigger(
            admin,
            serde_json::json!({ "type": "out_of_stock", "data": { "product_name": "Bone graft" } }),
        ))
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["result"]["line"]["sent"], 1);
    assert_eq!(body["result"]["line"]["failed"], 1);
    assert_eq!(server.stub.requests_to("/v2/bot/message/push").len(), 2);

    let logs = server.db.notification_logs();
    let failed = logs
        .iter()
        .find(|l| l.user_id == Some(rejected))
        .unwrap();
    assert_eq!(failed.status, DeliveryStatus::Failed);
    assert_eq!(failed.metadata["http_status"], 400);
    assert!(
        failed
            .error
            .as_deref()
            .unwrap()
            .contains("The user hasn't added the account")
    );
    // A rejected identity stays linked; only push subscriptions self-heal.
    assert_eq!(server.db.line_accounts().len(), 2);
}

#[tokio::test]
async fn follow_fetches_the_profile_and_greets() {
    let server = TestServer::start().await;
    let body = r#"{"destination":"Ubot","events":[{"type":"follow","timestamp":1700000000000,"replyToken":"reply-1","source":{"type":"user","userId":"U-new"}}]}"#;

    let (status, json) = server.call(signed_webhook(body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["success"], true);

    let profiles = server.stub.requests_to("/v2/bot/profile/U-new");
    assert_eq!(profiles.len(), 1);
    let replies = server.stub.requests_to("/v2/bot/message/reply");
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].json()["replyToken"], "reply-1");

    let pending = server.db.pending_links();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].line_user_id, "U-new");
    assert_eq!(pending[0].display_name.as_deref(), Some("Stub User"));
}

#[tokio::test]
async fn link_code_sent_in_chat_links_the_account() {
    let server = TestServer::start().await;
    let nurse = server.add_user(Role::CustomerService);

    let req = Request::post("/line/link-code")
        .header(header::AUTHORIZATION, format!("Bearer {}", token_for(nurse)))
        .body(Body::empty())
        .unwrap();
    let (status, json) = server.call(req).await;
    assert_eq!(status, StatusCode::OK, "{json}");
    let code = json["code"].as_str().unwrap().to_lowercase();

    let body = format!(
        r#"{{"events":[{{"type":"message","replyToken":"reply-2","source":{{"type":"user","userId":"U-nurse"}},"message":{{"id":"1","type":"text","text":"{code}"}}}}]}}"#
    );
    let (status, _) = server.call(signed_webhook(&body)).await;
    assert_eq!(status, StatusCode::OK);

    let accounts = server.db.line_accounts();
    assert_eq!(accounts.len(), 1);
    assert_eq!(accounts[0].user_id, nurse);
    assert_eq!(accounts[0].line_user_id, "U-nurse");
    let replies = server.stub.requests_to("/v2/bot/message/reply");
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].json()["replyToken"], "reply-2");
}

#[tokio::test]
async fn push_endpoints_report_missing_vapid_keys() {
    let server = TestServer::start().await;
    let (status, json) = server
        .call(Request::get("/push/vapid-key").body(Body::empty()).unwrap())
        .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(json["error"].is_string());
}
