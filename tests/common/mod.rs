//! A local HTTP server standing in for the LINE Messaging API.
//!
//! Every request is recorded so tests can assert on what the service sent.

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

/// A request received by the stub.
#[derive(Clone, Debug)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub authorization: Option<String>,
    pub body: Vec<u8>,
}

impl Request {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap()
    }
}

#[derive(Default)]
struct Recorded {
    requests: Vec<Request>,
}

/// LINE user ids the stub rejects pushes for.
pub const REJECTED_USER: &str = "U-rejected";

pub struct LineStub {
    pub addr: SocketAddr,
    recorded: Arc<Mutex<Recorded>>,
}

impl LineStub {
    pub async fn start() -> LineStub {
        let recorded = Arc::new(Mutex::new(Recorded::default()));
        let app = Router::new().fallback(handle).with_state(recorded.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        LineStub { addr, recorded }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn requests(&self) -> Vec<Request> {
        self.recorded.lock().unwrap().requests.clone()
    }

    pub fn requests_to(&self, path: &str) -> Vec<Request> {
        self.requests()
            .into_iter()
            .filter(|r| r.path == path)
            .collect()
    }
}

async fn handle(
    State(recorded): State<Arc<Mutex<Recorded>>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = Request {
        method,
        path: uri.path().to_string(),
        authorization: headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        body: body.to_vec(),
    };
    recorded.lock().unwrap().requests.push(request.clone());

    if let Some(user_id) = request.path.strip_prefix("/v2/bot/profile/") {
        return axum::Json(serde_json::json!({
            "userId": user_id,
            "displayName": "Stub User",
        }))
        .into_response();
    }
    if request.path == "/v2/bot/message/push" && request.json()["to"] == REJECTED_USER {
        return (
            StatusCode::BAD_REQUEST,
            axum::Json(serde_json::json!({ "message": "The user hasn't added the account" })),
        )
            .into_response();
    }
    axum::Json(serde_json::json!({})).into_response()
}
