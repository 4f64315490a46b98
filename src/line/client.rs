use crate::line::{LineApi, LineError, Message, Profile};
use reqwest::{Client, Method, RequestBuilder, Response};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use std::time::Duration;

#[derive(Clone)]
pub struct LineClient {
    client: Client,
    api_url: String,
}

impl LineClient {
    pub fn new(api_url: String, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(LineClient {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
        })
    }

    fn make_request(&self, method: Method, token: &SecretString, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}/v2/bot/{path}", self.api_url))
            .bearer_auth(token.expose_secret())
    }

    async fn execute(&self, req: RequestBuilder) -> Result<Response, LineError> {
        let resp = req.send().await.map_err(|e| LineError {
            status: e.status(),
            message: e.to_string(),
        })?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(LineError {
            status: Some(status),
            message: api_error_message(&body),
        })
    }

    async fn deserialize<T: DeserializeOwned>(resp: Response) -> Result<T, LineError> {
        let status = resp.status();
        resp.json::<T>().await.map_err(|e| LineError {
            status: Some(status),
            message: format!(
                "failed to deserialize value of type {}: {e}",
                std::any::type_name::<T>()
            ),
        })
    }
}

/// Pulls `message` out of the platform's JSON error body, falling back to
/// the raw text.
fn api_error_message(body: &str) -> String {
    #[derive(serde::Deserialize)]
    struct ApiError {
        message: String,
    }
    match serde_json::from_str::<ApiError>(body) {
        Ok(err) => err.message,
        Err(_) if body.is_empty() => "empty response".to_string(),
        Err(_) => body.to_string(),
    }
}

#[async_trait::async_trait]
impl LineApi for LineClient {
    async fn push_message(
        &self,
        token: &SecretString,
        to: &str,
        messages: &[Message],
    ) -> Result<(), LineError> {
        let req = self
            .make_request(Method::POST, token, "message/push")
            .json(&serde_json::json!({ "to": to, "messages": messages }));
        self.execute(req).await.map(drop)
    }

    async fn reply_message(
        &self,
        token: &SecretString,
        reply_token: &str,
        messages: &[Message],
    ) -> Result<(), LineError> {
        let req = self
            .make_request(Method::POST, token, "message/reply")
            .json(&serde_json::json!({ "replyToken": reply_token, "messages": messages }));
        self.execute(req).await.map(drop)
    }

    async fn get_profile(&self, token: &SecretString, user_id: &str) -> Result<Profile, LineError> {
        let req = self.make_request(Method::GET, token, &format!("profile/{user_id}"));
        let resp = self.execute(req).await?;
        Self::deserialize(resp).await
    }
}
