//! Browser push delivery (Web Push with VAPID).

use crate::config::Config;
use crate::db::subscriptions::PushSubscription;
use crate::utils::truncate_chars;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use std::fmt;
use web_push::{
    ContentEncoding, HyperWebPushClient, SubscriptionInfo, VapidSignatureBuilder, WebPushClient,
    WebPushError, WebPushMessageBuilder,
};

pub mod api;

/// Longest notification body handed to the push service.
pub const MAX_PUSH_BODY_CHARS: usize = 1000;

/// The JSON document the service worker receives.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PushPayload {
    pub title: String,
    pub body: String,
    pub url: String,
    pub tag: String,
    pub data: serde_json::Value,
}

impl PushPayload {
    pub fn new(
        title: &str,
        body: &str,
        url: &str,
        tag: &str,
        data: serde_json::Value,
    ) -> PushPayload {
        PushPayload {
            title: title.to_string(),
            body: truncate_chars(body, MAX_PUSH_BODY_CHARS).into_owned(),
            url: url.to_string(),
            tag: tag.to_string(),
            data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushError {
    /// The push service no longer knows the endpoint; the subscription
    /// should not be used again.
    Permanent(String),
    /// Anything else: network trouble, rate limiting, server errors.
    Transient(String),
}

impl PushError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, PushError::Permanent(_))
    }
}

impl fmt::Display for PushError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PushError::Permanent(msg) => write!(f, "subscription gone: {msg}"),
            PushError::Transient(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for PushError {}

#[async_trait::async_trait]
pub trait PushSender: Send + Sync {
    /// The VAPID public key browsers need to subscribe, if configured.
    fn public_key(&self) -> Option<&str>;

    fn is_configured(&self) -> bool {
        self.public_key().is_some()
    }

    async fn send(
        &self,
        subscription: &PushSubscription,
        payload: &PushPayload,
    ) -> Result<(), PushError>;
}

struct VapidKeys {
    public_key: String,
    private_pem: SecretString,
    subject: String,
}

pub struct WebPushSender {
    keys: Option<VapidKeys>,
    ttl: u32,
    client: HyperWebPushClient,
}

impl WebPushSender {
    pub fn new(config: &Config) -> WebPushSender {
        let keys = config.vapid.as_ref().map(|vapid| VapidKeys {
            public_key: vapid.public_key.clone(),
            private_pem: SecretString::from(vapid.private_key.expose_secret().to_string()),
            subject: vapid.subject.clone(),
        });
        WebPushSender {
            keys,
            ttl: config.push_ttl_secs,
            client: HyperWebPushClient::new(),
        }
    }
}

fn classify(err: WebPushError) -> PushError {
    match err {
        WebPushError::EndpointNotValid { .. } | WebPushError::EndpointNotFound { .. } => {
            PushError::Permanent(err.to_string())
        }
        other => PushError::Transient(other.to_string()),
    }
}

#[async_trait::async_trait]
impl PushSender for WebPushSender {
    fn public_key(&self) -> Option<&str> {
        self.keys.as_ref().map(|k| k.public_key.as_str())
    }

    async fn send(
        &self,
        subscription: &PushSubscription,
        payload: &PushPayload,
    ) -> Result<(), PushError> {
        let Some(keys) = &self.keys else {
            return Err(PushError::Transient("VAPID keys are not configured".into()));
        };
        let info = SubscriptionInfo::new(
            &subscription.endpoint,
            &subscription.p256dh,
            &subscription.auth,
        );
        let body = serde_json::to_vec(payload)
            .map_err(|e| PushError::Transient(format!("failed to encode payload: {e}")))?;

        let mut signature =
            VapidSignatureBuilder::from_pem(keys.private_pem.expose_secret().as_bytes(), &info)
                .map_err(|e| PushError::Transient(format!("invalid VAPID key: {e}")))?;
        signature.add_claim("sub", keys.subject.as_str());
        let signature = signature
            .build()
            .map_err(|e| PushError::Transient(format!("failed to sign request: {e}")))?;

        let mut builder = WebPushMessageBuilder::new(&info);
        builder.set_payload(ContentEncoding::Aes128Gcm, &body);
        builder.set_ttl(self.ttl);
        builder.set_vapid_signature(signature);
        let message = builder.build().map_err(classify)?;

        tracing::debug!(endpoint = subscription.endpoint_host(), "sending push");
        self.client.send(message).await.map_err(classify)
    }
}
