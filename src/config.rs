//! Service configuration.
//!
//! Two layers: [`Config`] is read once from the environment at startup and
//! holds secrets and deployment parameters; [`NotificationSettings`] is a
//! typed snapshot of the administrator-editable `settings` table, loaded at
//! the start of each request that needs it.

use crate::db::Connection;
use anyhow::Context as _;
use chrono::NaiveTime;
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

const DEFAULT_TIMEZONE: chrono_tz::Tz = chrono_tz::Asia::Bangkok;

pub struct VapidConfig {
    /// Base64url-encoded uncompressed P-256 public key, handed to browsers.
    pub public_key: String,
    /// PEM-encoded private key.
    pub private_key: SecretString,
    /// Contact URI placed in the VAPID `sub` claim.
    pub subject: String,
}

pub struct Config {
    pub database_url: String,
    pub bind_addr: SocketAddr,
    pub timezone: chrono_tz::Tz,
    pub app_url: String,
    pub cron_secret: Option<SecretString>,
    pub jwt_secret: Option<SecretString>,
    pub line_api_url: String,
    pub line_channel_secret: Option<SecretString>,
    /// Used when the settings table does not carry a token.
    pub line_channel_access_token: Option<SecretString>,
    pub vapid: Option<VapidConfig>,
    pub push_ttl_secs: u32,
    pub delivery_timeout: Duration,
    /// When set, the server evaluates the digest schedule itself at this
    /// cadence in addition to any external cron calls.
    pub scheduler_interval: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            database_url: "memory:".to_string(),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            timezone: DEFAULT_TIMEZONE,
            app_url: "http://localhost:3000".to_string(),
            cron_secret: None,
            jwt_secret: None,
            line_api_url: "https://api.line.me".to_string(),
            line_channel_secret: None,
            line_channel_access_token: None,
            vapid: None,
            push_ttl_secs: 24 * 60 * 60,
            delivery_timeout: Duration::from_secs(10),
            scheduler_interval: None,
        }
    }
}

fn var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn secret(name: &str) -> Option<SecretString> {
    var(name).map(SecretString::from)
}

fn parsed<T>(name: &str) -> anyhow::Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    var(name)
        .map(|v| {
            v.parse::<T>()
                .map_err(|e| anyhow::anyhow!("invalid {name} `{v}`: {e}"))
        })
        .transpose()
}

impl Config {
    pub fn from_env() -> anyhow::Result<Config> {
        let defaults = Config::default();

        let vapid = match (var("VAPID_PUBLIC_KEY"), secret("VAPID_PRIVATE_KEY")) {
            (Some(public_key), Some(private_key)) => Some(VapidConfig {
                public_key,
                private_key,
                subject: var("VAPID_SUBJECT").unwrap_or_else(|| "mailto:admin@localhost".into()),
            }),
            (None, None) => None,
            _ => anyhow::bail!("VAPID_PUBLIC_KEY and VAPID_PRIVATE_KEY must be set together"),
        };

        Ok(Config {
            database_url: var("DATABASE_URL").context("needs DATABASE_URL")?,
            bind_addr: parsed("BIND_ADDR")?.unwrap_or(defaults.bind_addr),
            timezone: parsed("CLINIC_TIMEZONE")?.unwrap_or(defaults.timezone),
            app_url: var("APP_URL").unwrap_or(defaults.app_url),
            cron_secret: secret("CRON_SECRET"),
            jwt_secret: secret("AUTH_JWT_SECRET"),
            line_api_url: var("LINE_API_URL").unwrap_or(defaults.line_api_url),
            line_channel_secret: secret("LINE_CHANNEL_SECRET"),
            line_channel_access_token: secret("LINE_CHANNEL_ACCESS_TOKEN"),
            vapid,
            push_ttl_secs: parsed("PUSH_TTL_SECS")?.unwrap_or(defaults.push_ttl_secs),
            delivery_timeout: parsed("DELIVERY_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.delivery_timeout),
            scheduler_interval: parsed("SCHEDULER_INTERVAL_SECS")?
                .filter(|secs: &u64| *secs > 0)
                .map(Duration::from_secs),
        })
    }
}

/// A malformed value in the `settings` table.
#[derive(Debug)]
pub struct SettingsError {
    pub key: String,
    pub message: String,
}

impl fmt::Display for SettingsError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "malformed setting `{}`: {}", self.key, self.message)
    }
}

impl std::error::Error for SettingsError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudienceToggles {
    pub stock_staff: bool,
    pub customer_service: bool,
    pub dentists: bool,
}

/// Typed snapshot of the notification settings.
#[derive(Debug)]
pub struct NotificationSettings {
    /// Master switch for the scheduled digests.
    pub enabled: bool,
    pub morning_time: NaiveTime,
    pub evening_time: NaiveTime,
    pub push_enabled: bool,
    pub line_enabled: bool,
    pub line_channel_access_token: Option<SecretString>,
    pub audiences: AudienceToggles,
}

/// Raw parse of the settings rows; `None` means the key is absent.
#[derive(Debug, Default)]
struct StoredSettings {
    enabled: Option<bool>,
    morning_time: Option<NaiveTime>,
    evening_time: Option<NaiveTime>,
    push_enabled: Option<bool>,
    line_enabled: Option<bool>,
    line_channel_access_token: Option<String>,
    stock_staff: Option<bool>,
    customer_service: Option<bool>,
    dentists: Option<bool>,
}

fn parse_bool(key: &str, value: &serde_json::Value) -> Result<bool, SettingsError> {
    match value {
        serde_json::Value::Bool(b) => Ok(*b),
        serde_json::Value::String(s) if s == "true" => Ok(true),
        serde_json::Value::String(s) if s == "false" => Ok(false),
        other => Err(SettingsError {
            key: key.to_string(),
            message: format!("expected a boolean, got {other}"),
        }),
    }
}

fn parse_time(key: &str, value: &serde_json::Value) -> Result<NaiveTime, SettingsError> {
    let err = |message: String| SettingsError {
        key: key.to_string(),
        message,
    };
    let s = value
        .as_str()
        .ok_or_else(|| err(format!("expected an `HH:MM` string, got {value}")))?;
    NaiveTime::parse_from_str(s, "%H:%M").map_err(|e| err(format!("invalid time `{s}`: {e}")))
}

fn parse_string(key: &str, value: &serde_json::Value) -> Result<Option<String>, SettingsError> {
    match value {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::String(s) if s.trim().is_empty() => Ok(None),
        serde_json::Value::String(s) => Ok(Some(s.trim().to_string())),
        other => Err(SettingsError {
            key: key.to_string(),
            message: format!("expected a string, got {other}"),
        }),
    }
}

impl StoredSettings {
    fn from_rows(rows: Vec<(String, serde_json::Value)>) -> Result<Self, SettingsError> {
        use crate::db::settings as keys;

        let rows: HashMap<String, serde_json::Value> = rows.into_iter().collect();
        let get_bool = |key: &str| rows.get(key).map(|v| parse_bool(key, v)).transpose();
        let get_time = |key: &str| rows.get(key).map(|v| parse_time(key, v)).transpose();

        Ok(StoredSettings {
            enabled: get_bool(keys::ENABLED)?,
            morning_time: get_time(keys::MORNING_TIME)?,
            evening_time: get_time(keys::EVENING_TIME)?,
            push_enabled: get_bool(keys::PUSH_ENABLED)?,
            line_enabled: get_bool(keys::LINE_ENABLED)?,
            line_channel_access_token: match rows.get(keys::LINE_CHANNEL_ACCESS_TOKEN) {
                Some(v) => parse_string(keys::LINE_CHANNEL_ACCESS_TOKEN, v)?,
                None => None,
            },
            stock_staff: get_bool(keys::NOTIFY_STOCK_STAFF)?,
            customer_service: get_bool(keys::NOTIFY_CUSTOMER_SERVICE)?,
            dentists: get_bool(keys::NOTIFY_DENTISTS)?,
        })
    }
}

impl NotificationSettings {
    /// Builds the snapshot from raw rows, falling back to `config` for
    /// credentials the table does not carry.
    ///
    /// A channel without an explicit switch is enabled exactly when its
    /// credentials are configured.
    pub fn from_rows(
        rows: Vec<(String, serde_json::Value)>,
        config: &Config,
    ) -> Result<NotificationSettings, SettingsError> {
        let stored = StoredSettings::from_rows(rows)?;

        let line_channel_access_token = stored
            .line_channel_access_token
            .map(SecretString::from)
            .or_else(|| {
                config
                    .line_channel_access_token
                    .as_ref()
                    .map(|t| SecretString::from(t.expose_secret().to_string()))
            });

        Ok(NotificationSettings {
            enabled: stored.enabled.unwrap_or(false),
            morning_time: stored
                .morning_time
                .unwrap_or(NaiveTime::from_hms_opt(8, 0, 0).unwrap_or_default()),
            evening_time: stored
                .evening_time
                .unwrap_or(NaiveTime::from_hms_opt(18, 0, 0).unwrap_or_default()),
            push_enabled: stored.push_enabled.unwrap_or(config.vapid.is_some()),
            line_enabled: stored
                .line_enabled
                .unwrap_or(line_channel_access_token.is_some()),
            line_channel_access_token,
            audiences: AudienceToggles {
                stock_staff: stored.stock_staff.unwrap_or(true),
                customer_service: stored.customer_service.unwrap_or(true),
                dentists: stored.dentists.unwrap_or(true),
            },
        })
    }

    pub async fn load(
        conn: &mut dyn Connection,
        config: &Config,
    ) -> anyhow::Result<NotificationSettings> {
        let rows = conn.load_settings().await.context("loading settings")?;
        Ok(Self::from_rows(rows, config)?)
    }
}
