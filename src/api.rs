use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::codec::ModeSettings;
use crate::logger::{MessageLogMode, MessageLogger};
use crate::protocol::{DEFAULT_API_URL, DEVICES_PATH, DeviceRecord, WireCommand, device_path, parse_error_message};
use crate::{Error, Result};

pub const BOOST_TEMPERATURE_KEY: &str = "boost_temperature";
pub const CONSTANT_TEMPERATURE_KEY: &str = "constant_temperature";

const DEFAULT_BOOST_TEMPERATURE: f64 = 26.0;
const DEFAULT_CONSTANT_TEMPERATURE: f64 = 22.0;

/// Thermostat REST API.
#[async_trait]
pub trait ThermostatApi: Send + Sync {
    /// Raw list elements; each is decoded on its own with
    /// [`decode_record`](crate::protocol::decode_record).
    async fn fetch_devices(&self) -> Result<Vec<Value>>;
    async fn fetch_device(&self, serial: &str) -> Result<DeviceRecord>;
    async fn write_command(&self, command: &WireCommand) -> Result<()>;
}

/// Owner of the OAuth session. The engine only reads tokens and asks for refreshes.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    fn access_token(&self) -> Option<String>;
    async fn refresh_token(&self) -> Result<()>;
}

/// Per-device user settings.
pub trait SettingsProvider: Send + Sync {
    fn setting(&self, serial: &str, key: &str) -> Option<f64>;
}

impl ModeSettings {
    pub fn load(provider: &dyn SettingsProvider, serial: &str) -> Self {
        Self {
            boost_temperature: provider.setting(serial, BOOST_TEMPERATURE_KEY),
            constant_temperature: provider.setting(serial, CONSTANT_TEMPERATURE_KEY),
        }
    }
}

/// A fixed access token. Refreshing is not possible.
pub struct StaticCredentials {
    token: RwLock<Option<String>>,
}

impl StaticCredentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: RwLock::new(Some(token.into())),
        }
    }

    pub fn empty() -> Self {
        Self {
            token: RwLock::new(None),
        }
    }

    pub fn set(&self, token: Option<String>) {
        *self.token.write() = token;
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    fn access_token(&self) -> Option<String> {
        self.token.read().clone()
    }

    async fn refresh_token(&self) -> Result<()> {
        warn!("static credentials cannot be refreshed");
        Err(Error::NoCredentials)
    }
}

/// In-memory settings with the defaults seeded at pairing time.
pub struct DeviceSettings {
    defaults: HashMap<String, f64>,
    values: RwLock<HashMap<(String, String), f64>>,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        let defaults = HashMap::from([
            (BOOST_TEMPERATURE_KEY.to_string(), DEFAULT_BOOST_TEMPERATURE),
            (CONSTANT_TEMPERATURE_KEY.to_string(), DEFAULT_CONSTANT_TEMPERATURE),
        ]);
        Self {
            defaults,
            values: RwLock::new(HashMap::new()),
        }
    }
}

impl DeviceSettings {
    pub fn set(&self, serial: &str, key: &str, value: f64) {
        self.values
            .write()
            .insert((serial.to_string(), key.to_string()), value);
    }
}

impl SettingsProvider for DeviceSettings {
    fn setting(&self, serial: &str, key: &str) -> Option<f64> {
        self.values
            .read()
            .get(&(serial.to_string(), key.to_string()))
            .copied()
            .or_else(|| self.defaults.get(key).copied())
    }
}

pub struct SenzClientBuilder {
    base_url: String,
    credentials: Arc<dyn CredentialProvider>,
    log_mode: Option<MessageLogMode>,
    log_path: Option<String>,
}

impl SenzClientBuilder {
    pub fn new(credentials: Arc<dyn CredentialProvider>) -> Self {
        Self {
            base_url: DEFAULT_API_URL.to_string(),
            credentials,
            log_mode: None,
            log_path: None,
        }
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn message_log(mut self, mode: MessageLogMode, path: impl Into<String>) -> Self {
        self.log_mode = Some(mode);
        self.log_path = Some(path.into());
        self
    }

    pub fn build(self) -> Result<SenzClient> {
        let http = reqwest::Client::builder().build()?;

        let logger = match (self.log_mode, self.log_path) {
            (Some(mode), Some(path)) => Some(Mutex::new(MessageLogger::new(mode, &path)?)),
            _ => None,
        };

        Ok(SenzClient {
            http,
            base_url: self.base_url.trim_end_matches('/').to_string(),
            credentials: self.credentials,
            logger,
        })
    }
}

/// reqwest client for the SENZ cloud API.
pub struct SenzClient {
    http: reqwest::Client,
    base_url: String,
    credentials: Arc<dyn CredentialProvider>,
    logger: Option<Mutex<MessageLogger>>,
}

impl SenzClient {
    pub fn builder(credentials: Arc<dyn CredentialProvider>) -> SenzClientBuilder {
        SenzClientBuilder::new(credentials)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn token(&self) -> Result<String> {
        self.credentials.access_token().ok_or(Error::NoCredentials)
    }

    fn with_logger(&self, f: impl FnOnce(&mut MessageLogger)) {
        if let Some(ref logger) = self.logger {
            f(&mut logger.lock());
        }
    }

    async fn get(&self, path: &str) -> Result<Value> {
        let url = format!("{}{path}", self.base_url);
        debug!(url = %url, "GET");
        self.with_logger(|l| l.log_request("GET", path));

        let resp = self.http.get(&url).bearer_auth(self.token()?).send().await?;
        let body = self.check(path, resp).await?;
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body)
            .map_err(|e| Error::Protocol(format!("invalid JSON from {path}: {e}")))
    }

    async fn put(&self, path: &str, body: &Value) -> Result<()> {
        let url = format!("{}{path}", self.base_url);
        debug!(url = %url, "PUT");
        self.with_logger(|l| l.log_command(path, body));

        let resp = self
            .http
            .put(&url)
            .bearer_auth(self.token()?)
            .json(body)
            .send()
            .await?;
        self.check(path, resp).await?;
        Ok(())
    }

    /// Maps non-success statuses onto the error taxonomy and returns the body.
    async fn check(&self, path: &str, resp: reqwest::Response) -> Result<String> {
        let status = resp.status().as_u16();
        let body = resp.text().await?;
        if (200..300).contains(&status) {
            trace!(status, path, "request ok");
            return Ok(body);
        }

        warn!(status, path, "request not OK");
        self.with_logger(|l| l.log_error(path, status, &body));

        Err(match status {
            401 => Error::Unauthorized,
            404 => Error::NotFound(path.to_string()),
            s if (500..600).contains(&s) => Error::Server(s),
            s => Error::Status {
                status: s,
                message: parse_error_message(&body),
            },
        })
    }
}

#[async_trait]
impl ThermostatApi for SenzClient {
    async fn fetch_devices(&self) -> Result<Vec<Value>> {
        let body = self.get(DEVICES_PATH).await?;
        self.with_logger(|l| l.log_devices(&body));
        match body {
            Value::Null => Ok(Vec::new()),
            Value::Array(items) => Ok(items),
            other => Err(Error::Protocol(format!(
                "expected device list, got {}",
                json_kind(&other)
            ))),
        }
    }

    async fn fetch_device(&self, serial: &str) -> Result<DeviceRecord> {
        let path = device_path(serial);
        let body = self.get(&path).await?;
        self.with_logger(|l| l.log_device(&body));
        if !body.is_object() {
            return Err(Error::Protocol(format!(
                "expected device object, got {}",
                json_kind(&body)
            )));
        }
        Ok(serde_json::from_value(body)?)
    }

    async fn write_command(&self, command: &WireCommand) -> Result<()> {
        let body = serde_json::to_value(command)?;
        self.put(&command.path(), &body).await
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_fall_back_to_pairing_defaults() {
        let settings = DeviceSettings::default();
        settings.set("A1", BOOST_TEMPERATURE_KEY, 24.0);

        let a1 = ModeSettings::load(&settings, "A1");
        assert_eq!(a1.boost_temperature, Some(24.0));
        assert_eq!(a1.constant_temperature, Some(22.0));

        let b2 = ModeSettings::load(&settings, "B2");
        assert_eq!(b2.boost_temperature, Some(26.0));
        assert_eq!(settings.setting("B2", "unknown"), None);
    }

    #[tokio::test]
    async fn static_credentials_cannot_refresh() {
        let creds = StaticCredentials::new("token");
        assert_eq!(creds.access_token().as_deref(), Some("token"));
        assert!(creds.refresh_token().await.is_err());
        creds.set(None);
        assert_eq!(creds.access_token(), None);
    }
}
