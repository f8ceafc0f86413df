use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::Url;

use crate::error::{Error, ErrorKind, Result};

/// Default records endpoint of the server.
pub const DEFAULT_RECORDS_ENDPOINT: &str = "API/records";
/// Default devices endpoint of the server.
pub const DEFAULT_DEVICES_ENDPOINT: &str = "API/devices";
/// Default authentication endpoint of the server.
pub const DEFAULT_AUTH_ENDPOINT: &str = "API/auth";
/// Default topic filter for device records.
pub const DEFAULT_RECORD_TOPIC: &str = "device/+/record";
/// Default topic filter for device states.
pub const DEFAULT_STATE_TOPIC: &str = "device/+/state";
/// Health check path of the hub `HTTP` interface.
pub const HEALTH_PATH: &str = "/API/health";
/// Credentials update path of the hub `HTTP` interface.
pub const UPDATE_CREDENTIALS_PATH: &str = "/API/update-credentials";

// Attempts allowed for a single logical request to the server.
const DEFAULT_RETRY_BUDGET: u32 = 3;
// Timeout applied to every request to the server.
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);
// Keep alive time to send `pingreq` to broker when the connection is idle.
const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);
// Number of dispatch workers.
const DEFAULT_WORKERS: usize = 4;
// Capacity of the queue between the broker session and the workers.
const DEFAULT_QUEUE_CAPACITY: usize = 64;
// Pause between two polls of a lost broker session.
const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);
// Time granted to in-flight deliveries when shutting down.
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

fn config_error(description: impl Into<std::borrow::Cow<'static, str>>) -> Error {
    Error::new(ErrorKind::Config, description)
}

/// Server connection settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Server hostname or address.
    pub hostname: String,
    /// Server port.
    pub port: u16,
    /// Records endpoint, relative to the server root.
    pub records_endpoint: String,
    /// Devices endpoint, relative to the server root.
    pub devices_endpoint: String,
    /// Authentication endpoint, relative to the server root.
    pub auth_endpoint: String,
    /// Timeout of every request.
    pub timeout: Duration,
    /// Maximum number of attempts for a single logical request.
    pub retry_budget: u32,
}

impl ServerConfig {
    /// Creates a [`ServerConfig`] with the default endpoints.
    #[must_use]
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            records_endpoint: DEFAULT_RECORDS_ENDPOINT.into(),
            devices_endpoint: DEFAULT_DEVICES_ENDPOINT.into(),
            auth_endpoint: DEFAULT_AUTH_ENDPOINT.into(),
            timeout: DEFAULT_HTTP_TIMEOUT,
            retry_budget: DEFAULT_RETRY_BUDGET,
        }
    }

    /// Sets the maximum number of attempts for a single logical request.
    #[must_use]
    pub const fn retry_budget(mut self, retry_budget: u32) -> Self {
        self.retry_budget = retry_budget;
        self
    }

    /// Sets the timeout of every request.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns the server root `URL`.
    ///
    /// # Errors
    ///
    /// An error is returned when hostname and port do not form a valid `URL`.
    pub fn base_url(&self) -> Result<Url> {
        Url::parse(&format!("http://{}:{}/", self.hostname, self.port)).map_err(|e| {
            config_error(format!(
                "Invalid server address `{}:{}`: {e}",
                self.hostname, self.port
            ))
        })
    }
}

/// Broker session settings.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerConfig {
    /// Broker hostname or address.
    pub address: String,
    /// Broker port.
    pub port: u16,
    /// Client identifier, the hub identifier.
    pub client_id: String,
    /// Keep alive interval of the session.
    pub keep_alive: Duration,
    /// Optional broker username and password.
    pub credentials: Option<(String, String)>,
    /// Topic filters subscribed at every connection.
    pub topic_filters: Vec<String>,
}

impl BrokerConfig {
    /// Creates a [`BrokerConfig`] subscribing to the default device topics.
    #[must_use]
    pub fn new(address: impl Into<String>, port: u16, client_id: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            port,
            client_id: client_id.into(),
            keep_alive: DEFAULT_KEEP_ALIVE,
            credentials: None,
            topic_filters: vec![DEFAULT_RECORD_TOPIC.into(), DEFAULT_STATE_TOPIC.into()],
        }
    }

    /// Sets the broker username and password.
    #[must_use]
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }

    /// Replaces the subscribed topic filters.
    #[must_use]
    pub fn topic_filters(mut self, topic_filters: Vec<String>) -> Self {
        self.topic_filters = topic_filters;
        self
    }
}

/// Dispatch pipeline settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayConfig {
    /// Number of concurrent dispatch workers.
    pub workers: usize,
    /// Number of messages buffered between the broker session and workers.
    pub queue_capacity: usize,
    /// Pause between two polls of a lost broker session.
    pub reconnect_delay: Duration,
    /// Time granted to in-flight deliveries when shutting down.
    pub shutdown_grace: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

/// Discovery advertisement settings.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryConfig {
    /// Address advertised for every service.
    pub address: IpAddr,
    /// Port of the hub `HTTP` interface.
    pub http_port: u16,
    /// Port of the broker.
    pub broker_port: u16,
    /// Paths advertised in the `TXT` records.
    pub paths: Vec<String>,
}

impl DiscoveryConfig {
    /// Creates a [`DiscoveryConfig`] advertising the hub `HTTP` paths.
    #[must_use]
    pub fn new(address: IpAddr, http_port: u16, broker_port: u16) -> Self {
        Self {
            address,
            http_port,
            broker_port,
            paths: vec![HEALTH_PATH.into(), UPDATE_CREDENTIALS_PATH.into()],
        }
    }
}

/// The whole hub configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct HubConfig {
    /// Hub identifier.
    pub hub_id: String,
    /// Port of the hub `HTTP` interface.
    pub http_port: u16,
    /// Server settings.
    pub server: ServerConfig,
    /// Broker settings.
    pub broker: BrokerConfig,
    /// Discovery settings.
    pub discovery: DiscoveryConfig,
    /// Dispatch pipeline settings.
    pub relay: RelayConfig,
    /// Dotenv file updated when user credentials change.
    pub env_file: Option<PathBuf>,
}

impl HubConfig {
    /// Checks the configuration consistency.
    ///
    /// # Errors
    ///
    /// An error is returned when a value would make the relay unusable.
    pub fn validate(&self) -> Result<()> {
        if self.hub_id.is_empty() {
            return Err(config_error("The hub identifier must not be empty"));
        }
        if self.server.retry_budget == 0 {
            return Err(config_error("The retry budget must be at least 1"));
        }
        if self.relay.workers == 0 {
            return Err(config_error("At least one dispatch worker is required"));
        }
        if self.relay.queue_capacity == 0 {
            return Err(config_error("The dispatch queue capacity must be at least 1"));
        }
        if self.broker.topic_filters.is_empty() {
            return Err(config_error("At least one topic filter is required"));
        }
        let _ = self.server.base_url()?;
        Ok(())
    }
}

/// Rewrites the `key=value` line of a dotenv file.
///
/// Other lines are preserved. When the key is missing, it is appended.
///
/// # Errors
///
/// An error is returned when the file cannot be read or written.
pub fn update_env_file(path: &Path, key: &str, value: &str) -> Result<()> {
    let content = std::fs::read_to_string(path)?;
    let prefix = format!("{key}=");

    let mut found = false;
    let mut lines = Vec::new();
    for line in content.lines() {
        if line.starts_with(&prefix) {
            found = true;
            lines.push(format!("{key}={value}"));
        } else {
            lines.push(line.to_string());
        }
    }
    if !found {
        lines.push(format!("{key}={value}"));
    }

    let mut updated = lines.join("\n");
    updated.push('\n');
    std::fs::write(path, updated)?;
    Ok(())
}
