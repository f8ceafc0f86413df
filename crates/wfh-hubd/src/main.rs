//! The WasteFreeHome hub daemon.
//!
//! It relays the states and records published by home devices on the `MQTT`
//! broker to the WasteFreeHome server, advertises the hub services through
//! `mDNS` and serves the hub `HTTP` interface until `Ctrl-C` is pressed.
//!
//! Every option can also be set through the environment variable shown in
//! `--help`, or through a `.env` file.

use std::ffi::OsString;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use tracing::{Level, error, info, warn};

use wfh_hub::api::{ApiServer, router};
use wfh_hub::client::ServerClient;
use wfh_hub::config::{
    BrokerConfig, DEFAULT_AUTH_ENDPOINT, DEFAULT_DEVICES_ENDPOINT, DEFAULT_RECORD_TOPIC,
    DEFAULT_RECORDS_ENDPOINT, DEFAULT_STATE_TOPIC, DiscoveryConfig, HubConfig, RelayConfig,
    ServerConfig,
};
use wfh_hub::credential::{CredentialStore, UserCredentials};
use wfh_hub::discovery::DiscoveryAdvertiser;
use wfh_hub::error::Error;
use wfh_hub::relay::RelayEngine;

// Dotenv file loaded when neither `--env-file` nor `ENV_FILE` is set.
const DEFAULT_ENV_FILE: &str = ".env";

#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Hub identifier, also used as broker client identifier.
    #[arg(long, env = "HUB_ID")]
    hub_id: String,

    /// Address advertised through mDNS.
    #[arg(long, env = "HUB_HOSTNAME")]
    hub_hostname: IpAddr,

    /// Port of the hub HTTP interface.
    #[arg(long, env = "HTTP_PORT", default_value_t = 8000)]
    http_port: u16,

    /// Broker address.
    #[arg(long, env = "MQTT_BROKER_ADDRESS", default_value = "localhost")]
    mqtt_broker_address: String,

    /// Broker port.
    #[arg(long, env = "MQTT_BROKER_PORT", default_value_t = 1883)]
    mqtt_broker_port: u16,

    /// Broker username.
    #[arg(long, env = "MQTT_USERNAME", requires = "mqtt_password")]
    mqtt_username: Option<String>,

    /// Broker password.
    #[arg(long, env = "MQTT_PASSWORD", hide_env_values = true)]
    mqtt_password: Option<String>,

    /// Topic filter of device records.
    #[arg(long, env = "DEVICE_RECORD_TOPIC", default_value = DEFAULT_RECORD_TOPIC)]
    device_record_topic: String,

    /// Topic filter of device states.
    #[arg(long, env = "DEVICE_STATE_TOPIC", default_value = DEFAULT_STATE_TOPIC)]
    device_state_topic: String,

    /// Server hostname.
    #[arg(long, env = "SERVER_HOSTNAME")]
    server_hostname: String,

    /// Server port.
    #[arg(long, env = "SERVER_PORT")]
    server_port: u16,

    /// Records endpoint of the server.
    #[arg(long, env = "SERVER_RECORDS_ENDPOINT", default_value = DEFAULT_RECORDS_ENDPOINT)]
    server_records_endpoint: String,

    /// Devices endpoint of the server.
    #[arg(long, env = "SERVER_DEVICES_ENDPOINT", default_value = DEFAULT_DEVICES_ENDPOINT)]
    server_devices_endpoint: String,

    /// Authentication endpoint of the server.
    #[arg(long, env = "SERVER_AUTH_ENDPOINT", default_value = DEFAULT_AUTH_ENDPOINT)]
    server_auth_endpoint: String,

    /// Email of the hub owner.
    #[arg(long, env = "USER_EMAIL")]
    user_email: String,

    /// Password of the hub owner.
    #[arg(long, env = "USER_PASSWORD", hide_env_values = true)]
    user_password: String,

    /// An already issued token, no authentication at startup when present.
    #[arg(long, env = "JWT", hide_env_values = true)]
    jwt: Option<String>,

    /// Maximum number of attempts of a single server request.
    #[arg(long, env = "RETRY_BUDGET", default_value_t = 3)]
    retry_budget: u32,

    /// Number of concurrent dispatch workers.
    #[arg(long, env = "WORKERS", default_value_t = 4)]
    workers: usize,

    /// Dotenv file updated when the user credentials change.
    #[arg(long, env = "ENV_FILE", default_value = DEFAULT_ENV_FILE)]
    env_file: PathBuf,

    /// Increases the logging verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn level(&self) -> Level {
        match self.verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    }

    fn into_config(self) -> (HubConfig, UserCredentials, Option<String>) {
        let mut server = ServerConfig::new(self.server_hostname, self.server_port)
            .retry_budget(self.retry_budget);
        server.records_endpoint = self.server_records_endpoint;
        server.devices_endpoint = self.server_devices_endpoint;
        server.auth_endpoint = self.server_auth_endpoint;

        let mut broker = BrokerConfig::new(
            self.mqtt_broker_address,
            self.mqtt_broker_port,
            self.hub_id.clone(),
        )
        .topic_filters(vec![self.device_record_topic, self.device_state_topic]);
        if let (Some(username), Some(password)) = (self.mqtt_username, self.mqtt_password) {
            broker = broker.credentials(username, password);
        }

        let relay = RelayConfig {
            workers: self.workers,
            ..RelayConfig::default()
        };

        let config = HubConfig {
            hub_id: self.hub_id,
            http_port: self.http_port,
            server,
            broker,
            discovery: DiscoveryConfig::new(
                self.hub_hostname,
                self.http_port,
                self.mqtt_broker_port,
            ),
            relay,
            env_file: Some(self.env_file),
        };

        (
            config,
            UserCredentials::new(self.user_email, self.user_password),
            self.jwt,
        )
    }
}

// The dotenv file provides argument values, so it is resolved before the
// arguments are parsed, with the same precedence `clap` applies.
fn env_file_path(args: &[OsString], env: Option<OsString>) -> PathBuf {
    let mut args = args.iter().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--" {
            break;
        }
        if arg == "--env-file" {
            if let Some(path) = args.next() {
                return PathBuf::from(path);
            }
        } else if let Some(path) = arg.to_str().and_then(|arg| arg.strip_prefix("--env-file=")) {
            return PathBuf::from(path);
        }
    }
    env.map_or_else(|| PathBuf::from(DEFAULT_ENV_FILE), PathBuf::from)
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args: Vec<OsString> = std::env::args_os().collect();
    let env_file = env_file_path(&args, std::env::var_os("ENV_FILE"));
    let loaded = dotenvy::from_path(&env_file);

    let cli = Cli::parse_from(&args);

    tracing_subscriber::fmt()
        .with_max_level(cli.level())
        .with_target(false)
        .init();

    if let Err(e) = loaded {
        warn!("No env file loaded from `{}`: {e}", env_file.display());
    }

    let (mut config, user, jwt) = cli.into_config();
    // Credential updates are written back to the file that was loaded.
    config.env_file = Some(env_file);
    config.validate()?;

    let mut credentials = CredentialStore::new(&config.server, user)?;
    if let Some(jwt) = jwt.as_deref() {
        credentials = credentials.with_token(jwt);
    }
    let credentials = Arc::new(credentials);

    if jwt.is_none()
        && let Err(e) = credentials.refresh().await
    {
        error!("Initial authentication failed, it will be retried at the first delivery: {e}");
    }

    let client = ServerClient::new(&config.server, Arc::clone(&credentials))?;
    let relay = RelayEngine::new(config.broker, config.relay, client).start();

    let api = ApiServer::start(
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.http_port)),
        router(credentials, config.env_file),
    )
    .await?;

    let advertisement = match DiscoveryAdvertiser::new(&config.discovery).start().await {
        Ok(handle) => Some(handle),
        Err(e) => {
            error!("Hub services not advertised: {e}");
            None
        }
    };

    info!("Hub `{}` running, press Ctrl-C to stop it", config.hub_id);
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for the shutdown signal: {e}");
    }
    info!("Shutting down the hub");

    relay.shutdown().await;
    api.shutdown().await;

    if let Some(handle) = advertisement
        && let Err(e) = DiscoveryAdvertiser::stop(handle).await
    {
        error!("Hub services not fully unregistered: {e}");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::ffi::OsString;
    use std::net::{IpAddr, Ipv4Addr};
    use std::path::{Path, PathBuf};

    use clap::Parser;

    use serial_test::serial;

    use super::{Cli, DEFAULT_ENV_FILE, env_file_path};

    const ENV_FILE: &str = "HUB_ID=hub-env\n\
                            HUB_HOSTNAME=10.0.0.2\n\
                            HTTP_PORT=9000\n\
                            SERVER_HOSTNAME=server.local\n\
                            SERVER_PORT=8080\n\
                            USER_EMAIL=env@home.org\n\
                            USER_PASSWORD=env-secret\n\
                            JWT=issued-token\n";

    const REQUIRED: &[&str] = &[
        "wfh-hubd",
        "--hub-id",
        "hub-1",
        "--hub-hostname",
        "192.168.1.10",
        "--server-hostname",
        "server.local",
        "--server-port",
        "8080",
        "--user-email",
        "owner@home.org",
        "--user-password",
        "secret",
    ];

    #[test]
    #[serial]
    fn config_from_arguments() {
        let mut args = REQUIRED.to_vec();
        args.extend([
            "--mqtt-username",
            "hub",
            "--mqtt-password",
            "broker-secret",
            "--retry-budget",
            "5",
            "-vv",
        ]);
        let cli = Cli::try_parse_from(args).unwrap();
        assert_eq!(cli.level(), tracing::Level::TRACE);

        let (config, user, _) = cli.into_config();
        assert!(config.validate().is_ok());
        assert_eq!(config.hub_id, "hub-1");
        assert_eq!(config.broker.client_id, "hub-1");
        assert_eq!(
            config.broker.credentials,
            Some(("hub".to_string(), "broker-secret".to_string()))
        );
        assert_eq!(config.server.retry_budget, 5);
        assert_eq!(config.server.records_endpoint, "API/records");
        assert_eq!(
            config.discovery.address,
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10))
        );
        assert_eq!(config.discovery.http_port, config.http_port);
        assert_eq!(config.discovery.broker_port, 1883);
        assert_eq!(user.email, "owner@home.org");
    }

    #[test]
    #[serial]
    fn broker_password_required_with_username() {
        let mut args = REQUIRED.to_vec();
        args.extend(["--mqtt-username", "hub"]);
        assert!(Cli::try_parse_from(args).is_err());
    }

    // Removes from the process environment the variables of an env file.
    #[allow(unsafe_code)]
    fn unload_env_file(path: &Path) {
        for item in dotenvy::from_path_iter(path).unwrap() {
            let (key, _) = item.unwrap();
            // SAFETY: the tests reading the environment are serial and spawn
            // no threads, so it is not read concurrently.
            unsafe { std::env::remove_var(key) };
        }
    }

    fn os_args(args: &[&str]) -> Vec<OsString> {
        args.iter().map(OsString::from).collect()
    }

    #[test]
    fn env_file_resolution() {
        let env = Some(OsString::from("from-env.env"));

        assert_eq!(
            env_file_path(&os_args(&["wfh-hubd", "--env-file", "a.env"]), env.clone()),
            PathBuf::from("a.env")
        );
        assert_eq!(
            env_file_path(&os_args(&["wfh-hubd", "-v", "--env-file=b.env"]), env.clone()),
            PathBuf::from("b.env")
        );
        assert_eq!(
            env_file_path(&os_args(&["wfh-hubd", "--hub-id", "hub-1"]), env.clone()),
            PathBuf::from("from-env.env")
        );
        assert_eq!(
            env_file_path(&os_args(&["wfh-hubd", "--", "--env-file", "c.env"]), env),
            PathBuf::from("from-env.env")
        );
        assert_eq!(
            env_file_path(&os_args(&["wfh-hubd"]), None),
            PathBuf::from(DEFAULT_ENV_FILE)
        );
        // A trailing flag without value is left to the parser.
        assert_eq!(
            env_file_path(&os_args(&["wfh-hubd", "--env-file"]), None),
            PathBuf::from(DEFAULT_ENV_FILE)
        );
    }

    #[test]
    #[serial]
    fn config_from_env_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(&path, ENV_FILE).unwrap();
        dotenvy::from_path(&path).unwrap();

        let cli = Cli::try_parse_from(["wfh-hubd", "--env-file", "custom.env"]).unwrap();
        let (config, user, jwt) = cli.into_config();
        assert_eq!(config.hub_id, "hub-env");
        assert_eq!(config.http_port, 9000);
        assert_eq!(config.discovery.http_port, 9000);
        assert_eq!(config.env_file, Some(PathBuf::from("custom.env")));
        assert_eq!(user.email, "env@home.org");
        assert_eq!(jwt.as_deref(), Some("issued-token"));

        unload_env_file(&path);
        assert!(std::env::var_os("HUB_ID").is_none());
    }

    #[test]
    #[serial]
    fn env_file_flag_selects_the_loaded_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hub.env");
        std::fs::write(&path, ENV_FILE).unwrap();

        let mut args = os_args(&["wfh-hubd", "--env-file"]);
        args.push(path.clone().into_os_string());

        let env_file = env_file_path(&args, None);
        assert_eq!(env_file, path);
        dotenvy::from_path(&env_file).unwrap();

        let cli = Cli::try_parse_from(&args).unwrap();
        let (config, user, jwt) = cli.into_config();
        assert_eq!(config.hub_id, "hub-env");
        assert_eq!(
            config.discovery.address,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2))
        );
        assert_eq!(config.env_file, Some(path.clone()));
        assert_eq!(user.password, "env-secret");
        assert_eq!(jwt.as_deref(), Some("issued-token"));

        unload_env_file(&path);
    }
}
