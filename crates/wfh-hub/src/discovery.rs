use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use mdns_sd::{ServiceDaemon, ServiceInfo};

use tracing::{error, info, warn};

use crate::config::DiscoveryConfig;
use crate::error::{Error, ErrorKind, Result};

// Hub HTTP service type.
const HTTP_SERVICE_TYPE: &str = "_http._tcp.local.";
// Hub HTTP instance name.
const HTTP_SERVICE_NAME: &str = "WasteFreeHomeHTTPHub";
// Hub HTTP hostname.
const HTTP_HOSTNAME: &str = "waste-free-home-http-hub.local.";

// Broker service type.
const MQTT_SERVICE_TYPE: &str = "_mqtt._tcp.local.";
// Broker instance name.
const MQTT_SERVICE_NAME: &str = "WasteFreeHomeMQTTBroker";
// Broker hostname.
const MQTT_HOSTNAME: &str = "waste-free-home-mqtt-broker.local.";

// TXT key listing the hub paths.
const PATHS_PROPERTY: &str = "paths";

// Time allowed to the responder to confirm an unregistration.
const UNREGISTER_TIMEOUT: Duration = Duration::from_secs(2);

fn discovery_error(description: impl Into<std::borrow::Cow<'static, str>>) -> Error {
    Error::new(ErrorKind::Discovery, description)
}

/// A service advertised on the local network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAdvertisement {
    /// Instance name.
    pub service_name: String,
    /// Service type, i.e. `_http._tcp.local.`
    pub service_type: String,
    /// Hostname of the service host.
    pub hostname: String,
    /// Address of the service host.
    pub address: IpAddr,
    /// Service port.
    pub port: u16,
    /// `TXT` metadata.
    pub properties: HashMap<String, String>,
}

impl ServiceAdvertisement {
    /// Returns the fully qualified name of the service instance.
    #[must_use]
    pub fn fullname(&self) -> String {
        format!("{}.{}", self.service_name, self.service_type)
    }

    /// Returns the advertisements of the hub: its `HTTP` interface and its
    /// broker.
    #[must_use]
    pub fn hub_services(config: &DiscoveryConfig) -> Vec<Self> {
        let properties = HashMap::from([(PATHS_PROPERTY.to_string(), config.paths.join(","))]);

        vec![
            Self {
                service_name: HTTP_SERVICE_NAME.into(),
                service_type: HTTP_SERVICE_TYPE.into(),
                hostname: HTTP_HOSTNAME.into(),
                address: config.address,
                port: config.http_port,
                properties: properties.clone(),
            },
            Self {
                service_name: MQTT_SERVICE_NAME.into(),
                service_type: MQTT_SERVICE_TYPE.into(),
                hostname: MQTT_HOSTNAME.into(),
                address: config.address,
                port: config.broker_port,
                properties,
            },
        ]
    }
}

/// A local network responder publishing service records.
///
/// All methods are blocking.
pub trait Responder: Send + 'static {
    /// Publishes a service and returns its registered fullname.
    ///
    /// # Errors
    ///
    /// An error is returned when the service records are invalid or
    /// cannot be published.
    fn register(&self, advertisement: &ServiceAdvertisement) -> Result<String>;

    /// Withdraws a previously registered service.
    ///
    /// # Errors
    ///
    /// An error is returned when the service cannot be withdrawn.
    fn unregister(&self, fullname: &str) -> Result<()>;

    /// Releases the responder.
    ///
    /// # Errors
    ///
    /// An error is returned when the responder cannot be stopped.
    fn shutdown(&self) -> Result<()>;
}

impl Responder for ServiceDaemon {
    fn register(&self, advertisement: &ServiceAdvertisement) -> Result<String> {
        let info = ServiceInfo::new(
            &advertisement.service_type,
            &advertisement.service_name,
            &advertisement.hostname,
            advertisement.address,
            advertisement.port,
            advertisement.properties.clone(),
        )?;

        let fullname = info.get_fullname().to_string();
        ServiceDaemon::register(self, info)?;
        Ok(fullname)
    }

    fn unregister(&self, fullname: &str) -> Result<()> {
        let receiver = ServiceDaemon::unregister(self, fullname)?;
        let status = receiver.recv_timeout(UNREGISTER_TIMEOUT).map_err(|e| {
            discovery_error(format!("No unregistration status for `{fullname}`: {e}"))
        })?;
        info!("Unregistration status of `{fullname}`: {status:?}");
        Ok(())
    }

    fn shutdown(&self) -> Result<()> {
        let _ = ServiceDaemon::shutdown(self)?;
        Ok(())
    }
}

/// The services registered by a [`DiscoveryAdvertiser`].
#[derive(Debug)]
pub struct AdvertisementHandle<R: Responder = ServiceDaemon> {
    responder: R,
    registered: Vec<String>,
}

impl<R: Responder> AdvertisementHandle<R> {
    /// Returns the fullnames of the registered services.
    #[must_use]
    pub fn registered(&self) -> &[String] {
        &self.registered
    }
}

/// The advertiser of the hub services on the local network.
///
/// Registration and unregistration run on the blocking thread pool, so that
/// multicast traffic never shares a thread with the relay.
#[derive(Debug)]
pub struct DiscoveryAdvertiser {
    services: Vec<ServiceAdvertisement>,
}

impl DiscoveryAdvertiser {
    /// Creates a [`DiscoveryAdvertiser`] for the hub services.
    #[must_use]
    pub fn new(config: &DiscoveryConfig) -> Self {
        Self {
            services: ServiceAdvertisement::hub_services(config),
        }
    }

    /// Creates a [`DiscoveryAdvertiser`] for arbitrary services.
    #[must_use]
    pub const fn with_services(services: Vec<ServiceAdvertisement>) -> Self {
        Self { services }
    }

    /// Starts an `mDNS-SD` responder and registers all services.
    ///
    /// # Errors
    ///
    /// An error is returned when the responder cannot be started. Failures
    /// of single registrations are logged and skipped.
    pub async fn start(&self) -> Result<AdvertisementHandle> {
        let responder = tokio::task::spawn_blocking(ServiceDaemon::new)
            .await
            .map_err(|e| discovery_error(format!("Discovery task failed: {e}")))??;
        self.start_with(responder).await
    }

    /// Registers all services on the given [`Responder`].
    ///
    /// # Errors
    ///
    /// An error is returned when the blocking task cannot complete.
    pub async fn start_with<R: Responder>(&self, responder: R) -> Result<AdvertisementHandle<R>> {
        let services = self.services.clone();

        tokio::task::spawn_blocking(move || {
            let mut registered = Vec::new();
            for service in &services {
                match responder.register(service) {
                    Ok(fullname) => {
                        info!(
                            "Service `{fullname}` registered on {}:{}",
                            service.address, service.port
                        );
                        registered.push(fullname);
                    }
                    Err(e) => error!(
                        "Impossible to register service `{}`: {e}",
                        service.fullname()
                    ),
                }
            }
            AdvertisementHandle {
                responder,
                registered,
            }
        })
        .await
        .map_err(|e| discovery_error(format!("Discovery task failed: {e}")))
    }

    /// Unregisters every registered service and releases the responder.
    ///
    /// Every service is unregistered even when others fail.
    ///
    /// # Errors
    ///
    /// An error is returned when at least one service could not be
    /// unregistered or the responder could not be released.
    pub async fn stop<R: Responder>(handle: AdvertisementHandle<R>) -> Result<()> {
        tokio::task::spawn_blocking(move || {
            let mut failures = 0;
            for fullname in &handle.registered {
                match handle.responder.unregister(fullname) {
                    Ok(()) => info!("Service `{fullname}` unregistered"),
                    Err(e) => {
                        failures += 1;
                        warn!("Impossible to unregister service `{fullname}`: {e}");
                    }
                }
            }

            if let Err(e) = handle.responder.shutdown() {
                warn!("Impossible to stop the discovery responder: {e}");
                failures += 1;
            }

            if failures == 0 {
                Ok(())
            } else {
                Err(discovery_error(format!(
                    "{failures} discovery operations failed while stopping"
                )))
            }
        })
        .await
        .map_err(|e| discovery_error(format!("Discovery task failed: {e}")))?
    }
}
