use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::constants;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Error while reading TOML config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("Error while deserializing TOML: {0}")]
    Deserialize(#[from] toml::de::Error),

    #[error("{0} is not a multicast address")]
    NotMulticast(IpAddr),

    #[error("Invalid option: {0}")]
    Invalid(String),
}

#[derive(Debug, Default, Deserialize)]
pub struct RawConfig {
    pub network: Option<String>,
    pub unicast: Option<IpAddr>,
    pub prefix_length: Option<u8>,
    pub diagnosis_address: Option<u8>,
    #[serde(default)]
    pub service_discovery: RawSdOptions,
    #[serde(default)]
    pub logging: RawLoggingOptions,
    #[serde(default)]
    pub statistics: RawStatisticsOptions,
    #[serde(default)]
    pub endpoints: RawEndpointOptions,
    pub e2e_enabled: Option<bool>,
    pub security_enabled: Option<bool>,
    pub local_routing: Option<bool>,
    #[serde(default)]
    pub services: Vec<RawServiceOptions>,
}

#[derive(Debug, Deserialize)]
pub struct RawServiceOptions {
    pub service: u16,
    pub instance: u16,
    pub reliable_port: Option<u16>,
    pub unreliable_port: Option<u16>,
    pub multicast: Option<IpAddr>,
    pub multicast_port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RawSdOptions {
    pub enabled: Option<bool>,
    pub multicast: Option<IpAddr>,
    pub port: Option<u16>,
    pub initial_delay_min: Option<u32>,
    pub initial_delay_max: Option<u32>,
    pub repetitions_base_delay: Option<u32>,
    pub repetitions_max: Option<u8>,
    pub cyclic_offer_delay: Option<u32>,
    pub request_response_delay: Option<u32>,
    pub offer_debounce_time: Option<u32>,
    pub find_debounce_time: Option<u32>,
    pub ttl: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RawLoggingOptions {
    pub memory_interval: Option<u64>,
    pub status_interval: Option<u64>,
    pub statistics_interval: Option<u64>,
    pub version_interval: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RawStatisticsOptions {
    pub interval: Option<u64>,
    pub max_messages: Option<u32>,
    pub min_freq: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RawEndpointOptions {
    pub max_message_size_reliable: Option<usize>,
    pub max_message_size_unreliable: Option<usize>,
    pub max_message_size_local: Option<usize>,
    pub buffer_shrink_threshold: Option<u32>,
    pub send_queue_capacity: Option<usize>,
    pub max_reconnect_attempts: Option<u32>,
    pub reconnect_base_delay: Option<u64>,
    pub reconnect_max_delay: Option<u64>,
    pub magic_cookies: Option<bool>,
    pub magic_cookie_interval: Option<u64>,
    pub tp_reassembly_timeout: Option<u64>,
    pub reconnect_rebind_port: Option<bool>,
}

/// Service-discovery timing and addressing.
#[derive(Debug, Clone)]
pub struct SdConfig {
    pub enabled: bool,
    pub multicast: IpAddr,
    pub port: u16,
    pub initial_delay_min: Duration,
    pub initial_delay_max: Duration,
    pub repetitions_base_delay: Duration,
    pub repetitions_max: u8,
    pub cyclic_offer_delay: Duration,
    pub request_response_delay: Duration,
    pub offer_debounce_time: Duration,
    pub find_debounce_time: Duration,
    pub ttl: u32,
}

impl Default for SdConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            multicast: constants::SD_DEFAULT_MULTICAST.parse().unwrap(),
            port: constants::SD_DEFAULT_PORT,
            initial_delay_min: Duration::from_millis(u64::from(
                constants::SD_DEFAULT_INITIAL_DELAY_MIN,
            )),
            initial_delay_max: Duration::from_millis(u64::from(
                constants::SD_DEFAULT_INITIAL_DELAY_MAX,
            )),
            repetitions_base_delay: Duration::from_millis(u64::from(
                constants::SD_DEFAULT_REPETITIONS_BASE_DELAY,
            )),
            repetitions_max: constants::SD_DEFAULT_REPETITIONS_MAX,
            cyclic_offer_delay: Duration::from_millis(u64::from(
                constants::SD_DEFAULT_CYCLIC_OFFER_DELAY,
            )),
            request_response_delay: Duration::from_millis(u64::from(
                constants::SD_DEFAULT_REQUEST_RESPONSE_DELAY,
            )),
            offer_debounce_time: Duration::from_millis(u64::from(
                constants::SD_DEFAULT_OFFER_DEBOUNCE_TIME,
            )),
            find_debounce_time: Duration::from_millis(u64::from(
                constants::SD_DEFAULT_FIND_DEBOUNCE_TIME,
            )),
            ttl: constants::TTL_INFINITE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub memory_interval: Option<Duration>,
    pub status_interval: Option<Duration>,
    pub statistics_interval: Option<Duration>,
    pub version_interval: Option<Duration>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            memory_interval: None,
            status_interval: Some(Duration::from_secs(10)),
            statistics_interval: None,
            version_interval: Some(Duration::from_secs(10)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StatisticsConfig {
    pub interval: Duration,
    pub max_messages: u32,
    pub min_freq: u32,
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            max_messages: 50,
            min_freq: 50,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub max_message_size_reliable: usize,
    pub max_message_size_unreliable: usize,
    pub max_message_size_local: usize,
    pub buffer_shrink_threshold: u32,
    pub send_queue_capacity: usize,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub magic_cookies: bool,
    pub magic_cookie_interval: Duration,
    pub tp_reassembly_timeout: Duration,
    /// Rebind the previous local port when reconnecting, preserving the
    /// endpoint identity seen by the peer.
    pub reconnect_rebind_port: bool,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            max_message_size_reliable: 1024 * 1024,
            max_message_size_unreliable: constants::MAX_MESSAGE_SIZE_UNRELIABLE,
            max_message_size_local: constants::MAX_LOCAL_MESSAGE_SIZE,
            buffer_shrink_threshold: 5,
            send_queue_capacity: 256,
            max_reconnect_attempts: 13,
            reconnect_base_delay: Duration::from_millis(100),
            reconnect_max_delay: Duration::from_secs(10),
            magic_cookies: true,
            magic_cookie_interval: Duration::from_secs(10),
            tp_reassembly_timeout: Duration::from_secs(5),
            reconnect_rebind_port: false,
        }
    }
}

/// Static per-service transport configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub service: u16,
    pub instance: u16,
    pub reliable_port: Option<u16>,
    pub unreliable_port: Option<u16>,
    /// Eventgroup multicast distribution target.
    pub multicast: Option<(IpAddr, u16)>,
}

/// The validated broker configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Logical network name; scopes the local transport socket and the
    /// client-id lockfile.
    pub network: String,
    pub unicast: IpAddr,
    pub prefix_length: u8,
    /// High byte of dynamically assigned client ids.
    pub diagnosis_address: u8,
    pub sd: SdConfig,
    pub logging: LoggingConfig,
    pub statistics: StatisticsConfig,
    pub endpoints: EndpointConfig,
    pub e2e_enabled: bool,
    pub security_enabled: bool,
    pub local_routing: bool,
    pub services: Vec<ServiceConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: "someip".into(),
            unicast: IpAddr::V4(Ipv4Addr::LOCALHOST),
            prefix_length: 24,
            diagnosis_address: 0x01,
            sd: SdConfig::default(),
            logging: LoggingConfig::default(),
            statistics: StatisticsConfig::default(),
            endpoints: EndpointConfig::default(),
            e2e_enabled: false,
            security_enabled: false,
            local_routing: true,
            services: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let b = fs::read_to_string(path)?;
        let c: RawConfig = toml::from_str(&b)?;

        Self::try_from(c)
    }

    /// Path of the local-transport socket for this network.
    pub fn routing_socket(&self) -> PathBuf {
        PathBuf::from(format!("/tmp/someipd-{}", self.network))
    }

    /// Path of the client-id pool lockfile for this network.
    pub fn lockfile(&self) -> PathBuf {
        PathBuf::from(format!("/tmp/someipd-{}.lck", self.network))
    }

    /// Static transport configuration of (service, instance), if any.
    pub fn service(&self, service: u16, instance: u16) -> Option<&ServiceConfig> {
        self.services
            .iter()
            .find(|cfg| cfg.service == service && cfg.instance == instance)
    }
}

impl TryFrom<RawConfig> for Config {
    type Error = ConfigError;

    fn try_from(value: RawConfig) -> Result<Self, ConfigError> {
        let defaults = Config::default();

        let sd_defaults = SdConfig::default();
        let sd_raw = value.service_discovery;

        let multicast = sd_raw.multicast.unwrap_or(sd_defaults.multicast);
        if !multicast.is_multicast() {
            return Err(ConfigError::NotMulticast(multicast));
        }

        let millis =
            |v: Option<u32>, d: Duration| v.map(|v| Duration::from_millis(u64::from(v))).unwrap_or(d);

        let mut initial_delay_min = millis(sd_raw.initial_delay_min, sd_defaults.initial_delay_min);
        let mut initial_delay_max = millis(sd_raw.initial_delay_max, sd_defaults.initial_delay_max);
        if initial_delay_min > initial_delay_max {
            std::mem::swap(&mut initial_delay_min, &mut initial_delay_max);
        }

        let cyclic_offer_delay = millis(sd_raw.cyclic_offer_delay, sd_defaults.cyclic_offer_delay);
        if cyclic_offer_delay.is_zero() {
            return Err(ConfigError::Invalid(
                "service_discovery.cyclic_offer_delay must be non-zero".into(),
            ));
        }

        let sd = SdConfig {
            enabled: sd_raw.enabled.unwrap_or(sd_defaults.enabled),
            multicast,
            port: sd_raw.port.unwrap_or(sd_defaults.port),
            initial_delay_min,
            initial_delay_max,
            repetitions_base_delay: millis(
                sd_raw.repetitions_base_delay,
                sd_defaults.repetitions_base_delay,
            ),
            repetitions_max: sd_raw.repetitions_max.unwrap_or(sd_defaults.repetitions_max),
            cyclic_offer_delay,
            request_response_delay: millis(
                sd_raw.request_response_delay,
                sd_defaults.request_response_delay,
            ),
            offer_debounce_time: millis(sd_raw.offer_debounce_time, sd_defaults.offer_debounce_time),
            find_debounce_time: millis(sd_raw.find_debounce_time, sd_defaults.find_debounce_time),
            ttl: sd_raw.ttl.unwrap_or(sd_defaults.ttl) & constants::TTL_INFINITE,
        };

        let log_defaults = LoggingConfig::default();
        let secs = |v: Option<u64>| v.filter(|v| *v > 0).map(Duration::from_secs);
        let logging = LoggingConfig {
            memory_interval: secs(value.logging.memory_interval).or(log_defaults.memory_interval),
            status_interval: secs(value.logging.status_interval).or(log_defaults.status_interval),
            statistics_interval: secs(value.logging.statistics_interval)
                .or(log_defaults.statistics_interval),
            version_interval: secs(value.logging.version_interval).or(log_defaults.version_interval),
        };

        let stats_defaults = StatisticsConfig::default();
        let statistics = StatisticsConfig {
            interval: value
                .statistics
                .interval
                .map(Duration::from_secs)
                .unwrap_or(stats_defaults.interval),
            max_messages: value
                .statistics
                .max_messages
                .unwrap_or(stats_defaults.max_messages),
            min_freq: value.statistics.min_freq.unwrap_or(stats_defaults.min_freq),
        };

        let ep_defaults = EndpointConfig::default();
        let ep_raw = value.endpoints;
        let endpoints = EndpointConfig {
            max_message_size_reliable: ep_raw
                .max_message_size_reliable
                .unwrap_or(ep_defaults.max_message_size_reliable),
            max_message_size_unreliable: ep_raw
                .max_message_size_unreliable
                .unwrap_or(ep_defaults.max_message_size_unreliable),
            max_message_size_local: ep_raw
                .max_message_size_local
                .unwrap_or(ep_defaults.max_message_size_local),
            buffer_shrink_threshold: ep_raw
                .buffer_shrink_threshold
                .unwrap_or(ep_defaults.buffer_shrink_threshold),
            send_queue_capacity: ep_raw
                .send_queue_capacity
                .unwrap_or(ep_defaults.send_queue_capacity),
            max_reconnect_attempts: ep_raw
                .max_reconnect_attempts
                .unwrap_or(ep_defaults.max_reconnect_attempts),
            reconnect_base_delay: ep_raw
                .reconnect_base_delay
                .map(Duration::from_millis)
                .unwrap_or(ep_defaults.reconnect_base_delay),
            reconnect_max_delay: ep_raw
                .reconnect_max_delay
                .map(Duration::from_millis)
                .unwrap_or(ep_defaults.reconnect_max_delay),
            magic_cookies: ep_raw.magic_cookies.unwrap_or(ep_defaults.magic_cookies),
            magic_cookie_interval: ep_raw
                .magic_cookie_interval
                .map(Duration::from_secs)
                .unwrap_or(ep_defaults.magic_cookie_interval),
            tp_reassembly_timeout: ep_raw
                .tp_reassembly_timeout
                .map(Duration::from_secs)
                .unwrap_or(ep_defaults.tp_reassembly_timeout),
            reconnect_rebind_port: ep_raw
                .reconnect_rebind_port
                .unwrap_or(ep_defaults.reconnect_rebind_port),
        };

        let services = value
            .services
            .into_iter()
            .map(|raw| {
                let multicast = match (raw.multicast, raw.multicast_port) {
                    (Some(address), Some(port)) => {
                        if !address.is_multicast() {
                            return Err(ConfigError::NotMulticast(address));
                        }
                        Some((address, port))
                    }
                    _ => None,
                };
                Ok(ServiceConfig {
                    service: raw.service,
                    instance: raw.instance,
                    reliable_port: raw.reliable_port,
                    unreliable_port: raw.unreliable_port,
                    multicast,
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        Ok(Self {
            network: value.network.unwrap_or(defaults.network),
            unicast: value.unicast.unwrap_or(defaults.unicast),
            prefix_length: value.prefix_length.unwrap_or(defaults.prefix_length),
            diagnosis_address: value.diagnosis_address.unwrap_or(defaults.diagnosis_address),
            sd,
            logging,
            statistics,
            endpoints,
            e2e_enabled: value.e2e_enabled.unwrap_or(defaults.e2e_enabled),
            security_enabled: value.security_enabled.unwrap_or(defaults.security_enabled),
            local_routing: value.local_routing.unwrap_or(defaults.local_routing),
            services,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply() {
        let cfg = Config::try_from(RawConfig::default()).unwrap();
        assert!(cfg.sd.enabled);
        assert_eq!(cfg.sd.port, 30490);
        assert_eq!(cfg.sd.multicast.to_string(), "224.224.224.0");
        assert_eq!(cfg.sd.ttl, 0xFF_FFFF);
        assert!(cfg.local_routing);
    }

    #[test]
    fn parses_toml() {
        let raw: RawConfig = toml::from_str(
            r#"
            network = "car"
            unicast = "192.168.1.10"

            [service_discovery]
            port = 30490
            initial_delay_min = 20
            initial_delay_max = 10
            ttl = 5

            [endpoints]
            send_queue_capacity = 8
            "#,
        )
        .unwrap();

        let cfg = Config::try_from(raw).unwrap();
        assert_eq!(cfg.network, "car");
        assert_eq!(cfg.unicast.to_string(), "192.168.1.10");
        // swapped into order
        assert_eq!(cfg.sd.initial_delay_min, Duration::from_millis(10));
        assert_eq!(cfg.sd.initial_delay_max, Duration::from_millis(20));
        assert_eq!(cfg.sd.ttl, 5);
        assert_eq!(cfg.endpoints.send_queue_capacity, 8);
        assert_eq!(cfg.routing_socket().to_str().unwrap(), "/tmp/someipd-car");
    }

    #[test]
    fn rejects_unicast_sd_group() {
        let raw = RawConfig {
            service_discovery: RawSdOptions {
                multicast: Some("10.0.0.1".parse().unwrap()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(
            Config::try_from(raw),
            Err(ConfigError::NotMulticast(_))
        ));
    }
}
