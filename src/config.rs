use anyhow::{Context, Result};
use serde::Deserialize;
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tokio::fs;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub streams: StreamConfig,
    #[serde(default)]
    pub mission: MissionConfig,
    pub endpoint: Option<EndpointConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GeneralConfig {
    /// Our own system id on the link (255 = ground station)
    #[serde(default = "default_system_id")]
    pub system_id: u8,
    #[serde(default = "default_component_id")]
    pub component_id: u8,
    /// Overrides the target learned from the first heartbeat
    pub target_system: Option<u8>,
    pub target_component: Option<u8>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            system_id: default_system_id(),
            component_id: default_component_id(),
            target_system: None,
            target_component: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            event_queue_capacity: default_event_queue_capacity(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReconnectConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_reconnect_delay_ms")]
    pub delay_ms: u64,
    /// Upper bound for the delay when `multiplier` > 1. Defaults to `delay_ms`.
    pub max_delay_ms: Option<u64>,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            delay_ms: default_reconnect_delay_ms(),
            max_delay_ms: None,
            multiplier: default_multiplier(),
            max_attempts: default_max_attempts(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StreamConfig {
    #[serde(default = "default_stream_rate_hz")]
    pub default_rate_hz: u16,
    #[serde(default = "default_true")]
    pub request_on_connect: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            default_rate_hz: default_stream_rate_hz(),
            request_on_connect: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct MissionConfig {
    /// Abort an upload (or re-request a download item) after this long without progress.
    pub stall_timeout_ms: Option<u64>,
}

const MAX_RECONNECT_MULTIPLIER: f64 = 10.0;

fn default_system_id() -> u8 { 255 }
fn default_component_id() -> u8 { 190 }
fn default_connect_timeout_ms() -> u64 { 10_000 }
fn default_event_queue_capacity() -> usize { 10_000 }
fn default_shutdown_timeout_ms() -> u64 { 2_000 }
fn default_reconnect_delay_ms() -> u64 { 5_000 }
fn default_multiplier() -> f64 { 1.0 }
fn default_max_attempts() -> u32 { 10 }
fn default_stream_rate_hz() -> u16 { 4 }
fn default_baud() -> u32 { 57_600 }
fn default_true() -> bool { true }

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(tag = "type")]
#[serde(rename_all = "lowercase")]
pub enum EndpointConfig {
    Serial {
        device: String,
        #[serde(default = "default_baud")]
        baud: u32,
    },
    Tcp {
        address: String,
    },
    Udp {
        address: String,
        #[serde(default = "default_mode_server")]
        mode: EndpointMode,
    },
}

#[derive(Debug, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum EndpointMode {
    Client,
    Server,
}

fn default_mode_server() -> EndpointMode { EndpointMode::Server }

impl fmt::Display for EndpointConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointConfig::Serial { device, baud } => write!(f, "serial:{}:{}", device, baud),
            EndpointConfig::Tcp { address } => write!(f, "tcp:{}", address),
            EndpointConfig::Udp { address, mode: EndpointMode::Server } => {
                write!(f, "udpin:{}", address)
            }
            EndpointConfig::Udp { address, mode: EndpointMode::Client } => {
                write!(f, "udpout:{}", address)
            }
        }
    }
}

/// Parses connection strings of the form `serial:/dev/ttyACM0:57600`,
/// `tcp:host:port`, `udpin:addr:port` and `udpout:host:port`.
impl FromStr for EndpointConfig {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (scheme, rest) = s
            .split_once(':')
            .with_context(|| format!("Missing scheme in endpoint '{}'", s))?;
        if rest.is_empty() {
            anyhow::bail!("Missing address in endpoint '{}'", s);
        }

        match scheme {
            "serial" => {
                // Optional trailing ":<baud>"
                let (device, baud) = match rest.rsplit_once(':') {
                    Some((device, baud)) if baud.chars().all(|c| c.is_ascii_digit()) => {
                        let baud = baud
                            .parse()
                            .with_context(|| format!("Invalid baud rate in '{}'", s))?;
                        (device.to_string(), baud)
                    }
                    _ => (rest.to_string(), default_baud()),
                };
                Ok(EndpointConfig::Serial { device, baud })
            }
            "tcp" | "tcpout" => Ok(EndpointConfig::Tcp {
                address: rest.to_string(),
            }),
            "udp" | "udpin" => Ok(EndpointConfig::Udp {
                address: rest.to_string(),
                mode: EndpointMode::Server,
            }),
            "udpout" => Ok(EndpointConfig::Udp {
                address: rest.to_string(),
                mode: EndpointMode::Client,
            }),
            other => anyhow::bail!("Unsupported endpoint scheme '{}'", other),
        }
    }
}

impl EndpointConfig {
    pub fn validate(&self) -> Result<()> {
        match self {
            EndpointConfig::Serial { device, baud } => {
                if *baud == 0 {
                    anyhow::bail!("Serial endpoint {} has baud rate 0", device);
                }
                #[cfg(unix)]
                if !Path::new(device).exists() {
                    tracing::warn!("Serial device {} does not exist", device);
                }
            }
            EndpointConfig::Udp {
                address,
                mode: EndpointMode::Server,
            } => {
                address
                    .parse::<SocketAddr>()
                    .with_context(|| format!("Invalid UDP bind address '{}'", address))?;
            }
            EndpointConfig::Tcp { address }
            | EndpointConfig::Udp {
                address,
                mode: EndpointMode::Client,
            } => {
                // Host names are resolved at connect time; only require a port.
                let port = address
                    .rsplit_once(':')
                    .map(|(_, port)| port)
                    .with_context(|| format!("Missing port in address '{}'", address))?;
                port.parse::<u16>()
                    .with_context(|| format!("Invalid port in address '{}'", address))?;
            }
        }
        Ok(())
    }
}

impl Config {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .await
            .context("Failed to read config file")?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse config file")?;

        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.general.system_id == 0 {
            anyhow::bail!("system_id 0 is reserved for broadcast");
        }

        if self.general.event_queue_capacity < 10 {
            anyhow::bail!(
                "event_queue_capacity too small: {}",
                self.general.event_queue_capacity
            );
        }

        let reconnect = &self.reconnect;
        if !(1.0..=MAX_RECONNECT_MULTIPLIER).contains(&reconnect.multiplier) {
            anyhow::bail!(
                "reconnect multiplier must be between 1.0 and {}, got {}",
                MAX_RECONNECT_MULTIPLIER,
                reconnect.multiplier
            );
        }
        if let Some(max) = reconnect.max_delay_ms {
            if max < reconnect.delay_ms {
                anyhow::bail!(
                    "reconnect max_delay_ms ({}) is below delay_ms ({})",
                    max,
                    reconnect.delay_ms
                );
            }
        }
        if reconnect.enabled && reconnect.max_attempts == 0 {
            anyhow::bail!("reconnect is enabled but max_attempts is 0");
        }

        if let Some(endpoint) = &self.endpoint {
            endpoint.validate().context("Invalid [endpoint]")?;
        }

        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.general.connect_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.general.shutdown_timeout_ms)
    }

    pub fn stall_timeout(&self) -> Option<Duration> {
        self.mission.stall_timeout_ms.map(Duration::from_millis)
    }
}

impl ReconnectConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms.unwrap_or(self.delay_ms))
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse("").expect("empty config is valid");
        assert_eq!(config.general.system_id, 255);
        assert_eq!(config.general.component_id, 190);
        assert_eq!(config.reconnect.max_attempts, 10);
        assert_eq!(config.reconnect.delay(), Duration::from_secs(5));
        assert_eq!(config.reconnect.max_delay(), Duration::from_secs(5));
        assert_eq!(config.streams.default_rate_hz, 4);
        assert!(config.stall_timeout().is_none());
        assert!(config.endpoint.is_none());
    }

    #[test]
    fn test_full_config() {
        let toml = r#"
            [general]
            system_id = 250
            connect_timeout_ms = 3000

            [reconnect]
            delay_ms = 500
            max_delay_ms = 4000
            multiplier = 2.0
            max_attempts = 3

            [mission]
            stall_timeout_ms = 1500

            [endpoint]
            type = "serial"
            device = "/dev/ttyACM0"
            baud = 115200
        "#;
        let config = Config::parse(toml).expect("valid config");
        assert_eq!(config.general.system_id, 250);
        assert_eq!(config.connect_timeout(), Duration::from_secs(3));
        assert_eq!(config.reconnect.max_delay(), Duration::from_secs(4));
        assert_eq!(config.stall_timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(
            config.endpoint,
            Some(EndpointConfig::Serial {
                device: "/dev/ttyACM0".to_string(),
                baud: 115200
            })
        );
    }

    #[test]
    fn test_validation_failures() {
        assert!(Config::parse("[general]\nevent_queue_capacity = 2").is_err());
        assert!(Config::parse("[reconnect]\nmultiplier = 0.5").is_err());
        assert!(Config::parse("[reconnect]\nmultiplier = 1e30").is_err());
        assert!(Config::parse("[reconnect]\nmultiplier = nan").is_err());
        assert!(Config::parse("[reconnect]\nmultiplier = 10.0").is_ok());
        assert!(Config::parse("[reconnect]\ndelay_ms = 1000\nmax_delay_ms = 10").is_err());
        assert!(Config::parse("[reconnect]\nmax_attempts = 0").is_err());
        assert!(Config::parse("[reconnect]\nenabled = false\nmax_attempts = 0").is_ok());
        assert!(
            Config::parse("[endpoint]\ntype = \"udp\"\naddress = \"not-an-addr\"").is_err()
        );
    }

    #[test]
    fn test_endpoint_strings() {
        let serial: EndpointConfig = "serial:/dev/ttyUSB0:921600".parse().expect("serial");
        assert_eq!(
            serial,
            EndpointConfig::Serial {
                device: "/dev/ttyUSB0".to_string(),
                baud: 921600
            }
        );

        let serial: EndpointConfig = "serial:COM3".parse().expect("serial without baud");
        assert_eq!(
            serial,
            EndpointConfig::Serial {
                device: "COM3".to_string(),
                baud: 57600
            }
        );

        let udp: EndpointConfig = "udpin:0.0.0.0:14550".parse().expect("udpin");
        assert_eq!(udp.to_string(), "udpin:0.0.0.0:14550");
        assert!(udp.validate().is_ok());

        let out: EndpointConfig = "udpout:localhost:14551".parse().expect("udpout");
        assert!(out.validate().is_ok());

        let tcp: EndpointConfig = "tcp:127.0.0.1:5760".parse().expect("tcp");
        assert_eq!(tcp.to_string(), "tcp:127.0.0.1:5760");

        assert!("ftp:host:21".parse::<EndpointConfig>().is_err());
        assert!("tcp:".parse::<EndpointConfig>().is_err());
        assert!("tcp:localhost".parse::<EndpointConfig>().expect("parses").validate().is_err());
    }
}
