use crate::models::ConnectionType;
use anyhow::{bail, Result};
use log::{error, info};
use std::collections::HashMap;
use std::time::Duration;
use tokio_serial::FlowControl;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/gnss-uplink.conf";

// Upper bound for every configured duration
pub const MAX_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct Config {
    pub at_config: AtConfig,
    pub uplink: UplinkConfig,
}

#[derive(Debug, Clone)]
pub struct AtConfig {
    pub connection_type: ConnectionType,
    pub network: NetworkConfig,
    pub serial: SerialConfig,
}

#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub host: String,
    pub port: u16,
    pub timeout: u64,
}

#[derive(Debug, Clone)]
pub struct SerialConfig {
    pub port: String,
    pub baudrate: u32,
    /// RTS/CTS by default, as the modem's USB serial bridge expects.
    pub flow_control: FlowControl,
}

/// Settings for one fix-and-upload run.
#[derive(Debug, Clone)]
pub struct UplinkConfig {
    /// Defined with `AT+CNCFG` before activation when set.
    pub apn: Option<String>,
    pub url: String,
    pub gps_poll_interval: Duration,
    pub gps_max_wait: Duration,
    pub cmd_timeout: Duration,
    /// Used for `AT+SHCONN` and `AT+SHREQ`, which wait on the network.
    pub https_timeout: Duration,
    /// `AT+CSSLCFG="sslversion"` value, 3 is TLS 1.2.
    pub tls_version: u8,
    pub body_limit: usize,
}

impl Default for UplinkConfig {
    fn default() -> Self {
        UplinkConfig {
            apn: None,
            url: String::new(),
            gps_poll_interval: Duration::from_secs(2),
            gps_max_wait: Duration::from_secs(120),
            cmd_timeout: Duration::from_secs(5),
            https_timeout: Duration::from_secs(30),
            tls_version: 3,
            body_limit: 4096,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            at_config: AtConfig {
                connection_type: ConnectionType::Serial,
                network: NetworkConfig {
                    host: "192.168.8.1".to_string(),
                    port: 20249,
                    timeout: 10,
                },
                serial: SerialConfig {
                    port: "/dev/ttyUSB2".to_string(),
                    baudrate: 115200,
                    flow_control: FlowControl::Hardware,
                },
            },
            uplink: UplinkConfig::default(),
        }
    }
}

/// `hardware`, `software` or `none`.
pub fn parse_flow_control(value: &str) -> Option<FlowControl> {
    match value.to_ascii_lowercase().as_str() {
        "hardware" | "rtscts" => Some(FlowControl::Hardware),
        "software" | "xonxoff" => Some(FlowControl::Software),
        "none" => Some(FlowControl::None),
        _ => None,
    }
}

/// Parse `key=value` lines. `#` starts a comment line, values may be quoted.
pub fn parse_pairs(text: &str) -> HashMap<String, String> {
    let mut data = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let clean_value = value.trim().trim_matches('\'').trim_matches('"').to_string();
            data.insert(key.trim().to_string(), clean_value);
        }
    }
    data
}

impl Config {
    /// Defaults, then the config file, then environment overrides.
    pub fn load() -> Self {
        let path =
            std::env::var("GNSS_UPLINK_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

        info!("Loading configuration from {}...", path);
        let data = match std::fs::read_to_string(&path) {
            Ok(text) => parse_pairs(&text),
            Err(e) => {
                error!("Failed to read {}: {}. Using default config.", path, e);
                HashMap::new()
            }
        };

        let mut config = Config::from_pairs(&data);
        config.apply_env();

        info!("Loaded configuration: {:?}", config);
        config
    }

    pub fn from_pairs(data: &HashMap<String, String>) -> Self {
        let mut config = Config::default();

        // Helper to get string value
        let get_str = |key: &str, default: &str| -> String {
            data.get(key).cloned().unwrap_or_else(|| default.to_string())
        };

        let get_u64 = |key: &str, default: u64| -> u64 {
            data.get(key).and_then(|s| s.parse().ok()).unwrap_or(default)
        };

        let get_u32 = |key: &str, default: u32| -> u32 {
            data.get(key).and_then(|s| s.parse().ok()).unwrap_or(default)
        };

        let get_u16 = |key: &str, default: u16| -> u16 {
            data.get(key).and_then(|s| s.parse().ok()).unwrap_or(default)
        };

        // Seconds, fractions allowed
        let get_secs = |key: &str, default: Duration| -> Duration {
            data.get(key)
                .and_then(|s| s.parse::<f64>().ok())
                .and_then(|v| Duration::try_from_secs_f64(v).ok())
                .unwrap_or(default)
        };

        // AT Config
        if get_str("connection_type", "SERIAL") == "NETWORK" {
            config.at_config.connection_type = ConnectionType::Network;
        }
        config.at_config.network.host = get_str("network_host", "192.168.8.1");
        config.at_config.network.port = get_u16("network_port", 20249);
        config.at_config.network.timeout = get_u64("network_timeout", 10);
        config.at_config.serial.port = get_str("serial_port", "/dev/ttyUSB2");
        config.at_config.serial.baudrate = get_u32("serial_baudrate", 115200);
        if let Some(flow) = data.get("serial_flow_control") {
            match parse_flow_control(flow) {
                Some(f) => config.at_config.serial.flow_control = f,
                None => error!("Unknown serial_flow_control {:?}, keeping hardware", flow),
            }
        }

        // Uplink Config
        let defaults = UplinkConfig::default();
        let apn = get_str("apn", "");
        config.uplink.apn = if apn.is_empty() { None } else { Some(apn) };
        config.uplink.url = get_str("url", "");
        config.uplink.gps_poll_interval = get_secs("gps_poll_interval", defaults.gps_poll_interval);
        config.uplink.gps_max_wait = get_secs("gps_max_wait", defaults.gps_max_wait);
        config.uplink.cmd_timeout = get_secs("cmd_timeout", defaults.cmd_timeout);
        config.uplink.https_timeout = get_secs("https_timeout", defaults.https_timeout);
        config.uplink.tls_version = data
            .get("tls_version")
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.tls_version);
        config.uplink.body_limit = get_u64("body_limit", defaults.body_limit as u64) as usize;

        config
    }

    fn apply_env(&mut self) {
        if let Ok(val) = std::env::var("AT_CONNECTION_TYPE") {
            match val.as_str() {
                "SERIAL" => self.at_config.connection_type = ConnectionType::Serial,
                "NETWORK" => self.at_config.connection_type = ConnectionType::Network,
                _ => {}
            }
        }
        if let Ok(val) = std::env::var("AT_NETWORK_HOST") { self.at_config.network.host = val; }
        if let Ok(val) = std::env::var("AT_NETWORK_PORT") {
            if let Ok(p) = val.parse() { self.at_config.network.port = p; }
        }
        if let Ok(val) = std::env::var("AT_SERIAL_PORT") { self.at_config.serial.port = val; }
        if let Ok(val) = std::env::var("AT_SERIAL_BAUDRATE") {
            if let Ok(b) = val.parse() { self.at_config.serial.baudrate = b; }
        }
        if let Ok(val) = std::env::var("UPLINK_APN") {
            self.uplink.apn = if val.is_empty() { None } else { Some(val) };
        }
        if let Ok(val) = std::env::var("UPLINK_URL") { self.uplink.url = val; }
    }

    pub fn validate(&self) -> Result<()> {
        let uplink = &self.uplink;
        if uplink.url.is_empty() {
            bail!("url is not configured");
        }
        if !uplink.url.starts_with("https://") {
            bail!("url must start with https://, got {}", uplink.url);
        }
        if uplink.gps_poll_interval.is_zero() {
            bail!("gps_poll_interval must be greater than zero");
        }
        if uplink.gps_max_wait < uplink.gps_poll_interval {
            bail!(
                "gps_max_wait ({:?}) is shorter than gps_poll_interval ({:?})",
                uplink.gps_max_wait,
                uplink.gps_poll_interval
            );
        }
        if uplink.cmd_timeout.is_zero() {
            bail!("cmd_timeout must be greater than zero");
        }
        let durations = [
            ("gps_poll_interval", uplink.gps_poll_interval),
            ("gps_max_wait", uplink.gps_max_wait),
            ("cmd_timeout", uplink.cmd_timeout),
            ("https_timeout", uplink.https_timeout),
            ("network_timeout", Duration::from_secs(self.at_config.network.timeout)),
        ];
        for (key, value) in durations {
            if value > MAX_DURATION {
                bail!("{} of {:?} exceeds the {:?} limit", key, value, MAX_DURATION);
            }
        }
        Ok(())
    }
}
