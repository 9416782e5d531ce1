//! Configuration module
//!
//! Handles loading and saving RailFi configuration.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::network::{DispatcherConfig, SessionConfig};
use crate::protocol::handshake::{StationCredentials, SECRET_LEN};
use crate::protocol::{pairing_network_name, Dialect, DEFAULT_DISCOVERY_PORT, DEFAULT_RENDEZVOUS_PORT};
use crate::vehicle::PairingConfig;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Missing required entry: {0}")]
    MissingEntry(&'static str),

    #[error("Invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Operational session settings, shared by station and vehicle
    #[serde(default)]
    pub session: SessionSettings,

    /// Station settings
    #[serde(default)]
    pub station: StationConfig,

    /// Vehicle settings
    #[serde(default)]
    pub vehicle: VehicleConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Human-readable name for this node
    pub name: String,
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
    /// Use simulated actuators and radio on a vehicle
    #[serde(default)]
    pub simulate: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            name: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            verbose: false,
            simulate: false,
        }
    }
}

/// Session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Wire dialect, `sequential` or `correlated`
    #[serde(default)]
    pub dialect: Dialect,
    /// Read attempts before a command gives up
    #[serde(default = "default_response_attempts")]
    pub response_attempts: u32,
    /// Wait per read attempt in ms
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout_ms: u64,
}

fn default_response_attempts() -> u32 {
    10
}

fn default_attempt_timeout() -> u64 {
    200
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            dialect: Dialect::default(),
            response_attempts: default_response_attempts(),
            attempt_timeout_ms: default_attempt_timeout(),
        }
    }
}

/// Station configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationConfig {
    /// Interface to bind to (default: all)
    pub bind_address: Option<String>,
    /// Well-known rendezvous port
    #[serde(default = "default_rendezvous_port")]
    pub rendezvous_port: u16,
    /// First dedicated port (default: rendezvous port + 1)
    pub dedicated_port_base: Option<u16>,
    /// How many dedicated ports may be tried from the base
    #[serde(default = "default_dedicated_port_count")]
    pub dedicated_port_count: u16,
    /// Time a redirected vehicle has to reach its dedicated port, in ms
    #[serde(default = "default_handoff_timeout")]
    pub handoff_timeout_ms: u64,
    /// Permanent network vehicles are told to join
    #[serde(default)]
    pub network_name: String,
    #[serde(default)]
    pub network_secret: String,
    /// Address vehicles reach the dispatcher at on that network
    #[serde(default)]
    pub address: String,
    /// Timeout for pushing credentials to a vehicle, in ms
    #[serde(default = "default_pair_timeout")]
    pub pair_timeout_ms: u64,
}

fn default_rendezvous_port() -> u16 {
    DEFAULT_RENDEZVOUS_PORT
}

fn default_dedicated_port_count() -> u16 {
    256
}

fn default_handoff_timeout() -> u64 {
    1000
}

fn default_pair_timeout() -> u64 {
    10_000
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            bind_address: None,
            rendezvous_port: default_rendezvous_port(),
            dedicated_port_base: None,
            dedicated_port_count: default_dedicated_port_count(),
            handoff_timeout_ms: default_handoff_timeout(),
            network_name: String::new(),
            network_secret: String::new(),
            address: String::new(),
            pair_timeout_ms: default_pair_timeout(),
        }
    }
}

/// Vehicle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VehicleConfig {
    pub road_name: Option<String>,
    pub road_acronym: Option<String>,
    pub loco_number: Option<String>,
    pub loco_model: Option<String>,
    /// Shared secret a controller must present when pairing
    pub secret: Option<String>,
    pub model_manufacturer: Option<String>,
    /// Port controllers connect to while pairing
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    #[serde(default = "default_join_attempts")]
    pub join_attempts: u32,
    #[serde(default = "default_join_retry")]
    pub join_retry_ms: u64,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,
    /// Skip pairing and connect straight to this station (host:port)
    pub station: Option<String>,
    /// Hardware wiring
    #[serde(default)]
    pub hardware: HardwareConfig,
}

fn default_discovery_port() -> u16 {
    DEFAULT_DISCOVERY_PORT
}

fn default_join_attempts() -> u32 {
    5
}

fn default_join_retry() -> u64 {
    2000
}

fn default_retry_delay() -> u64 {
    5000
}

fn default_handshake_timeout() -> u64 {
    10_000
}

impl Default for VehicleConfig {
    fn default() -> Self {
        Self {
            road_name: None,
            road_acronym: None,
            loco_number: None,
            loco_model: None,
            secret: None,
            model_manufacturer: None,
            discovery_port: default_discovery_port(),
            join_attempts: default_join_attempts(),
            join_retry_ms: default_join_retry(),
            retry_delay_ms: default_retry_delay(),
            handshake_timeout_ms: default_handshake_timeout(),
            station: None,
            hardware: HardwareConfig::default(),
        }
    }
}

/// Pins and devices of a Linux vehicle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareConfig {
    #[serde(default = "default_headlight_gpio")]
    pub headlight_gpio: u32,
    #[serde(default = "default_rear_light_gpio")]
    pub rear_light_gpio: u32,
    #[serde(default)]
    pub pwm_chip: u32,
    #[serde(default)]
    pub pwm_channel: u32,
    /// PWM period in ns
    #[serde(default = "default_pwm_period")]
    pub pwm_period_ns: u32,
    #[serde(default = "default_direction_gpio")]
    pub direction_gpio: u32,
    #[serde(default = "default_wifi_interface")]
    pub wifi_interface: String,
}

fn default_headlight_gpio() -> u32 {
    32
}

fn default_rear_light_gpio() -> u32 {
    33
}

fn default_pwm_period() -> u32 {
    50_000 // 20 kHz
}

fn default_direction_gpio() -> u32 {
    25
}

fn default_wifi_interface() -> String {
    "wlan0".to_string()
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            headlight_gpio: default_headlight_gpio(),
            rear_light_gpio: default_rear_light_gpio(),
            pwm_chip: 0,
            pwm_channel: 0,
            pwm_period_ns: default_pwm_period(),
            direction_gpio: default_direction_gpio(),
            wifi_interface: default_wifi_interface(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("railfi/config.toml")),
            Some(PathBuf::from("./railfi.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                return Self::load(path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Check the entries a vehicle cannot run without
    pub fn validate_vehicle(&self) -> ConfigResult<()> {
        let vehicle = &self.vehicle;
        let required = [
            ("road_name", &vehicle.road_name),
            ("road_acronym", &vehicle.road_acronym),
            ("loco_number", &vehicle.loco_number),
            ("loco_model", &vehicle.loco_model),
            ("secret", &vehicle.secret),
            ("model_manufacturer", &vehicle.model_manufacturer),
        ];
        for (name, value) in required {
            if value.as_deref().map_or(true, str::is_empty) {
                return Err(ConfigError::MissingEntry(name));
            }
        }

        // A longer secret could never be sent in full by a controller
        if let Some(secret) = vehicle.secret.as_deref() {
            if secret.len() > SECRET_LEN {
                return Err(ConfigError::InvalidValue {
                    field: "vehicle.secret",
                    value: format!("{} bytes, at most {} allowed", secret.len(), SECRET_LEN),
                });
            }
        }
        Ok(())
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            dialect: self.session.dialect,
            response_attempts: self.session.response_attempts,
            attempt_timeout: Duration::from_millis(self.session.attempt_timeout_ms),
        }
    }

    pub fn dispatcher_config(&self) -> ConfigResult<DispatcherConfig> {
        let station = &self.station;
        let bind_address = match &station.bind_address {
            Some(addr) => addr.parse().map_err(|_| ConfigError::InvalidValue {
                field: "station.bind_address",
                value: addr.clone(),
            })?,
            None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        };
        Ok(DispatcherConfig {
            bind_address,
            rendezvous_port: station.rendezvous_port,
            dedicated_port_base: station
                .dedicated_port_base
                .unwrap_or_else(|| station.rendezvous_port.saturating_add(1)),
            dedicated_port_count: station.dedicated_port_count,
            handoff_timeout: Duration::from_millis(station.handoff_timeout_ms),
        })
    }

    pub fn pairing_config(&self) -> PairingConfig {
        let vehicle = &self.vehicle;
        PairingConfig {
            discovery_port: vehicle.discovery_port,
            join_attempts: vehicle.join_attempts.max(1),
            join_retry: Duration::from_millis(vehicle.join_retry_ms),
            retry_delay: Duration::from_millis(vehicle.retry_delay_ms),
            handshake_timeout: Duration::from_millis(vehicle.handshake_timeout_ms),
            ..Default::default()
        }
    }

    /// Credentials the station hands to vehicles when pairing
    pub fn station_credentials(&self) -> ConfigResult<StationCredentials> {
        let station = &self.station;
        for (name, value) in [
            ("station.network_name", &station.network_name),
            ("station.address", &station.address),
        ] {
            if value.is_empty() {
                return Err(ConfigError::MissingEntry(name));
            }
        }
        Ok(StationCredentials {
            network_name: station.network_name.clone(),
            network_secret: station.network_secret.clone(),
            address: station.address.clone(),
            rendezvous_port: station.rendezvous_port,
        })
    }

    /// Temporary network name the vehicle advertises while pairing
    pub fn vehicle_network_name(&self) -> ConfigResult<String> {
        let acronym = self
            .vehicle
            .road_acronym
            .as_deref()
            .ok_or(ConfigError::MissingEntry("road_acronym"))?;
        let number = self
            .vehicle
            .loco_number
            .as_deref()
            .ok_or(ConfigError::MissingEntry("loco_number"))?;
        Ok(pairing_network_name(acronym, number))
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        general: GeneralConfig {
            name: "layout-station".to_string(),
            verbose: false,
            simulate: false,
        },
        station: StationConfig {
            network_name: "RailFiStation".to_string(),
            network_secret: "trackside".to_string(),
            address: "192.168.50.1".to_string(),
            ..Default::default()
        },
        vehicle: VehicleConfig {
            road_name: Some("Union Station Switching Company".to_string()),
            road_acronym: Some("USSC".to_string()),
            loco_number: Some("148".to_string()),
            loco_model: Some("SW1500".to_string()),
            secret: Some("abc123".to_string()),
            model_manufacturer: Some("Athearn".to_string()),
            ..Default::default()
        },
        ..Default::default()
    };

    Ok(toml::to_string_pretty(&config)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.station.rendezvous_port, DEFAULT_RENDEZVOUS_PORT);
        assert_eq!(config.vehicle.discovery_port, DEFAULT_DISCOVERY_PORT);
        assert_eq!(config.session.dialect, Dialect::Sequential);
        assert_eq!(config.dispatcher_config().unwrap().dedicated_port_base, 4001);
    }

    #[test]
    fn test_save_and_load() {
        let mut config = Config::default();
        config.session.dialect = Dialect::Correlated;
        let file = NamedTempFile::new().unwrap();

        config.save(file.path()).unwrap();

        let loaded = Config::load(file.path()).unwrap();
        assert_eq!(loaded.session.dialect, Dialect::Correlated);
        assert_eq!(loaded.station.rendezvous_port, config.station.rendezvous_port);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[session]\ndialect = \"correlated\"\n\n[vehicle]\nloco_number = \"7\"").unwrap();

        let loaded = Config::load(file.path()).unwrap();
        assert_eq!(loaded.session.dialect, Dialect::Correlated);
        assert_eq!(loaded.session.response_attempts, 10);
        assert_eq!(loaded.vehicle.loco_number.as_deref(), Some("7"));
        assert_eq!(loaded.vehicle.hardware.headlight_gpio, 32);
    }

    #[test]
    fn test_sample_config() {
        let sample = generate_sample_config().unwrap();
        let parsed: Config = toml::from_str(&sample).unwrap();
        assert_eq!(parsed.general.name, "layout-station");
        parsed.validate_vehicle().unwrap();
        assert_eq!(parsed.vehicle_network_name().unwrap(), "RailFi_USSC_148");
        assert_eq!(parsed.station_credentials().unwrap().rendezvous_port, 4000);
    }

    #[test]
    fn test_validate_reports_first_missing_entry() {
        let mut config: Config = toml::from_str(&generate_sample_config().unwrap()).unwrap();
        config.vehicle.loco_number = None;
        config.vehicle.secret = Some(String::new());
        assert!(matches!(
            config.validate_vehicle(),
            Err(ConfigError::MissingEntry("loco_number"))
        ));
    }

    #[test]
    fn test_validate_rejects_long_secret() {
        let mut config: Config = toml::from_str(&generate_sample_config().unwrap()).unwrap();
        config.vehicle.secret = Some("x".repeat(SECRET_LEN));
        config.validate_vehicle().unwrap();

        config.vehicle.secret = Some("x".repeat(SECRET_LEN + 4));
        assert!(matches!(
            config.validate_vehicle(),
            Err(ConfigError::InvalidValue { field: "vehicle.secret", .. })
        ));
    }

    #[test]
    fn test_bad_bind_address() {
        let mut config = Config::default();
        config.station.bind_address = Some("not-an-ip".to_string());
        assert!(matches!(
            config.dispatcher_config(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }
}
