use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_yml;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::prelude::*;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::kamstrup::registers::{find_register, Register, KAMSTRUP_403};

/// Environment variable pointing to a config file outside the default locations
pub const CONFIG_PATH_ENV: &str = "K2M_CONFIG";
const CONFIG_LOCATIONS: [&str; 2] = ["config/kamstrup2mqtt.yaml", "kamstrup2mqtt.yaml"];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unable to find a config file in {0:?}")]
    NotFound(Vec<PathBuf>),
    #[error("Unable to read config file {path:?}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("Unable to parse config file: {0}")]
    Parse(#[from] serde_yml::Error),
    #[error("No serial port configured")]
    EmptyPort,
    #[error("Baud rate must not be zero")]
    InvalidBaudRate,
    #[error("Read timeout must not be zero")]
    InvalidTimeout,
    #[error("Scan interval must be at least one second")]
    InvalidScanInterval,
    #[error("Unknown register {0:?}")]
    UnknownRegister(String),
    #[error("Register {0:#06x} is configured twice")]
    DuplicateRegister(u16),
    #[error("No register enabled, there is nothing to poll")]
    NoRegisters,
}

fn meter_name_default() -> String { return "kamstrup_403".to_string() }
fn meter_baud_rate_default() -> u32 { return 1200 }
fn meter_timeout_ms_default() -> u64 { return 1000 }
fn meter_scan_interval_default() -> u64 { return 3600 }
fn meter_register_delay_ms_default() -> u64 { return 1000 }

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct MeterConfig {
    #[serde(default="meter_name_default")]
    pub name: String,
    pub port: String,
    #[serde(default="meter_baud_rate_default")]
    pub baud_rate: u32,
    #[serde(default="meter_timeout_ms_default")]
    pub timeout_ms: u64,
    /// Seconds between two poll cycles
    #[serde(default="meter_scan_interval_default")]
    pub scan_interval: u64,
    /// Pause between two register reads, the meter needs some time to turn around
    #[serde(default="meter_register_delay_ms_default")]
    pub register_delay_ms: u64,
    /// Enable flags by register key, registers not listed here are enabled
    #[serde(default)]
    pub registers: BTreeMap<String, bool>,
}

impl MeterConfig {
    pub fn new(port: &str) -> Self {
        return MeterConfig {
            name: meter_name_default(),
            port: port.to_string(),
            baud_rate: meter_baud_rate_default(),
            timeout_ms: meter_timeout_ms_default(),
            scan_interval: meter_scan_interval_default(),
            register_delay_ms: meter_register_delay_ms_default(),
            registers: BTreeMap::new(),
        };
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval)
    }

    pub fn register_delay(&self) -> Duration {
        Duration::from_millis(self.register_delay_ms)
    }

    /// Returns the poll plan: all catalogue registers minus the disabled ones,
    /// in catalogue order.
    pub fn enabled_registers(&self) -> Result<Vec<Register>, ConfigError> {
        for key in self.registers.keys() {
            if find_register(key).is_none() {
                return Err(ConfigError::UnknownRegister(key.clone()));
            }
        }

        let plan: Vec<Register> = KAMSTRUP_403.iter()
            .filter(|r| *self.registers.get(&r.key).unwrap_or(&true))
            .cloned()
            .collect();

        if plan.is_empty() {
            return Err(ConfigError::NoRegisters);
        }

        return Ok(plan);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port.trim().is_empty() {
            return Err(ConfigError::EmptyPort);
        }
        if self.baud_rate == 0 {
            return Err(ConfigError::InvalidBaudRate);
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::InvalidTimeout);
        }
        if self.scan_interval == 0 {
            return Err(ConfigError::InvalidScanInterval);
        }

        self.enabled_registers()?;
        Ok(())
    }
}

fn mqtt_port_default() -> u16 { return 1883 }
fn mqtt_client_name_default() -> String { return "kamstrup2mqtt".to_string() }
fn mqtt_base_topic_default() -> String { return "kamstrup2mqtt".to_string() }

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default="mqtt_port_default")]
    pub port: u16,
    pub user: Option<String>,
    pub pass: Option<String>,
    #[serde(default="mqtt_client_name_default")]
    pub client_name: String,
    #[serde(default="mqtt_base_topic_default")]
    pub base_topic: String,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct Config {
    pub meter: MeterConfig,
    pub mqtt: Option<MqttConfig>,
}

impl Config {
    /// Loads the config from `K2M_CONFIG` or, if unset, from the first
    /// default location that exists.
    pub fn load() -> Result<Self, ConfigError> {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            return Config::load_from(path);
        }

        for location in CONFIG_LOCATIONS {
            if Path::new(location).exists() {
                return Config::load_from(location);
            }
            debug!("No config at {location}");
        }

        Err(ConfigError::NotFound(CONFIG_LOCATIONS.into_iter().map(PathBuf::from).collect()))
    }

    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let io_error = |source| ConfigError::Io { path: path.to_path_buf(), source };

        let mut file = File::open(path).map_err(io_error)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents).map_err(io_error)?;

        info!("Using config {path:?}");
        Config::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let c: Config = serde_yml::from_str(contents)?;
        c.meter.validate()?;
        return Ok(c);
    }
}
