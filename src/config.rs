//! Bridge Configuration
//!
//! Strongly-typed settings loaded from a TOML file merged with
//! `WTP_BRIDGE_`-prefixed environment variables. Nothing the deployment
//! cares about is compiled in: serial device and baud rate, PLC endpoint
//! and unit ids, the Modbus address map, the loop's backoff/reconnect
//! policy, persistence, and log level all come from here.
//!
//! Every field has a default matching the deployed plant, so an empty file
//! (or no file at all) yields a working configuration for the original
//! site.
//!
//! # Example
//! ```no_run
//! use wtp_bridge::config::BridgeSettings;
//!
//! let settings = BridgeSettings::load_from("config/default.toml")?;
//! settings.validate()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::gateway::AddressMap;

/// Environment variable prefix for overrides, e.g.
/// `WTP_BRIDGE_PLC_HOST=10.0.0.2`.
pub const ENV_PREFIX: &str = "WTP_BRIDGE_";

/// Top-level bridge configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSettings {
    pub application: ApplicationSettings,
    pub serial: SerialSettings,
    pub plc: PlcSettings,
    pub policy: PolicySettings,
    pub persistence: PersistenceSettings,
}

/// Application-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationSettings {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// The microcontroller serial link.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    /// Serial device path, e.g. `/dev/serial0` or `COM3`.
    pub port: String,
    pub baud_rate: u32,
    /// Per-read timeout; also the idle cadence between shutdown checks.
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: "/dev/serial0".to_string(),
            baud_rate: 115_200,
            read_timeout: Duration::from_secs(1),
        }
    }
}

/// The PLC Modbus TCP endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlcSettings {
    pub host: String,
    pub port: u16,
    /// Bound on every individual Modbus call.
    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,
    pub address_map: AddressMap,
}

impl Default for PlcSettings {
    fn default() -> Self {
        Self {
            host: "192.168.0.101".to_string(),
            port: 502,
            call_timeout: Duration::from_secs(1),
            address_map: AddressMap::default(),
        }
    }
}

impl PlcSettings {
    /// The endpoint as a socket address.
    pub fn socket_addr(&self) -> Result<SocketAddr, String> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| format!("invalid PLC endpoint '{}:{}': {e}", self.host, self.port))
    }
}

/// How the loop reacts to cycle failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicySettings {
    /// Sleep after any failed cycle before retrying.
    #[serde(with = "humantime_serde")]
    pub backoff: Duration,
    /// Consecutive failed cycles before the gateway is asked to
    /// re-establish its session. Zero disables reconnection, leaving the
    /// plain sleep-and-retry baseline.
    pub reconnect_after: u32,
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            backoff: Duration::from_secs(1),
            reconnect_after: 5,
        }
    }
}

/// Where cycle records go.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceSettings {
    pub enabled: bool,
    /// Directory for the per-run CSV files.
    pub output_dir: PathBuf,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            output_dir: PathBuf::from("data"),
        }
    }
}

impl BridgeSettings {
    /// Load from the default file location merged with the environment.
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from("config/default.toml")
    }

    /// Load from a specific TOML file merged with `WTP_BRIDGE_` variables.
    /// A missing file is not an error; defaults and the environment apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("_"))
            .extract()
    }

    /// Semantic checks that parsing cannot express.
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(format!(
                "invalid log_level '{}', must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.serial.port.is_empty() {
            return Err("serial.port must not be empty".to_string());
        }
        if self.serial.baud_rate == 0 {
            return Err("serial.baud_rate must be non-zero".to_string());
        }

        self.plc.socket_addr()?;

        let actuators = self.plc.address_map.actuator_count;
        if !(1..=16).contains(&actuators) {
            return Err(format!(
                "plc.address_map.actuator_count must be 1-16, got {actuators}"
            ));
        }

        if self.policy.backoff.is_zero() {
            return Err("policy.backoff must be non-zero".to_string());
        }

        Ok(())
    }
}
