//! YAML configuration for connections and the devices polled through them.
//!
//! ```yaml
//! connection:
//!   type: rtu-over-tcp
//!   address: 10.0.0.5:502
//!   timeout: 1s
//!   connect_delay: 500ms
//! devices:
//!   - slave: 1
//!     name: main meter
//!     address: 0x0000
//!     count: 2
//!   - slave: 2
//!     kind: input
//!     address: 0x0010
//!     count: 4
//! ```

use crate::{
    connection::{Connection, RtuOverTcp, Tcp},
    handler::HandlerConfig,
    logger::LogLogger,
    Error, Result,
};
use serde::{Deserialize, Serialize};
use std::{path::Path, sync::Arc, time::Duration};

#[cfg(feature = "serial")]
use crate::{connection::Rtu, serial::SerialSettings};

/// Where to connect to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EndpointConfig {
    Tcp {
        address: String,
    },
    RtuOverTcp {
        address: String,
    },
    #[cfg(feature = "serial")]
    Rtu(SerialSettings),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(flatten)]
    pub endpoint: EndpointConfig,
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    pub connect_delay: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    pub idle_timeout: Option<Duration>,
    /// Forward transport diagnostics to the `log` facade under this target.
    #[serde(default)]
    pub log_target: Option<String>,
}

impl ConnectionConfig {
    pub fn new(endpoint: EndpointConfig) -> Self {
        Self {
            endpoint,
            timeout: None,
            connect_delay: None,
            idle_timeout: None,
            log_target: None,
        }
    }

    pub fn handler_config(&self) -> HandlerConfig {
        let mut config = HandlerConfig::default();
        if let Some(timeout) = self.timeout {
            config.timeout = timeout;
        }
        if let Some(delay) = self.connect_delay {
            config.connect_delay = delay;
        }
        if let Some(idle_timeout) = self.idle_timeout {
            config.idle_timeout = idle_timeout;
        }
        if let Some(target) = self.log_target.as_ref() {
            config.logger = Some(Arc::new(LogLogger::new(target.as_str())));
        }
        config
    }

    /// Creates the configured connection without connecting.
    pub fn build(&self) -> Result<Box<dyn Connection>> {
        let config = self.handler_config();
        Ok(match &self.endpoint {
            EndpointConfig::Tcp { address } => {
                check_address(address)?;
                Box::new(Tcp::with_config(address.as_str(), config))
            }
            EndpointConfig::RtuOverTcp { address } => {
                check_address(address)?;
                Box::new(RtuOverTcp::with_config(address.as_str(), config))
            }
            #[cfg(feature = "serial")]
            EndpointConfig::Rtu(settings) => {
                if settings.device.is_empty() {
                    return Err(Error::Config("empty serial device".into()));
                }
                Box::new(Rtu::with_config(settings.clone(), config))
            }
        })
    }
}

fn check_address(address: &str) -> Result<()> {
    match address.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => Ok(()),
        _ => Err(Error::Config(format!(
            "invalid address '{address}', expected host:port"
        ))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterKind {
    #[default]
    Holding,
    Input,
}

/// A block of registers read from one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub slave: u8,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub kind: RegisterKind,
    pub address: u16,
    #[serde(default = "default_count")]
    pub count: u16,
}

fn default_count() -> u16 {
    1
}

impl DeviceConfig {
    pub fn label(&self) -> String {
        match self.name.as_ref() {
            Some(name) => format!("{name} ({})", self.slave),
            None => format!("device {}", self.slave),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl Config {
    pub const DEFAULT_CONFIG_FILE: &'static str = "mbconn.yaml";

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&yaml)
    }
}
