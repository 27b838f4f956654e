//! Modbus connections for metering code.
//!
//! This crate wraps `tokio-modbus` into blocking, lazily connected
//! connections that metering code can share a single interface for:
//!
//! 1.  **[`connection::Connection`]**: the capability set every transport
//!     flavor implements (device selection, timeouts, connect delay,
//!     diagnostics, close and per-device cloning).
//! 2.  **[`handler::Handler`]**: the per-endpoint `tokio-modbus` client that
//!     opens its transport on demand and reopens it after [`Handler::close`].
//! 3.  **[`config`]**: YAML configuration of a connection and the devices
//!     reached through it.
//!
//! ## Features
//!
//! - **RTU over TCP**: RTU frames through serial-to-Ethernet gateways, with
//!   a settling pause whenever the addressed device changes.
//! - **Modbus TCP** and **Modbus RTU** (feature `serial`) as sibling variants.
//! - **Blocking API**: every call blocks the calling thread, no runtime is
//!   required by the caller.
//!
//! ## Quick Start
//!
//! ```no_run
//! use modbus_meters_lib::client::ModbusClient;
//! use modbus_meters_lib::connection::{Connection, RtuOverTcp};
//! use std::time::Duration;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut conn = RtuOverTcp::new("10.0.0.5:502");
//!     conn.set_timeout(Duration::from_secs(1));
//!     conn.set_slave(1);
//!
//!     let registers = conn.modbus_client().read_holding_registers(0x0000, 2)?;
//!     println!("{conn}: {registers:?}");
//!
//!     // An independent connection for the second meter behind the gateway
//!     let mut second = conn.clone_for(2);
//!     let registers = second.modbus_client().read_input_registers(0x0000, 2)?;
//!     println!("{second}: {registers:?}");
//!
//!     Ok(())
//! }
//! ```
//!
//! [`Handler::close`]: handler::Handler::close

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod logger;

#[cfg_attr(docsrs, doc(cfg(feature = "serial")))]
#[cfg(feature = "serial")]
pub mod serial;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
