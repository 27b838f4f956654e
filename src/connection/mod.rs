//! The `Connection` capability set consumed by metering code.
//!
//! Every transport flavor is a sibling implementation of [`Connection`]:
//!
//! * [`RtuOverTcp`] – RTU framing over a TCP stream (serial gateways).
//! * [`Tcp`] – plain Modbus TCP.
//! * [`Rtu`] – RTU on a local serial line (feature `serial`).
//!
//! None of them lock internally. Callers sharing one connection between
//! several devices serialize the `set_slave`/request pairs themselves, or
//! hand every device its own connection via [`Connection::clone_for`].

use crate::{client::ModbusClient, logger::Logger};
use std::{fmt, sync::Arc, time::Duration};

mod rtu_over_tcp;
mod tcp;

#[cfg(feature = "serial")]
mod rtu;

pub use rtu_over_tcp::RtuOverTcp;
pub use tcp::Tcp;

#[cfg(feature = "serial")]
pub use rtu::Rtu;

/// Pause applied by RTU connections when the addressed device changes.
///
/// Some meters (e.g. SDM) lose or misroute the next frame if it follows a
/// frame for another device too closely.
pub const SETTLING_DELAY: Duration = Duration::from_millis(100);

/// A configured bus connection.
///
/// The `Display` implementation yields the endpoint address.
pub trait Connection: fmt::Display + Send {
    /// The client used to issue requests to the currently selected device.
    fn modbus_client(&mut self) -> &mut dyn ModbusClient;

    /// Replaces the sink for transport diagnostics.
    fn set_logger(&mut self, logger: Arc<dyn Logger>);

    /// Sets the device id for the following operations.
    fn set_slave(&mut self, device_id: u8);

    /// Installs a new request timeout and returns the previous one.
    fn set_timeout(&mut self, timeout: Duration) -> Duration;

    /// Sets the delay between connecting and the first request.
    fn set_connect_delay(&mut self, delay: Duration);

    /// Closes the live transport, the next request reopens it.
    fn close(&mut self);

    /// Creates an independent connection to the same endpoint, addressed
    /// to `device_id`.
    fn clone_for(&self, device_id: u8) -> Box<dyn Connection>;
}

/// Enforces [`SETTLING_DELAY`] between requests to different devices.
#[derive(Debug, Clone)]
pub struct SlavePacer {
    previous: u8,
    delay: Duration,
}

impl SlavePacer {
    /// Creates a pacer waiting `delay` on every device switch.
    pub fn new(delay: Duration) -> Self {
        Self { previous: 0, delay }
    }

    /// The last selected device id, `0` if none was selected yet.
    pub fn previous(&self) -> u8 {
        self.previous
    }

    /// The wait applied when switching devices.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Records the selection of `device_id`, blocking the calling thread
    /// first if another device was selected before. Returns whether it
    /// slept.
    pub fn select(&mut self, device_id: u8) -> bool {
        let settle = self.previous != 0 && self.previous != device_id;
        if settle {
            log::trace!(
                "switching from device {} to {device_id}, waiting {:?}",
                self.previous,
                self.delay
            );
            std::thread::sleep(self.delay);
        }
        self.previous = device_id;
        settle
    }

    /// Same delay, no history.
    pub fn fresh(&self) -> Self {
        Self::new(self.delay)
    }
}

impl Default for SlavePacer {
    fn default() -> Self {
        Self::new(SETTLING_DELAY)
    }
}
