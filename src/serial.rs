//! Serial line parameters for Modbus RTU connections.
use serde::{Deserialize, Serialize};

/// The number of data bits used for serial communication.
pub const DATA_BITS: tokio_serial::DataBits = tokio_serial::DataBits::Eight;
/// The default baud rate of most meters.
pub const DEFAULT_BAUD_RATE: u32 = 9600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

impl From<Parity> for tokio_serial::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum StopBits {
    #[default]
    One,
    Two,
}

impl TryFrom<u8> for StopBits {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(StopBits::One),
            2 => Ok(StopBits::Two),
            other => Err(format!("unsupported number of stop bits: {other}")),
        }
    }
}

impl From<StopBits> for u8 {
    fn from(stop_bits: StopBits) -> Self {
        match stop_bits {
            StopBits::One => 1,
            StopBits::Two => 2,
        }
    }
}

impl From<StopBits> for tokio_serial::StopBits {
    fn from(stop_bits: StopBits) -> Self {
        match stop_bits {
            StopBits::One => tokio_serial::StopBits::One,
            StopBits::Two => tokio_serial::StopBits::Two,
        }
    }
}

/// Settings of a serial Modbus RTU line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialSettings {
    /// The path to the serial port device (e.g., `/dev/ttyUSB0`).
    pub device: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default)]
    pub parity: Parity,
    #[serde(default)]
    pub stop_bits: StopBits,
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

impl SerialSettings {
    pub fn new(device: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            device: device.into(),
            baud_rate,
            parity: Parity::default(),
            stop_bits: StopBits::default(),
        }
    }

    /// Creates a `tokio_serial::SerialPortBuilder` with these settings.
    pub fn builder(&self) -> tokio_serial::SerialPortBuilder {
        tokio_serial::new(&self.device, self.baud_rate)
            .parity(self.parity.into())
            .stop_bits(self.stop_bits.into())
            .data_bits(DATA_BITS)
            .flow_control(tokio_serial::FlowControl::None)
    }
}
