//! Transport independent synchronous request interface.
//!
//! All methods block the calling thread until the response arrives or the
//! connection timeout elapses. A Modbus exception reported by the device is
//! returned as [`crate::Error::TokioExceptionError`].

use crate::Result;
use tokio_modbus::{Address, Quantity};

/// Synchronous Modbus client as seen by metering code.
pub trait ModbusClient: Send {
    /// Read multiple coils (0x01)
    fn read_coils(&mut self, addr: Address, cnt: Quantity) -> Result<Vec<bool>>;

    /// Read multiple discrete inputs (0x02)
    fn read_discrete_inputs(&mut self, addr: Address, cnt: Quantity) -> Result<Vec<bool>>;

    /// Read multiple holding registers (0x03)
    fn read_holding_registers(&mut self, addr: Address, cnt: Quantity) -> Result<Vec<u16>>;

    /// Read multiple input registers (0x04)
    fn read_input_registers(&mut self, addr: Address, cnt: Quantity) -> Result<Vec<u16>>;

    /// Write a single coil (0x05)
    fn write_single_coil(&mut self, addr: Address, coil: bool) -> Result<()>;

    /// Write a single holding register (0x06)
    fn write_single_register(&mut self, addr: Address, word: u16) -> Result<()>;

    /// Write multiple coils (0x0F)
    fn write_multiple_coils(&mut self, addr: Address, coils: &[bool]) -> Result<()>;

    /// Write multiple holding registers (0x10)
    fn write_multiple_registers(&mut self, addr: Address, words: &[u16]) -> Result<()>;
}
