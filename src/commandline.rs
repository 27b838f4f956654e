use clap::{Args, Parser, Subcommand};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use modbus_meters_lib::{config::Config, serial::DEFAULT_BAUD_RATE};
use std::time::Duration;

fn default_device_name() -> String {
    if cfg!(target_os = "windows") {
        String::from("COM1")
    } else {
        String::from("/dev/ttyUSB0")
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliConnection {
    /// Connect via Modbus TCP.
    Tcp {
        /// The IP address or hostname and port of the Modbus TCP device.
        /// Example: "192.168.1.100:502".
        address: String,

        #[command(subcommand)]
        command: CliCommands,
    },
    /// Connect via RTU frames over TCP, e.g. to a serial-to-Ethernet gateway.
    RtuOverTcp {
        /// The IP address or hostname and port of the gateway.
        /// Example: "10.0.0.5:502".
        address: String,

        #[command(subcommand)]
        command: CliCommands,
    },
    /// Connect via Modbus RTU (Serial).
    Rtu {
        /// Serial port device name.
        /// Examples: "/dev/ttyUSB0" (Linux), "COM3" (Windows).
        #[arg(short, long, default_value_t = default_device_name())]
        device: String,

        /// Baud rate for serial communication.
        #[arg(long, default_value_t = DEFAULT_BAUD_RATE)]
        baud_rate: u32,

        #[command(subcommand)]
        command: CliCommands,
    },
    /// Take the connection and the polled devices from a YAML file.
    Config {
        /// The configuration file.
        #[arg(long, default_value_t = Config::DEFAULT_CONFIG_FILE.to_string())]
        file: String,

        #[command(subcommand)]
        command: CliCommands,
    },
}

impl CliConnection {
    pub fn command(&self) -> &CliCommands {
        match self {
            CliConnection::Tcp { command, .. }
            | CliConnection::RtuOverTcp { command, .. }
            | CliConnection::Rtu { command, .. }
            | CliConnection::Config { command, .. } => command,
        }
    }
}

#[derive(Args, Debug, Clone, PartialEq)]
pub struct RegisterArgs {
    /// The Modbus device id.
    #[arg(short, long, default_value_t = 1, value_parser = clap_num::maybe_hex::<u8>)]
    pub slave: u8,

    /// The first register or coil address.
    /// Can be specified in decimal or hexadecimal (e.g., "0x10").
    #[arg(value_parser = clap_num::maybe_hex::<u16>, verbatim_doc_comment)]
    pub address: u16,

    /// Number of registers or coils to read.
    #[arg(default_value_t = 1)]
    pub count: u16,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Read holding registers (0x03).
    ReadHolding(RegisterArgs),

    /// Read input registers (0x04).
    ReadInput(RegisterArgs),

    /// Read coils (0x01).
    ReadCoils(RegisterArgs),

    /// Write a single holding register (0x06).
    WriteRegister {
        /// The Modbus device id.
        #[arg(short, long, default_value_t = 1, value_parser = clap_num::maybe_hex::<u8>)]
        slave: u8,

        /// The register address, decimal or hexadecimal.
        #[arg(value_parser = clap_num::maybe_hex::<u16>)]
        address: u16,

        /// The value to write, decimal or hexadecimal.
        #[arg(value_parser = clap_num::maybe_hex::<u16>)]
        value: u16,
    },

    /// Continuously read a register block from several devices.
    /// Without `--slaves` the devices are taken from the configuration file.
    #[clap(verbatim_doc_comment)]
    Poll {
        /// Interval between polling rounds (e.g., "10s", "1m").
        #[arg(value_parser = humantime::parse_duration, short, long, default_value = "5s")]
        poll_interval: Duration,

        /// Device ids to poll, comma separated.
        #[arg(long, value_delimiter = ',', value_parser = clap_num::maybe_hex::<u8>)]
        slaves: Vec<u8>,

        /// Read input registers instead of holding registers.
        #[arg(long)]
        input: bool,

        /// The first register address, decimal or hexadecimal.
        #[arg(long, default_value_t = 0, value_parser = clap_num::maybe_hex::<u16>)]
        address: u16,

        /// Number of registers to read.
        #[arg(long, default_value_t = 1)]
        count: u16,

        /// Give every device its own connection instead of switching the
        /// device id on a shared one.
        #[arg(long, verbatim_doc_comment)]
        isolated: bool,
    },
}

const fn about_text() -> &'static str {
    "Modbus meter connection tool - read and write registers via Modbus TCP, RTU over TCP or RTU."
}

#[derive(Parser, Debug)]
#[command(name="mbconn", author, version, about=about_text(), long_about = None, propagate_version = true)]
pub struct CliArgs {
    /// Configure verbosity of logging output.
    /// -v for info, -vv for debug, -vvv for trace. Default is off.
    #[command(flatten)]
    pub verbose: Verbosity<WarnLevel>,

    /// Specifies the connection method and the command.
    #[command(subcommand)]
    pub connection: CliConnection,

    /// Modbus I/O timeout for connecting and for each request.
    /// Examples: "1s", "500ms".
    #[arg(global = true, long, value_parser = humantime::parse_duration, verbatim_doc_comment)]
    pub timeout: Option<Duration>,

    /// Delay after opening the connection before the first request.
    /// Some gateways drop requests that arrive right after connecting.
    #[arg(global = true, long, value_parser = humantime::parse_duration, verbatim_doc_comment)]
    pub connect_delay: Option<Duration>,
}
