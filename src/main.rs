//! Modbus meter connection CLI
//!
//! A command-line interface (CLI) application for talking to Modbus meters
//! via Modbus TCP, RTU frames over TCP (serial gateways) or Modbus RTU.
//!
//! This tool allows users to:
//! - Read holding registers, input registers and coils.
//! - Write single holding registers.
//! - Poll a register block from several devices at a fixed interval, either
//!   switching the device id on one shared connection or with an isolated
//!   connection per device.
//!
//! The CLI leverages the `modbus_meters_lib` crate for all bus operations.

use anyhow::{Context, Result};
use clap::Parser;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use modbus_meters_lib::{
    client::ModbusClient,
    config::{Config, ConnectionConfig, DeviceConfig, EndpointConfig, RegisterKind},
    connection::Connection,
    logger::LogLogger,
    serial::SerialSettings,
};
use std::{panic, sync::Arc, time::Duration};

mod commandline;

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown_file>", 0, 0));

        let cause_str = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            *s
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.as_str()
        } else {
            "<unknown_panic_cause>"
        };

        error!(
            target: "panic",
            "Thread '{}' panicked at '{}': {}:{} - Cause: {}",
            std::thread::current().name().unwrap_or("<unnamed>"),
            filename,
            line,
            column,
            cause_str
        );
    }));
    log_handle
}

fn format_registers(registers: &[u16]) -> String {
    registers
        .iter()
        .map(|value| format!("0x{value:04X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn format_coils(coils: &[bool]) -> String {
    coils
        .iter()
        .map(|coil| if *coil { "1" } else { "0" })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Builds the connection configuration from the command line.
/// Command line timings take precedence over the configuration file.
fn connection_config(
    args: &commandline::CliArgs,
) -> Result<(ConnectionConfig, Vec<DeviceConfig>)> {
    let (mut config, devices) = match &args.connection {
        commandline::CliConnection::Tcp { address, .. } => (
            ConnectionConfig::new(EndpointConfig::Tcp {
                address: address.clone(),
            }),
            Vec::new(),
        ),
        commandline::CliConnection::RtuOverTcp { address, .. } => (
            ConnectionConfig::new(EndpointConfig::RtuOverTcp {
                address: address.clone(),
            }),
            Vec::new(),
        ),
        commandline::CliConnection::Rtu {
            device, baud_rate, ..
        } => (
            ConnectionConfig::new(EndpointConfig::Rtu(SerialSettings::new(
                device.as_str(),
                *baud_rate,
            ))),
            Vec::new(),
        ),
        commandline::CliConnection::Config { file, .. } => {
            let config = Config::from_file(file)
                .with_context(|| format!("Cannot read configuration file '{file}'"))?;
            (config.connection, config.devices)
        }
    };
    if args.timeout.is_some() {
        config.timeout = args.timeout;
    }
    if args.connect_delay.is_some() {
        config.connect_delay = args.connect_delay;
    }
    Ok((config, devices))
}

fn read_block(conn: &mut dyn Connection, device: &DeviceConfig) -> Result<Vec<u16>> {
    conn.set_slave(device.slave);
    let client = conn.modbus_client();
    let registers = match device.kind {
        RegisterKind::Holding => client.read_holding_registers(device.address, device.count),
        RegisterKind::Input => client.read_input_registers(device.address, device.count),
    };
    registers.with_context(|| {
        format!(
            "Cannot read {} register(s) at 0x{:04X} from {}",
            device.count,
            device.address,
            device.label()
        )
    })
}

fn poll(
    conn: &mut dyn Connection,
    devices: &[DeviceConfig],
    poll_interval: Duration,
    isolated: bool,
) -> Result<()> {
    anyhow::ensure!(!devices.is_empty(), "No devices to poll");
    info!(
        "Polling {} device(s) on {conn} every {poll_interval:?} (isolated: {isolated})",
        devices.len()
    );
    let mut connections: Vec<Box<dyn Connection>> = if isolated {
        devices
            .iter()
            .map(|device| conn.clone_for(device.slave))
            .collect()
    } else {
        Vec::new()
    };

    loop {
        for (index, device) in devices.iter().enumerate() {
            let target: &mut dyn Connection = match connections.get_mut(index) {
                Some(own) => own.as_mut(),
                None => &mut *conn,
            };
            match read_block(target, device) {
                Ok(registers) => println!("{}: {}", device.label(), format_registers(&registers)),
                Err(error) => warn!("{error:#}"),
            }
        }
        std::thread::sleep(poll_interval);
    }
}

fn main() -> Result<()> {
    let args = commandline::CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter());
    info!(
        "mbconn started. Log level: {}",
        args.verbose.log_level_filter()
    );

    let (config, configured_devices) = connection_config(&args)?;
    let mut conn = config.build().context("Invalid connection settings")?;
    if config.log_target.is_none() {
        conn.set_logger(Arc::new(LogLogger::default()));
    }
    info!("Using connection {conn}");

    match args.connection.command() {
        commandline::CliCommands::ReadHolding(register) => {
            conn.set_slave(register.slave);
            let registers = conn
                .modbus_client()
                .read_holding_registers(register.address, register.count)
                .with_context(|| "Cannot read holding registers")?;
            println!("Holding registers: {}", format_registers(&registers));
        }
        commandline::CliCommands::ReadInput(register) => {
            conn.set_slave(register.slave);
            let registers = conn
                .modbus_client()
                .read_input_registers(register.address, register.count)
                .with_context(|| "Cannot read input registers")?;
            println!("Input registers: {}", format_registers(&registers));
        }
        commandline::CliCommands::ReadCoils(register) => {
            conn.set_slave(register.slave);
            let coils = conn
                .modbus_client()
                .read_coils(register.address, register.count)
                .with_context(|| "Cannot read coils")?;
            println!("Coils: {}", format_coils(&coils));
        }
        commandline::CliCommands::WriteRegister {
            slave,
            address,
            value,
        } => {
            conn.set_slave(*slave);
            conn.modbus_client()
                .write_single_register(*address, *value)
                .with_context(|| format!("Failed to write 0x{value:04X} to 0x{address:04X}"))?;
            println!("Register 0x{address:04X} set to 0x{value:04X} successfully.");
        }
        commandline::CliCommands::Poll {
            poll_interval,
            slaves,
            input,
            address,
            count,
            isolated,
        } => {
            let devices = if slaves.is_empty() {
                configured_devices
            } else {
                let kind = if *input {
                    RegisterKind::Input
                } else {
                    RegisterKind::Holding
                };
                slaves
                    .iter()
                    .map(|slave| DeviceConfig {
                        slave: *slave,
                        name: None,
                        kind,
                        address: *address,
                        count: *count,
                    })
                    .collect()
            };
            poll(conn.as_mut(), &devices, *poll_interval, *isolated)?;
        }
    }

    conn.close();
    Ok(())
}
