//! Lazily connected Modbus handler on top of `tokio-modbus`.
//!
//! A [`Handler`] owns everything needed to talk to one endpoint: the
//! address or serial line, the protocol settings and, once the first
//! request has been issued, the live `tokio-modbus` context together with
//! the single threaded runtime that drives it.
//!
//! The transport is opened on demand. [`Handler::close`] only drops the
//! live transport; the next request reopens it and honors the connect
//! delay again.

use crate::{client::ModbusClient, logger::Logger, Error, Result};
use std::{
    fmt, io,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{net::TcpStream, runtime::Runtime, time::error::Elapsed};
use tokio_modbus::{
    client::{Client, Context, Reader, Writer},
    slave::SlaveContext,
    Address, Quantity, Slave,
};

#[cfg(feature = "serial")]
use crate::serial::SerialSettings;

/// Default timeout for connecting and for each request.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default time after which an unused transport is reopened.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_PROTOCOL_RECOVERY_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_LINK_RECOVERY_TIMEOUT: Duration = Duration::from_secs(15);

/// Where and how to reach the devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Modbus TCP (MBAP framing).
    Tcp(String),
    /// RTU framing tunneled over a TCP stream.
    RtuOverTcp(String),
    /// RTU framing on a local serial line.
    #[cfg(feature = "serial")]
    Rtu(SerialSettings),
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(address) | Endpoint::RtuOverTcp(address) => f.write_str(address),
            #[cfg(feature = "serial")]
            Endpoint::Rtu(settings) => f.write_str(&settings.device),
        }
    }
}

/// Protocol level settings, copied verbatim into cloned handlers.
#[derive(Clone)]
pub struct HandlerConfig {
    pub timeout: Duration,
    pub connect_delay: Duration,
    pub idle_timeout: Duration,
    /// Carried through unchanged, no code path consults it.
    pub protocol_recovery_timeout: Duration,
    /// Carried through unchanged, no code path consults it.
    pub link_recovery_timeout: Duration,
    pub logger: Option<Arc<dyn Logger>>,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            connect_delay: Duration::ZERO,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            protocol_recovery_timeout: DEFAULT_PROTOCOL_RECOVERY_TIMEOUT,
            link_recovery_timeout: DEFAULT_LINK_RECOVERY_TIMEOUT,
            logger: None,
        }
    }
}

impl fmt::Debug for HandlerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerConfig")
            .field("timeout", &self.timeout)
            .field("connect_delay", &self.connect_delay)
            .field("idle_timeout", &self.idle_timeout)
            .field("protocol_recovery_timeout", &self.protocol_recovery_timeout)
            .field("link_recovery_timeout", &self.link_recovery_timeout)
            .field("logger", &self.logger.is_some())
            .finish()
    }
}

/// Runs one request against the live context, bounded by the timeout.
///
/// The timer is created inside the runtime, it needs its time driver.
macro_rules! request {
    ($handler:expr, $ctx:ident => $call:expr) => {{
        let timeout = $handler.config.timeout;
        let outcome = {
            let (runtime, $ctx) = $handler.connected()?;
            runtime.block_on(async { tokio::time::timeout(timeout, $call).await })
        };
        $handler.complete(outcome)
    }};
}

/// A Modbus client handler for a single endpoint.
pub struct Handler {
    endpoint: Endpoint,
    config: HandlerConfig,
    slave: Slave,
    // Dropped before the runtime that drives it.
    ctx: Option<Context>,
    runtime: Option<Runtime>,
    last_activity: Option<Instant>,
}

impl Handler {
    pub fn new(endpoint: Endpoint) -> Self {
        Self::with_config(endpoint, HandlerConfig::default())
    }

    pub fn with_config(endpoint: Endpoint, config: HandlerConfig) -> Self {
        let slave = match endpoint {
            Endpoint::Tcp(_) => Slave::tcp_device(),
            _ => Slave::broadcast(),
        };
        Self {
            endpoint,
            config,
            slave,
            ctx: None,
            runtime: None,
            last_activity: None,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn config(&self) -> &HandlerConfig {
        &self.config
    }

    /// The device id used for the following requests.
    pub fn slave(&self) -> u8 {
        self.slave.0
    }

    pub fn set_slave(&mut self, device_id: u8) {
        self.slave = Slave(device_id);
        if let Some(ctx) = self.ctx.as_mut() {
            ctx.set_slave(self.slave);
        }
    }

    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    /// Installs a new timeout and returns the previous one.
    pub fn set_timeout(&mut self, timeout: Duration) -> Duration {
        std::mem::replace(&mut self.config.timeout, timeout)
    }

    pub fn connect_delay(&self) -> Duration {
        self.config.connect_delay
    }

    /// Sets the delay between opening the transport and the first request.
    pub fn set_connect_delay(&mut self, delay: Duration) {
        self.config.connect_delay = delay;
    }

    pub fn idle_timeout(&self) -> Duration {
        self.config.idle_timeout
    }

    /// Sets the time after which an unused transport is reopened.
    /// `Duration::ZERO` keeps the transport open indefinitely.
    pub fn set_idle_timeout(&mut self, idle_timeout: Duration) {
        self.config.idle_timeout = idle_timeout;
    }

    /// Replaces the diagnostic sink.
    pub fn set_logger(&mut self, logger: Arc<dyn Logger>) {
        self.config.logger = Some(logger);
    }

    pub fn is_connected(&self) -> bool {
        self.ctx.is_some()
    }

    /// Releases the live transport, if any.
    ///
    /// Errors while shutting down the stream are logged and otherwise
    /// ignored. The configuration is kept, the next request reconnects.
    pub fn close(&mut self) {
        self.last_activity = None;
        let Some(mut ctx) = self.ctx.take() else {
            return;
        };
        if let Some(runtime) = self.runtime.as_ref() {
            if let Err(err) = runtime.block_on(async { ctx.disconnect().await }) {
                log::debug!("{}: closing the connection failed: {err}", self.endpoint);
            }
        }
        self.diag(format_args!("connection closed"));
    }

    fn diag(&self, args: fmt::Arguments<'_>) {
        log::trace!("{}: {args}", self.endpoint);
        if let Some(logger) = self.config.logger.as_ref() {
            logger.log(args);
        }
    }

    fn idle_expired(&self) -> bool {
        match self.last_activity {
            Some(at) if !self.config.idle_timeout.is_zero() => {
                at.elapsed() >= self.config.idle_timeout
            }
            _ => false,
        }
    }

    fn connected(&mut self) -> Result<(&Runtime, &mut Context)> {
        if self.ctx.is_some() && self.idle_expired() {
            self.diag(format_args!(
                "idle for more than {:?}, reconnecting",
                self.config.idle_timeout
            ));
            self.close();
        }
        if self.runtime.is_none() {
            self.runtime = Some(
                tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()?,
            );
        }
        if self.ctx.is_none() {
            let ctx = self.open()?;
            self.ctx = Some(ctx);
            self.last_activity = Some(Instant::now());
        }
        match (self.runtime.as_ref(), self.ctx.as_mut()) {
            (Some(runtime), Some(ctx)) => Ok((runtime, ctx)),
            _ => Err(io::Error::from(io::ErrorKind::NotConnected).into()),
        }
    }

    fn open(&self) -> Result<Context> {
        let Some(runtime) = self.runtime.as_ref() else {
            return Err(io::Error::from(io::ErrorKind::NotConnected).into());
        };
        self.diag(format_args!("connecting to {}", self.endpoint));
        let ctx = runtime.block_on(attach(&self.endpoint, self.slave, self.config.timeout))?;
        if !self.config.connect_delay.is_zero() {
            self.diag(format_args!(
                "waiting {:?} before the first request",
                self.config.connect_delay
            ));
            std::thread::sleep(self.config.connect_delay);
        }
        Ok(ctx)
    }

    fn complete<T>(
        &mut self,
        outcome: std::result::Result<tokio_modbus::Result<T>, Elapsed>,
    ) -> Result<T> {
        match outcome {
            Ok(Ok(Ok(rsp))) => {
                self.last_activity = Some(Instant::now());
                Ok(rsp)
            }
            Ok(Ok(Err(exception))) => {
                self.last_activity = Some(Instant::now());
                self.diag(format_args!(
                    "device {} responded with exception: {exception}",
                    self.slave.0
                ));
                Err(exception.into())
            }
            Ok(Err(err)) => {
                self.diag(format_args!("request to device {} failed: {err}", self.slave.0));
                self.close();
                Err(err.into())
            }
            Err(_) => {
                self.diag(format_args!(
                    "request to device {} timed out after {:?}",
                    self.slave.0, self.config.timeout
                ));
                self.close();
                Err(Error::Timeout(self.config.timeout))
            }
        }
    }
}

async fn connect_tcp(address: &str, timeout: Duration) -> Result<TcpStream> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
        .await
        .map_err(|_| Error::Timeout(timeout))??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

async fn attach(endpoint: &Endpoint, slave: Slave, timeout: Duration) -> Result<Context> {
    match endpoint {
        Endpoint::Tcp(address) => {
            let stream = connect_tcp(address, timeout).await?;
            Ok(tokio_modbus::client::tcp::attach_slave(stream, slave))
        }
        Endpoint::RtuOverTcp(address) => {
            let stream = connect_tcp(address, timeout).await?;
            Ok(tokio_modbus::client::rtu::attach_slave(stream, slave))
        }
        #[cfg(feature = "serial")]
        Endpoint::Rtu(settings) => {
            let port = tokio_serial::SerialStream::open(&settings.builder())
                .map_err(io::Error::from)?;
            Ok(tokio_modbus::client::rtu::attach_slave(port, slave))
        }
    }
}

/// Clones the endpoint and configuration, but not the live transport.
impl Clone for Handler {
    fn clone(&self) -> Self {
        Self {
            endpoint: self.endpoint.clone(),
            config: self.config.clone(),
            slave: self.slave,
            ctx: None,
            runtime: None,
            last_activity: None,
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("endpoint", &self.endpoint)
            .field("config", &self.config)
            .field("slave", &self.slave.0)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl ModbusClient for Handler {
    fn read_coils(&mut self, addr: Address, cnt: Quantity) -> Result<Vec<bool>> {
        request!(self, ctx => ctx.read_coils(addr, cnt))
    }

    fn read_discrete_inputs(&mut self, addr: Address, cnt: Quantity) -> Result<Vec<bool>> {
        request!(self, ctx => ctx.read_discrete_inputs(addr, cnt))
    }

    fn read_holding_registers(&mut self, addr: Address, cnt: Quantity) -> Result<Vec<u16>> {
        request!(self, ctx => ctx.read_holding_registers(addr, cnt))
    }

    fn read_input_registers(&mut self, addr: Address, cnt: Quantity) -> Result<Vec<u16>> {
        request!(self, ctx => ctx.read_input_registers(addr, cnt))
    }

    fn write_single_coil(&mut self, addr: Address, coil: bool) -> Result<()> {
        request!(self, ctx => ctx.write_single_coil(addr, coil))
    }

    fn write_single_register(&mut self, addr: Address, word: u16) -> Result<()> {
        request!(self, ctx => ctx.write_single_register(addr, word))
    }

    fn write_multiple_coils(&mut self, addr: Address, coils: &[bool]) -> Result<()> {
        request!(self, ctx => ctx.write_multiple_coils(addr, coils))
    }

    fn write_multiple_registers(&mut self, addr: Address, words: &[u16]) -> Result<()> {
        request!(self, ctx => ctx.write_multiple_registers(addr, words))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{refused_address, FakeDevice, Reply};
    use assert_matches::assert_matches;
    use std::sync::Mutex;

    fn rtu_over_tcp(address: &str) -> Handler {
        let mut handler = Handler::new(Endpoint::RtuOverTcp(address.to_string()));
        handler.set_timeout(Duration::from_secs(2));
        handler
    }

    #[test]
    fn default_config() {
        let handler = Handler::new(Endpoint::RtuOverTcp("10.0.0.5:502".into()));
        assert_eq!(handler.timeout(), DEFAULT_TIMEOUT);
        assert_eq!(handler.connect_delay(), Duration::ZERO);
        assert_eq!(handler.idle_timeout(), DEFAULT_IDLE_TIMEOUT);
        assert_eq!(handler.config().protocol_recovery_timeout, Duration::from_secs(10));
        assert_eq!(handler.config().link_recovery_timeout, Duration::from_secs(15));
        assert!(handler.config().logger.is_none());
        assert!(!handler.is_connected());
        assert_eq!(handler.endpoint().to_string(), "10.0.0.5:502");
    }

    #[test]
    fn set_timeout_returns_previous() {
        let mut handler = Handler::new(Endpoint::Tcp("10.0.0.5:502".into()));
        assert_eq!(handler.set_timeout(Duration::from_secs(1)), DEFAULT_TIMEOUT);
        assert_eq!(handler.set_timeout(Duration::from_secs(3)), Duration::from_secs(1));
        assert_eq!(handler.timeout(), Duration::from_secs(3));
    }

    #[test]
    fn clone_copies_config_only() {
        let mut handler = Handler::new(Endpoint::RtuOverTcp("10.0.0.5:502".into()));
        handler.set_connect_delay(Duration::from_millis(500));
        handler.set_slave(4);
        let mut clone = handler.clone();
        clone.set_slave(8);
        clone.set_connect_delay(Duration::ZERO);
        assert_eq!(handler.slave(), 4);
        assert_eq!(handler.connect_delay(), Duration::from_millis(500));
        assert_eq!(clone.slave(), 8);
        assert_eq!(clone.endpoint(), handler.endpoint());
    }

    #[test]
    fn close_is_idempotent() {
        let mut handler = Handler::new(Endpoint::RtuOverTcp("10.0.0.5:502".into()));
        handler.close();
        handler.close();
        assert!(!handler.is_connected());
        assert_eq!(handler.slave(), 0);
        assert_eq!(handler.timeout(), DEFAULT_TIMEOUT);
    }

    #[test]
    fn connection_refused() {
        let mut handler = rtu_over_tcp(&refused_address());
        assert_matches!(handler.read_holding_registers(0, 1), Err(Error::Io(_)));
        assert!(!handler.is_connected());
    }

    #[test]
    fn read_registers() {
        let device = FakeDevice::rtu(1, Reply::Data);
        let mut handler = rtu_over_tcp(device.address());
        handler.set_slave(3);
        assert_eq!(handler.read_holding_registers(0x10, 3).unwrap(), [0x10, 0x11, 0x12]);
        assert_eq!(handler.read_input_registers(0x20, 1).unwrap(), [0x20]);
        assert!(handler.is_connected());
        handler.close();

        let requests = device.join();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].connection, 0);
        assert_eq!(&requests[0].frame[..6], [3, 0x03, 0x00, 0x10, 0x00, 0x03]);
        assert_eq!(&requests[1].frame[..6], [3, 0x04, 0x00, 0x20, 0x00, 0x01]);
    }

    #[test]
    fn read_coils_and_discrete_inputs() {
        let device = FakeDevice::rtu(1, Reply::Data);
        let mut handler = rtu_over_tcp(device.address());
        handler.set_slave(5);
        assert_eq!(handler.read_coils(0, 4).unwrap(), [false, true, false, true]);
        assert_eq!(handler.read_discrete_inputs(3, 2).unwrap(), [true, false]);
        handler.close();

        let requests = device.join();
        assert_eq!(requests[0].frame, [5, 0x01, 0x00, 0x00, 0x00, 0x04]);
        assert_eq!(requests[1].frame, [5, 0x02, 0x00, 0x03, 0x00, 0x02]);
    }

    #[test]
    fn writes() {
        let device = FakeDevice::rtu(1, Reply::Data);
        let mut handler = rtu_over_tcp(device.address());
        handler.set_slave(3);
        handler.write_single_register(0x0102, 0xBEEF).unwrap();
        handler.write_single_coil(5, true).unwrap();
        handler.write_multiple_registers(0x10, &[1, 2]).unwrap();
        handler.write_multiple_coils(0, &[true, false, true]).unwrap();
        assert!(handler.is_connected());
        handler.close();

        let frames: Vec<_> = device.join().into_iter().map(|r| r.frame).collect();
        assert_eq!(
            frames,
            [
                vec![3u8, 0x06, 0x01, 0x02, 0xBE, 0xEF],
                vec![3, 0x05, 0x00, 0x05, 0xFF, 0x00],
                vec![3, 0x10, 0x00, 0x10, 0x00, 0x02, 4, 0x00, 0x01, 0x00, 0x02],
                vec![3, 0x0F, 0x00, 0x00, 0x00, 0x03, 1, 0b101],
            ]
        );
    }

    #[test]
    fn tcp_round_trip() {
        let device = FakeDevice::tcp(1, Reply::Data);
        let mut handler = Handler::new(Endpoint::Tcp(device.address().to_string()));
        handler.set_timeout(Duration::from_secs(2));
        handler.set_slave(1);
        assert_eq!(handler.read_holding_registers(4, 2).unwrap(), [4, 5]);
        handler.write_single_register(1, 7).unwrap();
        handler.close();

        let requests = device.join();
        assert_eq!(requests[0].frame, [1, 0x03, 0x00, 0x04, 0x00, 0x02]);
        assert_eq!(requests[1].frame, [1, 0x06, 0x00, 0x01, 0x00, 0x07]);
    }

    #[test]
    fn reconnects_after_close() {
        let device = FakeDevice::rtu(2, Reply::Data);
        let mut handler = rtu_over_tcp(device.address());
        handler.set_slave(1);
        handler.read_holding_registers(0, 1).unwrap();
        handler.close();
        assert!(!handler.is_connected());
        handler.read_holding_registers(1, 1).unwrap();
        handler.close();

        let connections: Vec<_> = device.join().iter().map(|r| r.connection).collect();
        assert_eq!(connections, [0, 1]);
    }

    #[test]
    fn reconnects_after_idle_timeout() {
        let device = FakeDevice::rtu(2, Reply::Data);
        let mut handler = rtu_over_tcp(device.address());
        handler.set_slave(1);
        handler.set_idle_timeout(Duration::from_millis(50));
        handler.read_holding_registers(0, 1).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        handler.read_holding_registers(0, 1).unwrap();
        handler.close();

        let connections: Vec<_> = device.join().iter().map(|r| r.connection).collect();
        assert_eq!(connections, [0, 1]);
    }

    #[test]
    fn exception_keeps_connection() {
        let device = FakeDevice::rtu(1, Reply::Exception(0x02));
        let mut handler = rtu_over_tcp(device.address());
        handler.set_slave(2);
        assert_matches!(
            handler.read_holding_registers(0x1000, 1),
            Err(Error::TokioExceptionError(
                tokio_modbus::ExceptionCode::IllegalDataAddress
            ))
        );
        assert!(handler.is_connected());
        handler.close();
        assert_eq!(device.join().len(), 1);
    }

    #[test]
    fn timeout_closes_connection() {
        let device = FakeDevice::rtu(1, Reply::Silent);
        let mut handler = rtu_over_tcp(device.address());
        handler.set_slave(1);
        handler.set_timeout(Duration::from_millis(100));
        let err = handler.read_holding_registers(0, 1).unwrap_err();
        assert!(err.is_timeout());
        assert!(!handler.is_connected());
        assert_eq!(device.join().len(), 1);
    }

    #[test]
    fn connect_delay_and_logger() {
        let lines = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = {
            let lines = lines.clone();
            move |line: &str| lines.lock().unwrap().push(line.to_string())
        };
        let device = FakeDevice::rtu(1, Reply::Data);
        let mut handler = rtu_over_tcp(device.address());
        handler.set_slave(1);
        handler.set_logger(Arc::new(sink));
        handler.set_connect_delay(Duration::from_millis(50));

        let started = Instant::now();
        handler.read_holding_registers(0, 1).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(50));
        handler.close();
        device.join();

        let lines = lines.lock().unwrap();
        assert!(lines[0].starts_with("connecting to 127.0.0.1:"));
        assert!(lines.iter().any(|line| line.starts_with("waiting 50ms")));
        assert_eq!(lines.last().map(String::as_str), Some("connection closed"));
    }
}
