use super::Connection;
use crate::{
    client::ModbusClient,
    handler::{Endpoint, Handler, HandlerConfig},
    logger::Logger,
};
use std::{fmt, sync::Arc, time::Duration};

/// Plain Modbus TCP. Devices behind a TCP gateway are selected by unit id
/// without any settling delay.
#[derive(Debug)]
pub struct Tcp {
    handler: Handler,
}

impl Tcp {
    pub fn new(address: impl Into<String>) -> Self {
        Self::with_config(address, HandlerConfig::default())
    }

    pub fn with_config(address: impl Into<String>, config: HandlerConfig) -> Self {
        Self {
            handler: Handler::with_config(Endpoint::Tcp(address.into()), config),
        }
    }

    pub fn handler(&self) -> &Handler {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut Handler {
        &mut self.handler
    }
}

impl fmt::Display for Tcp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.handler.endpoint(), f)
    }
}

impl Connection for Tcp {
    fn modbus_client(&mut self) -> &mut dyn ModbusClient {
        &mut self.handler
    }

    fn set_logger(&mut self, logger: Arc<dyn Logger>) {
        self.handler.set_logger(logger);
    }

    fn set_slave(&mut self, device_id: u8) {
        self.handler.set_slave(device_id);
    }

    fn set_timeout(&mut self, timeout: Duration) -> Duration {
        self.handler.set_timeout(timeout)
    }

    fn set_connect_delay(&mut self, delay: Duration) {
        self.handler.set_connect_delay(delay);
    }

    fn close(&mut self) {
        self.handler.close();
    }

    fn clone_for(&self, device_id: u8) -> Box<dyn Connection> {
        let mut handler = self.handler.clone();
        handler.set_slave(device_id);
        Box::new(Self { handler })
    }
}
