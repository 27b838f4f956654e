//! Diagnostic sinks for transport level output.
//!
//! A connection writes its transport diagnostics (connecting, connect delay,
//! closing, failed requests) to an injected [`Logger`]. Without one, the
//! same messages only reach the `log` facade at trace level.

use std::fmt;

/// A sink for transport diagnostics of a single connection.
pub trait Logger: Send + Sync {
    fn log(&self, args: fmt::Arguments<'_>);
}

/// Forwards diagnostics to the `log` facade at debug level.
#[derive(Debug, Clone)]
pub struct LogLogger {
    target: String,
}

impl LogLogger {
    pub const DEFAULT_TARGET: &'static str = "modbus";

    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }
}

impl Default for LogLogger {
    fn default() -> Self {
        Self::new(Self::DEFAULT_TARGET)
    }
}

impl Logger for LogLogger {
    fn log(&self, args: fmt::Arguments<'_>) {
        log::debug!(target: &self.target, "{args}");
    }
}

impl<F> Logger for F
where
    F: Fn(&str) + Send + Sync,
{
    fn log(&self, args: fmt::Arguments<'_>) {
        self(&args.to_string());
    }
}
