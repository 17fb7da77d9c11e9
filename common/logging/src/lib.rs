#[macro_use]
extern crate lazy_static;

use node_metrics::{inc_counter, try_create_int_counter, IntCounter, Result as MetricsResult};
use slog::{o, Drain, Logger, OwnedKVList, Record};
use sloggers::{null::NullLoggerBuilder, terminal::TerminalLoggerBuilder, types::Severity, Build};

lazy_static! {
    pub static ref INFOS_TOTAL: MetricsResult<IntCounter> =
        try_create_int_counter("info_total", "Count of infos logged");
    pub static ref WARNS_TOTAL: MetricsResult<IntCounter> =
        try_create_int_counter("warn_total", "Count of warns logged");
    pub static ref ERRORS_TOTAL: MetricsResult<IntCounter> =
        try_create_int_counter("error_total", "Count of errors logged");
    pub static ref CRITS_TOTAL: MetricsResult<IntCounter> =
        try_create_int_counter("crit_total", "Count of crits logged");
}

/// Forwards every record to `D`, counting records per level on the way through.
pub struct CountingDrain<D> {
    wrapped: D,
}

impl<D> CountingDrain<D> {
    pub fn new(wrapped: D) -> Self {
        Self { wrapped }
    }
}

impl<D: Drain> Drain for CountingDrain<D> {
    type Ok = D::Ok;
    type Err = D::Err;

    fn log(&self, record: &Record, values: &OwnedKVList) -> Result<Self::Ok, Self::Err> {
        match record.level() {
            slog::Level::Info => inc_counter(&INFOS_TOTAL),
            slog::Level::Warning => inc_counter(&WARNS_TOTAL),
            slog::Level::Error => inc_counter(&ERRORS_TOTAL),
            slog::Level::Critical => inc_counter(&CRITS_TOTAL),
            _ => (),
        }
        self.wrapped.log(record, values)
    }
}

/// Builds the terminal logger used by a running node, at `level` (e.g. `"info"`).
pub fn terminal_logger(level: &str) -> Result<Logger, String> {
    let severity = match level {
        "crit" => Severity::Critical,
        "error" => Severity::Error,
        "warn" => Severity::Warning,
        "info" => Severity::Info,
        "debug" => Severity::Debug,
        "trace" => Severity::Trace,
        other => return Err(format!("Unknown log level: {}", other)),
    };
    let inner = TerminalLoggerBuilder::new()
        .level(severity)
        .build()
        .map_err(|e| format!("Unable to build terminal logger: {:?}", e))?;
    Ok(Logger::root(CountingDrain::new(inner).fuse(), o!()))
}

/// Return a logger suitable for test usage.
///
/// By default no logs will be printed, but they can be enabled via the `test_logger` feature:
///
/// ```bash
/// cargo test -p execution_chain --features 'logging/test_logger'
/// ```
pub fn test_logger() -> Logger {
    if cfg!(feature = "test_logger") {
        match TerminalLoggerBuilder::new().level(Severity::Debug).build() {
            Ok(logger) => logger,
            Err(_) => null_logger(),
        }
    } else {
        null_logger()
    }
}

/// A logger that discards everything.
pub fn null_logger() -> Logger {
    match NullLoggerBuilder.build() {
        Ok(logger) => logger,
        Err(_) => Logger::root(slog::Discard, o!()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slog::{info, warn};

    #[test]
    fn counts_levels() {
        let log = Logger::root(CountingDrain::new(slog::Discard), o!());
        let before = INFOS_TOTAL.as_ref().map(|c| c.get()).unwrap_or(0);
        info!(log, "Hello"; "key" => 1);
        warn!(log, "World");
        let after = INFOS_TOTAL.as_ref().map(|c| c.get()).unwrap_or(0);
        assert!(after > before);
    }

    #[test]
    fn rejects_unknown_level() {
        assert!(terminal_logger("loud").is_err());
        assert!(terminal_logger("debug").is_ok());
    }
}
