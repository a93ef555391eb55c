use std::sync::{Arc, OnceLock};

use strum::Display;

/// Receives the crate's log output.
///
/// The library logs through the [`log`] facade. Hosts that have no `log`
/// implementation of their own (the browser bindings, an embedding app) install
/// one of these with [`set_logger`].
///
/// # Examples
///
/// ```rust
/// use signkit_core::logger::{LogLevel, Logger};
///
/// struct StderrLogger;
///
/// impl Logger for StderrLogger {
///     fn log(&self, level: LogLevel, message: String) {
///         eprintln!("[{level}] {message}");
///     }
/// }
/// ```
///
/// ## JavaScript
///
/// The wasm bindings install a console logger on load; nothing to do on the JS side
/// beyond opening the devtools console.
pub trait Logger: Sync + Send {
    /// Logs `message` at `level`.
    fn log(&self, level: LogLevel, message: String);
}

/// Severity of a log message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum LogLevel {
    /// Very detailed tracing.
    Trace,
    /// Protocol progress (sends, drops, transport transitions).
    Debug,
    /// Notable events.
    Info,
    /// Recoverable problems (timeouts, abandoned syncs).
    Warn,
    /// Failures.
    Error,
}

/// Forwards `log` records to the installed [`Logger`].
struct ForeignLogger;

impl log::Log for ForeignLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        if !should_forward(record.module_path(), record.level()) {
            return;
        }
        if let Some(logger) = LOGGER_INSTANCE.get() {
            logger.log(log_level(record.level()), format!("{}", record.args()));
        } else {
            eprintln!("Logger not set: {}", record.args());
        }
    }

    fn flush(&self) {}
}

/// Debug and trace output of dependencies is noise to a host; only ours passes.
fn should_forward(module_path: Option<&str>, level: log::Level) -> bool {
    let is_from_signkit = module_path.is_some_and(|path| path.starts_with("signkit"));
    let is_verbose = matches!(level, log::Level::Debug | log::Level::Trace);
    is_from_signkit || !is_verbose
}

const fn log_level(level: log::Level) -> LogLevel {
    match level {
        log::Level::Error => LogLevel::Error,
        log::Level::Warn => LogLevel::Warn,
        log::Level::Info => LogLevel::Info,
        log::Level::Debug => LogLevel::Debug,
        log::Level::Trace => LogLevel::Trace,
    }
}

static LOGGER_INSTANCE: OnceLock<Arc<dyn Logger>> = OnceLock::new();

/// Installs `logger` as the receiver of all library log output.
///
/// Only the first call has an effect; later calls report that a logger is
/// already set and return.
pub fn set_logger(logger: Arc<dyn Logger>) {
    if LOGGER_INSTANCE.set(logger).is_err() {
        eprintln!("Logger already set");
        return;
    }
    if let Err(e) = init_logger() {
        eprintln!("Failed to set logger: {e}");
    }
}

/// # Errors
///
/// Returns a `log::SetLoggerError` if another `log` implementation is already installed.
fn init_logger() -> Result<(), log::SetLoggerError> {
    static LOGGER: ForeignLogger = ForeignLogger;
    log::set_logger(&LOGGER)?;
    log::set_max_level(log::LevelFilter::Trace);
    Ok(())
}
