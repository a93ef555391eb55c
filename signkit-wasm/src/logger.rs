use signkit_core::logger::{LogLevel, Logger};

/// Writes library logs to the devtools console.
pub struct ConsoleLogger;

impl Logger for ConsoleLogger {
    fn log(&self, level: LogLevel, message: String) {
        let line = format!("[signkit] {message}");
        match level {
            LogLevel::Error => web_sys::console::error_1(&line.into()),
            LogLevel::Warn => web_sys::console::warn_1(&line.into()),
            LogLevel::Info => web_sys::console::info_1(&line.into()),
            LogLevel::Debug | LogLevel::Trace => web_sys::console::debug_1(&line.into()),
        }
    }
}
