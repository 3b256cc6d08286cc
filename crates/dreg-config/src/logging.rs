//! Structured logging utilities for dreg components.
//!
//! Provides consistent logging with component prefixes and structured fields.
//!
//! # Usage
//!
//! ```ignore
//! use dreg_config::{log_scan_info, log_server_info};
//!
//! log_server_info!("Listening", addr = listen.as_str());
//! log_scan_info!("Scan complete", blobs = report.blobs_written);
//! ```

/// Component identifiers for log filtering
pub struct Component;

impl Component {
    pub const SERVER: &'static str = "SERVER";
    pub const SCAN: &'static str = "SCAN";
    pub const CACHE: &'static str = "CACHE";
    pub const RUNTIME: &'static str = "RUNTIME";
}

/// Log levels for runtime configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("unknown log level: {other}")),
        }
    }
}

// === SERVER logging macros ===

#[macro_export]
macro_rules! log_server_error {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::error!(component = "SERVER", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_server_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "SERVER", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_server_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "SERVER", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_server_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "SERVER", $($key = $value,)* $msg)
    };
}

// === SCAN logging macros ===

#[macro_export]
macro_rules! log_scan_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "SCAN", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_scan_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "SCAN", $($key = $value,)* $msg)
    };
}

// === CACHE logging macros ===

#[macro_export]
macro_rules! log_cache_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "CACHE", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_cache_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "CACHE", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_cache_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "CACHE", $($key = $value,)* $msg)
    };
}

// === RUNTIME logging macros ===

#[macro_export]
macro_rules! log_runtime_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "RUNTIME", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_runtime_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "RUNTIME", $($key = $value,)* $msg)
    };
}

/// Initialize logging with the given level filter.
/// Call this once at application startup; `RUST_LOG` takes precedence.
pub fn init_logging(level: LogLevel) {
    use tracing_subscriber::EnvFilter;

    let filter = match level {
        LogLevel::Error => "error",
        LogLevel::Warn => "warn",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
        LogLevel::Trace => "trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}
