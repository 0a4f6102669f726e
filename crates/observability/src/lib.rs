//! Process-wide tracing/logging setup.

/// Tracing configuration (filters, layers).
pub mod tracing;

pub use self::tracing::LogFormat;

/// Initialize process-wide logging with the default `info` level.
///
/// Safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init("info", LogFormat::Json);
}

/// Initialize logging with an explicit fallback level and output format.
///
/// `RUST_LOG`, when set, always wins over `default_level`.
pub fn init_with(default_level: &str, format: LogFormat) {
    tracing::init(default_level, format);
}
