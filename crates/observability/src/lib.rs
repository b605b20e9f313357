//! Tracing and logging setup shared by every scheduler process.

/// Tracing configuration (filters, output format).
pub mod tracing;

pub use self::tracing::LogConfig;

/// Initialize process-wide tracing/logging.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init(config: &LogConfig) {
    tracing::init(config);
}
