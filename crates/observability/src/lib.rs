//! Tracing and logging setup shared by every keyward process.

/// Initialize process-wide logging with the format taken from
/// `KEYWARD_LOG_FORMAT` (`json` unless set to `pretty`).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(LogFormat::from_env());
}

/// Tracing configuration (filters, layers).
pub mod tracing;

pub use tracing::LogFormat;
