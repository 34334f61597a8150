//! Logging setup
//!
//! One tracing subscriber for the whole process. Level comes from `RUST_LOG`
//! (default `info`). The file variant tees every line into a log file next to
//! the terminal output.

use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::sync::{Arc, Once};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize terminal logging. Safe to call more than once.
pub fn init_logging() {
    INIT.call_once(|| {
        let result = tracing_subscriber::fmt()
            .with_env_filter(env_filter())
            .with_target(false)
            .with_thread_names(true)
            .try_init();

        if result.is_ok() {
            tracing::info!("📝 Logging initialized");
        }
    });
}

/// Initialize logging to the terminal and to `path` (appending).
///
/// Fails only if the file cannot be opened. If a subscriber is already
/// installed the call is a no-op.
pub fn init_logging_with_file(path: impl AsRef<Path>) -> io::Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path.as_ref())?;
    let file = Arc::new(file);

    INIT.call_once(|| {
        let result = tracing_subscriber::fmt()
            .with_env_filter(env_filter())
            .with_target(false)
            .with_thread_names(true)
            .with_writer(io::stdout.and(file))
            .try_init();

        if result.is_ok() {
            tracing::info!("📝 Logging initialized (file: {})", path.as_ref().display());
        }
    });

    Ok(())
}

#[macro_export]
macro_rules! log_order {
    ($action:expr, $order_id:expr, $symbol:expr) => {
        tracing::info!("📋 ORDER {}: {} ({})", $action, $order_id, $symbol);
    };
}
