//! # futlink core
//!
//! Runtime and support code shared by the futlink exchange crates.
//!
//! ## Pieces
//!
//! 1. **monoio runtimes** - the caller's runtime and a dedicated worker thread
//!    for background stream loops
//! 2. **CPU binding** - optional pinning of the worker thread
//! 3. **Timing** - nanosecond timestamps, perf timers, exchange millisecond times
//! 4. **Logging** - tracing subscriber setup, optionally teed to a file
//! 5. **ID generation** - nanoid based client order ids

pub mod runtime;
pub mod timing;
pub mod logging;
pub mod id_gen;
pub mod cpu;

// Re-export commonly used items
pub use runtime::{FutlinkRuntime, RuntimeConfig, WorkerHandle};
pub use timing::{nanos, millis, PerfTimer, Timestamp, TimeError};
pub use logging::{init_logging, init_logging_with_file};
pub use id_gen::{generate_client_order_id, is_valid_client_order_id};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::runtime::{FutlinkRuntime, RuntimeConfig, WorkerHandle};
    pub use crate::timing::{
        datetime_to_ms, millis, ms_to_datetime, nanos, parse_date_ms, PerfTimer, Timestamp,
    };
    pub use crate::id_gen::{generate_client_order_id, is_valid_client_order_id};
    pub use crate::logging::{init_logging, init_logging_with_file};
    pub use crate::cpu::{bind_to_cpu_set, get_cpu_count};

    // Common external types
    pub use monoio;
    pub use serde::{Deserialize, Serialize};
    pub use chrono::{DateTime, Utc};
}
