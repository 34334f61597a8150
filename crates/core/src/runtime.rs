//! monoio runtimes for the caller and for background workers
//!
//! The caller drives REST calls on its own runtime. Long-running loops (the
//! price stream) get a dedicated OS thread with a private monoio runtime, so
//! they never compete with the caller's tasks.

use monoio::{FusionDriver, RuntimeBuilder};
use std::future::Future;
use std::io;
use std::thread::{self, JoinHandle};
use tracing::{info, warn};
use crate::cpu::{bind_to_cpu_set, get_cpu_count};

/// Runtime configuration
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// CPU core to pin the thread to (None for no binding)
    pub cpu_core: Option<usize>,
    pub thread_name: String,
    /// Worker thread stack size
    pub stack_size: Option<usize>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            cpu_core: None,
            thread_name: "futlink-main".to_string(),
            stack_size: Some(2 * 1024 * 1024),
        }
    }
}

impl RuntimeConfig {
    pub fn worker(name: impl Into<String>) -> Self {
        Self {
            thread_name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_cpu_core(mut self, core: Option<usize>) -> Self {
        self.cpu_core = core;
        self
    }
}

/// Handle to a worker thread started with [`FutlinkRuntime::spawn_worker`]
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    handle: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the worker to exit. A panicked worker is logged, not propagated.
    pub fn join(self) {
        if self.handle.join().is_err() {
            warn!("Worker thread {} panicked", self.name);
        }
    }
}

/// monoio runtime wrapper with timers enabled
pub struct FutlinkRuntime {
    config: RuntimeConfig,
}

impl FutlinkRuntime {
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        Self { config }
    }

    /// Run a future to completion on a fresh runtime on the current thread
    pub fn block_on<F>(&self, future: F) -> io::Result<F::Output>
    where
        F: Future,
    {
        if let Some(cpu_core) = self.config.cpu_core {
            Self::pin(cpu_core);
        }

        let mut runtime = RuntimeBuilder::<FusionDriver>::new()
            .enable_timer()
            .build()?;
        Ok(runtime.block_on(future))
    }

    /// Start `f` on a new named OS thread with its own runtime.
    ///
    /// `f` runs on the new thread, so the future it builds does not need to
    /// be `Send`.
    pub fn spawn_worker<F, Fut>(config: RuntimeConfig, f: F) -> io::Result<WorkerHandle>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        let name = config.thread_name.clone();
        let mut builder = thread::Builder::new().name(name.clone());
        if let Some(stack_size) = config.stack_size {
            builder = builder.stack_size(stack_size);
        }

        let handle = builder.spawn(move || {
            let runtime = FutlinkRuntime::with_config(config);
            if let Err(e) = runtime.block_on(f()) {
                warn!("Worker runtime failed to start: {}", e);
            }
        })?;

        info!("🧵 Worker thread {} started", name);
        Ok(WorkerHandle { name, handle })
    }

    fn pin(cpu_core: usize) {
        match bind_to_cpu_set(cpu_core) {
            Ok(()) => info!("🔗 Bound to CPU core {} of {}", cpu_core, get_cpu_count()),
            Err(e) => warn!("Failed to bind to CPU core {}: {}", cpu_core, e),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }
}

impl Default for FutlinkRuntime {
    fn default() -> Self {
        Self::new()
    }
}
