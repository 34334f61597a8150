//! Book-ticker price stream
//!
//! One persistent socket on a dedicated worker thread keeps a best bid/ask
//! table per symbol. The worker subscribes to `<symbol>@bookTicker` for every
//! symbol of interest each time the socket opens, and reconnects after a fixed
//! delay whenever the socket closes or fails.
//!
//! Callers never touch the socket. They read the shared [`PriceTable`] and
//! talk to the worker through [`PriceStream`].

use crate::binance::rest::FuturesConfig;
use crate::binance::types::{PriceQuote, parse_number};
use crate::errors::{ExchangeError, Result};
use crate::websocket::{StreamConnection, StreamConnector};
use futlink_core::{FutlinkRuntime, PerfTimer, RuntimeConfig, WorkerHandle};

use flume::{Receiver, Sender, TryRecvError};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use url::Url;

/// Shared best bid/ask table keyed by symbol
#[derive(Debug, Clone, Default)]
pub struct PriceTable {
    inner: Arc<RwLock<HashMap<String, PriceQuote>>>,
}

impl PriceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the quote for `symbol`
    pub fn update(&self, symbol: &str, quote: PriceQuote) {
        let mut table = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        match table.get_mut(symbol) {
            Some(existing) => *existing = quote,
            None => {
                table.insert(symbol.to_string(), quote);
            }
        }
    }

    pub fn get(&self, symbol: &str) -> Option<PriceQuote> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(symbol)
            .copied()
    }

    pub fn snapshot(&self) -> HashMap<String, PriceQuote> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        symbols.sort();
        symbols
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Apply one inbound stream message to `prices`.
///
/// Only `bookTicker` events change the table. Everything else (subscription
/// acks, other events, malformed text) is dropped. Returns whether the table
/// was updated.
pub fn apply_message(prices: &PriceTable, text: &str) -> bool {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            debug!("Dropping non-JSON stream message: {}", e);
            return false;
        }
    };

    match value.get("e").and_then(Value::as_str) {
        Some("bookTicker") => {}
        Some(other) => {
            debug!("Ignoring {} event", other);
            return false;
        }
        None => {
            debug!("Ignoring message without event type: {}", text);
            return false;
        }
    }

    let Some(symbol) = value.get("s").and_then(Value::as_str) else {
        debug!("Dropping bookTicker without symbol");
        return false;
    };

    let price = |field: &str| value.get(field).map(|v| parse_number(v, field));
    match (price("b"), price("a")) {
        (Some(Ok(bid)), Some(Ok(ask))) => {
            prices.update(symbol, PriceQuote::new(bid, ask));
            true
        }
        _ => {
            debug!("Dropping bookTicker for {} with unparsable prices", symbol);
            false
        }
    }
}

/// Stream connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Disconnected,
    Connecting,
    Open,
    Closed,
    Errored,
    /// Worker has exited after shutdown
    Stopped,
}

/// Stream health snapshot
#[derive(Debug, Clone)]
pub struct StreamHealth {
    pub state: StreamState,
    /// Whether the socket has reached `Open` at least once
    pub connected_once: bool,
    pub reconnect_count: u32,
    pub message_count: u64,
    /// Id of the last control message sent, 0 before the first
    pub last_request_id: u64,
    pub symbols: Vec<String>,
    pub last_error: Option<String>,
}

impl Default for StreamHealth {
    fn default() -> Self {
        Self {
            state: StreamState::Disconnected,
            connected_once: false,
            reconnect_count: 0,
            message_count: 0,
            last_request_id: 0,
            symbols: Vec::new(),
            last_error: None,
        }
    }
}

impl StreamHealth {
    pub fn is_open(&self) -> bool {
        self.state == StreamState::Open
    }
}

#[derive(Default)]
struct SharedHealth {
    health: Mutex<StreamHealth>,
    changed: Condvar,
}

impl SharedHealth {
    fn lock(&self) -> MutexGuard<'_, StreamHealth> {
        self.health.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, f: impl FnOnce(&mut StreamHealth)) {
        f(&mut self.lock());
        self.changed.notify_all();
    }

    fn set_state(&self, state: StreamState) {
        self.update(|h| {
            h.state = state;
            if state == StreamState::Open {
                h.connected_once = true;
            }
        });
    }
}

/// Where and what the stream subscribes to
#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub url: Url,
    pub symbols: Vec<String>,
    pub reconnect_delay: Duration,
    pub cpu_core: Option<usize>,
}

impl StreamSettings {
    pub fn new(url: Url, symbols: Vec<String>) -> Self {
        Self {
            url,
            symbols,
            reconnect_delay: Duration::from_millis(5000),
            cpu_core: None,
        }
    }

    pub fn from_config(config: &FuturesConfig) -> Result<Self> {
        Ok(Self {
            url: Url::parse(&config.ws_url)?,
            symbols: config.symbols.clone(),
            reconnect_delay: config.reconnect_delay(),
            cpu_core: config.cpu_core,
        })
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }
}

#[derive(Debug)]
enum StreamCommand {
    Subscribe(String),
}

enum SessionEvent {
    Shutdown,
    Command(StreamCommand),
    Readable(Result<()>),
}

#[derive(Serialize)]
struct ControlMessage<'a> {
    method: &'a str,
    params: Vec<String>,
    id: u64,
}

/// `{"method":"SUBSCRIBE","params":["<symbol>@bookTicker",...],"id":N}`
pub fn subscribe_message<S: AsRef<str>>(symbols: &[S], id: u64) -> Result<String> {
    let message = ControlMessage {
        method: "SUBSCRIBE",
        params: symbols
            .iter()
            .map(|s| format!("{}@bookTicker", s.as_ref().to_lowercase()))
            .collect(),
        id,
    };
    Ok(serde_json::to_string(&message)?)
}

fn normalize_symbol(symbol: &str) -> String {
    symbol.trim().to_uppercase()
}

/// Handle to the running price stream worker
pub struct PriceStream {
    commands: Sender<StreamCommand>,
    shutdown: Option<Sender<()>>,
    health: Arc<SharedHealth>,
    prices: PriceTable,
    worker: Option<WorkerHandle>,
}

impl PriceStream {
    /// Start the worker thread. Returns immediately; the first connect
    /// happens in the background.
    pub fn start<C: StreamConnector>(connector: C, settings: StreamSettings, prices: PriceTable) -> Result<Self> {
        let (command_tx, command_rx) = flume::unbounded();
        let (shutdown_tx, shutdown_rx) = flume::bounded(1);
        let health = Arc::new(SharedHealth::default());

        let mut symbols: Vec<String> = Vec::new();
        for symbol in settings.symbols.iter().map(|s| normalize_symbol(s)) {
            if !symbol.is_empty() && !symbols.contains(&symbol) {
                symbols.push(symbol);
            }
        }
        health.update(|h| h.symbols = symbols.clone());

        info!("📈 Starting price stream");
        info!("   URL: {}", settings.url);
        info!("   Symbols: {:?}", symbols);

        let worker = StreamWorker {
            connector,
            url: settings.url,
            reconnect_delay: settings.reconnect_delay,
            symbols,
            next_id: 1,
            prices: prices.clone(),
            health: health.clone(),
            commands: command_rx,
        };

        let runtime_config = RuntimeConfig::worker("futlink-price-stream").with_cpu_core(settings.cpu_core);
        let handle = FutlinkRuntime::spawn_worker(runtime_config, move || worker.run(shutdown_rx))
            .map_err(|e| ExchangeError::ConnectionFailed(format!("Failed to start stream worker: {e}")))?;

        Ok(Self {
            commands: command_tx,
            shutdown: Some(shutdown_tx),
            health,
            prices,
            worker: Some(handle),
        })
    }

    /// Add `symbol` to the subscription list. Sent right away when the
    /// socket is open, and on every later reconnect.
    pub fn subscribe(&self, symbol: &str) -> Result<()> {
        let symbol = normalize_symbol(symbol);
        if symbol.is_empty() {
            return Err(ExchangeError::Configuration("empty symbol".to_string()));
        }
        self.commands
            .send(StreamCommand::Subscribe(symbol))
            .map_err(|_| ExchangeError::ConnectionFailed("Price stream has stopped".to_string()))
    }

    /// Block until the socket has opened once, or `timeout` elapses
    pub fn wait_connected(&self, timeout: Duration) -> bool {
        let guard = self.health.lock();
        let (guard, _) = self
            .health
            .changed
            .wait_timeout_while(guard, timeout, |h| !h.connected_once && h.state != StreamState::Stopped)
            .unwrap_or_else(PoisonError::into_inner);
        guard.connected_once
    }

    pub fn health(&self) -> StreamHealth {
        self.health.lock().clone()
    }

    pub fn state(&self) -> StreamState {
        self.health.lock().state
    }

    pub fn prices(&self) -> PriceTable {
        self.prices.clone()
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    /// Stop the worker and wait for its thread to exit
    pub fn shutdown(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.try_send(());
        }
        if let Some(worker) = self.worker.take() {
            worker.join();
            info!("🛑 Price stream stopped");
        }
    }
}

impl Drop for PriceStream {
    fn drop(&mut self) {
        // Dropping the sender wakes the worker; the thread exits on its own.
        self.shutdown.take();
    }
}

struct StreamWorker<C: StreamConnector> {
    connector: C,
    url: Url,
    reconnect_delay: Duration,
    symbols: Vec<String>,
    next_id: u64,
    prices: PriceTable,
    health: Arc<SharedHealth>,
    commands: Receiver<StreamCommand>,
}

impl<C: StreamConnector> StreamWorker<C> {
    async fn run(mut self, shutdown: Receiver<()>) {
        loop {
            let outcome = self.session(&shutdown).await;
            if outcome == StreamState::Stopped {
                break;
            }

            self.health.update(|h| {
                h.state = outcome;
                h.reconnect_count += 1;
            });
            warn!(
                "🔄 Price stream {:?}, reconnecting in {}ms",
                outcome,
                self.reconnect_delay.as_millis()
            );

            let stop = monoio::select! {
                _ = shutdown.recv_async() => true,
                _ = monoio::time::sleep(self.reconnect_delay) => false,
            };
            if stop {
                break;
            }
        }

        self.health.set_state(StreamState::Stopped);
        info!("Price stream worker exiting");
    }

    /// One connection lifetime. Returns `Closed` or `Errored` when the socket
    /// goes away, `Stopped` when shutdown was signalled.
    async fn session(&mut self, shutdown: &Receiver<()>) -> StreamState {
        self.health.set_state(StreamState::Connecting);

        let connection = {
            let _timer = PerfTimer::start("price_stream_connect");
            monoio::select! {
                _ = shutdown.recv_async() => None,
                connection = self.connector.connect(&self.url) => Some(connection),
            }
        };
        let mut connection = match connection {
            None => return StreamState::Stopped,
            Some(Ok(connection)) => connection,
            Some(Err(e)) => return self.fail("connect", &e),
        };

        // Symbols requested while disconnected join the full list.
        self.drain_commands();
        let symbols = self.symbols.clone();
        if let Err(e) = self.send_subscribe(&mut connection, &symbols).await {
            return self.fail("subscribe", &e);
        }

        self.health.set_state(StreamState::Open);
        info!("✅ Price stream open, subscribed to {} symbols", symbols.len());

        loop {
            // Only the readiness wait is raced; a read already under way
            // must not be dropped midway through a frame.
            let event = monoio::select! {
                _ = shutdown.recv_async() => SessionEvent::Shutdown,
                command = self.commands.recv_async() => match command {
                    Ok(command) => SessionEvent::Command(command),
                    Err(_) => SessionEvent::Shutdown,
                },
                ready = connection.readable() => SessionEvent::Readable(ready),
            };

            match event {
                SessionEvent::Shutdown => return Self::stop(&mut connection).await,
                SessionEvent::Command(command) => {
                    if let Err(e) = self.apply_command(command, &mut connection).await {
                        return self.fail("subscribe", &e);
                    }
                }
                SessionEvent::Readable(Err(e)) => return self.fail("read", &e),
                SessionEvent::Readable(Ok(())) => {
                    let message = monoio::select! {
                        _ = shutdown.recv_async() => None,
                        message = connection.next_message() => Some(message),
                    };
                    match message {
                        None => return Self::stop(&mut connection).await,
                        Some(Ok(Some(text))) => {
                            self.health.lock().message_count += 1;
                            apply_message(&self.prices, &text);
                        }
                        Some(Ok(None)) => {
                            info!("🔌 Price stream closed by peer");
                            return StreamState::Closed;
                        }
                        Some(Err(e)) => return self.fail("read", &e),
                    }
                }
            }
        }
    }

    async fn stop(connection: &mut C::Connection) -> StreamState {
        if let Err(e) = connection.close().await {
            debug!("Close on shutdown failed: {}", e);
        }
        StreamState::Stopped
    }

    fn fail(&self, what: &str, err: &ExchangeError) -> StreamState {
        error!("❌ Price stream {} failed: {}", what, err);
        self.record_error(err);
        StreamState::Errored
    }

    /// Fold commands queued while disconnected into the symbol list
    fn drain_commands(&mut self) {
        loop {
            match self.commands.try_recv() {
                Ok(StreamCommand::Subscribe(symbol)) => {
                    self.add_symbol(symbol);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return,
            }
        }
    }

    /// Apply one command while open; a new symbol is subscribed right away
    async fn apply_command(&mut self, command: StreamCommand, connection: &mut C::Connection) -> Result<()> {
        match command {
            StreamCommand::Subscribe(symbol) => {
                if !self.add_symbol(symbol.clone()) {
                    return Ok(());
                }
                self.send_subscribe(connection, &[symbol]).await
            }
        }
    }

    /// Returns false when the symbol was already subscribed
    fn add_symbol(&mut self, symbol: String) -> bool {
        if self.symbols.contains(&symbol) {
            return false;
        }
        self.symbols.push(symbol);
        let symbols = self.symbols.clone();
        self.health.update(|h| h.symbols = symbols);
        true
    }

    async fn send_subscribe(&mut self, connection: &mut C::Connection, symbols: &[String]) -> Result<()> {
        if symbols.is_empty() {
            return Ok(());
        }

        let id = self.next_id;
        self.next_id += 1;
        let message = subscribe_message(symbols, id)?;

        debug!("📨 {}", message);
        connection.send_text(message).await?;
        self.health.update(|h| h.last_request_id = id);
        Ok(())
    }

    fn record_error(&self, err: &ExchangeError) {
        let message = err.to_string();
        self.health.update(|h| h.last_error = Some(message));
    }
}
