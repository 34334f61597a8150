//! Binance USDⓈ-M futures connector
//!
//! [`BinanceFuturesClient`] ties the signed REST client to the background
//! price stream. REST calls run on the caller's monoio runtime; the stream
//! has its own worker thread and only writes into the shared price table.

pub mod auth;
pub mod rest;
pub mod stream;
pub mod types;

use crate::errors::Result;
use crate::http::{HttpTransport, MonoioHttpsClient};
use crate::websocket::{StreamConnector, WssConnector};
use futlink_core::prelude::*;

use std::collections::HashMap;
use tracing::{info, warn};

pub use auth::{Credentials, QueryParams, Signer};
pub use rest::{BinanceRestClient, FuturesConfig};
pub use stream::{PriceStream, PriceTable, StreamHealth, StreamSettings, StreamState, apply_message};
pub use types::*;

/// Futures client: REST queries plus a live price table
pub struct BinanceFuturesClient<T: HttpTransport = MonoioHttpsClient> {
    rest: BinanceRestClient<T>,
    contracts: HashMap<String, Contract>,
    balances: HashMap<String, Balance>,
    stream: PriceStream,
}

impl BinanceFuturesClient<MonoioHttpsClient> {
    /// Connect over HTTPS and WSS. Credentials missing from `config` are
    /// read from `PUBLIC_KEY` / `SECRET_KEY`.
    pub async fn connect(config: FuturesConfig) -> Result<Self> {
        let config = match config.credentials {
            Some(_) => config,
            None => config.with_env_credentials()?,
        };
        let transport = MonoioHttpsClient::new(config.timeout());
        Self::connect_with(config, transport, WssConnector::new()).await
    }
}

impl<T: HttpTransport> BinanceFuturesClient<T> {
    /// Load contracts and balances, then start the price stream
    pub async fn connect_with<C: StreamConnector>(
        config: FuturesConfig,
        transport: T,
        connector: C,
    ) -> Result<Self> {
        let _timer = PerfTimer::start("binance_futures_connect");
        info!("🚀 Initializing Binance futures client");
        info!("   Base URL: {}", config.base_url);
        info!("   WebSocket: {}", config.ws_url);
        info!("   Testnet: {}", config.testnet);

        let rest = BinanceRestClient::with_transport(&config, transport)?;
        let contracts = rest.list_contracts().await?;

        let balances = if config.credentials.is_some() {
            rest.get_balances().await?
        } else {
            warn!("No credentials configured, skipping balances");
            HashMap::new()
        };

        let settings = StreamSettings::from_config(&config)?;
        let stream = PriceStream::start(connector, settings, rest.price_table())?;

        info!(
            "✅ Binance futures client ready ({} contracts, {} balances)",
            contracts.len(),
            balances.len()
        );

        Ok(Self {
            rest,
            contracts,
            balances,
            stream,
        })
    }

    pub fn rest(&self) -> &BinanceRestClient<T> {
        &self.rest
    }

    pub fn stream(&self) -> &PriceStream {
        &self.stream
    }

    /// Contracts loaded at connect time, keyed by symbol
    pub fn contracts(&self) -> &HashMap<String, Contract> {
        &self.contracts
    }

    pub fn contract(&self, symbol: &str) -> Option<&Contract> {
        self.contracts.get(symbol)
    }

    /// Balances as of connect time or the last [`refresh_balances`](Self::refresh_balances)
    pub fn balances(&self) -> &HashMap<String, Balance> {
        &self.balances
    }

    pub async fn refresh_balances(&mut self) -> Result<&HashMap<String, Balance>> {
        self.balances = self.rest.get_balances().await?;
        Ok(&self.balances)
    }

    pub fn prices(&self) -> PriceTable {
        self.rest.price_table()
    }

    /// Last streamed or fetched quote for `symbol`
    pub fn price(&self, symbol: &str) -> Option<PriceQuote> {
        self.rest.price_table().get(symbol)
    }

    pub fn subscribe(&self, symbol: &str) -> Result<()> {
        self.stream.subscribe(symbol)
    }

    pub async fn get_bid_ask(&self, symbol: &str) -> Result<PriceQuote> {
        self.rest.get_bid_ask(symbol).await
    }

    pub async fn get_historical_candles(
        &self,
        symbol: &str,
        interval: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<Candle>> {
        self.rest.get_historical_candles(symbol, interval, start, end).await
    }

    pub async fn place_order(&self, order: &OrderRequest) -> Result<OrderStatus> {
        self.rest.place_order(order).await
    }

    pub async fn cancel_order(&self, symbol: &str, order_id: u64) -> Result<OrderStatus> {
        self.rest.cancel_order(symbol, order_id).await
    }

    pub async fn get_order_status(&self, symbol: &str, order_id: u64) -> Result<OrderStatus> {
        self.rest.get_order_status(symbol, order_id).await
    }

    pub async fn list_orders(&self, symbol: &str) -> Result<Vec<OrderStatus>> {
        self.rest.list_orders(symbol).await
    }

    /// Stop the price stream and join its thread
    pub fn shutdown(&mut self) {
        self.stream.shutdown();
    }
}
