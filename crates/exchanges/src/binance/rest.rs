//! Binance USDⓈ-M futures REST client
//!
//! - One round trip per call, bounded by the configured timeout
//! - Signed calls carry `timestamp` + `signature` and the `X-MBX-APIKEY` header
//! - Any non-200 answer is a typed error, never retried

use crate::binance::auth::{Credentials, PUBLIC_KEY_VAR, QueryParams, Signer};
use crate::binance::stream::PriceTable;
use crate::binance::types::{
    Balance, Candle, Contract, OrderRequest, OrderStatus, OrderType, PriceQuote, TimeInForce,
    parse_balances, parse_book_ticker, parse_candles, parse_contracts,
};
use crate::errors::{ExchangeError, Result};
use crate::http::{HttpMethod, HttpRequest, HttpTransport, MonoioHttpsClient};
use futlink_core::log_order;
use futlink_core::prelude::*;

use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

pub const MAINNET_REST_URL: &str = "https://fapi.binance.com";
pub const MAINNET_WS_URL: &str = "wss://fstream.binance.com/ws";
pub const TESTNET_REST_URL: &str = "https://testnet.binancefuture.com";
pub const TESTNET_WS_URL: &str = "wss://stream.binancefuture.com/ws";

/// Futures connector configuration
#[derive(Debug, Clone)]
pub struct FuturesConfig {
    pub credentials: Option<Credentials>,
    pub base_url: String,
    pub ws_url: String,
    pub testnet: bool,
    pub timeout_ms: u64,
    pub reconnect_delay_ms: u64,
    /// Symbols the price stream subscribes to
    pub symbols: Vec<String>,
    /// CPU core for the stream worker thread
    pub cpu_core: Option<usize>,
}

impl Default for FuturesConfig {
    fn default() -> Self {
        Self {
            credentials: None,
            base_url: MAINNET_REST_URL.to_string(),
            ws_url: MAINNET_WS_URL.to_string(),
            testnet: false,
            timeout_ms: 5000,
            reconnect_delay_ms: 5000,
            symbols: vec!["BTCUSDT".to_string()],
            cpu_core: None,
        }
    }
}

impl FuturesConfig {
    pub fn testnet() -> Self {
        Self::default().with_testnet(true)
    }

    /// Select the testnet or production endpoints
    pub fn with_testnet(mut self, testnet: bool) -> Self {
        let (base_url, ws_url) = if testnet {
            (TESTNET_REST_URL, TESTNET_WS_URL)
        } else {
            (MAINNET_REST_URL, MAINNET_WS_URL)
        };
        self.testnet = testnet;
        self.base_url = base_url.to_string();
        self.ws_url = ws_url.to_string();
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Credentials from `PUBLIC_KEY` / `SECRET_KEY`
    pub fn with_env_credentials(self) -> Result<Self> {
        Ok(self.with_credentials(Credentials::from_env()?))
    }

    pub fn with_urls(mut self, base_url: impl Into<String>, ws_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self.ws_url = ws_url.into();
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_reconnect_delay_ms(mut self, delay_ms: u64) -> Self {
        self.reconnect_delay_ms = delay_ms;
        self
    }

    pub fn with_symbols<I, S>(mut self, symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.symbols = symbols.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_cpu_core(mut self, core: Option<usize>) -> Self {
        self.cpu_core = core;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn validate(&self) -> Result<()> {
        Url::parse(&self.base_url)?;
        Url::parse(&self.ws_url)?;
        if self.timeout_ms == 0 {
            return Err(ExchangeError::Configuration("timeout_ms must be positive".to_string()));
        }
        if self.symbols.iter().any(|s| s.trim().is_empty()) {
            return Err(ExchangeError::Configuration("empty symbol in stream symbols".to_string()));
        }
        Ok(())
    }
}

/// Binance futures REST client
pub struct BinanceRestClient<T: HttpTransport = MonoioHttpsClient> {
    base_url: Url,
    signer: Option<Signer>,
    transport: T,
    prices: PriceTable,
}

impl BinanceRestClient<MonoioHttpsClient> {
    /// Client over the monoio HTTPS transport
    pub fn new(config: &FuturesConfig) -> Result<Self> {
        Self::with_transport(config, MonoioHttpsClient::new(config.timeout()))
    }
}

impl<T: HttpTransport> BinanceRestClient<T> {
    pub fn with_transport(config: &FuturesConfig, transport: T) -> Result<Self> {
        config.validate()?;
        let base_url = Url::parse(&config.base_url)?;

        info!("🔗 Binance futures REST client created");
        info!("   Base URL: {}", base_url);
        info!("   Authenticated: {}", config.credentials.is_some());

        Ok(Self {
            base_url,
            signer: config.credentials.clone().map(Signer::new),
            transport,
            prices: PriceTable::new(),
        })
    }

    /// Write `get_bid_ask` results into `prices` instead of a private table
    pub fn with_price_table(mut self, prices: PriceTable) -> Self {
        self.prices = prices;
        self
    }

    pub fn price_table(&self) -> PriceTable {
        self.prices.clone()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn signer(&self) -> Result<&Signer> {
        self.signer
            .as_ref()
            .ok_or_else(|| ExchangeError::MissingCredentials(PUBLIC_KEY_VAR.to_string()))
    }

    /// Issue one call and return the parsed JSON body of a 200 response
    pub async fn request(
        &self,
        method: HttpMethod,
        path: &str,
        mut params: QueryParams,
        requires_auth: bool,
    ) -> Result<Value> {
        let _timer = PerfTimer::start(format!("binance_rest {method} {path}"));

        let signer = if requires_auth {
            let signer = self.signer()?;
            signer.sign_params(&mut params, millis())?;
            Some(signer)
        } else {
            None
        };

        let mut url = self.base_url.join(path)?;
        let encoded = params.encode();

        let mut request = match method {
            HttpMethod::Post => HttpRequest::new(method, url)
                .header("Content-Type", "application/x-www-form-urlencoded")
                .body(encoded),
            HttpMethod::Get | HttpMethod::Delete => {
                if !encoded.is_empty() {
                    url.set_query(Some(&encoded));
                }
                HttpRequest::new(method, url)
            }
        };

        if let Some(signer) = signer {
            request = request.header("X-MBX-APIKEY", signer.api_key());
        }

        let response = self.transport.send(request).await?;
        if response.status != 200 {
            warn!("❌ {} {} failed with HTTP {}", method, path, response.status);
            return Err(ExchangeError::Request {
                status: response.status,
                body: response.body,
            });
        }

        debug!("✅ {} {} ({} bytes)", method, path, response.body.len());
        Ok(serde_json::from_str(&response.body)?)
    }

    /// All contracts, keyed by symbol
    pub async fn list_contracts(&self) -> Result<HashMap<String, Contract>> {
        let response = self
            .request(HttpMethod::Get, "/fapi/v1/exchangeInfo", QueryParams::new(), false)
            .await?;
        let contracts = parse_contracts(&response)?;
        info!("📋 Loaded {} contracts", contracts.len());
        Ok(contracts)
    }

    /// Klines for `symbol`, oldest first as delivered by the exchange
    pub async fn get_historical_candles(
        &self,
        symbol: &str,
        interval: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<Candle>> {
        let mut params = QueryParams::new()
            .with("symbol", symbol)
            .with("interval", interval);
        params.push_opt("startTime", start.as_ref().map(datetime_to_ms));
        params.push_opt("endTime", end.as_ref().map(datetime_to_ms));

        let response = self
            .request(HttpMethod::Get, "/fapi/v1/klines", params, false)
            .await?;
        parse_candles(&response)
    }

    /// Futures wallet balances, keyed by asset
    pub async fn get_balances(&self) -> Result<HashMap<String, Balance>> {
        let response = self
            .request(HttpMethod::Get, "/fapi/v3/account", QueryParams::new(), true)
            .await?;
        parse_balances(&response)
    }

    /// Current best bid/ask, also written into the price table
    pub async fn get_bid_ask(&self, symbol: &str) -> Result<PriceQuote> {
        let params = QueryParams::new().with("symbol", symbol);
        let response = self
            .request(HttpMethod::Get, "/fapi/v1/ticker/bookTicker", params, false)
            .await?;

        let (symbol, quote) = parse_book_ticker(&response)?;
        self.prices.update(&symbol, quote);
        Ok(quote)
    }

    pub async fn place_order(&self, order: &OrderRequest) -> Result<OrderStatus> {
        order.validate()?;

        let time_in_force = match (order.time_in_force, order.order_type) {
            (None, OrderType::Limit) => Some(TimeInForce::GoodTillCanceled),
            (tif, _) => tif,
        };
        let client_order_id = order
            .client_order_id
            .clone()
            .unwrap_or_else(generate_client_order_id);

        let mut params = QueryParams::new()
            .with("symbol", &order.symbol)
            .with("side", order.side)
            .with("type", order.order_type)
            .with("quantity", order.quantity);
        params.push_opt("price", order.price);
        params.push_opt("timeInForce", time_in_force);
        params.push_opt("goodTillDate", order.good_till_date.as_ref().map(datetime_to_ms));
        params.push("newClientOrderId", &client_order_id);

        debug!(
            "📤 Placing {} {} {} {} (client id {})",
            order.side, order.order_type, order.quantity, order.symbol, client_order_id
        );
        let response = self
            .request(HttpMethod::Post, "/fapi/v1/order", params, true)
            .await?;
        let status: OrderStatus = serde_json::from_value(response)?;
        log_order!("PLACED", status.order_id, status.symbol);
        Ok(status)
    }

    pub async fn cancel_order(&self, symbol: &str, order_id: u64) -> Result<OrderStatus> {
        let params = QueryParams::new()
            .with("symbol", symbol)
            .with("orderId", order_id);
        let response = self
            .request(HttpMethod::Delete, "/fapi/v1/order", params, true)
            .await?;
        let status: OrderStatus = serde_json::from_value(response)?;
        log_order!("CANCELED", status.order_id, status.symbol);
        Ok(status)
    }

    pub async fn get_order_status(&self, symbol: &str, order_id: u64) -> Result<OrderStatus> {
        let params = QueryParams::new()
            .with("symbol", symbol)
            .with("orderId", order_id);
        let response = self
            .request(HttpMethod::Get, "/fapi/v1/order", params, true)
            .await?;
        Ok(serde_json::from_value(response)?)
    }

    /// All orders for `symbol`
    pub async fn list_orders(&self, symbol: &str) -> Result<Vec<OrderStatus>> {
        let params = QueryParams::new().with("symbol", symbol);
        let response = self
            .request(HttpMethod::Get, "/fapi/v1/allOrders", params, true)
            .await?;
        Ok(serde_json::from_value(response)?)
    }
}
