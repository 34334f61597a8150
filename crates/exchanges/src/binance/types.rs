//! Binance USDⓈ-M futures types and response parsers
//!
//! Prices travel as decimal strings on the wire and are converted to `f64`
//! here. Order objects keep the exchange's string fields as delivered.

use crate::errors::{ExchangeError, Result};
use futlink_core::prelude::*;
use serde_json::Value;
use std::collections::HashMap;

/// Best bid/ask for one symbol
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PriceQuote {
    pub bid: f64,
    pub ask: f64,
}

impl PriceQuote {
    pub fn new(bid: f64, ask: f64) -> Self {
        Self { bid, ask }
    }

    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }

    pub fn spread(&self) -> f64 {
        self.ask - self.bid
    }
}

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL")]
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

/// Futures order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Limit,
    Market,
    Stop,
    StopMarket,
    TakeProfit,
    TakeProfitMarket,
    TrailingStopMarket,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Limit => "LIMIT",
            OrderType::Market => "MARKET",
            OrderType::Stop => "STOP",
            OrderType::StopMarket => "STOP_MARKET",
            OrderType::TakeProfit => "TAKE_PROFIT",
            OrderType::TakeProfitMarket => "TAKE_PROFIT_MARKET",
            OrderType::TrailingStopMarket => "TRAILING_STOP_MARKET",
        }
    }
}

/// Time in force
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeInForce {
    #[serde(rename = "GTC")]
    GoodTillCanceled,
    #[serde(rename = "IOC")]
    ImmediateOrCancel,
    #[serde(rename = "FOK")]
    FillOrKill,
    /// Post only
    #[serde(rename = "GTX")]
    GoodTillCrossing,
    /// Expires at `goodTillDate`
    #[serde(rename = "GTD")]
    GoodTillDate,
}

impl TimeInForce {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeInForce::GoodTillCanceled => "GTC",
            TimeInForce::ImmediateOrCancel => "IOC",
            TimeInForce::FillOrKill => "FOK",
            TimeInForce::GoodTillCrossing => "GTX",
            TimeInForce::GoodTillDate => "GTD",
        }
    }
}

macro_rules! display_as_str {
    ($($ty:ty),*) => {
        $(impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        })*
    };
}

display_as_str!(OrderSide, OrderType, TimeInForce);

/// New order parameters
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: f64,
    pub price: Option<f64>,
    pub time_in_force: Option<TimeInForce>,
    /// Expiry for `GTD` orders
    pub good_till_date: Option<DateTime<Utc>>,
    pub client_order_id: Option<String>,
}

impl OrderRequest {
    pub fn market(symbol: impl Into<String>, side: OrderSide, quantity: f64) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            order_type: OrderType::Market,
            quantity,
            price: None,
            time_in_force: None,
            good_till_date: None,
            client_order_id: None,
        }
    }

    pub fn limit(symbol: impl Into<String>, side: OrderSide, quantity: f64, price: f64) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            order_type: OrderType::Limit,
            quantity,
            price: Some(price),
            time_in_force: None,
            good_till_date: None,
            client_order_id: None,
        }
    }

    pub fn with_time_in_force(mut self, tif: TimeInForce) -> Self {
        self.time_in_force = Some(tif);
        self
    }

    /// Rest as `GTD` until `expiry`
    pub fn good_till(mut self, expiry: DateTime<Utc>) -> Self {
        self.time_in_force = Some(TimeInForce::GoodTillDate);
        self.good_till_date = Some(expiry);
        self
    }

    pub fn with_client_order_id(mut self, id: impl Into<String>) -> Self {
        self.client_order_id = Some(id.into());
        self
    }

    /// Required-field checks done before anything is sent
    pub fn validate(&self) -> Result<()> {
        if self.symbol.trim().is_empty() {
            return Err(ExchangeError::InvalidOrder("symbol is required".to_string()));
        }
        if !self.quantity.is_finite() || self.quantity <= 0.0 {
            return Err(ExchangeError::InvalidOrder(format!(
                "quantity must be positive, got {}",
                self.quantity
            )));
        }
        if self.order_type == OrderType::Limit && self.price.is_none() {
            return Err(ExchangeError::InvalidOrder("LIMIT order requires a price".to_string()));
        }
        if let Some(price) = self.price {
            if !price.is_finite() || price <= 0.0 {
                return Err(ExchangeError::InvalidOrder(format!("price must be positive, got {price}")));
            }
        }
        if self.time_in_force == Some(TimeInForce::GoodTillDate) && self.good_till_date.is_none() {
            return Err(ExchangeError::InvalidOrder("GTD order requires goodTillDate".to_string()));
        }
        if let Some(id) = &self.client_order_id {
            if !is_valid_client_order_id(id) {
                return Err(ExchangeError::InvalidOrder(format!("invalid client order id {id:?}")));
            }
        }
        Ok(())
    }
}

/// Order object returned by the order endpoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderStatus {
    pub order_id: u64,
    pub symbol: String,
    pub status: String,
    #[serde(default)]
    pub client_order_id: String,
    #[serde(default)]
    pub price: String,
    #[serde(default)]
    pub avg_price: String,
    #[serde(default)]
    pub orig_qty: String,
    #[serde(default)]
    pub executed_qty: String,
    pub side: OrderSide,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    #[serde(default)]
    pub time_in_force: Option<TimeInForce>,
    #[serde(default)]
    pub update_time: u64,
}

impl OrderStatus {
    pub fn is_open(&self) -> bool {
        matches!(self.status.as_str(), "NEW" | "PARTIALLY_FILLED")
    }
}

/// Futures contract specification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    pub symbol: String,
    pub pair: String,
    pub contract_type: String,
    pub status: String,
    pub base_asset: String,
    pub quote_asset: String,
    pub margin_asset: String,
    pub price_precision: u32,
    pub quantity_precision: u32,
    pub tick_size: f64,
    pub step_size: f64,
    pub min_qty: f64,
    pub min_notional: f64,
}

impl Contract {
    pub fn is_trading(&self) -> bool {
        self.status == "TRADING"
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SymbolEntry {
    symbol: String,
    #[serde(default)]
    pair: String,
    #[serde(default)]
    contract_type: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    base_asset: String,
    #[serde(default)]
    quote_asset: String,
    #[serde(default)]
    margin_asset: String,
    #[serde(default)]
    price_precision: u32,
    #[serde(default)]
    quantity_precision: u32,
    #[serde(default)]
    filters: Vec<Value>,
}

impl SymbolEntry {
    fn filter_value(&self, filter_type: &str, field: &str) -> Result<f64> {
        let Some(filter) = self
            .filters
            .iter()
            .find(|f| f.get("filterType").and_then(Value::as_str) == Some(filter_type))
        else {
            return Ok(0.0);
        };

        match filter.get(field) {
            Some(value) => parse_number(value, field),
            None => Ok(0.0),
        }
    }

    fn into_contract(self) -> Result<Contract> {
        let tick_size = self.filter_value("PRICE_FILTER", "tickSize")?;
        let step_size = self.filter_value("LOT_SIZE", "stepSize")?;
        let min_qty = self.filter_value("LOT_SIZE", "minQty")?;
        let min_notional = self.filter_value("MIN_NOTIONAL", "notional")?;

        Ok(Contract {
            symbol: self.symbol,
            pair: self.pair,
            contract_type: self.contract_type,
            status: self.status,
            base_asset: self.base_asset,
            quote_asset: self.quote_asset,
            margin_asset: self.margin_asset,
            price_precision: self.price_precision,
            quantity_precision: self.quantity_precision,
            tick_size,
            step_size,
            min_qty,
            min_notional,
        })
    }
}

/// Contracts from an `exchangeInfo` response, keyed by symbol
pub fn parse_contracts(value: &Value) -> Result<HashMap<String, Contract>> {
    let symbols = value
        .get("symbols")
        .and_then(Value::as_array)
        .ok_or_else(|| ExchangeError::InvalidResponse("exchangeInfo without symbols".to_string()))?;

    symbols
        .iter()
        .map(|entry| -> Result<(String, Contract)> {
            let entry: SymbolEntry = serde_json::from_value(entry.clone())?;
            let contract = entry.into_contract()?;
            Ok((contract.symbol.clone(), contract))
        })
        .collect()
}

/// One kline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub close_time: DateTime<Utc>,
    pub quote_volume: f64,
    pub trade_count: f64,
}

impl Candle {
    /// `[openTime, o, h, l, c, v, closeTime, quoteVolume, trades, ...]`
    pub fn from_row(row: &Value) -> Result<Self> {
        let cols = row
            .as_array()
            .ok_or_else(|| ExchangeError::InvalidResponse("kline row is not an array".to_string()))?;
        if cols.len() < 9 {
            return Err(ExchangeError::InvalidResponse(format!(
                "kline row has {} columns, expected at least 9",
                cols.len()
            )));
        }

        let time = |idx: usize, field: &str| -> Result<DateTime<Utc>> {
            let ms = cols[idx]
                .as_i64()
                .ok_or_else(|| ExchangeError::InvalidResponse(format!("kline {field} is not an integer")))?;
            Ok(ms_to_datetime(ms)?)
        };

        Ok(Self {
            open_time: time(0, "openTime")?,
            open: parse_number(&cols[1], "open")?,
            high: parse_number(&cols[2], "high")?,
            low: parse_number(&cols[3], "low")?,
            close: parse_number(&cols[4], "close")?,
            volume: parse_number(&cols[5], "volume")?,
            close_time: time(6, "closeTime")?,
            quote_volume: parse_number(&cols[7], "quoteVolume")?,
            trade_count: parse_number(&cols[8], "trades")?,
        })
    }
}

/// Candles from a `klines` response, in exchange order
pub fn parse_candles(value: &Value) -> Result<Vec<Candle>> {
    value
        .as_array()
        .ok_or_else(|| ExchangeError::InvalidResponse("klines response is not an array".to_string()))?
        .iter()
        .map(Candle::from_row)
        .collect()
}

/// Futures wallet balance for one asset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub asset: String,
    pub wallet_balance: f64,
    pub unrealized_pnl: f64,
    pub margin_balance: f64,
    pub maintenance_margin: f64,
    pub initial_margin: f64,
}

/// Balances from the `assets` array of an account response, keyed by asset
pub fn parse_balances(value: &Value) -> Result<HashMap<String, Balance>> {
    let assets = value
        .get("assets")
        .and_then(Value::as_array)
        .ok_or_else(|| ExchangeError::InvalidResponse("account response without assets".to_string()))?;

    assets
        .iter()
        .map(|entry| -> Result<(String, Balance)> {
            let asset = entry
                .get("asset")
                .and_then(Value::as_str)
                .ok_or_else(|| ExchangeError::InvalidResponse("balance without asset".to_string()))?
                .to_string();

            let field = |name: &str| entry.get(name).map_or(Ok(0.0), |v| parse_number(v, name));

            let balance = Balance {
                wallet_balance: field("walletBalance")?,
                unrealized_pnl: field("unrealizedProfit")?,
                margin_balance: field("marginBalance")?,
                maintenance_margin: field("maintMargin")?,
                initial_margin: field("initialMargin")?,
                asset: asset.clone(),
            };
            Ok((asset, balance))
        })
        .collect()
}

/// `(symbol, quote)` from a REST `ticker/bookTicker` response
pub fn parse_book_ticker(value: &Value) -> Result<(String, PriceQuote)> {
    let symbol = value
        .get("symbol")
        .and_then(Value::as_str)
        .ok_or_else(|| ExchangeError::InvalidResponse("bookTicker without symbol".to_string()))?;

    let price = |name: &str| {
        value
            .get(name)
            .ok_or_else(|| ExchangeError::InvalidResponse(format!("bookTicker without {name}")))
            .and_then(|v| parse_number(v, name))
    };

    Ok((symbol.to_string(), PriceQuote::new(price("bidPrice")?, price("askPrice")?)))
}

/// A JSON decimal string or number as `f64`
pub fn parse_number(value: &Value, field: &str) -> Result<f64> {
    let parsed = match value {
        Value::String(s) => s.parse::<f64>().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    };
    parsed
        .filter(|v| v.is_finite())
        .ok_or_else(|| ExchangeError::InvalidResponse(format!("{field} is not a number: {value}")))
}
