//! REST client tests against scripted transports
//!
//! Every request the client builds is captured, so these check the exact
//! wire shape: method, path, parameter order, signature and headers.

use crate::mocks::{book_ticker, MockTransport, ScriptedConnector, Step};
use crate::wait_until;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futlink_core::millis;
use futlink_exchanges::binance::{
    BinanceFuturesClient, BinanceRestClient, Credentials, FuturesConfig, OrderRequest, OrderSide, OrderType,
    PriceQuote, Signer, TimeInForce,
};
use futlink_exchanges::errors::{ExchangeError, Result};
use futlink_exchanges::http::{HttpMethod, HttpRequest, HttpResponse, HttpTransport};
use mockall::mock;
use rstest::*;
use serde_json::{json, Value};
use std::time::Duration;

const PUBLIC_KEY: &str = "test-public-key";
const SECRET_KEY: &str = "test-secret-key";

mock! {
    pub Http {}

    #[async_trait(?Send)]
    impl HttpTransport for Http {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

#[fixture]
fn config() -> FuturesConfig {
    FuturesConfig::testnet().with_credentials(Credentials::new(PUBLIC_KEY, SECRET_KEY).unwrap())
}

fn signer() -> Signer {
    Signer::new(Credentials::new(PUBLIC_KEY, SECRET_KEY).unwrap())
}

fn client(config: &FuturesConfig, transport: &MockTransport) -> BinanceRestClient<MockTransport> {
    BinanceRestClient::with_transport(config, transport.clone()).unwrap()
}

fn pairs(encoded: &str) -> Vec<(String, String)> {
    url::form_urlencoded::parse(encoded.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

fn keys(encoded: &str) -> Vec<String> {
    pairs(encoded).into_iter().map(|(k, _)| k).collect()
}

fn value_of(encoded: &str, key: &str) -> Option<String> {
    pairs(encoded).into_iter().find(|(k, _)| k == key).map(|(_, v)| v)
}

/// The encoded parameters must end in a valid signature over everything before it
fn assert_signed(encoded: &str) {
    let (payload, signature) = encoded
        .rsplit_once("&signature=")
        .expect("signature must be the last parameter");
    assert!(signer().verify(payload, signature), "bad signature over {payload}");

    let timestamp: u64 = value_of(encoded, "timestamp").unwrap().parse().unwrap();
    assert!(millis().abs_diff(timestamp) < 60_000, "stale timestamp {timestamp}");
}

fn exchange_info() -> Value {
    json!({
        "timezone": "UTC",
        "serverTime": 1_704_067_200_000i64,
        "symbols": [
            {
                "symbol": "BTCUSDT", "pair": "BTCUSDT", "contractType": "PERPETUAL", "status": "TRADING",
                "baseAsset": "BTC", "quoteAsset": "USDT", "marginAsset": "USDT",
                "pricePrecision": 2, "quantityPrecision": 3,
                "filters": [
                    {"filterType": "PRICE_FILTER", "tickSize": "0.10"},
                    {"filterType": "LOT_SIZE", "stepSize": "0.001", "minQty": "0.001"},
                    {"filterType": "MIN_NOTIONAL", "notional": "100"}
                ]
            },
            {
                "symbol": "BTCUSDT_240628", "pair": "BTCUSDT", "contractType": "CURRENT_QUARTER", "status": "TRADING",
                "baseAsset": "BTC", "quoteAsset": "USDT", "marginAsset": "USDT",
                "pricePrecision": 1, "quantityPrecision": 3, "filters": []
            }
        ]
    })
}

fn account() -> Value {
    json!({
        "totalWalletBalance": "1000.00000000",
        "assets": [
            {"asset": "USDT", "walletBalance": "1000.00000000", "unrealizedProfit": "12.50000000",
             "marginBalance": "1012.50000000", "maintMargin": "4.00000000", "initialMargin": "40.00000000"},
            {"asset": "BNB", "walletBalance": "0.50000000", "unrealizedProfit": "0.00000000",
             "marginBalance": "0.50000000", "maintMargin": "0.00000000", "initialMargin": "0.00000000"}
        ]
    })
}

fn order_json(status: &str, order_type: &str) -> Value {
    json!({
        "orderId": 4_050_123_456u64, "symbol": "BTCUSDT", "status": status,
        "clientOrderId": "FL-test", "price": "30000.00", "avgPrice": "0.00",
        "origQty": "0.010", "executedQty": "0.000", "side": "BUY", "type": order_type,
        "timeInForce": "GTC", "updateTime": 1_704_067_200_123u64
    })
}

// ============================================================================
// ERROR HANDLING
// ============================================================================

#[cfg(test)]
mod error_tests {
    use super::*;

    #[rstest]
    #[monoio::test]
    async fn test_not_found_fails_once_without_retry(config: FuturesConfig) {
        let mut http = MockHttp::new();
        http.expect_send().times(1).returning(|_| {
            Ok(HttpResponse {
                status: 404,
                headers: Vec::new(),
                body: "<html>Not Found</html>".to_string(),
            })
        });

        let client = BinanceRestClient::with_transport(&config, http).unwrap();
        let err = client.list_contracts().await.unwrap_err();

        assert_eq!(err.status(), Some(404));
        assert!(matches!(err, ExchangeError::Request { ref body, .. } if body.contains("Not Found")));
    }

    #[rstest]
    #[case(400)]
    #[case(401)]
    #[case(418)]
    #[case(429)]
    #[case(500)]
    #[case(503)]
    #[monoio::test]
    async fn test_non_200_statuses_are_request_errors(config: FuturesConfig, #[case] status: u16) {
        let transport = MockTransport::new().respond(status, r#"{"code":-1000,"msg":"failure"}"#);
        let client = client(&config, &transport);

        let err = client.get_balances().await.unwrap_err();
        assert_eq!(
            err,
            ExchangeError::Request {
                status,
                body: r#"{"code":-1000,"msg":"failure"}"#.to_string()
            }
        );
        assert_eq!(transport.request_count(), 1);
    }

    #[rstest]
    #[monoio::test]
    async fn test_transport_timeout_propagates(config: FuturesConfig) {
        let transport = MockTransport::new().fail(ExchangeError::Timeout("GET /fapi/v1/klines exceeded 5000ms".to_string()));
        let client = client(&config, &transport);

        let err = client
            .get_historical_candles("BTCUSDT", "1h", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Timeout(_)));
    }

    #[rstest]
    #[monoio::test]
    async fn test_malformed_body_is_serialization_error(config: FuturesConfig) {
        let transport = MockTransport::new().respond(200, "{\"symbols\": [");
        let client = client(&config, &transport);

        let err = client.list_contracts().await.unwrap_err();
        assert!(matches!(err, ExchangeError::Serialization(_)));
    }

    #[monoio::test]
    async fn test_signed_call_without_credentials_sends_nothing() {
        let transport = MockTransport::new().respond_json(account());
        let client = client(&FuturesConfig::testnet(), &transport);

        let err = client.get_balances().await.unwrap_err();
        assert_eq!(err, ExchangeError::MissingCredentials("PUBLIC_KEY".to_string()));
        assert_eq!(transport.request_count(), 0);
    }
}

// ============================================================================
// MARKET DATA AND ACCOUNT
// ============================================================================

#[cfg(test)]
mod query_tests {
    use super::*;

    #[rstest]
    #[monoio::test]
    async fn test_contracts_keyed_by_symbol(config: FuturesConfig) {
        let transport = MockTransport::new().respond_json(exchange_info());
        let client = client(&config, &transport);

        let contracts = client.list_contracts().await.unwrap();
        assert_eq!(contracts.len(), 2);
        assert_eq!(contracts["BTCUSDT"].tick_size, 0.1);
        assert_eq!(contracts["BTCUSDT"].min_notional, 100.0);
        assert_eq!(contracts["BTCUSDT_240628"].contract_type, "CURRENT_QUARTER");

        let request = transport.last_request().unwrap();
        assert_eq!(request.method, HttpMethod::Get);
        assert_eq!(request.url.as_str(), "https://testnet.binancefuture.com/fapi/v1/exchangeInfo");
        assert_eq!(request.header_value("X-MBX-APIKEY"), None);
    }

    #[rstest]
    #[monoio::test]
    async fn test_balances_use_signed_get(config: FuturesConfig) {
        let transport = MockTransport::new().respond_json(account());
        let client = client(&config, &transport);

        let balances = client.get_balances().await.unwrap();
        assert_eq!(balances.len(), 2);
        assert_eq!(balances["USDT"].wallet_balance, 1000.0);
        assert_eq!(balances["USDT"].unrealized_pnl, 12.5);
        assert_eq!(balances["USDT"].maintenance_margin, 4.0);

        let request = transport.last_request().unwrap();
        assert_eq!(request.method, HttpMethod::Get);
        assert_eq!(request.url.path(), "/fapi/v3/account");
        assert_eq!(request.header_value("X-MBX-APIKEY"), Some(PUBLIC_KEY));
        assert!(request.body.is_none());

        let query = request.url.query().unwrap();
        assert_eq!(keys(query), ["timestamp", "signature"]);
        assert_signed(query);
    }

    #[rstest]
    #[case(None, None, vec!["symbol", "interval"])]
    #[case(
        Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
        Some(Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap()),
        vec!["symbol", "interval", "startTime", "endTime"]
    )]
    #[monoio::test]
    async fn test_klines_request_and_parse(
        config: FuturesConfig,
        #[case] start: Option<chrono::DateTime<Utc>>,
        #[case] end: Option<chrono::DateTime<Utc>>,
        #[case] expected_keys: Vec<&str>,
    ) {
        let rows = json!([
            [1_704_067_200_000i64, "42283.5", "42554.5", "42261.0", "42475.2", "5612.123",
             1_704_070_799_999i64, "237812345.12", 48120, "2805.1", "118901234.5", "0"],
            [1_704_070_800_000i64, "42475.2", "42600.0", "42400.1", "42580.0", "3011.5",
             1_704_074_399_999i64, "128112345.00", 30111, "1500.2", "63880000.1", "0"]
        ]);
        let transport = MockTransport::new().respond_json(rows);
        let client = client(&config, &transport);

        let candles = client
            .get_historical_candles("BTCUSDT", "1h", start, end)
            .await
            .unwrap();
        assert_eq!(candles.len(), 2);
        assert!(candles[0].open_time < candles[1].open_time);
        assert_eq!(candles[0].close, 42475.2);
        assert_eq!(candles[1].trade_count, 30111.0);

        let request = transport.last_request().unwrap();
        let query = request.url.query().unwrap();
        assert_eq!(request.url.path(), "/fapi/v1/klines");
        assert_eq!(keys(query), expected_keys);
        if start.is_some() {
            assert_eq!(value_of(query, "startTime").as_deref(), Some("1704067200000"));
            assert_eq!(value_of(query, "endTime").as_deref(), Some("1704153600000"));
        }
        assert_eq!(value_of(query, "signature"), None);
    }

    #[rstest]
    #[monoio::test]
    async fn test_short_kline_row_is_rejected(config: FuturesConfig) {
        let transport = MockTransport::new().respond_json(json!([[1_704_067_200_000i64, "1", "2", "0.5"]]));
        let client = client(&config, &transport);

        let err = client
            .get_historical_candles("BTCUSDT", "1m", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::InvalidResponse(_)));
    }

    #[rstest]
    #[monoio::test]
    async fn test_bid_ask_writes_price_table(config: FuturesConfig) {
        let transport = MockTransport::new().respond_json(json!({
            "symbol": "ETHUSDT", "bidPrice": "2250.10", "bidQty": "12.0",
            "askPrice": "2250.20", "askQty": "8.5", "time": 1_704_067_200_000i64
        }));
        let client = client(&config, &transport);

        let quote = client.get_bid_ask("ETHUSDT").await.unwrap();
        assert_eq!(quote, PriceQuote::new(2250.10, 2250.20));
        assert_eq!(client.price_table().get("ETHUSDT"), Some(quote));

        let request = transport.last_request().unwrap();
        assert_eq!(request.url.path(), "/fapi/v1/ticker/bookTicker");
        assert_eq!(request.url.query(), Some("symbol=ETHUSDT"));
    }
}

// ============================================================================
// ORDERS
// ============================================================================

#[cfg(test)]
mod order_tests {
    use super::*;

    #[rstest]
    #[monoio::test]
    async fn test_limit_order_posts_signed_form_body(config: FuturesConfig) {
        let transport = MockTransport::new().respond_json(order_json("NEW", "LIMIT"));
        let client = client(&config, &transport);

        let order = OrderRequest::limit("BTCUSDT", OrderSide::Buy, 0.01, 30_000.0);
        let status = client.place_order(&order).await.unwrap();
        assert_eq!(status.order_id, 4_050_123_456);
        assert!(status.is_open());

        let request = transport.last_request().unwrap();
        assert_eq!(request.method, HttpMethod::Post);
        assert_eq!(request.url.as_str(), "https://testnet.binancefuture.com/fapi/v1/order");
        assert_eq!(request.header_value("content-type"), Some("application/x-www-form-urlencoded"));
        assert_eq!(request.header_value("X-MBX-APIKEY"), Some(PUBLIC_KEY));

        let body = request.body.unwrap();
        assert_eq!(
            keys(&body),
            ["symbol", "side", "type", "quantity", "price", "timeInForce", "newClientOrderId", "timestamp", "signature"]
        );
        assert_eq!(value_of(&body, "quantity").as_deref(), Some("0.01"));
        assert_eq!(value_of(&body, "price").as_deref(), Some("30000"));
        assert_eq!(value_of(&body, "timeInForce").as_deref(), Some("GTC"));
        assert!(value_of(&body, "newClientOrderId").unwrap().starts_with("FL-"));
        assert_signed(&body);
    }

    #[rstest]
    #[monoio::test]
    async fn test_market_order_omits_price_and_time_in_force(config: FuturesConfig) {
        let transport = MockTransport::new().respond_json(order_json("FILLED", "MARKET"));
        let client = client(&config, &transport);

        let order = OrderRequest::market("BTCUSDT", OrderSide::Sell, 0.5).with_client_order_id("my-order-1");
        client.place_order(&order).await.unwrap();

        let body = transport.last_request().unwrap().body.unwrap();
        assert_eq!(value_of(&body, "price"), None);
        assert_eq!(value_of(&body, "timeInForce"), None);
        assert_eq!(value_of(&body, "side").as_deref(), Some("SELL"));
        assert_eq!(value_of(&body, "type").as_deref(), Some("MARKET"));
        assert_eq!(value_of(&body, "newClientOrderId").as_deref(), Some("my-order-1"));
    }

    #[rstest]
    #[monoio::test]
    async fn test_explicit_time_in_force_is_kept(config: FuturesConfig) {
        let transport = MockTransport::new().respond_json(order_json("NEW", "LIMIT"));
        let client = client(&config, &transport);

        let order = OrderRequest::limit("BTCUSDT", OrderSide::Buy, 0.01, 30_000.0)
            .with_time_in_force(TimeInForce::GoodTillCrossing);
        client.place_order(&order).await.unwrap();

        let body = transport.last_request().unwrap().body.unwrap();
        assert_eq!(value_of(&body, "timeInForce").as_deref(), Some("GTX"));
    }

    #[rstest]
    #[case::empty_symbol(OrderRequest::market("", OrderSide::Buy, 1.0))]
    #[case::zero_quantity(OrderRequest::market("BTCUSDT", OrderSide::Buy, 0.0))]
    #[case::negative_quantity(OrderRequest::market("BTCUSDT", OrderSide::Sell, -0.1))]
    #[case::infinite_quantity(OrderRequest::market("BTCUSDT", OrderSide::Sell, f64::INFINITY))]
    #[case::limit_without_price(OrderRequest {
        price: None,
        ..OrderRequest::limit("BTCUSDT", OrderSide::Buy, 0.01, 1.0)
    })]
    #[case::gtd_without_expiry(
        OrderRequest::limit("BTCUSDT", OrderSide::Buy, 0.01, 1.0).with_time_in_force(TimeInForce::GoodTillDate)
    )]
    #[case::unsafe_client_id(
        OrderRequest::market("BTCUSDT", OrderSide::Buy, 1.0).with_client_order_id("not allowed!")
    )]
    #[monoio::test]
    async fn test_invalid_orders_are_never_sent(config: FuturesConfig, #[case] order: OrderRequest) {
        let transport = MockTransport::new().respond_json(order_json("NEW", "LIMIT"));
        let client = client(&config, &transport);

        let err = client.place_order(&order).await.unwrap_err();
        assert!(matches!(err, ExchangeError::InvalidOrder(_)), "unexpected {err:?}");
        assert_eq!(transport.request_count(), 0);
    }

    #[rstest]
    #[monoio::test]
    async fn test_cancel_order_uses_signed_delete(config: FuturesConfig) {
        let transport = MockTransport::new().respond_json(order_json("CANCELED", "LIMIT"));
        let client = client(&config, &transport);

        let status = client.cancel_order("BTCUSDT", 4_050_123_456).await.unwrap();
        assert_eq!(status.status, "CANCELED");
        assert!(!status.is_open());

        let request = transport.last_request().unwrap();
        assert_eq!(request.method, HttpMethod::Delete);
        assert_eq!(request.url.path(), "/fapi/v1/order");
        assert!(request.body.is_none());

        let query = request.url.query().unwrap();
        assert_eq!(keys(query), ["symbol", "orderId", "timestamp", "signature"]);
        assert_eq!(value_of(query, "orderId").as_deref(), Some("4050123456"));
        assert_signed(query);
    }

    #[rstest]
    #[monoio::test]
    async fn test_order_status_and_history(config: FuturesConfig) {
        let transport = MockTransport::new()
            .respond_json(order_json("PARTIALLY_FILLED", "LIMIT"))
            .respond_json(json!([order_json("FILLED", "MARKET"), order_json("CANCELED", "LIMIT")]));
        let client = client(&config, &transport);

        let status = client.get_order_status("BTCUSDT", 4_050_123_456).await.unwrap();
        assert_eq!(status.status, "PARTIALLY_FILLED");

        let orders = client.list_orders("BTCUSDT").await.unwrap();
        assert_eq!(orders.len(), 2);
        assert_eq!(orders[0].order_type, OrderType::Market);

        let requests = transport.requests();
        assert_eq!(requests[0].method, HttpMethod::Get);
        assert_eq!(requests[0].url.path(), "/fapi/v1/order");
        assert_eq!(requests[1].url.path(), "/fapi/v1/allOrders");
        assert_signed(requests[1].url.query().unwrap());
    }

    #[rstest]
    #[monoio::test]
    async fn test_good_till_date_order_sends_expiry(config: FuturesConfig) {
        let mut response = order_json("NEW", "LIMIT");
        response["timeInForce"] = json!("GTD");
        let transport = MockTransport::new().respond_json(response);
        let client = client(&config, &transport);

        let expiry = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let order = OrderRequest::limit("BTCUSDT", OrderSide::Buy, 0.01, 30_000.0).good_till(expiry);
        let status = client.place_order(&order).await.unwrap();
        assert_eq!(status.time_in_force, Some(TimeInForce::GoodTillDate));

        let body = transport.last_request().unwrap().body.unwrap();
        assert_eq!(value_of(&body, "timeInForce").as_deref(), Some("GTD"));
        assert_eq!(value_of(&body, "goodTillDate").as_deref(), Some("1704153600000"));
        assert_signed(&body);
    }

    #[rstest]
    #[monoio::test]
    async fn test_order_history_with_gtd_orders_parses(config: FuturesConfig) {
        let mut gtd = order_json("EXPIRED", "LIMIT");
        gtd["timeInForce"] = json!("GTD");
        gtd["goodTillDate"] = json!(1_704_153_600_000u64);
        let transport = MockTransport::new().respond_json(json!([order_json("FILLED", "MARKET"), gtd]));
        let client = client(&config, &transport);

        let orders = client.list_orders("BTCUSDT").await.unwrap();
        assert_eq!(orders.len(), 2);
        assert_eq!(orders[1].time_in_force, Some(TimeInForce::GoodTillDate));
        assert!(!orders[1].is_open());
    }
}

// ============================================================================
// CLIENT FACADE
// ============================================================================

#[cfg(test)]
mod facade_tests {
    use super::*;

    #[rstest]
    #[monoio::test]
    async fn test_connect_loads_contracts_balances_and_streams(config: FuturesConfig) {
        let transport = MockTransport::new()
            .respond_json(exchange_info())
            .respond_json(account())
            .respond_json(json!({"symbol": "ETHUSDT", "bidPrice": "2250.1", "askPrice": "2250.2"}));
        let connector = ScriptedConnector::new().session(vec![Step::Message(book_ticker(
            "BTCUSDT",
            "42000.10",
            "42000.20",
        ))]);

        let mut client = BinanceFuturesClient::connect_with(
            config.with_reconnect_delay_ms(10),
            transport.clone(),
            connector.clone(),
        )
        .await
        .unwrap();

        assert!(client.contract("BTCUSDT").is_some());
        assert_eq!(client.balances()["USDT"].initial_margin, 40.0);

        assert!(client.stream().wait_connected(Duration::from_secs(5)));
        assert!(wait_until(Duration::from_secs(5), || client.price("BTCUSDT").is_some()));
        assert_eq!(client.price("BTCUSDT"), Some(PriceQuote::new(42000.10, 42000.20)));

        // REST lookups land in the same table the stream writes.
        client.get_bid_ask("ETHUSDT").await.unwrap();
        assert_eq!(client.prices().symbols(), ["BTCUSDT".to_string(), "ETHUSDT".to_string()]);

        client.shutdown();
        assert_eq!(connector.sent().len(), 1);
        assert_eq!(connector.close_count(), 1);
    }

    #[monoio::test]
    async fn test_connect_without_credentials_skips_balances() {
        let transport = MockTransport::new().respond_json(exchange_info());
        let mut client = BinanceFuturesClient::connect_with(FuturesConfig::testnet(), transport.clone(), ScriptedConnector::new())
            .await
            .unwrap();

        assert!(client.balances().is_empty());
        assert_eq!(transport.request_count(), 1);
        client.shutdown();
    }
}
