//! # futlink exchange connectors
//!
//! Binance USDⓈ-M futures over monoio.
//!
//! ## Architecture
//!
//! - **monoio HTTPS client** - single-threaded async REST calls with a timeout
//! - **Request signing** - HMAC-SHA256 over insertion-ordered parameters
//! - **WebSocket price stream** - book-ticker table kept by a worker thread
//! - **Transport traits** - HTTP and stream seams that tests can script

pub mod binance;
pub mod errors;
pub mod http;
pub mod websocket;

// Re-export main types
pub use binance::{BinanceFuturesClient, BinanceRestClient, FuturesConfig, PriceStream, PriceTable};
pub use errors::{ExchangeError, Result};
pub use http::{HttpMethod, HttpRequest, HttpResponse, HttpTransport, MonoioHttpsClient};
pub use websocket::{MonoioWebSocket, StreamConnection, StreamConnector, WssConnector};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::binance::{
        BinanceFuturesClient, BinanceRestClient, Credentials, FuturesConfig, PriceStream, PriceTable,
        QueryParams, StreamHealth, StreamState,
    };
    pub use crate::binance::types::*;
    pub use crate::errors::{ExchangeError, Result};
    pub use crate::http::{HttpMethod, HttpTransport, MonoioHttpsClient};
    pub use crate::websocket::{StreamConnection, StreamConnector, WssConnector};
    pub use futlink_core::prelude::*;
}
