//! Binance collaborators for the wsfeed client
//!
//! Stream and order handlers plugged into [`wsfeed_core::StreamClient`], plus
//! signed `order.place` request construction.

pub mod error;
pub mod order;
pub mod signer;
pub mod stream;

pub use error::{BinanceError, BinanceResult};
pub use order::{
    BinanceOrderHandler, OrderPlacer, OrderRequest, OrderRequestBuilder, OrderSide, TradeSignal,
};
pub use signer::{Ed25519Signer, RequestSigner};
pub use stream::{BinanceStreamHandler, SUBSCRIBE_ACK_KEY};

/// Public market data streams
pub const STREAM_URL: &str = "wss://stream.binance.com:9443/ws";
/// WebSocket trading API
pub const WS_API_URL: &str = "wss://ws-api.binance.com:443/ws-api/v3";
