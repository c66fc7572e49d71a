//! Signed order placement over the Binance WebSocket API

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use wsfeed_core::{ChannelName, ClientError, ClientHandle, ClientHandler, ClientResult};

use crate::error::{BinanceError, BinanceResult};
use crate::signer::RequestSigner;

/// Take-profit distance from the entry price (0.06%)
const TAKE_PROFIT_RATIO: f64 = 0.0006;
/// Stop-loss distance from the entry price (0.04%)
const STOP_LOSS_RATIO: f64 = 0.0004;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Externally generated instruction to place one order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeSignal {
    pub symbol: String,
    pub side: OrderSide,
    #[serde(rename = "type")]
    pub order_type: String,
    pub quantity: f64,
    pub price: f64,
}

impl TradeSignal {
    pub fn validate(&self) -> BinanceResult<()> {
        if self.symbol.is_empty() || !self.symbol.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(BinanceError::InvalidSignal(format!("bad symbol '{}'", self.symbol)));
        }
        if self.order_type.is_empty() {
            return Err(BinanceError::InvalidSignal("order type is empty".to_string()));
        }
        if !self.quantity.is_finite() || self.quantity <= 0.0 {
            return Err(BinanceError::InvalidSignal(format!("bad quantity {}", self.quantity)));
        }
        if !self.price.is_finite() || self.price <= 0.0 {
            return Err(BinanceError::InvalidSignal(format!("bad price {}", self.price)));
        }
        Ok(())
    }
}

/// A serialized `order.place` request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderRequest {
    pub id: String,
    pub payload: String,
}

/// Builds signed `order.place` requests with attached take-profit/stop-loss prices
pub struct OrderRequestBuilder {
    api_key: String,
    signer: Arc<dyn RequestSigner>,
    price_precision: usize,
}

impl OrderRequestBuilder {
    pub fn new(api_key: impl Into<String>, signer: Arc<dyn RequestSigner>) -> Self {
        Self {
            api_key: api_key.into(),
            signer,
            price_precision: 2,
        }
    }

    /// Decimal places for the take-profit and stop-loss prices
    #[must_use]
    pub fn with_price_precision(mut self, precision: usize) -> Self {
        self.price_precision = precision;
        self
    }

    /// `(take_profit, stop_loss)` formatted to the configured precision
    pub fn protective_prices(&self, side: OrderSide, price: f64) -> (String, String) {
        let (take_profit, stop_loss) = match side {
            OrderSide::Buy => (price * (1.0 + TAKE_PROFIT_RATIO), price * (1.0 - STOP_LOSS_RATIO)),
            OrderSide::Sell => (price * (1.0 - TAKE_PROFIT_RATIO), price * (1.0 + STOP_LOSS_RATIO)),
        };
        (
            format!("{:.*}", self.price_precision, take_profit),
            format!("{:.*}", self.price_precision, stop_loss),
        )
    }

    pub fn build(&self, signal: &TradeSignal, timestamp_ms: i64) -> BinanceResult<OrderRequest> {
        signal.validate()?;
        let (take_profit, stop_loss) = self.protective_prices(signal.side, signal.price);

        // Sorted by key; the signature covers exactly this ordering
        let mut params: BTreeMap<&str, String> = BTreeMap::new();
        params.insert("apiKey", self.api_key.clone());
        params.insert("price", signal.price.to_string());
        params.insert("quantity", signal.quantity.to_string());
        params.insert("side", signal.side.as_str().to_string());
        params.insert("symbol", signal.symbol.clone());
        params.insert("timeInForce", "GTC".to_string());
        params.insert("timestamp", timestamp_ms.to_string());
        params.insert("type", signal.order_type.clone());
        params.insert("takeProfitPrice", take_profit);
        params.insert("stopLossPrice", stop_loss);
        params.insert("workingType", "MARK_PRICE".to_string());

        let query = params
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect::<Vec<_>>()
            .join("&");
        let signature = self.signer.sign(&query)?;

        let mut signed: Map<String, Value> = params
            .into_iter()
            .map(|(key, value)| (key.to_string(), Value::String(value)))
            .collect();
        signed.insert("signature".to_string(), Value::String(signature));

        let id = format!("order_{}", timestamp_ms);
        let payload = json!({
            "id": id,
            "method": "order.place",
            "params": signed,
        })
        .to_string();

        Ok(OrderRequest { id, payload })
    }

    pub fn build_now(&self, signal: &TradeSignal) -> BinanceResult<OrderRequest> {
        self.build(signal, chrono::Utc::now().timestamp_millis())
    }
}

/// Places orders through a shared client handle
pub struct OrderPlacer {
    handle: ClientHandle,
    builder: OrderRequestBuilder,
}

impl OrderPlacer {
    pub fn new(handle: ClientHandle, builder: OrderRequestBuilder) -> Self {
        Self { handle, builder }
    }

    /// Queue a signed order and return its request id
    pub fn place(&self, signal: &TradeSignal) -> BinanceResult<String> {
        let request = self.builder.build_now(signal)?;
        info!(
            "Placing order {}: {} {} {} {} @ {}",
            request.id, signal.symbol, signal.side, signal.order_type, signal.quantity, signal.price
        );
        self.handle.send(request.payload)?;
        Ok(request.id)
    }
}

/// Handler for `ws-api.binance.com` order connections
#[derive(Debug, Default)]
pub struct BinanceOrderHandler {
    accepted: AtomicU64,
    rejected: AtomicU64,
}

impl BinanceOrderHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

impl ClientHandler for BinanceOrderHandler {
    fn on_connection_established(&self) {
        info!("Order connection ready for placement");
    }

    fn on_message(&self, message: &Value) -> anyhow::Result<()> {
        let Some(id) = message.get("id") else {
            debug!("Order connection message: {}", message);
            return Ok(());
        };

        if let Some(err) = message.get("error") {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            error!("Order {} rejected: {}", id, err);
        } else if let Some(result) = message.get("result") {
            self.accepted.fetch_add(1, Ordering::Relaxed);
            info!("Order {} accepted: {}", id, result);
        } else {
            debug!("Order response without result: {}", message);
        }
        Ok(())
    }

    fn on_raw_message(&self, message: &str) -> anyhow::Result<()> {
        warn!("Unexpected non-JSON frame on order connection: {}", message);
        Ok(())
    }

    fn subscribe_payload(&self, channel: &ChannelName, _unsubscribe: bool) -> ClientResult<String> {
        Err(ClientError::payload_format(
            channel,
            "order connections have no subscription channels",
        ))
    }
}
