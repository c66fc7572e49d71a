//! wsfeed trader
//!
//! `wsfeed-trader orders` reads newline-delimited JSON trade signals from
//! stdin and places signed orders over the Binance WebSocket API.
//! `wsfeed-trader stream` subscribes to `WSFEED_STREAMS` and logs market events.

use anyhow::{bail, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{debug, error, info, warn};

use wsfeed_binance::{
    BinanceOrderHandler, BinanceStreamHandler, Ed25519Signer, OrderPlacer, OrderRequestBuilder,
    TradeSignal, STREAM_URL, SUBSCRIBE_ACK_KEY, WS_API_URL,
};
use wsfeed_core::{ClientConfig, ConnectionState, StreamClient, TungsteniteTransport};

const CALLBACK_INTERVAL: Duration = Duration::from_millis(100);
const METRICS_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mode = std::env::args().nth(1).unwrap_or_else(|| "stream".to_string());
    match mode.as_str() {
        "orders" => run_orders().await,
        "stream" => run_stream().await,
        other => bail!("Unknown mode '{}', expected 'orders' or 'stream'", other),
    }
}

fn client_config(default_url: &str) -> ClientConfig {
    let url = std::env::var("WSFEED_URL").unwrap_or_else(|_| default_url.to_string());
    let log_traffic = std::env::var("WSFEED_LOG_TRAFFIC")
        .map(|v| v == "1" || v == "true")
        .unwrap_or(false);
    ClientConfig::new(url).with_log_traffic(log_traffic)
}

async fn connect(
    config: ClientConfig,
    handler: Arc<dyn wsfeed_core::ClientHandler>,
) -> Result<StreamClient> {
    let transport = TungsteniteTransport::new(config.connect_timeout);
    let url = config.url.clone();
    let client = StreamClient::connect(config, handler, transport)
        .await
        .with_context(|| format!("Failed to connect to {}", url))?;
    info!("✅ Connected to {}", url);
    Ok(client)
}

async fn run_orders() -> Result<()> {
    let api_key = std::env::var("BINANCE_API_KEY").context("BINANCE_API_KEY is not set")?;
    let key_path = std::env::var("BINANCE_PRIVATE_KEY_PATH")
        .context("BINANCE_PRIVATE_KEY_PATH is not set")?;
    let signer = Ed25519Signer::from_pem_file(&key_path)
        .with_context(|| format!("Failed to load private key from {}", key_path))?;

    let handler = Arc::new(BinanceOrderHandler::new());
    let client = connect(client_config(WS_API_URL), handler.clone()).await?;
    let builder = OrderRequestBuilder::new(api_key, Arc::new(signer));
    let placer = OrderPlacer::new(client.handle(), builder);
    let mut state = client.state_receiver();

    info!("📨 Reading trade signals from stdin. Press Ctrl+C to stop.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut ticker = tokio::time::interval(CALLBACK_INTERVAL);

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("🛑 Shutdown signal received...");
                break;
            }
            line = lines.next_line() => match line? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => match serde_json::from_str::<TradeSignal>(&line) {
                    Ok(trade) => match placer.place(&trade) {
                        Ok(id) => debug!("Queued order {}", id),
                        Err(e) => error!("Failed to place order for {}: {}", trade.symbol, e),
                    },
                    Err(e) => warn!("Ignoring malformed trade signal '{}': {}", line, e),
                },
                None => {
                    info!("Signal input closed");
                    break;
                }
            },
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                if current == ConnectionState::Disconnected {
                    error!("Order connection lost and reconnects exhausted, restart required");
                }
            }
            _ = ticker.tick() => {
                client.process_pending_callbacks();
            }
        }
    }

    info!(
        "Orders accepted: {}, rejected: {}",
        handler.accepted(),
        handler.rejected()
    );
    client.shutdown().await;
    info!("✅ Order placement shutdown complete");
    Ok(())
}

async fn run_stream() -> Result<()> {
    let streams: Vec<String> = std::env::var("WSFEED_STREAMS")
        .unwrap_or_else(|_| "btcusdt@trade".to_string())
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    let (handler, mut events) = BinanceStreamHandler::new(1);
    let client = connect(client_config(STREAM_URL), Arc::new(handler)).await?;

    client.set_subscription_callback(|channel, ok| {
        if ok {
            info!("📈 Subscribed to {}", channel);
        } else {
            error!("Subscription to {} was never confirmed", channel);
        }
    });
    client.set_unsubscription_callback(|channel, ok| {
        if ok {
            info!("Unsubscribed from {}", channel);
        } else {
            warn!("Unsubscribe from {} was never confirmed", channel);
        }
    });

    for stream in &streams {
        if let Err(e) = client.subscribe_dynamic(stream.as_str(), SUBSCRIBE_ACK_KEY, true) {
            error!("Skipping stream: {}", e);
        }
    }

    info!("📊 Streaming {} channel(s). Press Ctrl+C to stop.", streams.len());
    let mut ticker = tokio::time::interval(CALLBACK_INTERVAL);
    let mut metrics_ticker = tokio::time::interval(METRICS_INTERVAL);
    let mut received: u64 = 0;

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("🛑 Shutdown signal received...");
                break;
            }
            event = events.recv() => match event {
                Some(event) => {
                    received += 1;
                    debug!("Market event: {}", event);
                }
                None => break,
            },
            _ = ticker.tick() => {
                client.process_pending_callbacks();
            }
            _ = metrics_ticker.tick() => {
                let metrics = client.metrics();
                info!(
                    "State {}, events {}, frames {}, reconnections {}, subscription failures {}",
                    client.state(),
                    received,
                    metrics.frames_received,
                    metrics.reconnections,
                    metrics.subscription_failures
                );
            }
        }
    }

    info!("Confirmed at shutdown: {:?}", client.confirmed_channels());
    client.shutdown().await;
    info!("✅ Stream shutdown complete");
    Ok(())
}
