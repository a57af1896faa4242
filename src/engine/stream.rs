use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use super::bus::EventBus;
use super::cache::KlineCache;
use super::types::{Interval, Kline, KlineCloseEvent, Ticker};
use crate::config::StreamConfig;

fn duration_ms(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("no streams to subscribe to")]
    NoStreams,
    #[error("invalid stream url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("historical bootstrap failed for {symbol}/{interval}: {cause}")]
    Bootstrap { symbol: String, interval: String, cause: String },
}

#[derive(Debug, Deserialize)]
struct WsCombinedMessage {
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct WsKlineEvent {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "k")]
    kline: WsKlineData,
}

#[derive(Debug, Deserialize)]
struct WsKlineData {
    #[serde(rename = "t")]
    open_time: i64,
    #[serde(rename = "T")]
    close_time: i64,
    #[serde(rename = "i")]
    interval: String,
    #[serde(rename = "o")]
    open: String,
    #[serde(rename = "c")]
    close: String,
    #[serde(rename = "h")]
    high: String,
    #[serde(rename = "l")]
    low: String,
    #[serde(rename = "v")]
    volume: String,
    #[serde(rename = "q")]
    quote_volume: String,
    #[serde(rename = "n")]
    trade_count: i64,
    #[serde(rename = "V")]
    taker_buy_base: String,
    #[serde(rename = "Q")]
    taker_buy_quote: String,
    #[serde(rename = "x")]
    is_closed: bool,
}

#[derive(Debug, Deserialize)]
struct WsTickerEvent {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "c")]
    last_price: String,
    #[serde(rename = "P")]
    price_change_percent: String,
    #[serde(rename = "q")]
    quote_volume: String,
}

fn decimal_or_zero(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap_or_default()
}

impl WsKlineData {
    fn into_kline(self) -> Option<(Interval, Kline)> {
        let interval = Interval::from_str(&self.interval).ok()?;
        let kline = Kline {
            open_time: self.open_time,
            close_time: self.close_time,
            open: decimal_or_zero(&self.open),
            high: decimal_or_zero(&self.high),
            low: decimal_or_zero(&self.low),
            close: decimal_or_zero(&self.close),
            volume: decimal_or_zero(&self.volume),
            quote_volume: decimal_or_zero(&self.quote_volume),
            trade_count: self.trade_count,
            taker_buy_base: decimal_or_zero(&self.taker_buy_base),
            taker_buy_quote: decimal_or_zero(&self.taker_buy_quote),
            is_closed: self.is_closed,
        };
        Some((interval, kline))
    }
}

/// Bootstraps historical candles over REST and keeps the cache current via
/// a reconnecting combined-stream WebSocket, mirroring the teacher's
/// `BinanceWebSocket` reconnect loop generalized to our own cache/bus.
pub struct StreamClient {
    config: StreamConfig,
    http: reqwest::Client,
    cache: Arc<KlineCache>,
    bus: Arc<EventBus>,
    ticker_tx: mpsc::UnboundedSender<Ticker>,
    last_ticker_publish_ms: Arc<dashmap::DashMap<String, i64>>,
    reconnect_count: AtomicU64,
}

impl StreamClient {
    pub fn new(config: StreamConfig, cache: Arc<KlineCache>, bus: Arc<EventBus>) -> (Self, mpsc::UnboundedReceiver<Ticker>) {
        let (ticker_tx, ticker_rx) = mpsc::unbounded_channel();
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("building the REST client for historical bootstrap cannot fail with no custom TLS config");
        (
            Self {
                config,
                http,
                cache,
                bus,
                ticker_tx,
                last_ticker_publish_ms: Arc::new(dashmap::DashMap::new()),
                reconnect_count: AtomicU64::new(0),
            },
            ticker_rx,
        )
    }

    pub fn reconnect_count(&self) -> u64 {
        self.reconnect_count.load(Ordering::Relaxed)
    }

    /// Fetches `limit` historical candles for one symbol/interval over the
    /// public REST endpoint and seeds the cache with them.
    pub async fn bootstrap(&self, symbol: &str, interval: Interval) -> Result<(), StreamError> {
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit={}",
            self.config.rest_base_url,
            symbol.to_uppercase(),
            interval.as_str(),
            self.config.bootstrap_candles.min(1000),
        );
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| StreamError::Bootstrap {
                symbol: symbol.to_string(),
                interval: interval.as_str().to_string(),
                cause: e.to_string(),
            })?;
        let rows: Vec<serde_json::Value> = response.json().await.map_err(|e| StreamError::Bootstrap {
            symbol: symbol.to_string(),
            interval: interval.as_str().to_string(),
            cause: e.to_string(),
        })?;

        let klines: Vec<Kline> = rows
            .into_iter()
            .filter_map(|row| {
                let arr = row.as_array()?;
                Some(Kline {
                    open_time: arr.first()?.as_i64()?,
                    open: decimal_or_zero(arr.get(1)?.as_str()?),
                    high: decimal_or_zero(arr.get(2)?.as_str()?),
                    low: decimal_or_zero(arr.get(3)?.as_str()?),
                    close: decimal_or_zero(arr.get(4)?.as_str()?),
                    volume: decimal_or_zero(arr.get(5)?.as_str()?),
                    close_time: arr.get(6)?.as_i64()?,
                    quote_volume: decimal_or_zero(arr.get(7)?.as_str()?),
                    trade_count: arr.get(8)?.as_i64()?,
                    taker_buy_base: decimal_or_zero(arr.get(9)?.as_str()?),
                    taker_buy_quote: decimal_or_zero(arr.get(10)?.as_str()?),
                    is_closed: true,
                })
            })
            .collect();

        info!(symbol, interval = interval.as_str(), count = klines.len(), "bootstrapped historical candles");
        self.cache.put_all(symbol, interval, klines);
        Ok(())
    }

    pub async fn bootstrap_all(&self, symbols: &[String], intervals: &[Interval]) {
        for symbol in symbols {
            for &interval in intervals {
                if let Err(e) = self.bootstrap(symbol, interval).await {
                    warn!(symbol, interval = interval.as_str(), error = %e, "historical bootstrap failed, cache starts empty for this pair");
                }
            }
        }
    }

    fn build_stream_names(&self, symbols: &[String], intervals: &[Interval]) -> Vec<String> {
        let mut streams = Vec::new();
        for symbol in symbols {
            let lower = symbol.to_lowercase();
            for interval in intervals {
                streams.push(format!("{lower}@kline_{}", interval.as_str()));
            }
            streams.push(format!("{lower}@ticker"));
        }
        streams
    }

    fn build_websocket_url(&self, streams: &[String]) -> Result<Url, StreamError> {
        if streams.is_empty() {
            return Err(StreamError::NoStreams);
        }
        let base = self.config.ws_base_url.trim_end_matches('/');
        let joined = streams.join("/");
        Ok(Url::parse(&format!("{base}/stream?streams={joined}"))?)
    }

    /// Runs the reconnecting WebSocket loop until cancelled. Exponential
    /// backoff with jitter, capped per `StreamConfig`.
    pub async fn run(&self, symbols: Arc<parking_lot::RwLock<Vec<String>>>, intervals: Vec<Interval>, cancel: CancellationToken) {
        let mut backoff = duration_ms(self.config.reconnect_initial_ms);
        loop {
            if cancel.is_cancelled() {
                return;
            }
            let current_symbols = symbols.read().clone();
            match self.connect_and_run(&current_symbols, &intervals, &cancel).await {
                Ok(()) => {
                    info!("stream client stopped");
                    return;
                }
                Err(e) => {
                    self.reconnect_count.fetch_add(1, Ordering::Relaxed);
                    error!(error = %e, "stream connection dropped, reconnecting");
                    // gap repair: refetch the tail of each symbol/interval before resuming
                    self.bootstrap_all(&current_symbols, &intervals).await;
                    let jitter_ms = rand::rng().random_range(0..250);
                    sleep(backoff + Duration::from_millis(jitter_ms)).await;
                    backoff = (backoff * 2).min(duration_ms(self.config.reconnect_max_ms));
                }
            }
        }
    }

    async fn connect_and_run(&self, symbols: &[String], intervals: &[Interval], cancel: &CancellationToken) -> Result<(), StreamError> {
        let streams = self.build_stream_names(symbols, intervals);
        let url = self.build_websocket_url(&streams)?;
        info!(url = %url, "connecting to kline stream");

        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| StreamError::Bootstrap {
                symbol: "<all>".to_string(),
                interval: "<all>".to_string(),
                cause: e.to_string(),
            })?;
        let (mut write, mut read) = ws_stream.split();
        info!("stream connected");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                message = read.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => self.handle_message(&text),
                        Some(Ok(Message::Close(_))) => {
                            warn!("stream closed by server");
                            return Err(StreamError::Bootstrap {
                                symbol: "<all>".to_string(),
                                interval: "<all>".to_string(),
                                cause: "server closed connection".to_string(),
                            });
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if write.send(Message::Pong(data)).await.is_err() {
                                return Err(StreamError::Bootstrap {
                                    symbol: "<all>".to_string(),
                                    interval: "<all>".to_string(),
                                    cause: "failed to send pong".to_string(),
                                });
                            }
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            return Err(StreamError::Bootstrap {
                                symbol: "<all>".to_string(),
                                interval: "<all>".to_string(),
                                cause: e.to_string(),
                            });
                        }
                        None => {
                            return Err(StreamError::Bootstrap {
                                symbol: "<all>".to_string(),
                                interval: "<all>".to_string(),
                                cause: "stream ended".to_string(),
                            });
                        }
                    }
                }
            }
        }
    }

    fn handle_message(&self, text: &str) {
        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "failed to parse stream message as json");
                return;
            }
        };
        let data = if let Ok(combined) = serde_json::from_value::<WsCombinedMessage>(value.clone()) {
            combined.data
        } else {
            value
        };

        match data.get("e").and_then(|e| e.as_str()) {
            Some("kline") => self.handle_kline(data),
            Some("24hrTicker") => self.handle_ticker(data),
            other => debug!(event_type = ?other, "ignoring unhandled stream event"),
        }
    }

    fn handle_kline(&self, data: serde_json::Value) {
        let event: WsKlineEvent = match serde_json::from_value(data) {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "failed to parse kline event");
                return;
            }
        };
        let symbol = event.symbol.clone();
        let Some((interval, kline)) = event.kline.into_kline() else {
            warn!(symbol, "kline event referenced an unrecognized interval");
            return;
        };

        let is_closed = kline.is_closed;
        self.cache.append_or_update(&symbol, interval, kline.clone());

        if is_closed {
            self.bus.publish_kline_close(KlineCloseEvent {
                symbol,
                interval,
                kline,
                observed_at: chrono::Utc::now().timestamp_millis(),
            });
        }
    }

    fn handle_ticker(&self, data: serde_json::Value) {
        let event: WsTickerEvent = match serde_json::from_value(data) {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "failed to parse ticker event");
                return;
            }
        };

        let now = chrono::Utc::now().timestamp_millis();
        let throttle_ms = self.config.ticker_throttle_ms as i64;
        let should_publish = match self.last_ticker_publish_ms.get(&event.symbol) {
            Some(last) => now - *last >= throttle_ms,
            None => true,
        };
        if !should_publish {
            return;
        }
        self.last_ticker_publish_ms.insert(event.symbol.clone(), now);

        let ticker = Ticker {
            last_price: decimal_or_zero(&event.last_price),
            price_change_percent: event.price_change_percent.parse().unwrap_or(0.0),
            quote_volume: decimal_or_zero(&event.quote_volume),
        };
        self.cache.put_ticker(&event.symbol, ticker.clone());
        let _ = self.ticker_tx.send(ticker);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> StreamConfig {
        StreamConfig {
            rest_base_url: "https://api.binance.com".to_string(),
            ws_base_url: "wss://stream.binance.com:9443".to_string(),
            bootstrap_candles: 500,
            reconnect_initial_ms: 1_000,
            reconnect_max_ms: 30_000,
            ticker_throttle_ms: 500,
        }
    }

    fn make_client() -> StreamClient {
        let cache = Arc::new(KlineCache::new(500));
        let bus = Arc::new(EventBus::new());
        StreamClient::new(test_config(), cache, bus).0
    }

    #[test]
    fn build_stream_names_includes_kline_and_ticker_per_symbol() {
        let client = make_client();
        let streams = client.build_stream_names(&["BTCUSDT".to_string()], &[Interval::OneMinute, Interval::OneHour]);
        assert_eq!(streams.len(), 3);
        assert!(streams.contains(&"btcusdt@kline_1m".to_string()));
        assert!(streams.contains(&"btcusdt@kline_1h".to_string()));
        assert!(streams.contains(&"btcusdt@ticker".to_string()));
    }

    #[test]
    fn build_websocket_url_uses_combined_stream_endpoint() {
        let client = make_client();
        let streams = vec!["btcusdt@kline_1m".to_string(), "btcusdt@ticker".to_string()];
        let url = client.build_websocket_url(&streams).unwrap();
        assert!(url.as_str().starts_with("wss://stream.binance.com:9443/stream?streams="));
    }

    #[test]
    fn build_websocket_url_rejects_empty_stream_list() {
        let client = make_client();
        assert!(client.build_websocket_url(&[]).is_err());
    }

    #[test]
    fn handle_kline_closed_updates_cache_and_publishes() {
        let client = make_client();
        let mut subscriber = client.bus.subscribe_kline_close();
        let msg = serde_json::json!({
            "e": "kline",
            "s": "BTCUSDT",
            "k": {
                "t": 1000i64, "T": 1999i64, "i": "1m",
                "o": "100.0", "c": "101.0", "h": "102.0", "l": "99.0",
                "v": "10.0", "q": "1010.0", "n": 5,
                "V": "5.0", "Q": "505.0", "x": true
            }
        });
        client.handle_message(&msg.to_string());

        assert!(client.cache.has("BTCUSDT", Interval::OneMinute));
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let received = rt.block_on(subscriber.recv());
        assert!(received.is_some());
    }
}
