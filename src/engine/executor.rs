use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::bus::EventBus;
use super::cache::KlineCache;
use super::persistence::Persistence;
use super::registry::TraderRegistry;
use super::sandbox::{SandboxExecutor, Snapshot};
use super::types::{CandleOpenEvent, DedupKey, Interval, Kline, Signal, SignalSource};

const DRAIN_TICK: Duration = Duration::from_millis(50);

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("persistence write failed after retry: {0}")]
    PersistenceWrite(String),
}

struct DedupEntry {
    count: u32,
    first_seen_ms: i64,
}

/// Subscribes to `CandleOpenEvent`, resolves which traders fire on that
/// interval, calls the sandbox in batch per trader, de-duplicates results,
/// and writes accepted signals via the persistence interface.
pub struct TraderExecutor {
    bus: Arc<EventBus>,
    cache: Arc<KlineCache>,
    registry: Arc<TraderRegistry>,
    sandbox: Arc<SandboxExecutor>,
    persistence: Arc<dyn Persistence>,
    symbols: Arc<RwLock<Vec<String>>>,
    dedup: DashMap<DedupKey, DedupEntry>,
    dedup_window_ms: i64,
    pending: parking_lot::Mutex<VecDeque<CandleOpenEvent>>,
    pending_queue_size: usize,
    dropped_events: std::sync::atomic::AtomicU64,
}

impl TraderExecutor {
    pub fn new(
        bus: Arc<EventBus>,
        cache: Arc<KlineCache>,
        registry: Arc<TraderRegistry>,
        sandbox: Arc<SandboxExecutor>,
        persistence: Arc<dyn Persistence>,
        symbols: Arc<RwLock<Vec<String>>>,
        dedup_window_ms: i64,
        pending_queue_size: usize,
    ) -> Self {
        Self {
            bus,
            cache,
            registry,
            sandbox,
            persistence,
            symbols,
            dedup: DashMap::new(),
            dedup_window_ms,
            pending: parking_lot::Mutex::new(VecDeque::new()),
            pending_queue_size,
            dropped_events: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn dropped_event_count(&self) -> u64 {
        self.dropped_events.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn run(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let drain = self.clone().spawn_drain_task(cancel.clone());
        tokio::spawn(async move {
            let mut subscriber = self.bus.subscribe_candle_open();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("trader executor stopping");
                        break;
                    }
                    event = subscriber.recv() => {
                        match event {
                            Some(event) => self.handle_event(event).await,
                            None => break,
                        }
                    }
                }
            }
            let _ = drain.await;
        })
    }

    /// Pops queued events and processes them as sandbox permits free up.
    /// This is what actually makes `pending` a deferral queue rather than
    /// pure drop-accounting.
    fn spawn_drain_task(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(DRAIN_TICK);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        while self.sandbox.available_permits() > 0 {
                            let next = self.pending.lock().pop_front();
                            match next {
                                Some(event) => self.process_event(event).await,
                                None => break,
                            }
                        }
                    }
                }
            }
        })
    }

    /// Processes immediately if the sandbox has spare capacity; otherwise
    /// queues the event for the drain task, dropping the oldest queued
    /// event once the queue is full.
    async fn handle_event(self: &Arc<Self>, event: CandleOpenEvent) {
        if self.sandbox.available_permits() == 0 {
            let mut pending = self.pending.lock();
            if pending.len() >= self.pending_queue_size {
                if let Some(dropped) = pending.pop_front() {
                    warn!(
                        interval = dropped.interval.as_str(),
                        open_time = dropped.open_time,
                        "executor backpressure: dropping oldest queued event"
                    );
                    self.dropped_events.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                }
            }
            pending.push_back(event);
            return;
        }
        self.process_event(event).await;
    }

    async fn process_event(self: &Arc<Self>, event: CandleOpenEvent) {
        let active = self.registry.list_active();
        let traders_for_interval: Vec<_> = active
            .into_iter()
            .filter(|(_trader, compiled)| compiled.required_timeframes.contains(&event.interval))
            .collect();
        if traders_for_interval.is_empty() {
            return;
        }

        let symbols = self.symbols.read().clone();
        let mut accepted_signals = Vec::new();

        for (trader, compiled) in traders_for_interval {
            let snapshots: Vec<Snapshot> = symbols
                .iter()
                .map(|symbol| {
                    let mut klines = HashMap::new();
                    for &interval in &compiled.required_timeframes {
                        klines.insert(interval, self.cache.get(symbol, interval, usize::MAX));
                    }
                    Snapshot {
                        symbol: symbol.clone(),
                        klines,
                        ticker: self.cache.get_ticker(symbol),
                    }
                })
                .collect();

            let results = self
                .sandbox
                .execute_batch(Arc::new(compiled.root.clone()), snapshots)
                .await;

            let now_ms = event.open_time;
            for (symbol, result) in results {
                match result {
                    Ok(true) => {
                        if let Some(signal) = self.build_signal_if_not_duplicate(&trader.id, &symbol, event.interval, now_ms) {
                            accepted_signals.push(signal);
                        }
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!(trader_id = %trader.id, symbol = %symbol, error = %e, "strategy evaluation faulted");
                        self.registry.record_fault(&trader.id, now_ms);
                    }
                }
            }
        }

        if !accepted_signals.is_empty() {
            self.write_signals(accepted_signals).await;
        }
    }

    fn build_signal_if_not_duplicate(
        &self,
        trader_id: &str,
        symbol: &str,
        interval: Interval,
        open_time: i64,
    ) -> Option<Signal> {
        let key = DedupKey {
            trader_id: trader_id.to_string(),
            symbol: symbol.to_string(),
            interval,
            timestamp: open_time,
        };

        let window_ms = if self.dedup_window_ms > 0 {
            self.dedup_window_ms
        } else {
            interval.duration_ms()
        };

        let mut is_new = false;
        self.dedup
            .entry(key)
            .and_modify(|e| {
                if open_time - e.first_seen_ms <= window_ms {
                    e.count += 1;
                } else {
                    e.count = 1;
                    e.first_seen_ms = open_time;
                    is_new = true;
                }
            })
            .or_insert_with(|| {
                is_new = true;
                DedupEntry {
                    count: 1,
                    first_seen_ms: open_time,
                }
            });

        if !is_new {
            return None;
        }

        let latest = self.cache.get(symbol, interval, 1);
        let latest_kline = latest.first()?;

        let change_percent_at_signal = match self.cache.get_ticker(symbol) {
            Some(ticker) => ticker.price_change_percent,
            None => change_percent_from_kline(latest_kline),
        };

        Some(Signal {
            id: uuid::Uuid::new_v4().to_string(),
            trader_id: trader_id.to_string(),
            symbol: symbol.to_string(),
            interval,
            timestamp: open_time,
            price_at_signal: latest_kline.close,
            change_percent_at_signal,
            volume_at_signal: latest_kline.volume,
            count: 1,
            source: SignalSource::Local,
        })
    }

    async fn write_signals(&self, signals: Vec<Signal>) {
        if self.persistence.insert_signals(&signals).await.is_ok() {
            return;
        }
        warn!(count = signals.len(), "signal batch write failed, retrying once");
        if let Err(e) = self.persistence.insert_signals(&signals).await {
            warn!(count = signals.len(), error = %e, "signal batch write failed twice, dropping batch");
        }
    }
}

/// Falls back to the candle's own open/close move when no ticker frame has
/// arrived yet for this symbol.
fn change_percent_from_kline(kline: &Kline) -> f64 {
    if kline.open.is_zero() {
        return 0.0;
    }
    let change = (kline.close - kline.open) / kline.open * Decimal::from(100);
    change.to_f64().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::persistence::InMemoryPersistence;
    use crate::engine::registry::TraderRegistry;
    use crate::engine::types::{Filter, Trader};
    use serde_json::json;

    fn rising_klines(n: usize) -> Vec<Kline> {
        (0..n)
            .map(|i| Kline {
                open_time: i as i64 * Interval::OneHour.duration_ms(),
                close_time: 0,
                open: Decimal::from(i),
                high: Decimal::from(i + 1),
                low: Decimal::from(i),
                close: Decimal::from(i + 1),
                volume: Decimal::from(10),
                quote_volume: Decimal::from(10),
                trade_count: 1,
                taker_buy_base: Decimal::from(0),
                taker_buy_quote: Decimal::from(0),
                is_closed: true,
            })
            .collect()
    }

    #[tokio::test]
    async fn dedup_suppresses_repeat_emission_within_window() {
        let bus = Arc::new(EventBus::new());
        let cache = Arc::new(KlineCache::new(500));
        for candle in rising_klines(30) {
            cache.append_or_update("BTCUSDT", Interval::OneHour, candle);
        }
        let persistence = Arc::new(InMemoryPersistence::new());
        persistence
            .seed(vec![Trader {
                id: "t1".to_string(),
                owner: None,
                name: "rsi-high".to_string(),
                description: String::new(),
                enabled: true,
                filter: Filter {
                    code: json!({"kind": "rsi", "interval": "1h", "period": 14, "threshold": 10.0, "side": "above"}),
                    required_timeframes: vec![Interval::OneHour],
                    series_code: None,
                },
            }])
            .await;
        let registry = Arc::new(TraderRegistry::new(persistence.clone(), bus.clone(), 5, Duration::from_secs(60)));
        registry.load_all().await.unwrap();
        let sandbox = Arc::new(SandboxExecutor::new(4, Duration::from_secs(1), Duration::from_secs(5)));
        let symbols = Arc::new(RwLock::new(vec!["BTCUSDT".to_string()]));

        let executor = Arc::new(TraderExecutor::new(
            bus,
            cache,
            registry,
            sandbox,
            persistence.clone(),
            symbols,
            0,
            64,
        ));

        let event = CandleOpenEvent {
            interval: Interval::OneHour,
            open_time: 29 * Interval::OneHour.duration_ms(),
        };
        executor.process_event(event).await;
        executor.process_event(event).await;

        let signals = persistence.signals();
        assert_eq!(signals.len(), 1);
    }

    #[tokio::test]
    async fn change_percent_prefers_ticker_over_kline_derived_value() {
        let bus = Arc::new(EventBus::new());
        let cache = Arc::new(KlineCache::new(500));
        for candle in rising_klines(30) {
            cache.append_or_update("BTCUSDT", Interval::OneHour, candle);
        }
        cache.put_ticker(
            "BTCUSDT",
            crate::engine::types::Ticker {
                last_price: Decimal::from(30),
                price_change_percent: 7.5,
                quote_volume: Decimal::from(1000),
            },
        );
        let persistence = Arc::new(InMemoryPersistence::new());
        persistence
            .seed(vec![Trader {
                id: "t1".to_string(),
                owner: None,
                name: "rsi-high".to_string(),
                description: String::new(),
                enabled: true,
                filter: Filter {
                    code: json!({"kind": "rsi", "interval": "1h", "period": 14, "threshold": 10.0, "side": "above"}),
                    required_timeframes: vec![Interval::OneHour],
                    series_code: None,
                },
            }])
            .await;
        let registry = Arc::new(TraderRegistry::new(persistence.clone(), bus.clone(), 5, Duration::from_secs(60)));
        registry.load_all().await.unwrap();
        let sandbox = Arc::new(SandboxExecutor::new(4, Duration::from_secs(1), Duration::from_secs(5)));
        let symbols = Arc::new(RwLock::new(vec!["BTCUSDT".to_string()]));

        let executor = Arc::new(TraderExecutor::new(
            bus, cache, registry, sandbox, persistence.clone(), symbols, 0, 64,
        ));

        let event = CandleOpenEvent {
            interval: Interval::OneHour,
            open_time: 29 * Interval::OneHour.duration_ms(),
        };
        executor.process_event(event).await;

        let signals = persistence.signals();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].change_percent_at_signal, 7.5);
    }

    #[test]
    fn change_percent_from_kline_falls_back_to_open_close_move() {
        let kline = Kline {
            open_time: 0,
            close_time: 0,
            open: Decimal::from(100),
            high: Decimal::from(110),
            low: Decimal::from(100),
            close: Decimal::from(110),
            volume: Decimal::from(1),
            quote_volume: Decimal::from(1),
            trade_count: 1,
            taker_buy_base: Decimal::from(0),
            taker_buy_quote: Decimal::from(0),
            is_closed: true,
        };
        assert_eq!(change_percent_from_kline(&kline), 10.0);
    }

    #[test]
    fn change_percent_from_kline_is_zero_for_zero_open() {
        let kline = Kline {
            open_time: 0,
            close_time: 0,
            open: Decimal::from(0),
            high: Decimal::from(1),
            low: Decimal::from(0),
            close: Decimal::from(1),
            volume: Decimal::from(1),
            quote_volume: Decimal::from(1),
            trade_count: 1,
            taker_buy_base: Decimal::from(0),
            taker_buy_quote: Decimal::from(0),
            is_closed: true,
        };
        assert_eq!(change_percent_from_kline(&kline), 0.0);
    }

    #[tokio::test]
    async fn saturated_sandbox_defers_event_instead_of_processing_inline() {
        let bus = Arc::new(EventBus::new());
        let cache = Arc::new(KlineCache::new(500));
        let persistence = Arc::new(InMemoryPersistence::new());
        let registry = Arc::new(TraderRegistry::new(persistence.clone(), bus.clone(), 5, Duration::from_secs(60)));
        // Holding the sandbox's only permit forces `available_permits() == 0`,
        // so the event must be queued rather than processed inline.
        let sandbox = Arc::new(SandboxExecutor::new(1, Duration::from_secs(1), Duration::from_secs(5)));
        let _held = sandbox.try_acquire_permit_for_test();
        assert_eq!(sandbox.available_permits(), 0);
        let symbols = Arc::new(RwLock::new(vec!["BTCUSDT".to_string()]));

        let executor = Arc::new(TraderExecutor::new(
            bus, cache, registry, sandbox, persistence.clone(), symbols, 0, 4,
        ));

        executor
            .handle_event(CandleOpenEvent { interval: Interval::OneHour, open_time: 0 })
            .await;

        assert_eq!(executor.pending.lock().len(), 1);
        assert!(persistence.signals().is_empty());
    }
}
