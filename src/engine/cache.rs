use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, warn};

use super::types::{Interval, Kline, Ticker};

/// Per-key ring buffer of candles, bounded at `capacity`.
struct TimeframeData {
    candles: VecDeque<Kline>,
    capacity: usize,
}

impl TimeframeData {
    fn new(capacity: usize) -> Self {
        Self {
            candles: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn evict_excess(&mut self) {
        while self.candles.len() > self.capacity {
            self.candles.pop_front();
        }
    }

    fn put_all(&mut self, mut candles: Vec<Kline>) {
        candles.sort_by_key(|c| c.open_time);
        candles.truncate(self.capacity);
        self.candles = candles.into();
    }

    /// Returns `true` if the candle was accepted (appended or replaced the
    /// tail); `false` if it was ignored as stale.
    fn append_or_update(&mut self, candle: Kline, interval_ms: i64, symbol: &str) -> bool {
        match self.candles.back() {
            None => {
                self.candles.push_back(candle);
                true
            }
            Some(last) => {
                if candle.open_time == last.open_time {
                    *self.candles.back_mut().unwrap() = candle;
                    true
                } else if candle.open_time == last.open_time + interval_ms {
                    self.candles.push_back(candle);
                    self.evict_excess();
                    true
                } else if candle.open_time > last.open_time {
                    warn!(
                        symbol,
                        last_open_time = last.open_time,
                        new_open_time = candle.open_time,
                        "kline cache gap detected, discarding history before new tail"
                    );
                    self.candles.clear();
                    self.candles.push_back(candle);
                    true
                } else {
                    debug!(
                        symbol,
                        last_open_time = last.open_time,
                        new_open_time = candle.open_time,
                        "ignoring out-of-order candle older than cached tail"
                    );
                    false
                }
            }
        }
    }

    fn get(&self, limit: usize) -> Vec<Kline> {
        let n = limit.min(self.candles.len());
        self.candles.iter().rev().take(n).rev().cloned().collect()
    }

    fn len(&self) -> usize {
        self.candles.len()
    }
}

fn cache_key(symbol: &str, interval: Interval) -> String {
    format!("{}:{}", symbol, interval.as_str())
}

/// A `{symbol -> {interval -> klines}}` view returned by `snapshot`.
pub struct MarketData {
    pub klines: std::collections::HashMap<String, std::collections::HashMap<Interval, Vec<Kline>>>,
}

/// Bounded, per-symbol-per-interval candle store. Single logical writer per
/// key, many concurrent readers; no read blocks behind another read.
#[derive(Clone)]
pub struct KlineCache {
    shards: Arc<DashMap<String, Arc<RwLock<TimeframeData>>>>,
    tickers: Arc<DashMap<String, Ticker>>,
    capacity: usize,
}

impl KlineCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            shards: Arc::new(DashMap::new()),
            tickers: Arc::new(DashMap::new()),
            capacity,
        }
    }

    /// Records the latest 24h-ticker snapshot for `symbol`, consulted by
    /// the executor when it builds a sandbox snapshot or a signal.
    pub fn put_ticker(&self, symbol: &str, ticker: Ticker) {
        self.tickers.insert(symbol.to_string(), ticker);
    }

    pub fn get_ticker(&self, symbol: &str) -> Option<Ticker> {
        self.tickers.get(symbol).map(|t| t.clone())
    }

    fn shard(&self, symbol: &str, interval: Interval) -> Arc<RwLock<TimeframeData>> {
        self.shards
            .entry(cache_key(symbol, interval))
            .or_insert_with(|| Arc::new(RwLock::new(TimeframeData::new(self.capacity))))
            .clone()
    }

    pub fn put_all(&self, symbol: &str, interval: Interval, candles: Vec<Kline>) {
        let valid: Vec<Kline> = candles
            .into_iter()
            .filter(|c| reject_malformed(c, symbol))
            .collect();
        let shard = self.shard(symbol, interval);
        shard.write().put_all(valid);
    }

    /// Returns `true` if the candle was rejected (malformed, or stale
    /// out-of-order input older than the cached tail).
    pub fn append_or_update(&self, symbol: &str, interval: Interval, candle: Kline) -> bool {
        if !reject_malformed(&candle, symbol) {
            return true;
        }
        let shard = self.shard(symbol, interval);
        let interval_ms = interval.duration_ms();
        let rejected = !shard.write().append_or_update(candle, interval_ms, symbol);
        rejected
    }

    pub fn get(&self, symbol: &str, interval: Interval, limit: usize) -> Vec<Kline> {
        match self.shards.get(&cache_key(symbol, interval)) {
            Some(shard) => shard.read().get(limit),
            None => Vec::new(),
        }
    }

    pub fn has(&self, symbol: &str, interval: Interval) -> bool {
        self.shards.contains_key(&cache_key(symbol, interval))
    }

    pub fn size(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    pub fn key_count(&self) -> usize {
        self.shards.len()
    }

    pub fn snapshot(&self, symbols: &[String], intervals: &[Interval]) -> MarketData {
        let mut klines = std::collections::HashMap::new();
        for symbol in symbols {
            let mut per_interval = std::collections::HashMap::new();
            for &interval in intervals {
                per_interval.insert(interval, self.get(symbol, interval, self.capacity));
            }
            klines.insert(symbol.clone(), per_interval);
        }
        MarketData { klines }
    }
}

fn reject_malformed(candle: &Kline, symbol: &str) -> bool {
    if !candle.is_finite_nonnegative() {
        warn!(symbol, open_time = candle.open_time, "rejecting malformed candle (negative field)");
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn candle(open_time: i64, close: i64) -> Kline {
        Kline {
            open_time,
            close_time: open_time + 99,
            open: Decimal::from(close),
            high: Decimal::from(close),
            low: Decimal::from(close),
            close: Decimal::from(close),
            volume: Decimal::from(1),
            quote_volume: Decimal::from(1),
            trade_count: 1,
            taker_buy_base: Decimal::from(0),
            taker_buy_quote: Decimal::from(0),
            is_closed: true,
        }
    }

    #[test]
    fn contiguous_append_and_eviction() {
        let cache = KlineCache::new(3);
        let step = Interval::OneMinute.duration_ms();
        let base = 0;
        for i in 0..4 {
            cache.append_or_update(
                "ETHUSDT",
                Interval::OneMinute,
                candle(base + i * step, 100 + i),
            );
        }
        let got = cache.get("ETHUSDT", Interval::OneMinute, 10);
        assert_eq!(got.len(), 3);
        assert_eq!(got[0].open_time, base + step);
        assert_eq!(got[2].open_time, base + 3 * step);
    }

    #[test]
    fn mid_candle_update_replaces_tail() {
        let cache = KlineCache::new(10);
        cache.append_or_update("BTCUSDT", Interval::OneMinute, candle(1000, 50));
        cache.append_or_update("BTCUSDT", Interval::OneMinute, candle(1000, 55));
        let got = cache.get("BTCUSDT", Interval::OneMinute, 1);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].close, Decimal::from(55));
    }

    #[test]
    fn earlier_candle_is_ignored() {
        let cache = KlineCache::new(10);
        let step = Interval::OneMinute.duration_ms();
        cache.append_or_update("BTCUSDT", Interval::OneMinute, candle(2 * step, 1));
        let rejected = cache.append_or_update("BTCUSDT", Interval::OneMinute, candle(step, 2));
        assert!(!rejected);
        let got = cache.get("BTCUSDT", Interval::OneMinute, 10);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].open_time, 2 * step);
    }

    #[test]
    fn missing_key_returns_empty() {
        let cache = KlineCache::new(10);
        assert!(cache.get("NOPE", Interval::OneDay, 10).is_empty());
        assert!(!cache.has("NOPE", Interval::OneDay));
    }

    #[test]
    fn malformed_candle_rejected() {
        let cache = KlineCache::new(10);
        let mut bad = candle(0, 1);
        bad.close = Decimal::from(-1);
        let rejected = cache.append_or_update("BTCUSDT", Interval::OneMinute, bad);
        assert!(rejected);
        assert!(cache.get("BTCUSDT", Interval::OneMinute, 10).is_empty());
    }
}
