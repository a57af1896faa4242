use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};

/// A symbolic candle duration. Parseable to a strictly positive `Duration`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Interval {
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "15m")]
    FifteenMinutes,
    #[serde(rename = "30m")]
    ThirtyMinutes,
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "4h")]
    FourHours,
    #[serde(rename = "1d")]
    OneDay,
    #[serde(rename = "1w")]
    OneWeek,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid interval string: {0}")]
pub struct InvalidInterval(pub String);

impl Interval {
    pub const ALL: [Interval; 8] = [
        Interval::OneMinute,
        Interval::FiveMinutes,
        Interval::FifteenMinutes,
        Interval::ThirtyMinutes,
        Interval::OneHour,
        Interval::FourHours,
        Interval::OneDay,
        Interval::OneWeek,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::OneMinute => "1m",
            Interval::FiveMinutes => "5m",
            Interval::FifteenMinutes => "15m",
            Interval::ThirtyMinutes => "30m",
            Interval::OneHour => "1h",
            Interval::FourHours => "4h",
            Interval::OneDay => "1d",
            Interval::OneWeek => "1w",
        }
    }

    /// Duration of one candle for this interval.
    pub fn duration(&self) -> Duration {
        let secs = match self {
            Interval::OneMinute => 60,
            Interval::FiveMinutes => 5 * 60,
            Interval::FifteenMinutes => 15 * 60,
            Interval::ThirtyMinutes => 30 * 60,
            Interval::OneHour => 60 * 60,
            Interval::FourHours => 4 * 60 * 60,
            Interval::OneDay => 24 * 60 * 60,
            Interval::OneWeek => 7 * 24 * 60 * 60,
        };
        Duration::from_secs(secs)
    }

    pub fn duration_ms(&self) -> i64 {
        self.duration().as_millis() as i64
    }

    /// Truncate `now` to this interval's most recent boundary.
    ///
    /// Intervals `< 1d` align to Unix-epoch multiples; `>= 1d` align to
    /// UTC-midnight multiples of the interval length.
    pub fn truncate(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let step_ms = self.duration_ms();
        if matches!(self, Interval::OneDay | Interval::OneWeek) {
            let midnight = now.date_naive().and_hms_opt(0, 0, 0).unwrap();
            let midnight = Utc.from_utc_datetime(&midnight);
            let since_midnight_ms = (now - midnight).num_milliseconds();
            let aligned_ms = (since_midnight_ms / step_ms) * step_ms;
            midnight + chrono::Duration::milliseconds(aligned_ms)
        } else {
            let epoch_ms = now.timestamp_millis();
            let aligned_ms = (epoch_ms / step_ms) * step_ms;
            Utc.timestamp_millis_opt(aligned_ms).unwrap()
        }
    }
}

impl FromStr for Interval {
    type Err = InvalidInterval;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1m" => Ok(Interval::OneMinute),
            "5m" => Ok(Interval::FiveMinutes),
            "15m" => Ok(Interval::FifteenMinutes),
            "30m" => Ok(Interval::ThirtyMinutes),
            "1h" => Ok(Interval::OneHour),
            "4h" => Ok(Interval::FourHours),
            "1d" => Ok(Interval::OneDay),
            "1w" => Ok(Interval::OneWeek),
            other => Err(InvalidInterval(other.to_string())),
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A closed or in-progress OHLCV record for a (symbol, interval) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kline {
    pub open_time: i64,
    pub close_time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub quote_volume: Decimal,
    pub trade_count: i64,
    pub taker_buy_base: Decimal,
    pub taker_buy_quote: Decimal,
    pub is_closed: bool,
}

impl Kline {
    pub fn is_finite_nonnegative(&self) -> bool {
        for v in [
            self.open,
            self.high,
            self.low,
            self.close,
            self.volume,
            self.quote_volume,
            self.taker_buy_base,
            self.taker_buy_quote,
        ] {
            if v.is_sign_negative() && !v.is_zero() {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub symbol: String,
    pub interval: Interval,
}

/// Last-price / 24h-change / volume view used by the sandbox snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub last_price: Decimal,
    pub price_change_percent: f64,
    pub quote_volume: Decimal,
}

/// `{interval, open_time}` — emitted by C4 on every boundary crossing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandleOpenEvent {
    pub interval: Interval,
    pub open_time: i64,
}

/// Emitted by C2 whenever a candle transitions to its closed state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KlineCloseEvent {
    pub symbol: String,
    pub interval: Interval,
    pub kline: Kline,
    pub observed_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TraderLifecycleKind {
    Loaded,
    Reloaded,
    Started,
    Stopped,
    Errored,
    Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraderLifecycleEvent {
    pub trader_id: String,
    pub kind: TraderLifecycleKind,
}

/// Any event the bus carries, used for uniform subscriber plumbing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    CandleOpen(CandleOpenEvent),
    KlineClose(KlineCloseEvent),
    TraderLifecycle(TraderLifecycleEvent),
}

fn deserialize_filter_code<'de, D>(deserializer: D) -> Result<serde_json::Value, D::Error>
where
    D: Deserializer<'de>,
{
    // The upstream persistence layer sometimes stringifies the filter
    // object inside the outer JSON document. Accept either shape and
    // normalize to the parsed object.
    let raw = serde_json::Value::deserialize(deserializer)?;
    match raw {
        serde_json::Value::String(s) => {
            serde_json::from_str(&s).map_err(serde::de::Error::custom)
        }
        other => Ok(other),
    }
}

/// The executable predicate at the heart of a trader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Filter {
    #[serde(deserialize_with = "deserialize_filter_code")]
    pub code: serde_json::Value,
    pub required_timeframes: Vec<Interval>,
    #[serde(default)]
    pub series_code: Option<String>,
}

/// Persistent identity plus executable strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trader {
    pub id: String,
    pub owner: Option<String>,
    pub name: String,
    pub description: String,
    pub enabled: bool,
    pub filter: Filter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalSource {
    #[serde(rename = "cloud")]
    Cloud,
    #[serde(rename = "local")]
    Local,
}

/// A time-stamped emission stating a strategy's conditions matched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub id: String,
    pub trader_id: String,
    pub symbol: String,
    pub interval: Interval,
    pub timestamp: i64,
    pub price_at_signal: Decimal,
    pub change_percent_at_signal: f64,
    pub volume_at_signal: Decimal,
    pub count: u32,
    pub source: SignalSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub trader_id: String,
    pub symbol: String,
    pub interval: Interval,
    pub timestamp: i64,
}

impl Signal {
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            trader_id: self.trader_id.clone(),
            symbol: self.symbol.clone(),
            interval: self.interval,
            timestamp: self.timestamp,
        }
    }
}
