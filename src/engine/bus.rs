use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

use super::types::{CandleOpenEvent, KlineCloseEvent, TraderLifecycleEvent};

const DEFAULT_BUFFER: usize = 1024;

#[derive(Default)]
pub struct BusCounters {
    pub candle_open_dropped: AtomicU64,
    pub kline_close_dropped: AtomicU64,
    pub trader_lifecycle_dropped: AtomicU64,
}

/// Typed pub/sub within the process: one broadcast channel per event kind.
/// Each subscriber has a bounded buffer; a slow subscriber that falls
/// behind silently drops its oldest unread events (`broadcast`'s native
/// lagged-receiver behavior) rather than blocking the publisher, which is
/// counted by `next_candle_open`/`next_kline_close`/`next_trader_lifecycle`
/// rather than propagated as an error to callers of `publish`.
pub struct EventBus {
    candle_open: broadcast::Sender<CandleOpenEvent>,
    kline_close: broadcast::Sender<KlineCloseEvent>,
    trader_lifecycle: broadcast::Sender<TraderLifecycleEvent>,
    counters: Arc<BusCounters>,
}

pub struct CandleOpenSubscriber {
    rx: broadcast::Receiver<CandleOpenEvent>,
    counters: Arc<BusCounters>,
}

pub struct KlineCloseSubscriber {
    rx: broadcast::Receiver<KlineCloseEvent>,
    counters: Arc<BusCounters>,
}

pub struct TraderLifecycleSubscriber {
    rx: broadcast::Receiver<TraderLifecycleEvent>,
    counters: Arc<BusCounters>,
}

impl CandleOpenSubscriber {
    /// Waits for the next event, silently skipping over any lag (counted)
    /// and returning `None` only once the bus itself has been dropped.
    pub async fn recv(&mut self) -> Option<CandleOpenEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(dropped = n, kind = "candle_open", "event bus subscriber lagged");
                    self.counters
                        .candle_open_dropped
                        .fetch_add(n, Ordering::Relaxed);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl KlineCloseSubscriber {
    pub async fn recv(&mut self) -> Option<KlineCloseEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(dropped = n, kind = "kline_close", "event bus subscriber lagged");
                    self.counters
                        .kline_close_dropped
                        .fetch_add(n, Ordering::Relaxed);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl TraderLifecycleSubscriber {
    pub async fn recv(&mut self) -> Option<TraderLifecycleEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(dropped = n, kind = "trader_lifecycle", "event bus subscriber lagged");
                    self.counters
                        .trader_lifecycle_dropped
                        .fetch_add(n, Ordering::Relaxed);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (candle_open, _) = broadcast::channel(capacity);
        let (kline_close, _) = broadcast::channel(capacity);
        let (trader_lifecycle, _) = broadcast::channel(capacity);
        Self {
            candle_open,
            kline_close,
            trader_lifecycle,
            counters: Arc::new(BusCounters::default()),
        }
    }

    pub fn counters(&self) -> Arc<BusCounters> {
        self.counters.clone()
    }

    /// Non-blocking; a failure here means there are currently no
    /// subscribers, which is not itself an error condition.
    pub fn publish_candle_open(&self, event: CandleOpenEvent) {
        let _ = self.candle_open.send(event);
    }

    pub fn publish_kline_close(&self, event: KlineCloseEvent) {
        let _ = self.kline_close.send(event);
    }

    pub fn publish_trader_lifecycle(&self, event: TraderLifecycleEvent) {
        let _ = self.trader_lifecycle.send(event);
    }

    pub fn subscribe_candle_open(&self) -> CandleOpenSubscriber {
        CandleOpenSubscriber {
            rx: self.candle_open.subscribe(),
            counters: self.counters.clone(),
        }
    }

    pub fn subscribe_kline_close(&self) -> KlineCloseSubscriber {
        KlineCloseSubscriber {
            rx: self.kline_close.subscribe(),
            counters: self.counters.clone(),
        }
    }

    pub fn subscribe_trader_lifecycle(&self) -> TraderLifecycleSubscriber {
        TraderLifecycleSubscriber {
            rx: self.trader_lifecycle.subscribe(),
            counters: self.counters.clone(),
        }
    }

    /// Dropping every `Sender` (which happens when the bus itself is
    /// dropped) closes every subscriber stream; `stop` just makes that
    /// explicit at the call site.
    pub fn stop(self) {
        drop(self);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::Interval;

    #[tokio::test]
    async fn fifo_delivery_within_one_event_kind() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe_candle_open();

        bus.publish_candle_open(CandleOpenEvent {
            interval: Interval::OneMinute,
            open_time: 100,
        });
        bus.publish_candle_open(CandleOpenEvent {
            interval: Interval::OneMinute,
            open_time: 200,
        });

        let first = sub.recv().await.unwrap();
        let second = sub.recv().await.unwrap();
        assert_eq!(first.open_time, 100);
        assert_eq!(second.open_time, 200);
    }

    #[tokio::test]
    async fn slow_subscriber_drops_oldest_and_counts() {
        let bus = EventBus::with_capacity(2);
        let mut sub = bus.subscribe_candle_open();
        for i in 0..5 {
            bus.publish_candle_open(CandleOpenEvent {
                interval: Interval::OneMinute,
                open_time: i,
            });
        }
        let mut received = Vec::new();
        while let Ok(event) =
            tokio::time::timeout(std::time::Duration::from_millis(50), sub.recv()).await
        {
            match event {
                Some(e) => received.push(e),
                None => break,
            }
        }
        assert!(received.len() <= 3);
        assert!(bus.counters().candle_open_dropped.load(Ordering::Relaxed) > 0);
    }

    #[tokio::test]
    async fn no_subscribers_is_not_an_error() {
        let bus = EventBus::new();
        bus.publish_candle_open(CandleOpenEvent {
            interval: Interval::OneHour,
            open_time: 1,
        });
    }
}
