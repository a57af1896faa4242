use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::bus::EventBus;
use super::types::{CandleOpenEvent, Interval};

const TICK: Duration = Duration::from_millis(100);

/// Produces a `CandleOpenEvent` at every candle open-time boundary, for
/// each configured interval. One worker task per interval; drift is
/// bounded by the 100ms tick rate.
pub struct CandleScheduler {
    bus: Arc<EventBus>,
    cancel: CancellationToken,
    handles: Mutex<HashMap<Interval, tokio::task::JoinHandle<()>>>,
    add_tx: mpsc::UnboundedSender<Interval>,
    configured: Vec<Interval>,
}

impl CandleScheduler {
    pub fn new(bus: Arc<EventBus>, intervals: &[Interval], cancel: CancellationToken) -> Self {
        let (add_tx, mut add_rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            bus,
            cancel,
            handles: Mutex::new(HashMap::new()),
            add_tx,
            configured: intervals.to_vec(),
        };
        for &iv in intervals {
            scheduler.spawn_worker(iv);
        }

        // Drain dynamically-added intervals on a supervisor task owned by
        // the scheduler itself, so `add_interval` stays synchronous.
        let bus_for_adds = scheduler.bus.clone();
        let cancel_for_adds = scheduler.cancel.clone();
        tokio::spawn(async move {
            while let Some(iv) = add_rx.recv().await {
                spawn_worker_task(bus_for_adds.clone(), iv, cancel_for_adds.clone());
            }
        });

        scheduler
    }

    fn spawn_worker(&self, interval: Interval) {
        let handle = spawn_worker_task(self.bus.clone(), interval, self.cancel.clone());
        self.handles.lock().insert(interval, handle);
    }

    /// Adds a new interval to schedule, if not already present.
    pub fn add_interval(&self, interval: Interval) {
        if self.handles.lock().contains_key(&interval) {
            return;
        }
        let _ = self.add_tx.send(interval);
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn configured_intervals(&self) -> Vec<Interval> {
        self.configured.clone()
    }
}

fn spawn_worker_task(
    bus: Arc<EventBus>,
    iv: Interval,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        info!(interval = iv.as_str(), "candle scheduler worker starting");
        let mut ticker = interval(TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_seen: Option<i64> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(interval = iv.as_str(), "candle scheduler worker stopping");
                    break;
                }
                _ = ticker.tick() => {
                    let now = Utc::now();
                    let boundary = iv.truncate(now);
                    let boundary_ms = boundary.timestamp_millis();

                    match last_seen {
                        None => {
                            // First tick only primes; no event is emitted.
                            last_seen = Some(boundary_ms);
                        }
                        Some(prev) if prev != boundary_ms => {
                            bus.publish_candle_open(CandleOpenEvent {
                                interval: iv,
                                open_time: boundary_ms,
                            });
                            last_seen = Some(boundary_ms);
                        }
                        _ => {}
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_tick_only_primes_no_event() {
        let bus = Arc::new(EventBus::new());
        let mut sub = bus.subscribe_candle_open();
        let cancel = CancellationToken::new();
        let _scheduler = CandleScheduler::new(bus.clone(), &[Interval::OneMinute], cancel.clone());

        let result =
            tokio::time::timeout(Duration::from_millis(150), sub.recv()).await;
        assert!(result.is_err(), "no event should fire before a boundary is crossed");
        cancel.cancel();
    }

    #[test]
    fn truncate_aligns_minute_boundaries_to_epoch() {
        let now = chrono::Utc.timestamp_millis_opt(125_000).unwrap();
        let truncated = Interval::OneMinute.truncate(now);
        assert_eq!(truncated.timestamp_millis(), 120_000);
    }

    use chrono::TimeZone;

    #[test]
    fn truncate_aligns_day_boundaries_to_utc_midnight() {
        let now = chrono::Utc.with_ymd_and_hms(2026, 7, 31, 13, 45, 0).unwrap();
        let truncated = Interval::OneDay.truncate(now);
        assert_eq!(truncated.timestamp_millis() % 86_400_000, 0);
        assert_eq!(truncated.time(), chrono::NaiveTime::from_hms_opt(0, 0, 0).unwrap());
    }
}
