use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::bus::EventBus;
use super::persistence::{Persistence, PersistenceError};
use super::strategy::{self, CompiledFilter};
use super::types::{Trader, TraderLifecycleEvent, TraderLifecycleKind};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("trader not found: {0}")]
    NotFound(String),
    #[error("strategy compilation failed for trader {trader_id}: {cause}")]
    CompileFailed { trader_id: String, cause: String },
    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraderState {
    Compiling,
    Ready,
    Error,
    Stopped,
}

struct RegistryEntry {
    trader: Trader,
    state: TraderState,
    compiled: Option<Arc<CompiledFilter>>,
    error_timestamps_ms: Vec<i64>,
}

/// The set of active traders with their compiled strategy code. Reads
/// (for execution) are the hot path; writes (reload/start/stop/deletion)
/// are rare, so each entry is guarded independently via `DashMap`'s
/// internal sharding rather than one global lock.
pub struct TraderRegistry {
    entries: DashMap<String, RegistryEntry>,
    persistence: Arc<dyn Persistence>,
    bus: Arc<EventBus>,
    error_threshold: u32,
    error_window: Duration,
    quarantine_count: AtomicU64,
}

impl TraderRegistry {
    pub fn new(persistence: Arc<dyn Persistence>, bus: Arc<EventBus>, error_threshold: u32, error_window: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            persistence,
            bus,
            error_threshold,
            error_window,
            quarantine_count: AtomicU64::new(0),
        }
    }

    pub fn quarantine_count(&self) -> u64 {
        self.quarantine_count.load(Ordering::Relaxed)
    }

    /// Loads every enabled trader from persistence, compiling each. A
    /// compilation failure marks that trader `Error` and excludes it from
    /// execution without failing the whole load.
    pub async fn load_all(&self) -> Result<(), RegistryError> {
        let traders = self.persistence.list_active_traders().await?;
        info!(count = traders.len(), "loading traders from persistence");
        for trader in traders {
            self.install(trader, TraderLifecycleKind::Loaded);
        }
        Ok(())
    }

    fn install(&self, trader: Trader, lifecycle_kind: TraderLifecycleKind) {
        let trader_id = trader.id.clone();
        let compiled = strategy::compile(&trader.filter.code);
        let (state, compiled_arc) = match compiled {
            Ok(c) => (TraderState::Ready, Some(Arc::new(c))),
            Err(e) => {
                warn!(trader_id = %trader_id, error = %e, "trader strategy compilation failed, marking errored");
                (TraderState::Error, None)
            }
        };

        self.entries.insert(
            trader_id.clone(),
            RegistryEntry {
                trader,
                state,
                compiled: compiled_arc,
                error_timestamps_ms: Vec::new(),
            },
        );

        self.bus.publish_trader_lifecycle(TraderLifecycleEvent {
            trader_id,
            kind: lifecycle_kind,
        });
    }

    pub async fn reload(&self, trader_id: &str) -> Result<(), RegistryError> {
        let trader = self.persistence.get_trader(trader_id).await?;
        self.install(trader, TraderLifecycleKind::Reloaded);
        Ok(())
    }

    pub fn start(&self, trader_id: &str) -> Result<(), RegistryError> {
        let mut entry = self
            .entries
            .get_mut(trader_id)
            .ok_or_else(|| RegistryError::NotFound(trader_id.to_string()))?;
        if entry.compiled.is_some() {
            entry.state = TraderState::Ready;
            entry.error_timestamps_ms.clear();
        }
        drop(entry);
        self.bus.publish_trader_lifecycle(TraderLifecycleEvent {
            trader_id: trader_id.to_string(),
            kind: TraderLifecycleKind::Started,
        });
        Ok(())
    }

    pub fn stop(&self, trader_id: &str) -> Result<(), RegistryError> {
        let mut entry = self
            .entries
            .get_mut(trader_id)
            .ok_or_else(|| RegistryError::NotFound(trader_id.to_string()))?;
        entry.state = TraderState::Stopped;
        drop(entry);
        self.bus.publish_trader_lifecycle(TraderLifecycleEvent {
            trader_id: trader_id.to_string(),
            kind: TraderLifecycleKind::Stopped,
        });
        Ok(())
    }

    pub fn get(&self, trader_id: &str) -> Option<Trader> {
        self.entries.get(trader_id).map(|e| e.trader.clone())
    }

    /// Active traders and their compiled strategy, ready for execution.
    pub fn list_active(&self) -> Vec<(Trader, Arc<CompiledFilter>)> {
        self.entries
            .iter()
            .filter(|e| e.state == TraderState::Ready && e.trader.enabled)
            .filter_map(|e| e.compiled.clone().map(|c| (e.trader.clone(), c)))
            .collect()
    }

    /// Records a strategy-execution fault against a trader; auto-stops and
    /// quarantines it once the error threshold is exceeded within the
    /// configured window.
    pub fn record_fault(&self, trader_id: &str, now_ms: i64) {
        let Some(mut entry) = self.entries.get_mut(trader_id) else {
            return;
        };
        let window_ms = self.error_window.as_millis() as i64;
        entry.error_timestamps_ms.retain(|&t| now_ms - t <= window_ms);
        entry.error_timestamps_ms.push(now_ms);

        if entry.error_timestamps_ms.len() as u32 >= self.error_threshold && entry.state != TraderState::Error {
            entry.state = TraderState::Error;
            let trader_id = trader_id.to_string();
            drop(entry);
            error!(trader_id = %trader_id, "trader auto-quarantined after repeated strategy faults");
            self.quarantine_count.fetch_add(1, Ordering::Relaxed);
            self.bus.publish_trader_lifecycle(TraderLifecycleEvent {
                trader_id,
                kind: TraderLifecycleKind::Errored,
            });
        }
    }

    /// Polls persistence for the current set of enabled trader ids and
    /// removes any local entry no longer present there. Intended to run
    /// on a dedicated background task at `poll_interval`.
    pub async fn reconcile_deletions(&self) -> Result<usize, RegistryError> {
        let live = self.persistence.list_active_traders().await?;
        let live_ids: std::collections::HashSet<String> = live.into_iter().map(|t| t.id).collect();
        let mut removed = 0;
        let stale: Vec<String> = self
            .entries
            .iter()
            .map(|e| e.key().clone())
            .filter(|id| !live_ids.contains(id))
            .collect();
        for id in stale {
            self.entries.remove(&id);
            removed += 1;
            self.bus.publish_trader_lifecycle(TraderLifecycleEvent {
                trader_id: id,
                kind: TraderLifecycleKind::Deleted,
            });
        }
        Ok(removed)
    }

    pub fn run_deletion_watcher(self: &Arc<Self>, poll_interval: Duration, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match registry.reconcile_deletions().await {
                            Ok(0) => {}
                            Ok(n) => info!(removed = n, "deletion watcher removed stale traders"),
                            Err(e) => warn!(error = %e, "deletion watcher poll failed"),
                        }
                    }
                }
            }
        })
    }

    /// Snapshot of trader counts by state, for the health surface.
    pub fn state_counts(&self) -> HashMap<&'static str, usize> {
        let mut counts = HashMap::new();
        for entry in self.entries.iter() {
            let key = match entry.state {
                TraderState::Compiling => "compiling",
                TraderState::Ready => "ready",
                TraderState::Error => "error",
                TraderState::Stopped => "stopped",
            };
            *counts.entry(key).or_insert(0) += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::persistence::InMemoryPersistence;
    use crate::engine::types::{Filter, Interval};
    use serde_json::json;

    fn trader(id: &str, enabled: bool, code: serde_json::Value) -> Trader {
        Trader {
            id: id.to_string(),
            owner: None,
            name: id.to_string(),
            description: String::new(),
            enabled,
            filter: Filter {
                code,
                required_timeframes: vec![Interval::OneHour],
                series_code: None,
            },
        }
    }

    fn good_code() -> serde_json::Value {
        json!({"kind": "rsi", "interval": "1h", "period": 14, "threshold": 70.0, "side": "above"})
    }

    #[tokio::test]
    async fn load_all_marks_bad_strategy_errored_without_failing_load() {
        let persistence = Arc::new(InMemoryPersistence::new());
        persistence
            .seed(vec![
                trader("ok", true, good_code()),
                trader("bad", true, json!({"kind": "not_a_real_node"})),
            ])
            .await;
        let bus = Arc::new(EventBus::new());
        let registry = TraderRegistry::new(persistence, bus, 5, Duration::from_secs(60));
        registry.load_all().await.unwrap();

        assert_eq!(registry.list_active().len(), 1);
        let counts = registry.state_counts();
        assert_eq!(counts.get("ready"), Some(&1));
        assert_eq!(counts.get("error"), Some(&1));
    }

    #[tokio::test]
    async fn repeated_faults_quarantine_trader() {
        let persistence = Arc::new(InMemoryPersistence::new());
        persistence.seed(vec![trader("flaky", true, good_code())]).await;
        let bus = Arc::new(EventBus::new());
        let registry = TraderRegistry::new(persistence, bus, 3, Duration::from_secs(60));
        registry.load_all().await.unwrap();

        for i in 0..3 {
            registry.record_fault("flaky", i);
        }
        assert_eq!(registry.list_active().len(), 0);
        assert_eq!(registry.quarantine_count(), 1);
    }

    #[tokio::test]
    async fn deletion_watcher_removes_traders_missing_from_persistence() {
        let persistence = Arc::new(InMemoryPersistence::new());
        persistence.seed(vec![trader("a", true, good_code())]).await;
        let bus = Arc::new(EventBus::new());
        let registry = TraderRegistry::new(persistence.clone(), bus, 5, Duration::from_secs(60));
        registry.load_all().await.unwrap();
        assert_eq!(registry.list_active().len(), 1);

        persistence.seed(vec![]).await;
        let removed = registry.reconcile_deletions().await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(registry.list_active().len(), 0);
    }
}
