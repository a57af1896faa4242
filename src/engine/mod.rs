pub mod bus;
pub mod cache;
pub mod executor;
pub mod indicators;
pub mod persistence;
pub mod registry;
pub mod sandbox;
pub mod scheduler;
pub mod strategy;
pub mod stream;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;

use bus::EventBus;
use cache::KlineCache;
use executor::TraderExecutor;
use persistence::Persistence;
use registry::TraderRegistry;
use sandbox::SandboxExecutor;
use scheduler::CandleScheduler;
use stream::StreamClient;

/// Wires the seven components together and owns their shared handles. This
/// is the object `main.rs` constructs and runs to completion.
pub struct Engine {
    pub bus: Arc<EventBus>,
    pub cache: Arc<KlineCache>,
    pub registry: Arc<TraderRegistry>,
    pub scheduler: Arc<CandleScheduler>,
    pub sandbox: Arc<SandboxExecutor>,
    pub executor: Arc<TraderExecutor>,
    pub stream: Arc<StreamClient>,
    pub symbols: Arc<RwLock<Vec<String>>>,
    persistence: Arc<dyn Persistence>,
    registry_poll_interval_ms: u64,
    cancel: CancellationToken,
}

impl Engine {
    pub async fn build(config: &Config, persistence: Arc<dyn Persistence>) -> Self {
        let cancel = CancellationToken::new();
        let bus = Arc::new(EventBus::new());
        let cache = Arc::new(KlineCache::new(config.cache.capacity_per_series));
        let symbols = Arc::new(RwLock::new(config.symbol_universe.symbols.clone()));

        let registry = Arc::new(TraderRegistry::new(
            persistence.clone(),
            bus.clone(),
            config.registry.error_quarantine_threshold,
            Duration::from_secs(config.registry.error_quarantine_window_secs),
        ));

        let scheduler = Arc::new(CandleScheduler::new(bus.clone(), &config.scheduler.intervals, cancel.clone()));

        let sandbox = Arc::new(SandboxExecutor::new(
            config.sandbox.concurrency,
            Duration::from_millis(config.sandbox.single_symbol_timeout_ms),
            Duration::from_millis(config.sandbox.batch_timeout_ms),
        ));

        let executor = Arc::new(TraderExecutor::new(
            bus.clone(),
            cache.clone(),
            registry.clone(),
            sandbox.clone(),
            persistence.clone(),
            symbols.clone(),
            config.executor.dedup_window_ms,
            config.executor.pending_queue_size,
        ));

        let (stream, _ticker_rx) = StreamClient::new(config.stream.clone(), cache.clone(), bus.clone());

        Self {
            bus,
            cache,
            registry,
            scheduler,
            sandbox,
            executor,
            stream: Arc::new(stream),
            symbols,
            persistence,
            registry_poll_interval_ms: config.registry.poll_interval_ms,
            cancel,
        }
    }

    /// Loads traders, bootstraps historical candles, and runs every
    /// component concurrently until cancelled.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        self.registry.load_all().await?;
        info!(active = self.registry.list_active().len(), "traders loaded");

        let symbols = self.symbols.read().clone();
        self.stream.bootstrap_all(&symbols, &self.scheduler_intervals()).await;

        let deletion_watcher = self
            .registry
            .run_deletion_watcher(Duration::from_millis(self.registry_poll_interval_ms), self.cancel.clone());
        let executor_task = self.executor.clone().run(self.cancel.clone());

        let stream = self.stream.clone();
        let stream_symbols = self.symbols.clone();
        let stream_intervals = self.scheduler_intervals();
        let stream_cancel = self.cancel.clone();
        let stream_task = tokio::spawn(async move {
            stream.run(stream_symbols, stream_intervals, stream_cancel).await;
        });

        tokio::select! {
            _ = self.cancel.cancelled() => {}
            res = deletion_watcher => { res?; }
            res = executor_task => { res?; }
            res = stream_task => { res?; }
        }

        self.scheduler.stop();
        Ok(())
    }

    fn scheduler_intervals(&self) -> Vec<types::Interval> {
        self.scheduler.configured_intervals()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// A coarse liveness/readiness snapshot for the health surface.
    pub async fn health(&self) -> EngineHealth {
        EngineHealth {
            persistence_ok: self.persistence.health_check().await.is_ok(),
            cache_series: self.cache.key_count(),
            trader_states: self.registry.state_counts(),
            reconnects: self.stream.reconnect_count(),
            dropped_events: self.executor.dropped_event_count(),
        }
    }
}

#[derive(Debug)]
pub struct EngineHealth {
    pub persistence_ok: bool,
    pub cache_series: usize,
    pub trader_states: std::collections::HashMap<&'static str, usize>,
    pub reconnects: u64,
    pub dropped_events: u64,
}
