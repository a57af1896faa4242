use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{error, warn};

use super::strategy::{evaluate, Node};
use super::types::{Interval, Kline, Ticker};

#[derive(Debug, Clone, thiserror::Error)]
pub enum SandboxError {
    #[error("strategy evaluation timed out")]
    Timeout,
    #[error("strategy evaluation panicked: {0}")]
    Panicked(String),
    #[error("strategy fault: {0}")]
    Fault(String),
}

/// An immutable bundle handed to a single evaluation: one symbol's worth
/// of cached data. No filesystem, network, or clock access is reachable
/// from here — only the klines the executor chose to include.
pub struct Snapshot {
    pub symbol: String,
    pub klines: HashMap<Interval, Vec<Kline>>,
    pub ticker: Option<Ticker>,
}

/// Executes compiled strategy trees against snapshots with a wall-clock
/// timeout, panic containment, and a process-wide concurrency cap.
pub struct SandboxExecutor {
    semaphore: Arc<Semaphore>,
    single_symbol_timeout: Duration,
    batch_timeout: Duration,
}

impl SandboxExecutor {
    pub fn new(concurrency: usize, single_symbol_timeout: Duration, batch_timeout: Duration) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
            single_symbol_timeout,
            batch_timeout,
        }
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    #[cfg(test)]
    pub fn try_acquire_permit_for_test(&self) -> tokio::sync::OwnedSemaphorePermit {
        self.semaphore.clone().try_acquire_owned().unwrap()
    }

    /// Executes `strategy` against one snapshot, bounded by the
    /// single-symbol timeout. A fault or timeout is treated as "no match".
    pub async fn execute(&self, strategy: Arc<Node>, snapshot: Snapshot) -> Result<bool, SandboxError> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SandboxError::Fault("sandbox semaphore closed".to_string()))?;

        let result = tokio::time::timeout(
            self.single_symbol_timeout,
            tokio::task::spawn_blocking(move || {
                let _permit = permit;
                std::panic::catch_unwind(AssertUnwindSafe(|| evaluate(&strategy, &snapshot.klines)))
            }),
        )
        .await;

        match result {
            Err(_elapsed) => {
                warn!("strategy evaluation exceeded timeout");
                Err(SandboxError::Timeout)
            }
            Ok(Err(join_err)) => Err(SandboxError::Fault(format!("task join error: {join_err}"))),
            Ok(Ok(Err(panic_payload))) => {
                let msg = panic_message(&panic_payload);
                error!(panic = %msg, "strategy evaluation panicked");
                Err(SandboxError::Panicked(msg))
            }
            Ok(Ok(Ok(Err(eval_err)))) => Err(SandboxError::Fault(eval_err.to_string())),
            Ok(Ok(Ok(Ok(matched)))) => Ok(matched),
        }
    }

    /// Dispatches one strategy across many symbols concurrently, under the
    /// semaphore. One symbol's failure never cancels the others; batch as
    /// a whole is bounded by the batch timeout.
    pub async fn execute_batch(
        &self,
        strategy: Arc<Node>,
        snapshots: Vec<Snapshot>,
    ) -> Vec<(String, Result<bool, SandboxError>)> {
        let batch = async {
            let mut handles = Vec::with_capacity(snapshots.len());
            for snapshot in snapshots {
                let symbol = snapshot.symbol.clone();
                let strategy = strategy.clone();
                let this_single_timeout = self.single_symbol_timeout;
                let semaphore = self.semaphore.clone();
                handles.push(tokio::spawn(async move {
                    let permit = match semaphore.acquire_owned().await {
                        Ok(p) => p,
                        Err(_) => {
                            return (
                                symbol,
                                Err(SandboxError::Fault("sandbox semaphore closed".to_string())),
                            )
                        }
                    };
                    let result = tokio::time::timeout(
                        this_single_timeout,
                        tokio::task::spawn_blocking(move || {
                            let _permit = permit;
                            std::panic::catch_unwind(AssertUnwindSafe(|| evaluate(&strategy, &snapshot.klines)))
                        }),
                    )
                    .await;

                    let outcome = match result {
                        Err(_elapsed) => Err(SandboxError::Timeout),
                        Ok(Err(join_err)) => Err(SandboxError::Fault(format!("task join error: {join_err}"))),
                        Ok(Ok(Err(panic_payload))) => {
                            let msg = panic_message(&panic_payload);
                            error!(panic = %msg, "strategy evaluation panicked");
                            Err(SandboxError::Panicked(msg))
                        }
                        Ok(Ok(Ok(Err(eval_err)))) => Err(SandboxError::Fault(eval_err.to_string())),
                        Ok(Ok(Ok(Ok(matched)))) => Ok(matched),
                    };
                    (symbol, outcome)
                }));
            }

            let mut results = Vec::with_capacity(handles.len());
            for handle in handles {
                match handle.await {
                    Ok(pair) => results.push(pair),
                    Err(join_err) => {
                        results.push(("<unknown>".to_string(), Err(SandboxError::Fault(join_err.to_string()))));
                    }
                }
            }
            results
        };

        match tokio::time::timeout(self.batch_timeout, batch).await {
            Ok(results) => results,
            Err(_) => {
                warn!("sandbox batch exceeded overall timeout");
                vec![("<batch>".to_string(), Err(SandboxError::Timeout))]
            }
        }
    }
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use serde_json::json;

    fn klines_rising(n: usize) -> Vec<Kline> {
        (0..n)
            .map(|i| Kline {
                open_time: i as i64,
                close_time: i as i64,
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
    async fn matching_strategy_returns_true() {
        let executor = SandboxExecutor::new(4, Duration::from_secs(1), Duration::from_secs(5));
        let tree = super::super::strategy::compile(&json!({
            "kind": "rsi", "interval": "1m", "period": 14, "threshold": 10.0, "side": "above"
        }))
        .unwrap();
        let mut klines = HashMap::new();
        klines.insert(Interval::OneMinute, klines_rising(30));
        let snapshot = Snapshot {
            symbol: "BTCUSDT".to_string(),
            klines,
            ticker: None,
        };
        let matched = executor.execute(Arc::new(tree.root), snapshot).await.unwrap();
        assert!(matched);
    }

    #[tokio::test]
    async fn timeout_is_treated_as_no_match_without_panicking_executor() {
        // A strategy referencing an interval absent from the snapshot
        // reports a fault rather than a timeout, exercising the "other
        // symbols still complete" guarantee from a different angle since
        // we cannot literally block a synchronous strategy for 2s here
        // without spawning a real OS thread sleep.
        let executor = SandboxExecutor::new(2, Duration::from_millis(50), Duration::from_secs(1));
        let tree = super::super::strategy::compile(&json!({
            "kind": "rsi", "interval": "1h", "period": 14, "threshold": 10.0, "side": "above"
        }))
        .unwrap();
        let snapshot = Snapshot {
            symbol: "ETHUSDT".to_string(),
            klines: HashMap::new(),
            ticker: None,
        };
        let result = executor.execute(Arc::new(tree.root), snapshot).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn batch_one_symbol_failure_does_not_cancel_others() {
        let executor = SandboxExecutor::new(4, Duration::from_secs(1), Duration::from_secs(5));
        let tree = super::super::strategy::compile(&json!({
            "kind": "rsi", "interval": "1m", "period": 14, "threshold": 10.0, "side": "above"
        }))
        .unwrap();
        let strategy = Arc::new(tree.root);

        let mut good_klines = HashMap::new();
        good_klines.insert(Interval::OneMinute, klines_rising(30));
        let good = Snapshot {
            symbol: "GOOD".to_string(),
            klines: good_klines,
            ticker: None,
        };
        let bad = Snapshot {
            symbol: "BAD".to_string(),
            klines: HashMap::new(),
            ticker: None,
        };

        let results = executor.execute_batch(strategy, vec![good, bad]).await;
        assert_eq!(results.len(), 2);
        let good_result = results.iter().find(|(s, _)| s == "GOOD").unwrap();
        let bad_result = results.iter().find(|(s, _)| s == "BAD").unwrap();
        assert!(good_result.1.as_ref().unwrap());
        assert!(bad_result.1.is_err());
    }
}
