use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{info, warn};

use super::types::{Signal, Trader};
use crate::config::DatabaseConfig;

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("trader not found: {0}")]
    NotFound(String),
    #[error("persistence backend error: {0}")]
    Backend(String),
    #[error("persistence timeout")]
    Timeout,
}

#[cfg(feature = "database")]
impl From<mongodb::error::Error> for PersistenceError {
    fn from(e: mongodb::error::Error) -> Self {
        PersistenceError::Backend(e.to_string())
    }
}

/// The engine's only view of the outside persistence layer. Four
/// operations suffice: loading traders, resolving one by id, writing
/// signals (batch preferred), and a liveness probe.
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn list_active_traders(&self) -> Result<Vec<Trader>, PersistenceError>;
    async fn get_trader(&self, id: &str) -> Result<Trader, PersistenceError>;
    async fn insert_signal(&self, signal: &Signal) -> Result<(), PersistenceError>;
    async fn insert_signals(&self, signals: &[Signal]) -> Result<(), PersistenceError>;
    async fn health_check(&self) -> Result<(), PersistenceError>;
}

/// In-memory fallback used when the `database` feature is disabled or the
/// configured URL does not look like a real connection string, mirroring
/// the teacher's `Storage` feature-gated connect-or-fallback pattern.
pub struct InMemoryPersistence {
    traders: RwLock<Vec<Trader>>,
    signals: RwLock<Vec<Signal>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self {
            traders: RwLock::new(Vec::new()),
            signals: RwLock::new(Vec::new()),
        }
    }

    /// Test/bootstrap helper: replaces the whole trader set.
    pub async fn seed(&self, traders: Vec<Trader>) {
        *self.traders.write() = traders;
    }

    pub fn signals(&self) -> Vec<Signal> {
        self.signals.read().clone()
    }
}

impl Default for InMemoryPersistence {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Persistence for InMemoryPersistence {
    async fn list_active_traders(&self) -> Result<Vec<Trader>, PersistenceError> {
        Ok(self
            .traders
            .read()
            .iter()
            .filter(|t| t.enabled)
            .cloned()
            .collect())
    }

    async fn get_trader(&self, id: &str) -> Result<Trader, PersistenceError> {
        self.traders
            .read()
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .ok_or_else(|| PersistenceError::NotFound(id.to_string()))
    }

    async fn insert_signal(&self, signal: &Signal) -> Result<(), PersistenceError> {
        self.signals.write().push(signal.clone());
        Ok(())
    }

    async fn insert_signals(&self, signals: &[Signal]) -> Result<(), PersistenceError> {
        self.signals.write().extend_from_slice(signals);
        Ok(())
    }

    async fn health_check(&self) -> Result<(), PersistenceError> {
        Ok(())
    }
}

#[cfg(feature = "database")]
mod mongo {
    use super::*;
    use bson::{doc, Document};
    use futures::stream::TryStreamExt;
    use mongodb::{options::IndexOptions, Client, Collection, Database, IndexModel};

    pub struct MongoPersistence {
        db: Database,
    }

    impl MongoPersistence {
        pub async fn connect(config: &DatabaseConfig) -> Result<Self, PersistenceError> {
            let client = Client::with_uri_str(&config.url)
                .await
                .map_err(|e| PersistenceError::Backend(e.to_string()))?;
            let db = client.database(config.database_name.as_deref().unwrap_or("screener"));
            db.list_collection_names()
                .await
                .map_err(|e| PersistenceError::Backend(e.to_string()))?;
            info!(url = %config.url, "connected to persistence backend");
            let persistence = Self { db };
            if let Err(e) = persistence.ensure_indexes().await {
                warn!(error = %e, "failed to create persistence indexes (non-fatal)");
            }
            Ok(persistence)
        }

        async fn ensure_indexes(&self) -> Result<(), PersistenceError> {
            let signals: Collection<Document> = self.db.collection("signals");
            let dedup_index = IndexModel::builder()
                .keys(doc! { "trader_id": 1, "symbol": 1, "interval": 1, "timestamp": -1 })
                .options(IndexOptions::builder().background(Some(true)).build())
                .build();
            signals
                .create_index(dedup_index)
                .await
                .map_err(PersistenceError::from)?;

            let traders: Collection<Document> = self.db.collection("traders");
            let traders_index = IndexModel::builder()
                .keys(doc! { "enabled": 1 })
                .options(IndexOptions::builder().background(Some(true)).build())
                .build();
            traders
                .create_index(traders_index)
                .await
                .map_err(PersistenceError::from)?;
            Ok(())
        }
    }

    #[async_trait]
    impl Persistence for MongoPersistence {
        async fn list_active_traders(&self) -> Result<Vec<Trader>, PersistenceError> {
            let collection: Collection<Trader> = self.db.collection("traders");
            let mut cursor = collection
                .find(doc! { "enabled": true })
                .await
                .map_err(PersistenceError::from)?;
            let mut out = Vec::new();
            while let Some(trader) = cursor.try_next().await.map_err(PersistenceError::from)? {
                out.push(trader);
            }
            Ok(out)
        }

        async fn get_trader(&self, id: &str) -> Result<Trader, PersistenceError> {
            let collection: Collection<Trader> = self.db.collection("traders");
            collection
                .find_one(doc! { "id": id })
                .await
                .map_err(PersistenceError::from)?
                .ok_or_else(|| PersistenceError::NotFound(id.to_string()))
        }

        async fn insert_signal(&self, signal: &Signal) -> Result<(), PersistenceError> {
            let collection: Collection<Signal> = self.db.collection("signals");
            collection
                .insert_one(signal)
                .await
                .map_err(PersistenceError::from)?;
            Ok(())
        }

        async fn insert_signals(&self, signals: &[Signal]) -> Result<(), PersistenceError> {
            if signals.is_empty() {
                return Ok(());
            }
            let collection: Collection<Signal> = self.db.collection("signals");
            collection
                .insert_many(signals)
                .await
                .map_err(PersistenceError::from)?;
            Ok(())
        }

        async fn health_check(&self) -> Result<(), PersistenceError> {
            self.db
                .list_collection_names()
                .await
                .map_err(PersistenceError::from)?;
            Ok(())
        }
    }
}

#[cfg(feature = "database")]
pub use mongo::MongoPersistence;

/// Connects to the configured persistence backend, falling back to the
/// in-memory store when the `database` feature is off or the URL does not
/// look like a real connection string — the same fallback shape the
/// teacher's `Storage::new` uses.
pub async fn connect(config: &DatabaseConfig) -> Arc<dyn Persistence> {
    #[cfg(feature = "database")]
    {
        if config.url.starts_with("mongodb://") || config.url.starts_with("mongodb+srv://") {
            match mongo::MongoPersistence::connect(config).await {
                Ok(p) => return Arc::new(p),
                Err(e) => warn!(error = %e, "falling back to in-memory persistence"),
            }
        }
    }
    #[cfg(not(feature = "database"))]
    {
        let _ = config;
    }
    info!("using in-memory persistence (database feature disabled or URL unrecognized)");
    Arc::new(InMemoryPersistence::new())
}
