//! # Embedding sync
//!
//! Keeps each vehicle's stored embedding in step with its attributes. The listing side
//! calls [`EmbeddingSync::spawn`] (fire-and-forget) after a create or update, and
//! [`EmbeddingSync::remove`] when a listing is deleted.
//!
//! ## Guarantees
//! - One sync writes the embedding of exactly one vehicle.
//! - Syncs for the same vehicle id run one at a time (last writer wins); different ids
//!   never wait on each other.
//! - Idempotent: when the rendered description has the same digest as the stored
//!   embedding and the model is unchanged, the embedder is not called and nothing is
//!   written ([`SyncOutcome::Unchanged`]).
//! - On failure the previous embedding stays in place. A stale vector only degrades
//!   ranking; clearing it would drop the vehicle from search altogether.
//!
//! ## Staleness window
//! Because the trigger does not block the listing save, a search that runs between the
//! save and the end of the sync ranks the vehicle by its previous vector. With a remote
//! embedder this is typically well under a second; it is unbounded while the backend is
//! down, until a later `sync_all` catches up.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex},
};
use tokio::{sync::Mutex as AsyncMutex, task::JoinHandle};
use tracing::{error, info, warn};

use crate::{
    embedding::EmbeddingGenerator,
    error::{MatchError, Result},
    vector_store::VehicleStore,
    vehicle::{describe, description_digest},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// A new vector was computed and written.
    Updated,
    /// The stored vector already matched the current attributes.
    Unchanged,
}

/// Tally of a batch sync.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SyncReport {
    pub updated: Vec<String>,
    pub unchanged: Vec<String>,
    /// Ids that no longer exist. Skipped, not fatal.
    pub missing: Vec<String>,
    /// Ids whose sync failed, with the error message.
    pub failed: Vec<(String, String)>,
}

impl SyncReport {
    pub fn record(&mut self, vehicle_id: &str, result: &Result<SyncOutcome>) {
        let id = vehicle_id.to_string();
        match result {
            Ok(SyncOutcome::Updated) => self.updated.push(id),
            Ok(SyncOutcome::Unchanged) => self.unchanged.push(id),
            Err(MatchError::NotFound(_)) => self.missing.push(id),
            Err(err) => self.failed.push((id, err.to_string())),
        }
    }

    pub fn total(&self) -> usize {
        self.updated.len() + self.unchanged.len() + self.missing.len() + self.failed.len()
    }
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} vehicles: {} updated, {} unchanged, {} missing, {} failed",
            self.total(),
            self.updated.len(),
            self.unchanged.len(),
            self.missing.len(),
            self.failed.len()
        )
    }
}

pub struct EmbeddingSync {
    generator: EmbeddingGenerator,
    store: Arc<dyn VehicleStore>,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl EmbeddingSync {
    pub fn new(generator: EmbeddingGenerator, store: Arc<dyn VehicleStore>) -> Self {
        Self {
            generator,
            store,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, vehicle_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        Arc::clone(
            locks
                .entry(vehicle_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }

    fn release(&self, vehicle_id: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        if locks
            .get(vehicle_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(vehicle_id);
        }
    }

    /// Bring one vehicle's embedding up to date, skipping the embedder when nothing
    /// changed.
    pub async fn sync(&self, vehicle_id: &str) -> Result<SyncOutcome> {
        self.run(vehicle_id, false).await
    }

    /// Recompute and write the embedding even if the stored one looks current.
    pub async fn sync_forced(&self, vehicle_id: &str) -> Result<SyncOutcome> {
        self.run(vehicle_id, true).await
    }

    async fn run(&self, vehicle_id: &str, force: bool) -> Result<SyncOutcome> {
        let lock = self.lock_for(vehicle_id);
        let result = {
            let _guard = lock.lock().await;
            self.sync_locked(vehicle_id, force).await
        };
        drop(lock);
        self.release(vehicle_id);
        result
    }

    async fn sync_locked(&self, vehicle_id: &str, force: bool) -> Result<SyncOutcome> {
        let vehicle = self.store.fetch_attributes(vehicle_id).await?;
        let text = describe(&vehicle);
        let embedder = self.generator.embedder();

        if !force {
            if let Some(stored) = vehicle.embedding.as_ref() {
                if stored.model == embedder.model_id()
                    && stored.dimension() == embedder.dimension()
                    && stored.digest == description_digest(&text)
                {
                    info!(vehicle_id, "Embedding already current");
                    return Ok(SyncOutcome::Unchanged);
                }
            }
        }

        let generated = self.generator.embed_description(vehicle_id, text).await?;
        self.store
            .upsert_embedding(vehicle_id, generated.embedding)
            .await?;
        info!(vehicle_id, "Embedding updated");
        Ok(SyncOutcome::Updated)
    }

    /// Sync every id in order. Missing vehicles are logged and skipped; other failures
    /// are collected and do not stop the batch.
    pub async fn sync_all(&self, vehicle_ids: &[String], force: bool) -> SyncReport {
        let mut report = SyncReport::default();
        for vehicle_id in vehicle_ids {
            let result = self.run(vehicle_id, force).await;
            match &result {
                Err(MatchError::NotFound(_)) => {
                    warn!(vehicle_id = %vehicle_id, "Vehicle vanished before sync, skipping")
                }
                Err(err) => error!(vehicle_id = %vehicle_id, "Embedding sync failed: {err}"),
                Ok(_) => {}
            }
            report.record(vehicle_id, &result);
        }
        report
    }

    /// Fire-and-forget trigger for a listing save. Failures are logged, never returned
    /// to the saver.
    pub fn spawn(self: &Arc<Self>, vehicle_id: impl Into<String>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let vehicle_id = vehicle_id.into();
        tokio::spawn(async move {
            if let Err(err) = this.sync(&vehicle_id).await {
                error!(vehicle_id = %vehicle_id, retryable = err.is_retryable(), "Background embedding sync failed: {err}");
            }
        })
    }

    /// Listing deleted: drop its embedding.
    pub async fn remove(&self, vehicle_id: &str) -> Result<()> {
        let lock = self.lock_for(vehicle_id);
        let result = {
            let _guard = lock.lock().await;
            self.store.delete_embedding(vehicle_id).await
        };
        drop(lock);
        self.release(vehicle_id);
        info!(vehicle_id, "Embedding removed");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::tests::{DownEmbedder, KeywordEmbedder};
    use crate::vector_store::InMemoryVehicleStore;
    use crate::vehicle::tests::corolla;

    async fn setup(embedder: Arc<KeywordEmbedder>) -> (Arc<InMemoryVehicleStore>, Arc<EmbeddingSync>) {
        let store = Arc::new(InMemoryVehicleStore::new());
        store.insert_vehicle(corolla()).await;
        let sync = Arc::new(EmbeddingSync::new(
            EmbeddingGenerator::new(embedder),
            store.clone(),
        ));
        (store, sync)
    }

    #[tokio::test]
    async fn test_sync_is_idempotent() {
        let embedder = Arc::new(KeywordEmbedder::new(16));
        let (store, sync) = setup(embedder.clone()).await;

        assert_eq!(sync.sync("v-corolla").await.unwrap(), SyncOutcome::Updated);
        let first = store.fetch_attributes("v-corolla").await.unwrap().embedding;

        assert_eq!(sync.sync("v-corolla").await.unwrap(), SyncOutcome::Unchanged);
        let second = store.fetch_attributes("v-corolla").await.unwrap().embedding;

        assert!(first.is_some());
        assert_eq!(first, second);
        assert_eq!(embedder.calls(), 1);

        // forcing recomputes, and lands on the same vector
        assert_eq!(
            sync.sync_forced("v-corolla").await.unwrap(),
            SyncOutcome::Updated
        );
        let third = store.fetch_attributes("v-corolla").await.unwrap().embedding;
        assert_eq!(first.map(|e| e.vector), third.map(|e| e.vector));
        assert_eq!(embedder.calls(), 2);
    }

    #[tokio::test]
    async fn test_attribute_change_triggers_reembedding() {
        let embedder = Arc::new(KeywordEmbedder::new(16));
        let (store, sync) = setup(embedder.clone()).await;
        sync.sync("v-corolla").await.unwrap();

        let mut edited = corolla();
        edited.description = Some("Blindado, teto solar.".into());
        store.insert_vehicle(edited).await;

        assert_eq!(sync.sync("v-corolla").await.unwrap(), SyncOutcome::Updated);
        assert_eq!(embedder.calls(), 2);
    }

    #[tokio::test]
    async fn test_failed_sync_keeps_previous_embedding() {
        let store = Arc::new(InMemoryVehicleStore::new());
        store.insert_vehicle(corolla()).await;
        let good = EmbeddingSync::new(
            EmbeddingGenerator::new(Arc::new(KeywordEmbedder::new(4))),
            store.clone(),
        );
        good.sync("v-corolla").await.unwrap();
        let before = store.fetch_attributes("v-corolla").await.unwrap().embedding;

        let mut edited = corolla();
        edited.price = Some(1.0);
        store.insert_vehicle(edited).await;

        let broken = EmbeddingSync::new(EmbeddingGenerator::new(Arc::new(DownEmbedder)), store.clone());
        let err = broken.sync("v-corolla").await.unwrap_err();
        assert!(matches!(err, MatchError::UpstreamUnavailable(_)));

        let after = store.fetch_attributes("v-corolla").await.unwrap().embedding;
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_sync_all_skips_missing() {
        let embedder = Arc::new(KeywordEmbedder::new(8));
        let (_store, sync) = setup(embedder).await;

        let ids = vec!["v-corolla".to_string(), "ghost".to_string()];
        let report = sync.sync_all(&ids, false).await;

        assert_eq!(report.updated, vec!["v-corolla".to_string()]);
        assert_eq!(report.missing, vec!["ghost".to_string()]);
        assert!(report.failed.is_empty());
        assert_eq!(report.total(), 2);
        assert_eq!(
            report.to_string(),
            "2 vehicles: 1 updated, 0 unchanged, 1 missing, 0 failed"
        );
    }

    #[tokio::test]
    async fn test_spawned_syncs_on_same_id_serialize() {
        let embedder = Arc::new(KeywordEmbedder::new(8));
        let (store, sync) = setup(embedder.clone()).await;

        let handles: Vec<_> = (0..4).map(|_| sync.spawn("v-corolla")).collect();
        for handle in handles {
            handle.await.unwrap();
        }

        // the first run writes, the rest see a current digest
        assert_eq!(embedder.calls(), 1);
        assert!(store.fetch_attributes("v-corolla").await.unwrap().embedding.is_some());
        assert!(sync.locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_deletes_embedding() {
        let embedder = Arc::new(KeywordEmbedder::new(8));
        let (store, sync) = setup(embedder).await;
        sync.sync("v-corolla").await.unwrap();

        sync.remove("v-corolla").await.unwrap();
        assert!(store.fetch_attributes("v-corolla").await.unwrap().embedding.is_none());
    }
}
