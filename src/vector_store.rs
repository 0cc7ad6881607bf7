//! # Vehicle vector store
//!
//! [`VehicleStore`] is the boundary to wherever listings and their embeddings live. The
//! matcher needs four operations from it:
//!
//! - `fetch_attributes`: current listing data for one vehicle.
//! - `upsert_embedding`: overwrite the embedding of exactly one vehicle.
//! - `nearest_neighbors`: top-k vehicles by cosine similarity to a query vector.
//! - `delete_embedding`: drop one vehicle's embedding.
//!
//! Two implementations ship with the crate: [`InMemoryVehicleStore`] here, and the
//! SQLite-backed [`crate::sqlite_store::SqliteVehicleStore`]. Both rank with
//! [`rank_candidates`], an exact cosine scan.
//!
//! ## Ranking rules
//! - Results are in non-increasing score order, ties broken by vehicle id.
//! - Vehicles without an embedding are not candidates.
//! - Vehicles embedded by a different model are skipped (they are stale, not wrong)
//!   and reported in a `warn!`.
//! - A same-model vector whose length differs from the query is an error
//!   ([`MatchError::DimensionMismatch`]), never a guessed score.

use async_trait::async_trait;
use std::{cmp::Ordering, collections::HashMap};
use tokio::sync::RwLock;
use tracing::warn;

use crate::{
    error::{MatchError, Result},
    vehicle::{StoredEmbedding, VehicleRecord},
};

/// A vehicle and how similar it is to the query.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub vehicle: VehicleRecord,
    /// Cosine similarity in `[-1, 1]`; higher is more similar.
    pub score: f32,
}

#[async_trait]
pub trait VehicleStore: Send + Sync {
    /// # Errors
    /// [`MatchError::NotFound`] when no vehicle has this id.
    async fn fetch_attributes(&self, vehicle_id: &str) -> Result<VehicleRecord>;

    /// # Errors
    /// [`MatchError::NotFound`] when no vehicle has this id.
    async fn upsert_embedding(&self, vehicle_id: &str, embedding: StoredEmbedding) -> Result<()>;

    /// Top `k` vehicles embedded with `model`, most similar first.
    async fn nearest_neighbors(&self, query: &[f32], model: &str, k: usize)
    -> Result<Vec<Neighbor>>;

    /// Idempotent: deleting a missing embedding is not an error.
    async fn delete_embedding(&self, vehicle_id: &str) -> Result<()>;
}

/// Cosine similarity between two equal-length vectors.
///
/// Returns `0.0` when either vector has zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let (mut dot, mut norm_a, mut norm_b) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Exact top-k cosine ranking over candidate vehicles.
pub fn rank_candidates<I>(query: &[f32], model: &str, k: usize, candidates: I) -> Result<Vec<Neighbor>>
where
    I: IntoIterator<Item = VehicleRecord>,
{
    let mut scored: Vec<Neighbor> = Vec::new();
    let mut stale = 0usize;

    for vehicle in candidates {
        let Some(embedding) = vehicle.embedding.as_ref() else {
            continue;
        };
        if embedding.model != model {
            stale += 1;
            continue;
        }
        if embedding.dimension() != query.len() {
            return Err(MatchError::DimensionMismatch {
                expected: query.len(),
                found: embedding.dimension(),
            });
        }
        let score = cosine_similarity(query, &embedding.vector);
        scored.push(Neighbor { vehicle, score });
    }

    if stale > 0 {
        warn!(stale, model, "Skipped vehicles embedded with another model");
    }

    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.vehicle.id.cmp(&b.vehicle.id))
    });
    scored.truncate(k);
    Ok(scored)
}

/// Process-local store, mostly for tests and small demos.
#[derive(Default)]
pub struct InMemoryVehicleStore {
    vehicles: RwLock<HashMap<String, VehicleRecord>>,
}

impl InMemoryVehicleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace a listing's attributes. An existing embedding is kept as-is
    /// (now possibly stale) until the next sync.
    pub async fn insert_vehicle(&self, mut vehicle: VehicleRecord) {
        let mut vehicles = self.vehicles.write().await;
        if let Some(existing) = vehicles.get(&vehicle.id) {
            if vehicle.embedding.is_none() {
                vehicle.embedding = existing.embedding.clone();
            }
        }
        vehicles.insert(vehicle.id.clone(), vehicle);
    }

    /// Remove a listing together with its embedding.
    pub async fn remove_vehicle(&self, vehicle_id: &str) -> Option<VehicleRecord> {
        self.vehicles.write().await.remove(vehicle_id)
    }

    pub async fn len(&self) -> usize {
        self.vehicles.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.vehicles.read().await.is_empty()
    }
}

#[async_trait]
impl VehicleStore for InMemoryVehicleStore {
    async fn fetch_attributes(&self, vehicle_id: &str) -> Result<VehicleRecord> {
        self.vehicles
            .read()
            .await
            .get(vehicle_id)
            .cloned()
            .ok_or_else(|| MatchError::NotFound(format!("vehicle {vehicle_id}")))
    }

    async fn upsert_embedding(&self, vehicle_id: &str, embedding: StoredEmbedding) -> Result<()> {
        let mut vehicles = self.vehicles.write().await;
        let vehicle = vehicles
            .get_mut(vehicle_id)
            .ok_or_else(|| MatchError::NotFound(format!("vehicle {vehicle_id}")))?;
        vehicle.embedding = Some(embedding);
        Ok(())
    }

    async fn nearest_neighbors(
        &self,
        query: &[f32],
        model: &str,
        k: usize,
    ) -> Result<Vec<Neighbor>> {
        let vehicles = self.vehicles.read().await;
        rank_candidates(query, model, k, vehicles.values().cloned())
    }

    async fn delete_embedding(&self, vehicle_id: &str) -> Result<()> {
        if let Some(vehicle) = self.vehicles.write().await.get_mut(vehicle_id) {
            vehicle.embedding = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vehicle::VehicleType;

    fn vehicle(id: &str, vector: Option<Vec<f32>>, model: &str) -> VehicleRecord {
        VehicleRecord {
            id: id.to_string(),
            brand: "Fiat".into(),
            model: id.to_string(),
            vehicle_type: VehicleType::Car,
            embedding: vector.map(|vector| StoredEmbedding {
                vector,
                model: model.to_string(),
                digest: String::new(),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_rank_orders_and_truncates() {
        let candidates = vec![
            vehicle("far", Some(vec![0.0, 1.0]), "m"),
            vehicle("near", Some(vec![1.0, 0.1]), "m"),
            vehicle("mid", Some(vec![1.0, 1.0]), "m"),
            vehicle("none", None, "m"),
        ];
        let ranked = rank_candidates(&[1.0, 0.0], "m", 2, candidates).unwrap();

        let ids: Vec<&str> = ranked.iter().map(|n| n.vehicle.id.as_str()).collect();
        assert_eq!(ids, vec!["near", "mid"]);
        assert!(ranked[0].score >= ranked[1].score);
    }

    #[test]
    fn test_rank_breaks_ties_by_id() {
        let candidates = vec![
            vehicle("b", Some(vec![1.0, 0.0]), "m"),
            vehicle("a", Some(vec![2.0, 0.0]), "m"),
        ];
        let ranked = rank_candidates(&[1.0, 0.0], "m", 5, candidates).unwrap();
        let ids: Vec<&str> = ranked.iter().map(|n| n.vehicle.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_rank_skips_other_models_and_rejects_dimension_mismatch() {
        let candidates = vec![
            vehicle("old", Some(vec![1.0, 0.0, 0.0]), "old-model"),
            vehicle("new", Some(vec![1.0, 0.0]), "m"),
        ];
        let ranked = rank_candidates(&[1.0, 0.0], "m", 5, candidates).unwrap();
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].vehicle.id, "new");

        let mismatched = vec![vehicle("bad", Some(vec![1.0, 0.0, 0.0]), "m")];
        let err = rank_candidates(&[1.0, 0.0], "m", 5, mismatched).unwrap_err();
        assert!(matches!(
            err,
            MatchError::DimensionMismatch {
                expected: 2,
                found: 3
            }
        ));
    }

    #[tokio::test]
    async fn test_in_memory_store_round_trip() {
        let store = InMemoryVehicleStore::new();
        store.insert_vehicle(vehicle("uno", None, "m")).await;

        assert!(matches!(
            store
                .upsert_embedding(
                    "ghost",
                    StoredEmbedding {
                        vector: vec![1.0],
                        model: "m".into(),
                        digest: String::new()
                    }
                )
                .await,
            Err(MatchError::NotFound(_))
        ));

        store
            .upsert_embedding(
                "uno",
                StoredEmbedding {
                    vector: vec![1.0, 0.0],
                    model: "m".into(),
                    digest: "d1".into(),
                },
            )
            .await
            .unwrap();
        let neighbors = store.nearest_neighbors(&[1.0, 0.0], "m", 3).await.unwrap();
        assert_eq!(neighbors.len(), 1);

        // editing attributes keeps the previous embedding until resync
        let mut edited = vehicle("uno", None, "m");
        edited.color = Some("vermelho".into());
        store.insert_vehicle(edited).await;
        let fetched = store.fetch_attributes("uno").await.unwrap();
        assert_eq!(fetched.color.as_deref(), Some("vermelho"));
        assert_eq!(fetched.embedding.unwrap().digest, "d1");

        store.delete_embedding("uno").await.unwrap();
        store.delete_embedding("ghost").await.unwrap();
        assert!(
            store
                .nearest_neighbors(&[1.0, 0.0], "m", 3)
                .await
                .unwrap()
                .is_empty()
        );
    }
}
