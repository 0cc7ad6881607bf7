//! # Semantic search
//!
//! [`SearchService::search`] embeds a free-text query with the same embedder that
//! produced the corpus vectors, asks the [`VehicleStore`] for the nearest listings and
//! turns them into display-ready [`SearchResult`]s.
//!
//! - A blank query is rejected before any backend call.
//! - `k` is clamped into `1..=max_results`.
//! - Matches scoring below `similarity_floor` are dropped; an empty list means
//!   "nothing found", not an error.
//!
//! [`render_inventory`] turns results into the grounding block the assistant adds to a
//! chat request, trimmed to a `cl100k_base` token budget.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::Arc;
use tiktoken_rs::{CoreBPE, cl100k_base};
use tracing::debug;

use crate::{
    config::SearchConfig,
    embedding::{Embedder, check_vector},
    error::{MatchError, Result},
    format::{format_mileage, format_price, round_score},
    vector_store::{Neighbor, VehicleStore},
};

/// One ranked match, ready for display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub vehicle_id: String,
    pub title: String,
    pub price: Option<String>,
    pub location: Option<String>,
    /// `R$ 139.900 · 32.000 km · Campinas/SP`
    pub summary: String,
    /// Cosine similarity rounded to three decimals; higher is closer.
    pub score: f32,
}

impl From<Neighbor> for SearchResult {
    fn from(neighbor: Neighbor) -> Self {
        let vehicle = neighbor.vehicle;
        let price = vehicle.price.map(format_price);
        let location = vehicle.location();
        let summary = [
            price.clone(),
            vehicle.mileage.map(format_mileage),
            location.clone(),
        ]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" · ");

        Self {
            title: vehicle.title(),
            vehicle_id: vehicle.id,
            price,
            location,
            summary,
            score: round_score(neighbor.score),
        }
    }
}

#[derive(Clone)]
pub struct SearchService {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VehicleStore>,
    max_results: usize,
    similarity_floor: f32,
}

impl SearchService {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn VehicleStore>,
        config: &SearchConfig,
    ) -> Self {
        Self {
            embedder,
            store,
            max_results: config.max_results.max(1),
            similarity_floor: config.similarity_floor,
        }
    }

    pub fn max_results(&self) -> usize {
        self.max_results
    }

    /// Rank listings against `query`, most similar first.
    ///
    /// # Errors
    /// - [`MatchError::InvalidArgument`] for a blank query (no backend is called).
    /// - [`MatchError::UpstreamUnavailable`] / [`MatchError::Upstream`] when the query
    ///   cannot be embedded.
    /// - [`MatchError::DimensionMismatch`] when the query and stored vectors disagree.
    /// - [`MatchError::SearchBackend`] when the store query fails.
    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<SearchResult>> {
        let query = query.trim();
        if query.is_empty() {
            return Err(MatchError::InvalidArgument(
                "search query must not be empty".into(),
            ));
        }
        let k = k.clamp(1, self.max_results);

        let vector = self.embedder.embed(query).await?;
        check_vector(&vector, self.embedder.dimension())?;

        let neighbors = self
            .store
            .nearest_neighbors(&vector, self.embedder.model_id(), k)
            .await?;
        let found = neighbors.len();

        let results: Vec<SearchResult> = neighbors
            .into_iter()
            .filter(|n| n.score >= self.similarity_floor)
            .take(k)
            .map(SearchResult::from)
            .collect();

        debug!(k, found, kept = results.len(), "Search complete");
        Ok(results)
    }
}

static BPE: Lazy<Option<CoreBPE>> = Lazy::new(|| cl100k_base().ok());

/// Token count under `cl100k_base`.
pub fn count_tokens(text: &str) -> Result<usize> {
    let bpe = BPE
        .as_ref()
        .ok_or_else(|| MatchError::Config("cl100k_base tokenizer unavailable".into()))?;
    Ok(bpe.encode_with_special_tokens(text).len())
}

fn inventory_line(rank: usize, result: &SearchResult) -> String {
    if result.summary.is_empty() {
        format!("{rank}. {} (id {})", result.title, result.vehicle_id)
    } else {
        format!(
            "{rank}. {} | {} (id {})",
            result.title, result.summary, result.vehicle_id
        )
    }
}

/// Render matches as a grounding block under `header`, dropping the lowest-ranked
/// lines until the block fits in `max_tokens`. `None` when nothing fits.
pub fn render_inventory(
    header: &str,
    results: &[SearchResult],
    max_tokens: usize,
) -> Result<Option<String>> {
    let mut lines: Vec<String> = results
        .iter()
        .enumerate()
        .map(|(i, r)| inventory_line(i + 1, r))
        .collect();

    while !lines.is_empty() {
        let block = format!("{header}\n{}", lines.join("\n"));
        if count_tokens(&block)? <= max_tokens {
            return Ok(Some(block));
        }
        lines.pop();
    }
    Ok(None)
}
