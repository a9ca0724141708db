//! In-memory approximate-nearest-neighbor indexes.
//!
//! Two structurally identical instances sit on top of the store: a face
//! index (int64 face id, 512-d) and an image index (photo id, 768-d).
//! Both wrap an HNSW graph with cosine distance and carry the full source
//! row as payload so searches return complete results without a database
//! round trip. The indexes are reconstructable caches: losing a snapshot
//! costs startup time, never data.

mod index;
mod snapshot;

pub use index::{AnnIndex, AnnKey, AnnPayload};
pub use snapshot::{load_snapshot, save_snapshot, LoadOutcome, SnapshotMeta, StoreFreshness};

use crate::config::AnnConfig;

/// HNSW graph layer cap. hnsw_rs derives the actual layer count from the
/// element count; this only bounds it.
pub(crate) const MAX_LAYER: usize = 16;

/// Tuning parameters shared by both index instances.
#[derive(Debug, Clone, Copy)]
pub struct AnnParams {
    pub dim: usize,
    pub m: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
    /// Graph searches request `k × search_multiplier` candidates before
    /// the exact top-k is recomputed, because graph-approximate distances
    /// drift on high-multiplicity inputs.
    pub search_multiplier: usize,
    pub max_elements: usize,
}

impl AnnParams {
    pub fn from_config(dim: usize, config: &AnnConfig) -> Self {
        Self {
            dim,
            m: config.ann_m,
            ef_construction: config.ann_ef_construction,
            ef_search: config.ann_ef_search,
            search_multiplier: config.ann_search_multiplier.max(1),
            max_elements: config.ann_max_elements,
        }
    }
}

impl Default for AnnParams {
    fn default() -> Self {
        Self {
            dim: 0,
            m: 16,
            ef_construction: 200,
            ef_search: 100,
            search_multiplier: 3,
            max_elements: 100_000,
        }
    }
}

/// Point-in-time view of an index for health/metrics.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct IndexStats {
    pub count: usize,
    pub tombstones: usize,
    pub ready: bool,
}
