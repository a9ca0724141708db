//! Generic HNSW index keyed by an application key.
//!
//! hnsw_rs addresses points by insertion-order slot ids and supports no
//! deletion, so this wrapper maintains the key ↔ slot mapping itself and
//! tombstones replaced or removed slots; searches never return tombstoned
//! keys. Writers serialize on the state lock, readers run concurrently,
//! and a search holds the read lock only for the duration of one query.

use hnsw_rs::prelude::*;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{Error, Result};
use crate::vector::{cosine_distance, l2_normalize};

use super::{AnnParams, IndexStats, MAX_LAYER};

/// Key requirements: hashable for lookup, ordered for the freshness
/// metadata's max-key, serde for the snapshot payload.
pub trait AnnKey:
    Clone + Eq + Hash + Ord + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> AnnKey for T where
    T: Clone + Eq + Hash + Ord + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

pub trait AnnPayload: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> AnnPayload for T where T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Newtype wrapper so the graph can be held in shared state.
///
/// The `'static` lifetime is sound: graphs built via `Hnsw::new` own all
/// their data, and snapshot loading leaks the small `HnswIo` so the
/// reloaded graph borrows from memory that lives for the process.
pub(crate) struct GraphHolder {
    pub(crate) hnsw: Hnsw<'static, f32, DistCosine>,
}

// SAFETY: Hnsw<'static, f32, DistCosine> uses internally synchronized
// storage and is shared behind our RwLock besides.
unsafe impl Send for GraphHolder {}
unsafe impl Sync for GraphHolder {}

pub(crate) struct Node<P> {
    pub(crate) vector: Vec<f32>,
    pub(crate) payload: P,
}

pub(crate) struct IndexState<K, P> {
    pub(crate) graph: GraphHolder,
    /// Slot id (graph data id) to the key living at that slot. `None`
    /// marks a tombstone: the graph keeps the point, searches skip it.
    pub(crate) slot_keys: Vec<Option<K>>,
    /// Key to its live slot.
    pub(crate) by_key: HashMap<K, usize>,
    /// Number of tombstoned slots.
    pub(crate) dead: usize,
    /// Full source rows, so searches answer without the database.
    pub(crate) nodes: HashMap<K, Node<P>>,
}

impl<K: AnnKey, P: AnnPayload> IndexState<K, P> {
    pub(crate) fn empty(params: &AnnParams) -> Self {
        Self {
            graph: new_graph(params),
            slot_keys: Vec::new(),
            by_key: HashMap::new(),
            dead: 0,
            nodes: HashMap::new(),
        }
    }

    pub(crate) fn insert(&mut self, key: K, vector: Vec<f32>, payload: P) {
        if let Some(old_slot) = self.by_key.remove(&key) {
            self.slot_keys[old_slot] = None;
            self.dead += 1;
        }
        let slot = self.slot_keys.len();
        self.graph.hnsw.insert_slice((vector.as_slice(), slot));
        self.slot_keys.push(Some(key.clone()));
        self.by_key.insert(key.clone(), slot);
        self.nodes.insert(key, Node { vector, payload });
    }
}

pub(crate) fn new_graph(params: &AnnParams) -> GraphHolder {
    GraphHolder {
        hnsw: Hnsw::<f32, DistCosine>::new(
            params.m,
            params.max_elements,
            MAX_LAYER,
            params.ef_construction,
            DistCosine {},
        ),
    }
}

pub struct AnnIndex<K, P> {
    label: &'static str,
    params: AnnParams,
    pub(crate) state: RwLock<IndexState<K, P>>,
    ready: AtomicBool,
}

impl<K: AnnKey, P: AnnPayload> AnnIndex<K, P> {
    pub fn new(label: &'static str, params: AnnParams) -> Self {
        let state = IndexState::empty(&params);
        Self {
            label,
            params,
            state: RwLock::new(state),
            ready: AtomicBool::new(false),
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn params(&self) -> &AnnParams {
        &self.params
    }

    /// Whether the index is loaded/built and may serve searches. Until
    /// then callers fall back to the database-native ANN path.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, IndexState<K, P>> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, IndexState<K, P>> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert or replace. A replaced key's old graph point is tombstoned;
    /// the graph keeps it but searches will not return it.
    pub fn add(&self, key: K, vector: Vec<f32>, payload: P) -> Result<()> {
        if vector.len() != self.params.dim {
            return Err(Error::BadDim {
                expected: self.params.dim,
                got: vector.len(),
            });
        }
        let mut state = self.write();
        state.insert(key, vector, payload);
        Ok(())
    }

    /// Tombstone a key. Returns true when the key was present.
    pub fn remove(&self, key: &K) -> bool {
        let mut state = self.write();
        match state.by_key.remove(key) {
            Some(slot) => {
                state.slot_keys[slot] = None;
                state.dead += 1;
                state.nodes.remove(key);
                true
            }
            None => false,
        }
    }

    /// Mutate the payload of a key in place without touching the graph.
    /// Used when only cached metadata changes (marker updates).
    pub fn update_payload(&self, key: &K, mutate: impl FnOnce(&mut P)) -> bool {
        let mut state = self.write();
        match state.nodes.get_mut(key) {
            Some(node) => {
                mutate(&mut node.payload);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, key: &K) -> Option<P> {
        let state = self.read();
        state.nodes.get(key).map(|node| node.payload.clone())
    }

    /// Top-k nearest neighbors, ascending by exact cosine distance.
    ///
    /// The graph is asked for `k × search_multiplier` candidates (plus
    /// the tombstone count, so deletions cannot starve the result set),
    /// then distances are recomputed from the stored vectors and the list
    /// is trimmed to k.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(K, f32, P)>> {
        if query.len() != self.params.dim {
            return Err(Error::BadDim {
                expected: self.params.dim,
                got: query.len(),
            });
        }

        let state = self.read();
        if k == 0 || state.by_key.is_empty() {
            return Ok(Vec::new());
        }

        let knbn = (k * self.params.search_multiplier + state.dead)
            .min(state.slot_keys.len())
            .max(1);
        let ef = self.params.ef_search.max(knbn);
        let neighbours = state.graph.hnsw.search(query, knbn, ef);

        let mut results: Vec<(K, f32, P)> = Vec::with_capacity(neighbours.len());
        for neighbour in neighbours {
            let Some(Some(key)) = state.slot_keys.get(neighbour.d_id) else {
                continue;
            };
            if let Some(node) = state.nodes.get(key) {
                let distance = cosine_distance(query, &node.vector);
                results.push((key.clone(), distance, node.payload.clone()));
            }
        }

        results.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        results.truncate(k);
        Ok(results)
    }

    /// Number of live keys.
    pub fn count(&self) -> usize {
        self.read().by_key.len()
    }

    /// Highest live key, for snapshot freshness metadata.
    pub fn max_key(&self) -> Option<K> {
        self.read().by_key.keys().max().cloned()
    }

    pub fn stats(&self) -> IndexStats {
        let state = self.read();
        IndexStats {
            count: state.by_key.len(),
            tombstones: state.dead,
            ready: self.is_ready(),
        }
    }

    /// Rebuild from scratch out of a full store scan. The fresh graph is
    /// built off-lock and swapped in at the end, so readers keep working
    /// against the old state during the build. Vectors are re-normalized
    /// defensively; rows with a wrong dimensionality are skipped with a
    /// warning rather than aborting the rebuild.
    pub fn rebuild<I>(&self, items: I) -> usize
    where
        I: IntoIterator<Item = (K, Vec<f32>, P)>,
    {
        let mut iter = items.into_iter();
        self.rebuild_with(|add| {
            for (key, vector, payload) in &mut iter {
                add(key, vector, payload);
            }
            Ok(())
        })
        .unwrap_or(0)
    }

    /// Streaming variant of [`rebuild`](Self::rebuild): `feed` is handed a
    /// sink and drives it row by row, so a full-store rebuild never holds
    /// the table in memory.
    pub fn rebuild_with<F>(&self, feed: F) -> Result<usize>
    where
        F: FnOnce(&mut dyn FnMut(K, Vec<f32>, P)) -> Result<()>,
    {
        let mut fresh = IndexState::empty(&self.params);
        let mut skipped = 0usize;

        {
            let dim = self.params.dim;
            let mut add = |key: K, mut vector: Vec<f32>, payload: P| {
                if vector.len() != dim {
                    skipped += 1;
                    return;
                }
                l2_normalize(&mut vector);
                fresh.insert(key, vector, payload);
            };
            feed(&mut add)?;
        }

        if skipped > 0 {
            tracing::warn!(
                index = self.label,
                skipped,
                "skipped rows with wrong dimensionality during rebuild"
            );
        }

        let count = fresh.by_key.len();
        let mut state = self.write();
        *state = fresh;
        drop(state);

        self.set_ready(true);
        tracing::info!(index = self.label, count, "ANN index rebuilt");
        Ok(count)
    }
}
