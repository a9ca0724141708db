//! Duplicate grouping over image embeddings.
//!
//! Every embedded photo queries the image ANN for near neighbors; the
//! resulting adjacencies feed a union-find, and each connected component
//! of two or more photos becomes a group. This is the batch-heaviest
//! primitive in the crate: one ANN search per photo, fanned out with
//! rayon while each search holds the index read lock only briefly.

use rayon::prelude::*;
use serde::Serialize;
use std::collections::HashMap;

use crate::config::MatchingConfig;
use crate::error::Result;
use crate::store::VectorStore;

#[derive(Debug, Clone)]
pub struct DuplicateOptions {
    /// Cosine distance ceiling for an edge (slider value: `1 − sim`).
    pub max_distance: f32,
    pub max_groups: usize,
    /// Neighbors requested per photo.
    pub neighbors: usize,
}

impl DuplicateOptions {
    pub fn from_config(config: &MatchingConfig) -> Self {
        Self {
            max_distance: config.duplicate_distance,
            max_groups: config.max_groups,
            neighbors: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DuplicateMember {
    pub photo_id: String,
    /// Distance of the closest edge that pulled this photo into the
    /// group; 0 for the photo the group grew from.
    pub distance: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct DuplicateGroup {
    pub photos: Vec<DuplicateMember>,
}

impl DuplicateGroup {
    pub fn len(&self) -> usize {
        self.photos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.photos.is_empty()
    }
}

struct DisjointSet {
    parent: Vec<usize>,
    size: Vec<usize>,
}

impl DisjointSet {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            size: vec![1; n],
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (mut ra, mut rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        if self.size[ra] < self.size[rb] {
            std::mem::swap(&mut ra, &mut rb);
        }
        self.parent[rb] = ra;
        self.size[ra] += self.size[rb];
    }
}

pub fn find_duplicates(
    store: &VectorStore,
    options: &DuplicateOptions,
) -> Result<Vec<DuplicateGroup>> {
    let mut photos: Vec<(String, Vec<f32>)> = Vec::new();
    store.backend().for_each_embedding(&mut |photo_id, vector| {
        photos.push((photo_id, vector));
        Ok(())
    })?;
    if photos.len() < 2 {
        return Ok(Vec::new());
    }

    let index_of: HashMap<&str, usize> = photos
        .iter()
        .enumerate()
        .map(|(idx, (photo_id, _))| (photo_id.as_str(), idx))
        .collect();

    // One ANN query per photo; edges are (a, b, distance) adjacencies.
    let edges: Vec<(usize, usize, f32)> = photos
        .par_iter()
        .enumerate()
        .map(|(idx, (photo_id, vector))| {
            let mut local = Vec::new();
            match store.find_similar_photos(vector, options.neighbors) {
                Ok(hits) => {
                    for (other_id, distance) in hits {
                        if other_id == *photo_id || distance > options.max_distance {
                            continue;
                        }
                        if let Some(&other_idx) = index_of.get(other_id.as_str()) {
                            local.push((idx, other_idx, distance));
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(photo = %photo_id, error = %e, "duplicate scan query failed");
                }
            }
            local
        })
        .flatten()
        .collect();

    let mut set = DisjointSet::new(photos.len());
    let mut best_edge: Vec<f32> = vec![f32::MAX; photos.len()];
    for (a, b, distance) in &edges {
        set.union(*a, *b);
        if *distance < best_edge[*a] {
            best_edge[*a] = *distance;
        }
        if *distance < best_edge[*b] {
            best_edge[*b] = *distance;
        }
    }

    let mut components: HashMap<usize, Vec<usize>> = HashMap::new();
    for idx in 0..photos.len() {
        components.entry(set.find(idx)).or_default().push(idx);
    }

    let mut groups: Vec<DuplicateGroup> = components
        .into_values()
        .filter(|members| members.len() >= 2)
        .map(|mut members| {
            members.sort_by(|a, b| {
                best_edge[*a]
                    .partial_cmp(&best_edge[*b])
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            DuplicateGroup {
                photos: members
                    .into_iter()
                    .enumerate()
                    .map(|(pos, idx)| DuplicateMember {
                        photo_id: photos[idx].0.clone(),
                        distance: if pos == 0 { 0.0 } else { best_edge[idx] },
                    })
                    .collect(),
            }
        })
        .collect();

    groups.sort_by(|a, b| b.len().cmp(&a.len()));
    groups.truncate(options.max_groups);
    Ok(groups)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::store::SqliteStore;
    use crate::vector::l2_normalized;
    use std::sync::Arc;

    fn test_store(dim: usize) -> VectorStore {
        let backend = Arc::new(SqliteStore::open_in_memory().unwrap());
        let mut config = Config::default();
        config.embedding.embedding_dim = dim;
        let store = VectorStore::new(backend, &config);
        store.initialize().unwrap();
        store
    }

    fn put(store: &VectorStore, photo_id: &str, vector: Vec<f32>) {
        store
            .put_embedding(photo_id, &l2_normalized(vector), "m", "p")
            .unwrap();
    }

    fn options(max_distance: f32) -> DuplicateOptions {
        DuplicateOptions {
            max_distance,
            max_groups: 100,
            neighbors: 10,
        }
    }

    #[test]
    fn test_groups_connected_components() {
        let store = test_store(8);
        // Cluster one: three near-identical shots.
        put(&store, "a1", vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        put(&store, "a2", vec![1.0, 0.05, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        put(&store, "a3", vec![1.0, 0.0, 0.05, 0.0, 0.0, 0.0, 0.0, 0.0]);
        // Cluster two: a pair.
        put(&store, "b1", vec![0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0]);
        put(&store, "b2", vec![0.0, 0.0, 0.0, 0.0, 1.0, 0.04, 0.0, 0.0]);
        // A loner.
        put(&store, "c1", vec![0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0]);
        store.image_index().set_ready(true);

        let groups = find_duplicates(&store, &options(0.10)).unwrap();
        assert_eq!(groups.len(), 2);
        // Largest group first.
        assert_eq!(groups[0].len(), 3);
        assert_eq!(groups[1].len(), 2);

        let first: Vec<&str> = groups[0].photos.iter().map(|m| m.photo_id.as_str()).collect();
        assert!(first.contains(&"a1") && first.contains(&"a2") && first.contains(&"a3"));
        let all: Vec<&str> = groups
            .iter()
            .flat_map(|g| g.photos.iter().map(|m| m.photo_id.as_str()))
            .collect();
        assert!(!all.contains(&"c1"));
    }

    #[test]
    fn test_threshold_bounds_grouping() {
        let store = test_store(8);
        put(&store, "x1", vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        put(&store, "x2", vec![1.0, 0.5, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        store.image_index().set_ready(true);

        // Distance between the two is ~0.106; a strict slider keeps them
        // apart, a looser one joins them.
        assert!(find_duplicates(&store, &options(0.05)).unwrap().is_empty());
        let groups = find_duplicates(&store, &options(0.15)).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 2);
    }

    #[test]
    fn test_max_groups_caps_by_size() {
        let store = test_store(16);
        // Three pair-clusters and one triple-cluster.
        for (n, axis) in [(0usize, 2usize), (1, 4), (2, 6)] {
            let mut base = vec![0.0f32; 16];
            base[axis] = 1.0;
            let mut tilted = base.clone();
            tilted[axis + 1] = 0.04;
            put(&store, &format!("pair{n}a"), base);
            put(&store, &format!("pair{n}b"), tilted);
        }
        let mut base = vec![0.0f32; 16];
        base[12] = 1.0;
        for (suffix, tilt) in [("a", 0.0f32), ("b", 0.03), ("c", 0.05)] {
            let mut v = base.clone();
            v[13] = tilt;
            put(&store, &format!("triple{suffix}"), v);
        }
        store.image_index().set_ready(true);

        let mut opts = options(0.10);
        opts.max_groups = 2;
        let groups = find_duplicates(&store, &opts).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].len(), 3);
        assert!(groups[0].photos[0].photo_id.starts_with("triple"));
    }

    #[test]
    fn test_empty_store_no_groups() {
        let store = test_store(8);
        assert!(find_duplicates(&store, &options(0.10)).unwrap().is_empty());
    }
}
