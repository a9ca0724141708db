//! On-disk ANN snapshots.
//!
//! One basename per index, with sibling files:
//! - `<base>.hnsw.graph` / `<base>.hnsw.data`: the hnsw_rs graph dump
//! - `<base>.meta`: JSON with count, max key, dim, created_at
//! - `<base>.payload`: length-prefixed bincode records in slot order,
//!   one per graph point, carrying the full source row (or a tombstone
//!   marker) so searches answer without the database at startup
//!
//! Snapshots are caches. A missing, stale or corrupt snapshot costs a
//! rebuild from the store, never data. Freshness on load compares the
//! stored count and max key against a fresh scan of the store; any drift
//! discards the snapshot.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use hnsw_rs::hnswio::HnswIo;
use hnsw_rs::prelude::*;

use crate::error::{Error, Result};

use super::index::{AnnIndex, AnnKey, AnnPayload, GraphHolder, IndexState, Node};

/// Snapshot metadata, written last so its presence marks a complete dump.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub dim: usize,
    /// Live entries at dump time.
    pub count: usize,
    /// Total graph points including tombstones; equals the payload record
    /// count.
    pub slots: usize,
    pub max_key: Option<serde_json::Value>,
    pub created_at: String,
}

/// Current store-side truth used for the freshness check.
#[derive(Debug, Clone)]
pub struct StoreFreshness {
    pub count: u64,
    pub max_key: Option<serde_json::Value>,
}

#[derive(Debug)]
pub enum LoadOutcome {
    Loaded { count: usize },
    /// No graph files on disk.
    MissingSnapshot,
    /// Graph present but payload sidecar missing (pre-payload snapshot
    /// layout); callers log a migration warning and rebuild.
    MissingPayload,
    Stale { reason: String },
    Corrupt { reason: String },
}

#[derive(Serialize, Deserialize)]
struct SlotRecord<K, P> {
    key: K,
    vector: Vec<f32>,
    payload: P,
}

struct SnapshotPaths {
    dir: PathBuf,
    basename: String,
    meta: PathBuf,
    payload: PathBuf,
    graph: PathBuf,
    data: PathBuf,
}

impl SnapshotPaths {
    fn new(base: &Path) -> Result<Self> {
        let dir = base
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let basename = base
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| Error::Serialization(format!("bad snapshot path {base:?}")))?;
        let meta = base.with_file_name(format!("{basename}.meta"));
        let payload = base.with_file_name(format!("{basename}.payload"));
        let graph = dir.join(format!("{basename}.hnsw.graph"));
        let data = dir.join(format!("{basename}.hnsw.data"));
        Ok(Self {
            dir,
            basename,
            meta,
            payload,
            graph,
            data,
        })
    }
}

/// Serialize an index to disk under a read lock, streaming the payload.
pub fn save_snapshot<K: AnnKey, P: AnnPayload>(index: &AnnIndex<K, P>, base: &Path) -> Result<()> {
    let paths = SnapshotPaths::new(base)?;
    std::fs::create_dir_all(&paths.dir)?;

    let state = index.read();

    if state.slot_keys.is_empty() {
        // hnsw_rs cannot dump an empty graph; the metadata alone carries
        // an empty snapshot. Leftover graph files from an earlier dump
        // would shadow it, so they go too.
        let _ = std::fs::remove_file(&paths.graph);
        let _ = std::fs::remove_file(&paths.data);
    } else {
        state
            .graph
            .hnsw
            .file_dump(&paths.dir, &paths.basename)
            .map_err(|e| Error::Serialization(format!("graph dump failed: {e}")))?;
    }

    let mut writer = BufWriter::new(File::create(&paths.payload)?);
    for slot_key in &state.slot_keys {
        let record: Option<SlotRecord<&K, &P>> = slot_key.as_ref().and_then(|key| {
            state.nodes.get(key).map(|node| SlotRecord {
                key,
                vector: node.vector.clone(),
                payload: &node.payload,
            })
        });
        let bytes = bincode::serialize(&record)?;
        writer.write_all(&(bytes.len() as u32).to_le_bytes())?;
        writer.write_all(&bytes)?;
    }
    writer.flush()?;

    let meta = SnapshotMeta {
        dim: index.params().dim,
        count: state.by_key.len(),
        slots: state.slot_keys.len(),
        max_key: state
            .by_key
            .keys()
            .max()
            .map(serde_json::to_value)
            .transpose()?,
        created_at: chrono::Utc::now().to_rfc3339(),
    };
    drop(state);

    std::fs::write(&paths.meta, serde_json::to_string_pretty(&meta)?)?;
    tracing::info!(
        index = index.label(),
        base = %base.display(),
        count = meta.count,
        "ANN snapshot written"
    );
    Ok(())
}

/// Compare snapshot and store keys. Only orders values of the same shape
/// (two integers or two strings); anything else is incomparable and the
/// caller treats the snapshot as stale.
fn compare_keys(a: &serde_json::Value, b: &serde_json::Value) -> Option<std::cmp::Ordering> {
    use serde_json::Value;
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => Some(x.as_i64()?.cmp(&y.as_i64()?)),
        (Value::String(x), Value::String(y)) => Some(x.as_str().cmp(y.as_str())),
        _ => None,
    }
}

fn check_freshness(meta: &SnapshotMeta, store: &StoreFreshness) -> Option<String> {
    if meta.count as u64 != store.count {
        return Some(format!(
            "snapshot count {} != store count {}",
            meta.count, store.count
        ));
    }
    if let Some(store_max) = &store.max_key {
        match &meta.max_key {
            None => {
                return Some("snapshot has no max key but store is non-empty".to_string());
            }
            Some(meta_max) => match compare_keys(meta_max, store_max) {
                Some(std::cmp::Ordering::Less) => {
                    return Some(format!(
                        "snapshot max key {meta_max} behind store max key {store_max}"
                    ));
                }
                Some(_) => {}
                None => {
                    return Some(format!(
                        "snapshot max key {meta_max} incomparable with store max key {store_max}"
                    ));
                }
            },
        }
    }
    None
}

/// Load a snapshot into the index after validating it against the store.
///
/// Returns the outcome instead of failing: every non-`Loaded` variant is
/// the caller's cue to rebuild from the store. The index is left untouched
/// unless loading fully succeeds.
pub fn load_snapshot<K: AnnKey, P: AnnPayload>(
    index: &AnnIndex<K, P>,
    base: &Path,
    store: &StoreFreshness,
) -> Result<LoadOutcome> {
    let paths = SnapshotPaths::new(base)?;

    if !paths.meta.exists() {
        if !paths.graph.exists() {
            return Ok(LoadOutcome::MissingSnapshot);
        }
        if !paths.payload.exists() {
            return Ok(LoadOutcome::MissingPayload);
        }
        return Ok(LoadOutcome::Stale {
            reason: "metadata sidecar missing".to_string(),
        });
    }

    let meta: SnapshotMeta = match serde_json::from_str(&std::fs::read_to_string(&paths.meta)?) {
        Ok(meta) => meta,
        Err(e) => {
            return Ok(LoadOutcome::Corrupt {
                reason: format!("unreadable metadata: {e}"),
            })
        }
    };

    if meta.dim != index.params().dim {
        return Ok(LoadOutcome::Stale {
            reason: format!(
                "snapshot dim {} != index dim {}",
                meta.dim,
                index.params().dim
            ),
        });
    }

    if let Some(reason) = check_freshness(&meta, store) {
        return Ok(LoadOutcome::Stale { reason });
    }

    // An empty snapshot has no graph files at all; a validated empty
    // state is still a successful load.
    if meta.slots == 0 {
        let params = *index.params();
        *index.write() = IndexState::empty(&params);
        index.set_ready(true);
        return Ok(LoadOutcome::Loaded { count: 0 });
    }
    if !paths.graph.exists() || !paths.data.exists() {
        return Ok(LoadOutcome::Corrupt {
            reason: "graph files missing for a non-empty snapshot".to_string(),
        });
    }
    if !paths.payload.exists() {
        return Ok(LoadOutcome::MissingPayload);
    }

    // hnsw_rs can panic on corrupt dumps instead of returning an error,
    // so the load runs under catch_unwind. The HnswIo is leaked once per
    // load to give the reloaded graph a 'static lifetime.
    let dir = paths.dir.clone();
    let basename = paths.basename.clone();
    let load_result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let io = Box::leak(Box::new(HnswIo::new(&dir, &basename)));
        let result: std::result::Result<Hnsw<'static, f32, DistCosine>, _> =
            io.load_hnsw_with_dist(DistCosine {});
        result
    }));

    let hnsw = match load_result {
        Ok(Ok(hnsw)) => hnsw,
        Ok(Err(e)) => {
            return Ok(LoadOutcome::Corrupt {
                reason: format!("graph load failed: {e}"),
            })
        }
        Err(_) => {
            return Ok(LoadOutcome::Corrupt {
                reason: "graph load panicked (corrupt dump)".to_string(),
            })
        }
    };

    let records = match read_payload::<K, P>(&paths.payload) {
        Ok(records) => records,
        Err(e) => {
            return Ok(LoadOutcome::Corrupt {
                reason: format!("unreadable payload: {e}"),
            })
        }
    };

    if records.len() != meta.slots {
        return Ok(LoadOutcome::Corrupt {
            reason: format!(
                "payload has {} records but metadata says {} slots",
                records.len(),
                meta.slots
            ),
        });
    }
    let graph_points = hnsw.get_nb_point();
    if graph_points != records.len() {
        return Ok(LoadOutcome::Corrupt {
            reason: format!(
                "graph has {graph_points} points but payload has {} records",
                records.len()
            ),
        });
    }

    // Reconstruct the slot mapping; every live graph point must have a
    // payload record by construction.
    let mut state = IndexState {
        graph: GraphHolder { hnsw },
        slot_keys: Vec::with_capacity(records.len()),
        by_key: std::collections::HashMap::new(),
        dead: 0,
        nodes: std::collections::HashMap::new(),
    };
    for record in records {
        match record {
            Some(SlotRecord {
                key,
                vector,
                payload,
            }) => {
                state.by_key.insert(key.clone(), state.slot_keys.len());
                state.nodes.insert(key.clone(), Node { vector, payload });
                state.slot_keys.push(Some(key));
            }
            None => {
                state.slot_keys.push(None);
                state.dead += 1;
            }
        }
    }

    if state.by_key.len() != meta.count {
        return Ok(LoadOutcome::Corrupt {
            reason: format!(
                "payload has {} live records but metadata says {}",
                state.by_key.len(),
                meta.count
            ),
        });
    }

    let count = state.by_key.len();
    *index.write() = state;
    index.set_ready(true);
    tracing::info!(
        index = index.label(),
        base = %base.display(),
        count,
        "ANN snapshot loaded"
    );
    Ok(LoadOutcome::Loaded { count })
}

fn read_payload<K: AnnKey, P: AnnPayload>(path: &Path) -> Result<Vec<Option<SlotRecord<K, P>>>> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();
    loop {
        let mut len_bytes = [0u8; 4];
        match reader.read_exact(&mut len_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes(len_bytes) as usize;
        let mut buf = vec![0u8; len];
        reader.read_exact(&mut buf)?;
        records.push(bincode::deserialize(&buf)?);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ann::AnnParams;

    fn params(dim: usize) -> AnnParams {
        AnnParams {
            dim,
            max_elements: 1000,
            ..AnnParams::default()
        }
    }

    fn unit(dim: usize, axis: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[axis] = 1.0;
        v
    }

    fn freshness(count: u64, max_key: Option<serde_json::Value>) -> StoreFreshness {
        StoreFreshness { count, max_key }
    }

    #[test]
    fn test_save_load_round_trip_preserves_topk() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("face-index");

        let index: AnnIndex<i64, String> = AnnIndex::new("face", params(8));
        for axis in 0..6 {
            index
                .add(axis as i64, unit(8, axis), format!("row-{axis}"))
                .unwrap();
        }
        // Tombstone one key so the round trip carries a dead slot.
        index.remove(&5);

        save_snapshot(&index, &base).unwrap();

        let restored: AnnIndex<i64, String> = AnnIndex::new("face", params(8));
        let outcome = load_snapshot(
            &restored,
            &base,
            &freshness(5, Some(serde_json::json!(4))),
        )
        .unwrap();
        assert!(matches!(outcome, LoadOutcome::Loaded { count: 5 }));
        assert!(restored.is_ready());
        assert_eq!(restored.count(), 5);

        for axis in 0..5 {
            let expected = index.search(&unit(8, axis), 3).unwrap();
            let got = restored.search(&unit(8, axis), 3).unwrap();
            let expected_keys: Vec<i64> = expected.iter().map(|(k, _, _)| *k).collect();
            let got_keys: Vec<i64> = got.iter().map(|(k, _, _)| *k).collect();
            assert_eq!(expected_keys, got_keys);
            assert_eq!(got[0].2, format!("row-{axis}"));
        }
        // The tombstoned key stays gone.
        let all = restored.search(&unit(8, 5), 10).unwrap();
        assert!(all.iter().all(|(k, _, _)| *k != 5));
    }

    #[test]
    fn test_missing_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("none");
        let index: AnnIndex<i64, ()> = AnnIndex::new("face", params(4));
        let outcome = load_snapshot(&index, &base, &freshness(0, None)).unwrap();
        assert!(matches!(outcome, LoadOutcome::MissingSnapshot));
        assert!(!index.is_ready());
    }

    #[test]
    fn test_missing_payload_triggers_migration_path() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("idx");

        let index: AnnIndex<i64, ()> = AnnIndex::new("face", params(4));
        index.add(1, unit(4, 0), ()).unwrap();
        save_snapshot(&index, &base).unwrap();

        std::fs::remove_file(base.with_file_name("idx.payload")).unwrap();

        let restored: AnnIndex<i64, ()> = AnnIndex::new("face", params(4));
        let outcome = load_snapshot(
            &restored,
            &base,
            &freshness(1, Some(serde_json::json!(1))),
        )
        .unwrap();
        assert!(matches!(outcome, LoadOutcome::MissingPayload));
    }

    #[test]
    fn test_count_drift_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("idx");

        let index: AnnIndex<i64, ()> = AnnIndex::new("face", params(4));
        index.add(1, unit(4, 0), ()).unwrap();
        save_snapshot(&index, &base).unwrap();

        // Store has moved on: 3 more faces.
        let restored: AnnIndex<i64, ()> = AnnIndex::new("face", params(4));
        let outcome = load_snapshot(
            &restored,
            &base,
            &freshness(4, Some(serde_json::json!(4))),
        )
        .unwrap();
        assert!(matches!(outcome, LoadOutcome::Stale { .. }));
        assert!(!restored.is_ready());
    }

    #[test]
    fn test_max_key_behind_store_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("idx");

        let index: AnnIndex<i64, ()> = AnnIndex::new("face", params(4));
        index.add(1, unit(4, 0), ()).unwrap();
        save_snapshot(&index, &base).unwrap();

        // Same count but the store's max id has advanced past the dump.
        let restored: AnnIndex<i64, ()> = AnnIndex::new("face", params(4));
        let outcome = load_snapshot(
            &restored,
            &base,
            &freshness(1, Some(serde_json::json!(9))),
        )
        .unwrap();
        assert!(matches!(outcome, LoadOutcome::Stale { .. }));
    }

    #[test]
    fn test_string_keys_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("image-index");

        let index: AnnIndex<String, i32> = AnnIndex::new("image", params(4));
        index.add("pA".into(), unit(4, 0), 10).unwrap();
        index.add("pB".into(), unit(4, 1), 20).unwrap();
        save_snapshot(&index, &base).unwrap();

        let restored: AnnIndex<String, i32> = AnnIndex::new("image", params(4));
        let outcome = load_snapshot(
            &restored,
            &base,
            &freshness(2, Some(serde_json::json!("pB"))),
        )
        .unwrap();
        assert!(matches!(outcome, LoadOutcome::Loaded { count: 2 }));
        assert_eq!(restored.get(&"pA".to_string()), Some(10));
    }
}
