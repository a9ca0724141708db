//! Persistent vector store with ANN routing.
//!
//! The [`VectorStore`] facade is the single write path for embedding and
//! face rows: it validates vectors at the boundary, delegates row storage
//! to a backend (SQLite by default, PostgreSQL with pgvector behind the
//! `postgres` feature) and keeps the two in-memory ANN indexes in step
//! with every mutation. Similarity queries route to the in-memory index
//! when it is loaded and fresh, and to the database-native ANN path
//! otherwise; both paths return the same shape.

pub mod backend;
mod sqlite;
mod sqlite_schema;
pub mod types;

#[cfg(feature = "postgres")]
mod postgres;
#[cfg(feature = "postgres")]
mod postgres_schema;

use std::sync::Arc;

use crate::ann::{AnnIndex, AnnParams, StoreFreshness};
use crate::config::Config;
use crate::error::Result;
use crate::vector::{self, FACE_DIM};

pub use backend::StoreBackend;
pub use sqlite::SqliteStore;
pub use types::{
    EmbeddingRecord, FaceHit, FaceRecord, MarkerFields, NewFace, PhotoInfo, ProcessingMarker,
    StoreStats,
};

#[cfg(feature = "postgres")]
pub use postgres::PgStore;

/// In-memory ANN over face vectors, keyed by face id.
pub type FaceIndex = AnnIndex<i64, FaceRecord>;

/// In-memory ANN over image embeddings, keyed by photo id.
pub type ImageIndex = AnnIndex<String, EmbeddingRecord>;

pub struct VectorStore {
    backend: Arc<dyn StoreBackend>,
    face_index: Arc<FaceIndex>,
    image_index: Arc<ImageIndex>,
    image_dim: usize,
    ef_search: usize,
}

impl VectorStore {
    pub fn new(backend: Arc<dyn StoreBackend>, config: &Config) -> Self {
        let face_index = Arc::new(AnnIndex::new(
            "face",
            AnnParams::from_config(FACE_DIM, &config.ann),
        ));
        let image_index = Arc::new(AnnIndex::new(
            "image",
            AnnParams::from_config(config.embedding.embedding_dim, &config.ann),
        ));
        Self {
            backend,
            face_index,
            image_index,
            image_dim: config.embedding.embedding_dim,
            ef_search: config.ann.ann_ef_search,
        }
    }

    pub fn initialize(&self) -> Result<()> {
        self.backend.initialize()
    }

    pub fn backend(&self) -> &Arc<dyn StoreBackend> {
        &self.backend
    }

    pub fn face_index(&self) -> &Arc<FaceIndex> {
        &self.face_index
    }

    pub fn image_index(&self) -> &Arc<ImageIndex> {
        &self.image_index
    }

    /// Whether the in-memory path answers similarity queries right now.
    pub fn hnsw_ready(&self) -> (bool, bool) {
        (self.face_index.is_ready(), self.image_index.is_ready())
    }

    // === Embeddings ===

    /// Upsert the image embedding for a photo and mirror it into the
    /// image ANN index.
    pub fn put_embedding(
        &self,
        photo_id: &str,
        vector: &[f32],
        model: &str,
        pretrained: &str,
    ) -> Result<()> {
        vector::validate(vector, self.image_dim)?;

        let record = EmbeddingRecord {
            photo_id: photo_id.to_string(),
            vector: vector.to_vec(),
            model: model.to_string(),
            pretrained: pretrained.to_string(),
            dim: vector.len(),
            created_at: None,
        };
        self.backend.put_embedding(&record)?;
        self.image_index
            .add(photo_id.to_string(), vector.to_vec(), record)?;
        Ok(())
    }

    pub fn get_embedding(&self, photo_id: &str) -> Result<Option<EmbeddingRecord>> {
        self.backend.get_embedding(photo_id)
    }

    pub fn has_embedding(&self, photo_id: &str) -> Result<bool> {
        self.backend.has_embedding(photo_id)
    }

    pub fn count_embeddings(&self) -> Result<u64> {
        self.backend.count_embeddings()
    }

    /// Nearest photos by cosine distance, ascending. Routes to the
    /// in-memory index when ready, the database-native index otherwise.
    pub fn find_similar_photos(&self, query: &[f32], k: usize) -> Result<Vec<(String, f32)>> {
        if self.image_index.is_ready() {
            let hits = self.image_index.search(query, k)?;
            return Ok(hits
                .into_iter()
                .map(|(photo_id, distance, _)| (photo_id, distance))
                .collect());
        }
        self.backend.similar_embeddings(query, k, self.ef_search)
    }

    // === Faces ===

    /// Replace the photo's whole face set: prior rows deleted, the new
    /// batch inserted under fresh ids, the processing marker written.
    /// ANN nodes follow: old ids evicted, new ones inserted.
    pub fn put_faces(&self, photo_id: &str, faces: &[NewFace]) -> Result<Vec<FaceRecord>> {
        for face in faces {
            vector::validate(&face.vector, FACE_DIM)?;
        }

        let old_ids: Vec<i64> = self
            .backend
            .faces_by_photo(photo_id)?
            .iter()
            .map(|f| f.id)
            .collect();

        let inserted = self.backend.replace_faces(photo_id, faces)?;

        for old_id in old_ids {
            self.face_index.remove(&old_id);
        }
        for face in &inserted {
            self.face_index
                .add(face.id, face.vector.clone(), face.clone())?;
        }
        Ok(inserted)
    }

    /// Record "ingestion complete" for a photo with no usable faces.
    pub fn mark_processed(&self, photo_id: &str, face_count: i64) -> Result<()> {
        self.backend.mark_processed(photo_id, face_count)
    }

    pub fn processing_marker(&self, photo_id: &str) -> Result<Option<ProcessingMarker>> {
        self.backend.processing_marker(photo_id)
    }

    pub fn faces_by_photo(&self, photo_id: &str) -> Result<Vec<FaceRecord>> {
        self.backend.faces_by_photo(photo_id)
    }

    pub fn faces_by_subject(&self, subject: &str) -> Result<Vec<FaceRecord>> {
        self.backend.faces_by_subject(subject)
    }

    /// Update the cached library-service fields of one face, in the row
    /// and in the ANN payload. The graph is untouched.
    pub fn update_marker(&self, face: &FaceRecord, fields: &MarkerFields) -> Result<()> {
        self.backend
            .update_marker(&face.photo_id, face.face_index, fields)?;
        self.face_index
            .update_payload(&face.id, |payload| payload.set_marker_fields(fields));
        Ok(())
    }

    /// Update the cached parent-photo info on every face of a photo.
    pub fn update_photo_info(&self, photo_id: &str, info: &PhotoInfo) -> Result<()> {
        let faces = self.backend.faces_by_photo(photo_id)?;
        self.backend.update_photo_info(photo_id, info)?;
        for face in faces {
            self.face_index
                .update_payload(&face.id, |payload| payload.set_photo_info(info));
        }
        Ok(())
    }

    /// Nearest faces by cosine distance, ascending, with full rows. When
    /// `exclude_subject` is set, faces assigned to a different subject
    /// are dropped; the in-memory path overfetches to compensate for the
    /// post-filter.
    pub fn find_similar_faces(
        &self,
        query: &[f32],
        k: usize,
        exclude_subject: Option<&str>,
    ) -> Result<Vec<FaceHit>> {
        if self.face_index.is_ready() {
            let fetch_k = if exclude_subject.is_some() { k * 2 } else { k };
            let normalized = exclude_subject.map(crate::names::normalize_subject);
            let mut hits: Vec<FaceHit> = self
                .face_index
                .search(query, fetch_k)?
                .into_iter()
                .map(|(face_id, distance, face)| FaceHit {
                    face_id,
                    distance,
                    face,
                })
                .filter(|hit| match (&normalized, hit.face.normalized_subject()) {
                    (Some(keep), Some(assigned)) => assigned == *keep,
                    _ => true,
                })
                .collect();
            hits.truncate(k);
            return Ok(hits);
        }
        self.backend
            .similar_faces(query, k, self.ef_search, exclude_subject)
    }

    /// Remove a photo everywhere: face rows, processing marker, embedding
    /// row and both ANN indexes. Returns the number of face rows removed
    /// plus whether an embedding existed.
    pub fn delete_photo(&self, photo_id: &str) -> Result<(usize, bool)> {
        let face_ids = self.backend.delete_faces_by_photo(photo_id)?;
        for face_id in &face_ids {
            self.face_index.remove(face_id);
        }

        let had_embedding = self.backend.delete_embedding(photo_id)?;
        self.image_index.remove(&photo_id.to_string());

        Ok((face_ids.len(), had_embedding))
    }

    pub fn known_photo_ids(&self) -> Result<Vec<String>> {
        self.backend.known_photo_ids()
    }

    // === Index lifecycle ===

    /// Current store-side truth for the face snapshot freshness check.
    pub fn face_freshness(&self) -> Result<StoreFreshness> {
        let count = self.backend.count_faces()?;
        let max_id = self.backend.max_face_id()?;
        Ok(StoreFreshness {
            count,
            max_key: (max_id > 0).then(|| serde_json::json!(max_id)),
        })
    }

    /// Current store-side truth for the image snapshot freshness check.
    pub fn image_freshness(&self) -> Result<StoreFreshness> {
        let count = self.backend.count_embeddings()?;
        let max_key = self.backend.max_photo_id()?.map(serde_json::Value::String);
        Ok(StoreFreshness { count, max_key })
    }

    /// Rebuild the face index from a streaming store scan.
    pub fn rebuild_face_index(&self) -> Result<usize> {
        self.face_index.rebuild_with(|add| {
            self.backend.for_each_face(&mut |face| {
                add(face.id, face.vector.clone(), face);
                Ok(())
            })
        })
    }

    /// Rebuild the image index from a streaming store scan.
    pub fn rebuild_image_index(&self) -> Result<usize> {
        self.image_index.rebuild_with(|add| {
            self.backend.for_each_embedding(&mut |photo_id, vector| {
                let record = EmbeddingRecord {
                    photo_id: photo_id.clone(),
                    vector: vector.clone(),
                    dim: vector.len(),
                    model: String::new(),
                    pretrained: String::new(),
                    created_at: None,
                };
                add(photo_id, vector, record);
                Ok(())
            })
        })
    }

    pub fn stats(&self) -> Result<StoreStats> {
        Ok(StoreStats {
            embeddings: self.backend.count_embeddings()?,
            faces: self.backend.count_faces()?,
            processed_photos: self.backend.count_processed()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::PixelBox;
    use crate::vector::l2_normalized;

    fn test_store() -> VectorStore {
        let backend = Arc::new(SqliteStore::open_in_memory().unwrap());
        let mut config = Config::default();
        // Small dimensions keep the fixtures readable.
        config.embedding.embedding_dim = 8;
        let store = VectorStore::new(backend, &config);
        store.initialize().unwrap();
        store
    }

    fn unit(dim: usize, axis: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[axis] = 1.0;
        v
    }

    fn face_vec(axis: usize) -> Vec<f32> {
        unit(crate::vector::FACE_DIM, axis)
    }

    fn new_face(face_index: i32, vector: Vec<f32>) -> NewFace {
        NewFace {
            face_index,
            vector,
            bbox: PixelBox::new(10.0, 10.0, 80.0, 90.0),
            det_score: 0.95,
        }
    }

    #[test]
    fn test_put_embedding_rejects_bad_vectors() {
        let store = test_store();

        let err = store
            .put_embedding("p1", &unit(9, 0), "ViT-L-14", "openai")
            .unwrap_err();
        assert!(matches!(err, crate::error::Error::BadDim { expected: 8, got: 9 }));

        let short = vec![0.9, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        let err = store
            .put_embedding("p1", &short, "ViT-L-14", "openai")
            .unwrap_err();
        assert!(matches!(err, crate::error::Error::BadNorm { .. }));
    }

    #[test]
    fn test_put_embedding_mirrors_into_index() {
        let store = test_store();
        store
            .put_embedding("p1", &unit(8, 0), "ViT-L-14", "openai")
            .unwrap();

        assert_eq!(store.image_index().count(), 1);
        assert_eq!(store.count_embeddings().unwrap(), 1);

        // In-memory routing once the index is marked ready.
        store.image_index().set_ready(true);
        let hits = store.find_similar_photos(&unit(8, 0), 5).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "p1");
        assert!(hits[0].1.abs() < 1e-6);
    }

    #[test]
    fn test_find_similar_photos_falls_back_to_backend() {
        let store = test_store();
        store
            .put_embedding("p1", &unit(8, 0), "ViT-L-14", "openai")
            .unwrap();
        store
            .put_embedding("p2", &unit(8, 1), "ViT-L-14", "openai")
            .unwrap();

        // Index not ready: the database-native path must answer.
        assert!(!store.image_index().is_ready());
        let hits = store.find_similar_photos(&unit(8, 0), 1).unwrap();
        assert_eq!(hits[0].0, "p1");
    }

    #[test]
    fn test_put_faces_syncs_face_index() {
        let store = test_store();
        let first = store
            .put_faces("p1", &[new_face(0, face_vec(0)), new_face(1, face_vec(1))])
            .unwrap();
        assert_eq!(store.face_index().count(), 2);

        // Re-ingest replaces rows and nodes; fresh ids, same count.
        let second = store.put_faces("p1", &[new_face(0, face_vec(0))]).unwrap();
        assert_eq!(store.face_index().count(), 1);
        assert!(second[0].id > first[1].id);

        store.face_index().set_ready(true);
        let hits = store.find_similar_faces(&face_vec(0), 5, None).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].face_id, second[0].id);
    }

    #[test]
    fn test_update_marker_updates_index_payload() {
        let store = test_store();
        let faces = store.put_faces("p1", &[new_face(0, face_vec(0))]).unwrap();

        let fields = MarkerFields {
            marker_id: Some("m1".into()),
            subject_id: Some("s1".into()),
            subject_name: Some("Anna".into()),
        };
        store.update_marker(&faces[0], &fields).unwrap();

        store.face_index().set_ready(true);
        let hits = store.find_similar_faces(&face_vec(0), 1, None).unwrap();
        assert_eq!(hits[0].face.marker_id.as_deref(), Some("m1"));
        assert_eq!(hits[0].face.subject_name.as_deref(), Some("Anna"));

        // Vector unchanged after any number of marker updates.
        let rows = store.faces_by_photo("p1").unwrap();
        assert_eq!(rows[0].vector, face_vec(0));
    }

    #[test]
    fn test_find_similar_faces_exclusion_in_memory() {
        let store = test_store();
        let f1 = store.put_faces("p1", &[new_face(0, face_vec(0))]).unwrap();
        let f2 = store.put_faces("p2", &[new_face(0, face_vec(0))]).unwrap();
        store.put_faces("p3", &[new_face(0, face_vec(0))]).unwrap();

        store
            .update_marker(
                &f1[0],
                &MarkerFields {
                    marker_id: Some("m1".into()),
                    subject_id: None,
                    subject_name: Some("anna".into()),
                },
            )
            .unwrap();
        store
            .update_marker(
                &f2[0],
                &MarkerFields {
                    marker_id: Some("m2".into()),
                    subject_id: None,
                    subject_name: Some("berta".into()),
                },
            )
            .unwrap();

        store.face_index().set_ready(true);
        let hits = store
            .find_similar_faces(&face_vec(0), 10, Some("anna"))
            .unwrap();
        let photos: Vec<&str> = hits.iter().map(|h| h.face.photo_id.as_str()).collect();
        assert!(photos.contains(&"p1"));
        assert!(photos.contains(&"p3"));
        assert!(!photos.contains(&"p2"));
    }

    #[test]
    fn test_delete_photo_evicts_everywhere() {
        let store = test_store();
        store
            .put_embedding("p1", &unit(8, 0), "ViT-L-14", "openai")
            .unwrap();
        store.put_faces("p1", &[new_face(0, face_vec(0))]).unwrap();

        let (faces_removed, had_embedding) = store.delete_photo("p1").unwrap();
        assert_eq!(faces_removed, 1);
        assert!(had_embedding);

        assert!(!store.has_embedding("p1").unwrap());
        assert!(store.faces_by_photo("p1").unwrap().is_empty());
        assert_eq!(store.face_index().count(), 0);
        assert_eq!(store.image_index().count(), 0);
        assert!(store.processing_marker("p1").unwrap().is_none());
    }

    #[test]
    fn test_rebuild_indexes_from_store() {
        let store = test_store();
        store
            .put_embedding("p1", &unit(8, 0), "ViT-L-14", "openai")
            .unwrap();
        store
            .put_faces("p1", &[new_face(0, face_vec(0)), new_face(1, face_vec(1))])
            .unwrap();

        // Simulate a cold start: fresh facade over the same backend.
        let backend = Arc::clone(store.backend());
        let mut config = Config::default();
        config.embedding.embedding_dim = 8;
        let cold = VectorStore::new(backend, &config);

        assert_eq!(cold.rebuild_face_index().unwrap(), 2);
        assert_eq!(cold.rebuild_image_index().unwrap(), 1);
        assert!(cold.face_index().is_ready());
        assert!(cold.image_index().is_ready());

        let hits = cold.find_similar_photos(&unit(8, 0), 1).unwrap();
        assert_eq!(hits[0].0, "p1");
    }

    #[test]
    fn test_freshness_reflects_store() {
        let store = test_store();
        let fresh = store.face_freshness().unwrap();
        assert_eq!(fresh.count, 0);
        assert!(fresh.max_key.is_none());

        let faces = store.put_faces("p1", &[new_face(0, face_vec(0))]).unwrap();
        let fresh = store.face_freshness().unwrap();
        assert_eq!(fresh.count, 1);
        assert_eq!(fresh.max_key, Some(serde_json::json!(faces[0].id)));

        store
            .put_embedding("p1", &l2_normalized(unit(8, 2)), "ViT-L-14", "openai")
            .unwrap();
        let fresh = store.image_freshness().unwrap();
        assert_eq!(fresh.count, 1);
        assert_eq!(fresh.max_key, Some(serde_json::json!("p1")));
    }

    #[test]
    fn test_stats() {
        let store = test_store();
        store
            .put_embedding("p1", &unit(8, 0), "ViT-L-14", "openai")
            .unwrap();
        store.put_faces("p1", &[new_face(0, face_vec(0))]).unwrap();
        store.mark_processed("p2", 0).unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.embeddings, 1);
        assert_eq!(stats.faces, 1);
        assert_eq!(stats.processed_photos, 2);
    }
}
