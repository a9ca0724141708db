//! Store backend abstraction.
//!
//! A common interface over the SQLite and PostgreSQL backends. The facade
//! in [`super`] validates vectors, routes similarity queries and keeps the
//! in-memory ANN indexes in step; backends only move rows.

use crate::error::Result;

use super::types::{
    EmbeddingRecord, FaceHit, FaceRecord, MarkerFields, NewFace, PhotoInfo, ProcessingMarker,
};

/// Trait for store backend implementations.
///
/// `similar_*` methods are the database-native ANN path used whenever the
/// in-memory index is not ready; `ef_search` tunes the native index's
/// search depth where the backend supports it so recall stays comparable.
pub trait StoreBackend: Send + Sync {
    /// Initialize the schema and run migrations.
    fn initialize(&self) -> Result<()>;

    // === Embeddings ===

    /// Upsert the embedding row for a photo.
    fn put_embedding(&self, record: &EmbeddingRecord) -> Result<()>;

    fn get_embedding(&self, photo_id: &str) -> Result<Option<EmbeddingRecord>>;

    /// Existence probe; must not deserialize the vector.
    fn has_embedding(&self, photo_id: &str) -> Result<bool>;

    fn count_embeddings(&self) -> Result<u64>;

    /// Returns true when a row was deleted.
    fn delete_embedding(&self, photo_id: &str) -> Result<bool>;

    /// Database-native similarity over image embeddings, ascending by
    /// cosine distance.
    fn similar_embeddings(
        &self,
        query: &[f32],
        k: usize,
        ef_search: usize,
    ) -> Result<Vec<(String, f32)>>;

    /// Stream every embedding row through `visit` without loading the
    /// whole table. Used for ANN rebuilds.
    fn for_each_embedding(
        &self,
        visit: &mut dyn FnMut(String, Vec<f32>) -> Result<()>,
    ) -> Result<()>;

    /// Highest photo id currently stored (lexicographic), for snapshot
    /// freshness checks.
    fn max_photo_id(&self) -> Result<Option<String>>;

    // === Faces ===

    /// Atomic replacement: delete all prior faces for the photo, insert
    /// the new batch with fresh ids, write the processing marker. Returns
    /// the inserted rows.
    fn replace_faces(&self, photo_id: &str, faces: &[NewFace]) -> Result<Vec<FaceRecord>>;

    /// Record "ingestion complete" without touching face rows (used for
    /// photos with zero detected faces).
    fn mark_processed(&self, photo_id: &str, face_count: i64) -> Result<()>;

    fn processing_marker(&self, photo_id: &str) -> Result<Option<ProcessingMarker>>;

    fn count_processed(&self) -> Result<u64>;

    fn faces_by_photo(&self, photo_id: &str) -> Result<Vec<FaceRecord>>;

    /// All faces whose cached subject matches `subject` under the
    /// canonical name form.
    fn faces_by_subject(&self, subject: &str) -> Result<Vec<FaceRecord>>;

    /// Update only the cached library-service fields of one face.
    fn update_marker(&self, photo_id: &str, face_index: i32, fields: &MarkerFields) -> Result<()>;

    /// Update the cached photo dimensions / orientation / file id on all
    /// faces of a photo.
    fn update_photo_info(&self, photo_id: &str, info: &PhotoInfo) -> Result<()>;

    /// Database-native similarity over face vectors. When
    /// `exclude_subject` is set, faces already assigned to a *different*
    /// subject are omitted; unassigned faces and faces of the named
    /// subject are kept.
    fn similar_faces(
        &self,
        query: &[f32],
        k: usize,
        ef_search: usize,
        exclude_subject: Option<&str>,
    ) -> Result<Vec<FaceHit>>;

    /// Stream every face row through `visit`. Used for ANN rebuilds.
    fn for_each_face(&self, visit: &mut dyn FnMut(FaceRecord) -> Result<()>) -> Result<()>;

    fn count_faces(&self) -> Result<u64>;

    /// Highest face id ever assigned, 0 when the table is empty.
    fn max_face_id(&self) -> Result<i64>;

    /// Delete all faces of a photo together with its processing marker.
    /// Returns the deleted face ids so callers can evict ANN nodes.
    fn delete_faces_by_photo(&self, photo_id: &str) -> Result<Vec<i64>>;

    /// Every photo id the face store knows about: photos with faces, a
    /// processing marker, or an embedding. The synchronizer's universe.
    fn known_photo_ids(&self) -> Result<Vec<String>>;
}
