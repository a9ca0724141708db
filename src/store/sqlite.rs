//! SQLite backend.
//!
//! The default backend: a single bundled-SQLite connection behind a mutex.
//! Vectors live in BLOB columns in the little-endian f32 codec. SQLite has
//! no native vector index, so the `similar_*` fallback path is an exact
//! scan with true cosine distances; the in-memory HNSW indexes carry the
//! batch-heavy workloads.

use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::geometry::PixelBox;
use crate::names;
use crate::vector::{bytes_to_vector, cosine_distance, vector_to_bytes};

use super::backend::StoreBackend;
use super::sqlite_schema::{MIGRATIONS, SCHEMA};
use super::types::{
    EmbeddingRecord, FaceHit, FaceRecord, MarkerFields, NewFace, PhotoInfo, ProcessingMarker,
};

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn row_to_face(row: &rusqlite::Row<'_>) -> rusqlite::Result<FaceRecord> {
    let vector_bytes: Vec<u8> = row.get(3)?;
    Ok(FaceRecord {
        id: row.get(0)?,
        photo_id: row.get(1)?,
        face_index: row.get(2)?,
        vector: bytes_to_vector(&vector_bytes),
        bbox: PixelBox::new(row.get(4)?, row.get(5)?, row.get(6)?, row.get(7)?),
        det_score: row.get(8)?,
        marker_id: row.get(9)?,
        subject_id: row.get(10)?,
        subject_name: row.get(11)?,
        photo_width: row.get(12)?,
        photo_height: row.get(13)?,
        orientation: row.get(14)?,
        file_id: row.get(15)?,
        created_at: row.get(16)?,
    })
}

const FACE_COLUMNS: &str = "id, photo_id, face_index, vector, \
     bbox_x1, bbox_y1, bbox_x2, bbox_y2, det_score, \
     marker_id, subject_id, subject_name, \
     photo_width, photo_height, orientation, file_id, created_at";

/// Map a unique-constraint violation to [`Error::Conflict`].
fn map_insert_error(e: rusqlite::Error, photo_id: &str) -> Error {
    if let rusqlite::Error::SqliteFailure(ref failure, _) = e {
        if failure.code == rusqlite::ErrorCode::ConstraintViolation {
            return Error::Conflict(format!("face batch for photo {photo_id}"));
        }
    }
    e.into()
}

impl StoreBackend for SqliteStore {
    fn initialize(&self) -> Result<()> {
        let conn = self.conn();
        conn.execute_batch(SCHEMA)?;
        for migration in MIGRATIONS {
            // Migrations may fail when the column already exists, which is
            // expected for idempotent re-runs.
            let _ = conn.execute(migration, []);
        }
        Ok(())
    }

    fn put_embedding(&self, record: &EmbeddingRecord) -> Result<()> {
        let bytes = vector_to_bytes(&record.vector);
        self.conn().execute(
            r#"
            INSERT OR REPLACE INTO embeddings (photo_id, vector, dim, model, pretrained, created_at)
            VALUES (?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
            "#,
            params![
                record.photo_id,
                bytes,
                record.vector.len() as i64,
                record.model,
                record.pretrained,
            ],
        )?;
        Ok(())
    }

    fn get_embedding(&self, photo_id: &str) -> Result<Option<EmbeddingRecord>> {
        let conn = self.conn();
        let result = conn.query_row(
            "SELECT photo_id, vector, dim, model, pretrained, created_at
             FROM embeddings WHERE photo_id = ?",
            [photo_id],
            |row| {
                let bytes: Vec<u8> = row.get(1)?;
                Ok(EmbeddingRecord {
                    photo_id: row.get(0)?,
                    vector: bytes_to_vector(&bytes),
                    dim: row.get::<_, i64>(2)? as usize,
                    model: row.get(3)?,
                    pretrained: row.get(4)?,
                    created_at: row.get(5)?,
                })
            },
        );

        match result {
            Ok(record) => Ok(Some(record)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn has_embedding(&self, photo_id: &str) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM embeddings WHERE photo_id = ?",
            [photo_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn count_embeddings(&self) -> Result<u64> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM embeddings", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    fn delete_embedding(&self, photo_id: &str) -> Result<bool> {
        let deleted = self
            .conn()
            .execute("DELETE FROM embeddings WHERE photo_id = ?", [photo_id])?;
        Ok(deleted > 0)
    }

    fn similar_embeddings(
        &self,
        query: &[f32],
        k: usize,
        _ef_search: usize,
    ) -> Result<Vec<(String, f32)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT photo_id, vector FROM embeddings")?;

        let mut results: Vec<(String, f32)> = stmt
            .query_map([], |row| {
                let bytes: Vec<u8> = row.get(1)?;
                Ok((row.get::<_, String>(0)?, bytes_to_vector(&bytes)))
            })?
            .filter_map(|r| r.ok())
            .map(|(photo_id, vector)| {
                let distance = cosine_distance(query, &vector);
                (photo_id, distance)
            })
            .collect();

        results.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(k);
        Ok(results)
    }

    fn for_each_embedding(
        &self,
        visit: &mut dyn FnMut(String, Vec<f32>) -> Result<()>,
    ) -> Result<()> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT photo_id, vector FROM embeddings")?;
        let rows = stmt.query_map([], |row| {
            let bytes: Vec<u8> = row.get(1)?;
            Ok((row.get::<_, String>(0)?, bytes_to_vector(&bytes)))
        })?;

        for row in rows {
            let (photo_id, vector) = row?;
            visit(photo_id, vector)?;
        }
        Ok(())
    }

    fn max_photo_id(&self) -> Result<Option<String>> {
        let max: Option<String> =
            self.conn()
                .query_row("SELECT MAX(photo_id) FROM embeddings", [], |row| row.get(0))?;
        Ok(max)
    }

    fn replace_faces(&self, photo_id: &str, faces: &[NewFace]) -> Result<Vec<FaceRecord>> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        tx.execute("DELETE FROM faces WHERE photo_id = ?", [photo_id])?;

        let mut inserted = Vec::with_capacity(faces.len());
        for face in faces {
            let bytes = vector_to_bytes(&face.vector);
            tx.execute(
                r#"
                INSERT INTO faces (photo_id, face_index, vector,
                                   bbox_x1, bbox_y1, bbox_x2, bbox_y2, det_score)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
                params![
                    photo_id,
                    face.face_index,
                    bytes,
                    face.bbox.x1,
                    face.bbox.y1,
                    face.bbox.x2,
                    face.bbox.y2,
                    face.det_score,
                ],
            )
            .map_err(|e| map_insert_error(e, photo_id))?;

            inserted.push(FaceRecord {
                id: tx.last_insert_rowid(),
                photo_id: photo_id.to_string(),
                face_index: face.face_index,
                vector: face.vector.clone(),
                bbox: face.bbox,
                det_score: face.det_score,
                marker_id: None,
                subject_id: None,
                subject_name: None,
                photo_width: None,
                photo_height: None,
                orientation: None,
                file_id: None,
                created_at: None,
            });
        }

        tx.execute(
            "INSERT OR REPLACE INTO faces_processed (photo_id, face_count, processed_at)
             VALUES (?, ?, CURRENT_TIMESTAMP)",
            params![photo_id, faces.len() as i64],
        )?;

        tx.commit()?;
        Ok(inserted)
    }

    fn mark_processed(&self, photo_id: &str, face_count: i64) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO faces_processed (photo_id, face_count, processed_at)
             VALUES (?, ?, CURRENT_TIMESTAMP)",
            params![photo_id, face_count],
        )?;
        Ok(())
    }

    fn processing_marker(&self, photo_id: &str) -> Result<Option<ProcessingMarker>> {
        let result = self.conn().query_row(
            "SELECT photo_id, face_count, processed_at FROM faces_processed WHERE photo_id = ?",
            [photo_id],
            |row| {
                Ok(ProcessingMarker {
                    photo_id: row.get(0)?,
                    face_count: row.get(1)?,
                    processed_at: row.get(2)?,
                })
            },
        );

        match result {
            Ok(marker) => Ok(Some(marker)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn count_processed(&self) -> Result<u64> {
        let count: i64 =
            self.conn()
                .query_row("SELECT COUNT(*) FROM faces_processed", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    fn faces_by_photo(&self, photo_id: &str) -> Result<Vec<FaceRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {FACE_COLUMNS} FROM faces WHERE photo_id = ? ORDER BY face_index"
        ))?;

        let faces = stmt
            .query_map([photo_id], row_to_face)?
            .filter_map(|r| r.ok())
            .collect();

        Ok(faces)
    }

    fn faces_by_subject(&self, subject: &str) -> Result<Vec<FaceRecord>> {
        let normalized = names::normalize_subject(subject);
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {FACE_COLUMNS} FROM faces WHERE subject_name_norm = ? ORDER BY id"
        ))?;

        let faces = stmt
            .query_map([normalized], row_to_face)?
            .filter_map(|r| r.ok())
            .collect();

        Ok(faces)
    }

    fn update_marker(&self, photo_id: &str, face_index: i32, fields: &MarkerFields) -> Result<()> {
        let normalized = fields
            .subject_name
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(names::normalize_subject);

        let updated = self.conn().execute(
            r#"
            UPDATE faces
            SET marker_id = ?, subject_id = ?, subject_name = ?, subject_name_norm = ?
            WHERE photo_id = ? AND face_index = ?
            "#,
            params![
                fields.marker_id,
                fields.subject_id,
                fields.subject_name,
                normalized,
                photo_id,
                face_index,
            ],
        )?;

        if updated == 0 {
            return Err(Error::not_found(format!(
                "face {face_index} of photo {photo_id}"
            )));
        }
        Ok(())
    }

    fn update_photo_info(&self, photo_id: &str, info: &PhotoInfo) -> Result<()> {
        self.conn().execute(
            r#"
            UPDATE faces
            SET photo_width = ?, photo_height = ?, orientation = ?, file_id = ?
            WHERE photo_id = ?
            "#,
            params![
                info.width,
                info.height,
                info.orientation,
                info.file_id,
                photo_id,
            ],
        )?;
        Ok(())
    }

    fn similar_faces(
        &self,
        query: &[f32],
        k: usize,
        _ef_search: usize,
        exclude_subject: Option<&str>,
    ) -> Result<Vec<FaceHit>> {
        let conn = self.conn();

        // When a subject is given, hide faces already assigned to a
        // different subject; keep unassigned faces and the subject's own.
        let (sql, normalized);
        match exclude_subject {
            Some(subject) => {
                normalized = names::normalize_subject(subject);
                sql = format!(
                    "SELECT {FACE_COLUMNS} FROM faces
                     WHERE subject_name_norm IS NULL OR subject_name_norm = ?"
                );
            }
            None => {
                normalized = String::new();
                sql = format!("SELECT {FACE_COLUMNS} FROM faces");
            }
        }

        let mut stmt = conn.prepare(&sql)?;
        let rows: Vec<FaceRecord> = if exclude_subject.is_some() {
            stmt.query_map([&normalized], row_to_face)?
                .filter_map(|r| r.ok())
                .collect()
        } else {
            stmt.query_map([], row_to_face)?
                .filter_map(|r| r.ok())
                .collect()
        };

        let mut hits: Vec<FaceHit> = rows
            .into_iter()
            .map(|face| FaceHit {
                face_id: face.id,
                distance: cosine_distance(query, &face.vector),
                face,
            })
            .collect();

        hits.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(k);
        Ok(hits)
    }

    fn for_each_face(&self, visit: &mut dyn FnMut(FaceRecord) -> Result<()>) -> Result<()> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("SELECT {FACE_COLUMNS} FROM faces ORDER BY id"))?;
        let rows = stmt.query_map([], row_to_face)?;

        for row in rows {
            visit(row?)?;
        }
        Ok(())
    }

    fn count_faces(&self) -> Result<u64> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM faces", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    fn max_face_id(&self) -> Result<i64> {
        let max: i64 = self
            .conn()
            .query_row("SELECT COALESCE(MAX(id), 0) FROM faces", [], |row| row.get(0))?;
        Ok(max)
    }

    fn delete_faces_by_photo(&self, photo_id: &str) -> Result<Vec<i64>> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let ids: Vec<i64> = {
            let mut stmt = tx.prepare("SELECT id FROM faces WHERE photo_id = ?")?;
            let rows = stmt
                .query_map([photo_id], |row| row.get(0))?
                .filter_map(|r| r.ok())
                .collect();
            rows
        };

        tx.execute("DELETE FROM faces WHERE photo_id = ?", [photo_id])?;
        tx.execute("DELETE FROM faces_processed WHERE photo_id = ?", [photo_id])?;
        tx.commit()?;

        Ok(ids)
    }

    fn known_photo_ids(&self) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT photo_id FROM faces_processed
             UNION
             SELECT photo_id FROM embeddings
             ORDER BY photo_id",
        )?;

        let ids = stmt
            .query_map([], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();

        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::l2_normalized;

    fn store() -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();
        store.initialize().unwrap();
        store
    }

    fn unit(dim: usize, axis: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[axis] = 1.0;
        v
    }

    fn new_face(face_index: i32, vector: Vec<f32>) -> NewFace {
        NewFace {
            face_index,
            vector,
            bbox: PixelBox::new(10.0, 10.0, 60.0, 70.0),
            det_score: 0.9,
        }
    }

    fn embedding(photo_id: &str, vector: Vec<f32>) -> EmbeddingRecord {
        EmbeddingRecord {
            photo_id: photo_id.to_string(),
            dim: vector.len(),
            vector,
            model: "ViT-L-14".into(),
            pretrained: "openai".into(),
            created_at: None,
        }
    }

    #[test]
    fn test_embedding_upsert_and_get() {
        let store = store();
        store.put_embedding(&embedding("p1", unit(8, 0))).unwrap();
        store.put_embedding(&embedding("p1", unit(8, 1))).unwrap();

        assert_eq!(store.count_embeddings().unwrap(), 1);
        let record = store.get_embedding("p1").unwrap().unwrap();
        assert_eq!(record.vector, unit(8, 1));
        assert_eq!(record.model, "ViT-L-14");
        assert!(store.has_embedding("p1").unwrap());
        assert!(!store.has_embedding("p2").unwrap());
    }

    #[test]
    fn test_delete_embedding() {
        let store = store();
        store.put_embedding(&embedding("p1", unit(4, 0))).unwrap();
        assert!(store.delete_embedding("p1").unwrap());
        assert!(!store.delete_embedding("p1").unwrap());
        assert_eq!(store.get_embedding("p1").unwrap().map(|r| r.photo_id), None);
    }

    #[test]
    fn test_similar_embeddings_sorted_ascending() {
        let store = store();
        store.put_embedding(&embedding("a", unit(4, 0))).unwrap();
        store
            .put_embedding(&embedding("b", l2_normalized(vec![1.0, 1.0, 0.0, 0.0])))
            .unwrap();
        store.put_embedding(&embedding("c", unit(4, 1))).unwrap();

        let hits = store.similar_embeddings(&unit(4, 0), 2, 100).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, "a");
        assert!(hits[0].1.abs() < 1e-6);
        assert_eq!(hits[1].0, "b");
    }

    #[test]
    fn test_replace_faces_is_atomic_replacement() {
        let store = store();
        let first = store
            .replace_faces("p1", &[new_face(0, unit(4, 0)), new_face(1, unit(4, 1))])
            .unwrap();
        assert_eq!(first.len(), 2);

        let second = store.replace_faces("p1", &[new_face(0, unit(4, 2))]).unwrap();
        assert_eq!(second.len(), 1);
        // Fresh ids on re-ingest.
        assert!(second[0].id > first[1].id);

        let faces = store.faces_by_photo("p1").unwrap();
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].vector, unit(4, 2));

        let marker = store.processing_marker("p1").unwrap().unwrap();
        assert_eq!(marker.face_count, 1);
    }

    #[test]
    fn test_mark_processed_without_faces() {
        let store = store();
        store.mark_processed("p1", 0).unwrap();
        let marker = store.processing_marker("p1").unwrap().unwrap();
        assert_eq!(marker.face_count, 0);
        assert!(store.faces_by_photo("p1").unwrap().is_empty());
    }

    #[test]
    fn test_update_marker_and_subject_query() {
        let store = store();
        store.replace_faces("p1", &[new_face(0, unit(4, 0))]).unwrap();

        store
            .update_marker(
                "p1",
                0,
                &MarkerFields {
                    marker_id: Some("m1".into()),
                    subject_id: Some("s1".into()),
                    subject_name: Some("Anna Nováková".into()),
                },
            )
            .unwrap();

        // Canonical-form lookup regardless of the query spelling.
        let faces = store.faces_by_subject("anna-novakova").unwrap();
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].marker_id.as_deref(), Some("m1"));

        // Vector untouched by marker updates.
        assert_eq!(faces[0].vector, unit(4, 0));
    }

    #[test]
    fn test_update_marker_missing_face_is_not_found() {
        let store = store();
        let err = store
            .update_marker("p1", 3, &MarkerFields::default())
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_update_photo_info_applies_to_all_faces() {
        let store = store();
        store
            .replace_faces("p1", &[new_face(0, unit(4, 0)), new_face(1, unit(4, 1))])
            .unwrap();

        store
            .update_photo_info(
                "p1",
                &PhotoInfo {
                    width: 1200,
                    height: 1600,
                    orientation: 6,
                    file_id: "f1".into(),
                },
            )
            .unwrap();

        for face in store.faces_by_photo("p1").unwrap() {
            assert_eq!(face.photo_width, Some(1200));
            assert_eq!(face.orientation, Some(6));
            assert_eq!(face.file_id.as_deref(), Some("f1"));
            assert_eq!(face.display_dimensions(), Some((1600, 1200)));
        }
    }

    #[test]
    fn test_similar_faces_excludes_other_subjects() {
        let store = store();
        store.replace_faces("p1", &[new_face(0, unit(4, 0))]).unwrap();
        store.replace_faces("p2", &[new_face(0, unit(4, 0))]).unwrap();
        store.replace_faces("p3", &[new_face(0, unit(4, 0))]).unwrap();

        store
            .update_marker(
                "p1",
                0,
                &MarkerFields {
                    marker_id: Some("m1".into()),
                    subject_id: None,
                    subject_name: Some("anna".into()),
                },
            )
            .unwrap();
        store
            .update_marker(
                "p2",
                0,
                &MarkerFields {
                    marker_id: Some("m2".into()),
                    subject_id: None,
                    subject_name: Some("berta".into()),
                },
            )
            .unwrap();

        let hits = store
            .similar_faces(&unit(4, 0), 10, 100, Some("anna"))
            .unwrap();
        let photos: Vec<&str> = hits.iter().map(|h| h.face.photo_id.as_str()).collect();
        assert!(photos.contains(&"p1")); // same subject kept
        assert!(photos.contains(&"p3")); // unassigned kept
        assert!(!photos.contains(&"p2")); // other subject dropped
    }

    #[test]
    fn test_delete_faces_by_photo_returns_ids() {
        let store = store();
        let inserted = store
            .replace_faces("p1", &[new_face(0, unit(4, 0)), new_face(1, unit(4, 1))])
            .unwrap();

        let deleted = store.delete_faces_by_photo("p1").unwrap();
        let mut expected: Vec<i64> = inserted.iter().map(|f| f.id).collect();
        expected.sort_unstable();
        let mut got = deleted.clone();
        got.sort_unstable();
        assert_eq!(got, expected);

        assert!(store.faces_by_photo("p1").unwrap().is_empty());
        assert!(store.processing_marker("p1").unwrap().is_none());
    }

    #[test]
    fn test_known_photo_ids_spans_both_tables() {
        let store = store();
        store.put_embedding(&embedding("p1", unit(4, 0))).unwrap();
        store.mark_processed("p2", 0).unwrap();
        store.replace_faces("p3", &[new_face(0, unit(4, 0))]).unwrap();

        let ids = store.known_photo_ids().unwrap();
        assert_eq!(ids, vec!["p1", "p2", "p3"]);
    }

    #[test]
    fn test_processed_count_invariant() {
        // For every marker with count=n there are exactly n face rows.
        let store = store();
        store
            .replace_faces("p1", &[new_face(0, unit(4, 0)), new_face(1, unit(4, 1))])
            .unwrap();
        store.mark_processed("p2", 0).unwrap();

        for photo_id in ["p1", "p2"] {
            let marker = store.processing_marker(photo_id).unwrap().unwrap();
            let faces = store.faces_by_photo(photo_id).unwrap();
            assert_eq!(faces.len() as i64, marker.face_count);
        }
    }
}
