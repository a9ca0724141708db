//! PostgreSQL backend.
//!
//! The production backend: pgvector columns with native HNSW indexes
//! (cosine operator class) give the database-side ANN path, and the
//! unaccent extension backs the canonical subject-name comparison at the
//! SQL layer. Connections come from an r2d2 pool sized by
//! `store_max_open_conns` / `store_max_idle_conns`.

use pgvector::Vector;
use postgres::fallible_iterator::FallibleIterator;
use postgres::types::ToSql;
use postgres::NoTls;
use r2d2::Pool;
use r2d2_postgres::PostgresConnectionManager;

use crate::error::{Error, Result};
use crate::geometry::PixelBox;
use crate::names;

use super::backend::StoreBackend;
use super::postgres_schema::POSTGRES_SCHEMA;
use super::types::{
    EmbeddingRecord, FaceHit, FaceRecord, MarkerFields, NewFace, PhotoInfo, ProcessingMarker,
};

pub struct PgStore {
    pool: Pool<PostgresConnectionManager<NoTls>>,
}

impl PgStore {
    pub fn open(url: &str, max_open: u32, max_idle: u32) -> Result<Self> {
        let config: postgres::Config = url
            .parse()
            .map_err(|e: <postgres::Config as std::str::FromStr>::Err| Error::ExternalRejected {
                service: "store",
                status: 0,
                reason: e.to_string(),
            })?;
        let manager = PostgresConnectionManager::new(config, NoTls);
        let pool = Pool::builder()
            .max_size(max_open)
            .min_idle(Some(max_idle.min(max_open)))
            .build(manager)
            .map_err(Error::Pool)?;
        Ok(Self { pool })
    }
}

const FACE_COLUMNS: &str = "id, photo_id, face_index, vector, \
     bbox_x1, bbox_y1, bbox_x2, bbox_y2, det_score, \
     marker_id, subject_id, subject_name, \
     photo_width, photo_height, orientation, file_id, created_at";

fn row_to_face(row: &postgres::Row) -> FaceRecord {
    let vector: Vector = row.get(3);
    FaceRecord {
        id: row.get(0),
        photo_id: row.get(1),
        face_index: row.get(2),
        vector: vector.to_vec(),
        bbox: PixelBox::new(row.get(4), row.get(5), row.get(6), row.get(7)),
        det_score: row.get(8),
        marker_id: row.get(9),
        subject_id: row.get(10),
        subject_name: row.get(11),
        photo_width: row.get::<_, Option<i32>>(12).and_then(|v| u32::try_from(v).ok()),
        photo_height: row.get::<_, Option<i32>>(13).and_then(|v| u32::try_from(v).ok()),
        orientation: row.get::<_, Option<i32>>(14).and_then(|v| u8::try_from(v).ok()),
        file_id: row.get(15),
        created_at: row.get(16),
    }
}

/// Map a unique-constraint violation to [`Error::Conflict`].
fn map_insert_error(e: postgres::Error, photo_id: &str) -> Error {
    if e.code() == Some(&postgres::error::SqlState::UNIQUE_VIOLATION) {
        return Error::Conflict(format!("face batch for photo {photo_id}"));
    }
    e.into()
}

impl StoreBackend for PgStore {
    fn initialize(&self) -> Result<()> {
        let mut client = self.pool.get()?;
        client.batch_execute(POSTGRES_SCHEMA)?;
        Ok(())
    }

    fn put_embedding(&self, record: &EmbeddingRecord) -> Result<()> {
        let mut client = self.pool.get()?;
        client.execute(
            r#"
            INSERT INTO embeddings (photo_id, vector, dim, model, pretrained)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (photo_id) DO UPDATE
                SET vector = EXCLUDED.vector,
                    dim = EXCLUDED.dim,
                    model = EXCLUDED.model,
                    pretrained = EXCLUDED.pretrained,
                    created_at = NOW()::text
            "#,
            &[
                &record.photo_id,
                &Vector::from(record.vector.clone()),
                &(record.vector.len() as i32),
                &record.model,
                &record.pretrained,
            ],
        )?;
        Ok(())
    }

    fn get_embedding(&self, photo_id: &str) -> Result<Option<EmbeddingRecord>> {
        let mut client = self.pool.get()?;
        let row = client.query_opt(
            "SELECT photo_id, vector, dim, model, pretrained, created_at
             FROM embeddings WHERE photo_id = $1",
            &[&photo_id],
        )?;

        Ok(row.map(|row| {
            let vector: Vector = row.get(1);
            EmbeddingRecord {
                photo_id: row.get(0),
                vector: vector.to_vec(),
                dim: row.get::<_, i32>(2) as usize,
                model: row.get(3),
                pretrained: row.get(4),
                created_at: row.get(5),
            }
        }))
    }

    fn has_embedding(&self, photo_id: &str) -> Result<bool> {
        let mut client = self.pool.get()?;
        let row = client.query_one(
            "SELECT EXISTS(SELECT 1 FROM embeddings WHERE photo_id = $1)",
            &[&photo_id],
        )?;
        Ok(row.get(0))
    }

    fn count_embeddings(&self) -> Result<u64> {
        let mut client = self.pool.get()?;
        let row = client.query_one("SELECT COUNT(*) FROM embeddings", &[])?;
        Ok(row.get::<_, i64>(0) as u64)
    }

    fn delete_embedding(&self, photo_id: &str) -> Result<bool> {
        let mut client = self.pool.get()?;
        let deleted = client.execute("DELETE FROM embeddings WHERE photo_id = $1", &[&photo_id])?;
        Ok(deleted > 0)
    }

    fn similar_embeddings(
        &self,
        query: &[f32],
        k: usize,
        ef_search: usize,
    ) -> Result<Vec<(String, f32)>> {
        let mut client = self.pool.get()?;
        let mut tx = client.transaction()?;
        // Match the in-memory index's search depth so recall is comparable.
        tx.batch_execute(&format!("SET LOCAL hnsw.ef_search = {}", ef_search.max(k)))?;

        let query_vec = Vector::from(query.to_vec());
        let rows = tx.query(
            "SELECT photo_id, (vector <=> $1)::float8 AS distance
             FROM embeddings
             ORDER BY vector <=> $1
             LIMIT $2",
            &[&query_vec, &(k as i64)],
        )?;
        tx.commit()?;

        Ok(rows
            .iter()
            .map(|row| (row.get::<_, String>(0), row.get::<_, f64>(1) as f32))
            .collect())
    }

    fn for_each_embedding(
        &self,
        visit: &mut dyn FnMut(String, Vec<f32>) -> Result<()>,
    ) -> Result<()> {
        let mut client = self.pool.get()?;
        let mut rows = client.query_raw(
            "SELECT photo_id, vector FROM embeddings",
            std::iter::empty::<&dyn ToSql>(),
        )?;

        while let Some(row) = rows.next()? {
            let vector: Vector = row.get(1);
            visit(row.get(0), vector.to_vec())?;
        }
        Ok(())
    }

    fn max_photo_id(&self) -> Result<Option<String>> {
        let mut client = self.pool.get()?;
        let row = client.query_one("SELECT MAX(photo_id) FROM embeddings", &[])?;
        Ok(row.get(0))
    }

    fn replace_faces(&self, photo_id: &str, faces: &[NewFace]) -> Result<Vec<FaceRecord>> {
        let mut client = self.pool.get()?;
        let mut tx = client.transaction()?;

        tx.execute("DELETE FROM faces WHERE photo_id = $1", &[&photo_id])?;

        let mut inserted = Vec::with_capacity(faces.len());
        for face in faces {
            let row = tx
                .query_one(
                    r#"
                    INSERT INTO faces (photo_id, face_index, vector,
                                       bbox_x1, bbox_y1, bbox_x2, bbox_y2, det_score)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                    RETURNING id
                    "#,
                    &[
                        &photo_id,
                        &face.face_index,
                        &Vector::from(face.vector.clone()),
                        &face.bbox.x1,
                        &face.bbox.y1,
                        &face.bbox.x2,
                        &face.bbox.y2,
                        &face.det_score,
                    ],
                )
                .map_err(|e| map_insert_error(e, photo_id))?;

            inserted.push(FaceRecord {
                id: row.get(0),
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
            r#"
            INSERT INTO faces_processed (photo_id, face_count)
            VALUES ($1, $2)
            ON CONFLICT (photo_id) DO UPDATE
                SET face_count = EXCLUDED.face_count,
                    processed_at = NOW()::text
            "#,
            &[&photo_id, &(faces.len() as i64)],
        )?;

        tx.commit()?;
        Ok(inserted)
    }

    fn mark_processed(&self, photo_id: &str, face_count: i64) -> Result<()> {
        let mut client = self.pool.get()?;
        client.execute(
            r#"
            INSERT INTO faces_processed (photo_id, face_count)
            VALUES ($1, $2)
            ON CONFLICT (photo_id) DO UPDATE
                SET face_count = EXCLUDED.face_count,
                    processed_at = NOW()::text
            "#,
            &[&photo_id, &face_count],
        )?;
        Ok(())
    }

    fn processing_marker(&self, photo_id: &str) -> Result<Option<ProcessingMarker>> {
        let mut client = self.pool.get()?;
        let row = client.query_opt(
            "SELECT photo_id, face_count, processed_at FROM faces_processed WHERE photo_id = $1",
            &[&photo_id],
        )?;

        Ok(row.map(|row| ProcessingMarker {
            photo_id: row.get(0),
            face_count: row.get(1),
            processed_at: row.get(2),
        }))
    }

    fn count_processed(&self) -> Result<u64> {
        let mut client = self.pool.get()?;
        let row = client.query_one("SELECT COUNT(*) FROM faces_processed", &[])?;
        Ok(row.get::<_, i64>(0) as u64)
    }

    fn faces_by_photo(&self, photo_id: &str) -> Result<Vec<FaceRecord>> {
        let mut client = self.pool.get()?;
        let sql = format!("SELECT {FACE_COLUMNS} FROM faces WHERE photo_id = $1 ORDER BY face_index");
        let rows = client.query(sql.as_str(), &[&photo_id])?;
        Ok(rows.iter().map(row_to_face).collect())
    }

    fn faces_by_subject(&self, subject: &str) -> Result<Vec<FaceRecord>> {
        let normalized = names::normalize_subject(subject);
        let mut client = self.pool.get()?;
        let sql = format!(
            "SELECT {FACE_COLUMNS} FROM faces
             WHERE subject_norm(subject_name) = $1 ORDER BY id"
        );
        let rows = client.query(sql.as_str(), &[&normalized])?;
        Ok(rows.iter().map(row_to_face).collect())
    }

    fn update_marker(&self, photo_id: &str, face_index: i32, fields: &MarkerFields) -> Result<()> {
        let mut client = self.pool.get()?;
        let updated = client.execute(
            r#"
            UPDATE faces
            SET marker_id = $1, subject_id = $2, subject_name = $3
            WHERE photo_id = $4 AND face_index = $5
            "#,
            &[
                &fields.marker_id,
                &fields.subject_id,
                &fields.subject_name,
                &photo_id,
                &face_index,
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
        let mut client = self.pool.get()?;
        client.execute(
            r#"
            UPDATE faces
            SET photo_width = $1, photo_height = $2, orientation = $3, file_id = $4
            WHERE photo_id = $5
            "#,
            &[
                &(info.width as i32),
                &(info.height as i32),
                &(info.orientation as i32),
                &info.file_id,
                &photo_id,
            ],
        )?;
        Ok(())
    }

    fn similar_faces(
        &self,
        query: &[f32],
        k: usize,
        ef_search: usize,
        exclude_subject: Option<&str>,
    ) -> Result<Vec<FaceHit>> {
        let mut client = self.pool.get()?;
        let mut tx = client.transaction()?;
        tx.batch_execute(&format!("SET LOCAL hnsw.ef_search = {}", ef_search.max(k)))?;

        let query_vec = Vector::from(query.to_vec());
        let rows = match exclude_subject {
            Some(subject) => {
                let normalized = names::normalize_subject(subject);
                let sql = format!(
                    "SELECT {FACE_COLUMNS}, (vector <=> $1)::float8 AS distance
                     FROM faces
                     WHERE subject_name IS NULL OR subject_norm(subject_name) = $2
                     ORDER BY vector <=> $1
                     LIMIT $3"
                );
                tx.query(sql.as_str(), &[&query_vec, &normalized, &(k as i64)])?
            }
            None => {
                let sql = format!(
                    "SELECT {FACE_COLUMNS}, (vector <=> $1)::float8 AS distance
                     FROM faces
                     ORDER BY vector <=> $1
                     LIMIT $2"
                );
                tx.query(sql.as_str(), &[&query_vec, &(k as i64)])?
            }
        };
        tx.commit()?;

        Ok(rows
            .iter()
            .map(|row| {
                let face = row_to_face(row);
                FaceHit {
                    face_id: face.id,
                    distance: row.get::<_, f64>(17) as f32,
                    face,
                }
            })
            .collect())
    }

    fn for_each_face(&self, visit: &mut dyn FnMut(FaceRecord) -> Result<()>) -> Result<()> {
        let mut client = self.pool.get()?;
        let sql = format!("SELECT {FACE_COLUMNS} FROM faces ORDER BY id");
        let mut rows = client.query_raw(sql.as_str(), std::iter::empty::<&dyn ToSql>())?;

        while let Some(row) = rows.next()? {
            visit(row_to_face(&row))?;
        }
        Ok(())
    }

    fn count_faces(&self) -> Result<u64> {
        let mut client = self.pool.get()?;
        let row = client.query_one("SELECT COUNT(*) FROM faces", &[])?;
        Ok(row.get::<_, i64>(0) as u64)
    }

    fn max_face_id(&self) -> Result<i64> {
        let mut client = self.pool.get()?;
        let row = client.query_one("SELECT COALESCE(MAX(id), 0) FROM faces", &[])?;
        Ok(row.get(0))
    }

    fn delete_faces_by_photo(&self, photo_id: &str) -> Result<Vec<i64>> {
        let mut client = self.pool.get()?;
        let mut tx = client.transaction()?;

        let rows = tx.query(
            "DELETE FROM faces WHERE photo_id = $1 RETURNING id",
            &[&photo_id],
        )?;
        tx.execute(
            "DELETE FROM faces_processed WHERE photo_id = $1",
            &[&photo_id],
        )?;
        tx.commit()?;

        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    fn known_photo_ids(&self) -> Result<Vec<String>> {
        let mut client = self.pool.get()?;
        let rows = client.query(
            "SELECT photo_id FROM faces_processed
             UNION
             SELECT photo_id FROM embeddings
             ORDER BY photo_id",
            &[],
        )?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }
}
