//! Row types owned by the persistent vector store.

use serde::{Deserialize, Serialize};

use crate::geometry::{self, PixelBox, RelBox};
use crate::names;

/// Image embedding row, keyed by the library service's photo id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub photo_id: String,
    /// 768-dim, L2-normalized.
    pub vector: Vec<f32>,
    pub model: String,
    pub pretrained: String,
    pub dim: usize,
    pub created_at: Option<String>,
}

/// A face as returned by the embedding service, before it has a row id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewFace {
    /// Position within the photo's face list; unique per photo.
    pub face_index: i32,
    /// 512-dim, L2-normalized.
    pub vector: Vec<f32>,
    /// Pixel corners in display space.
    pub bbox: PixelBox,
    /// Detection confidence in [0, 1].
    pub det_score: f32,
}

/// Cached library-service fields on a face row. These are the only face
/// fields the synchronizer and the pairing step may mutate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerFields {
    pub marker_id: Option<String>,
    pub subject_id: Option<String>,
    pub subject_name: Option<String>,
}

/// Dimensions and file identity of the parent photo as reported by the
/// library service (raw file dimensions, EXIF orientation tag).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhotoInfo {
    pub width: u32,
    pub height: u32,
    pub orientation: u8,
    pub file_id: String,
}

/// A persisted face detection with its cached library-service metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceRecord {
    pub id: i64,
    pub photo_id: String,
    pub face_index: i32,
    pub vector: Vec<f32>,
    pub bbox: PixelBox,
    pub det_score: f32,

    pub marker_id: Option<String>,
    pub subject_id: Option<String>,
    pub subject_name: Option<String>,

    pub photo_width: Option<u32>,
    pub photo_height: Option<u32>,
    pub orientation: Option<u8>,
    pub file_id: Option<String>,

    pub created_at: Option<String>,
}

impl FaceRecord {
    pub fn marker_fields(&self) -> MarkerFields {
        MarkerFields {
            marker_id: self.marker_id.clone(),
            subject_id: self.subject_id.clone(),
            subject_name: self.subject_name.clone(),
        }
    }

    pub fn set_marker_fields(&mut self, fields: &MarkerFields) {
        self.marker_id = fields.marker_id.clone();
        self.subject_id = fields.subject_id.clone();
        self.subject_name = fields.subject_name.clone();
    }

    pub fn set_photo_info(&mut self, info: &PhotoInfo) {
        self.photo_width = Some(info.width);
        self.photo_height = Some(info.height);
        self.orientation = Some(info.orientation);
        self.file_id = Some(info.file_id.clone());
    }

    /// Display-space dimensions of the parent photo, if known.
    pub fn display_dimensions(&self) -> Option<(u32, u32)> {
        let width = self.photo_width?;
        let height = self.photo_height?;
        Some(geometry::display_dimensions(
            width,
            height,
            self.orientation.unwrap_or(1),
        ))
    }

    /// The face box as a display-relative rectangle, if the photo
    /// dimensions are cached.
    pub fn relative_bbox(&self) -> Option<RelBox> {
        let (dw, dh) = self.display_dimensions()?;
        Some(self.bbox.to_relative(dw, dh))
    }

    /// Canonical form of the cached subject name, if any.
    pub fn normalized_subject(&self) -> Option<String> {
        self.subject_name
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(names::normalize_subject)
    }
}

/// "Ingestion complete" marker for a photo.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingMarker {
    pub photo_id: String,
    pub face_count: i64,
    pub processed_at: Option<String>,
}

/// A face similarity hit with the full source row.
#[derive(Debug, Clone)]
pub struct FaceHit {
    pub face_id: i64,
    pub distance: f32,
    pub face: FaceRecord,
}

/// Store-wide row counts for stats and dashboards.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StoreStats {
    pub embeddings: u64,
    pub faces: u64,
    pub processed_photos: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face_with_orientation(orientation: Option<u8>) -> FaceRecord {
        FaceRecord {
            id: 1,
            photo_id: "p1".into(),
            face_index: 0,
            vector: vec![1.0, 0.0],
            bbox: PixelBox::new(100.0, 100.0, 200.0, 220.0),
            det_score: 0.98,
            marker_id: None,
            subject_id: None,
            subject_name: None,
            photo_width: Some(1200),
            photo_height: Some(1600),
            orientation,
            file_id: None,
            created_at: None,
        }
    }

    #[test]
    fn test_display_dimensions_follow_orientation() {
        assert_eq!(
            face_with_orientation(Some(1)).display_dimensions(),
            Some((1200, 1600))
        );
        assert_eq!(
            face_with_orientation(Some(6)).display_dimensions(),
            Some((1600, 1200))
        );
        // Missing orientation behaves like the normal tag.
        assert_eq!(
            face_with_orientation(None).display_dimensions(),
            Some((1200, 1600))
        );
    }

    #[test]
    fn test_relative_bbox_uses_display_space() {
        let face = face_with_orientation(Some(6));
        let rel = face.relative_bbox().unwrap();
        assert!((rel.x - 100.0 / 1600.0).abs() < 1e-9);
        assert!((rel.y - 100.0 / 1200.0).abs() < 1e-9);
    }

    #[test]
    fn test_normalized_subject_skips_empty() {
        let mut face = face_with_orientation(None);
        face.subject_name = Some("".into());
        assert_eq!(face.normalized_subject(), None);
        face.subject_name = Some("Anna Nováková".into());
        assert_eq!(face.normalized_subject().as_deref(), Some("anna novakova"));
    }
}
