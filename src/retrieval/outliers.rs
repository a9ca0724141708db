//! Person-outlier detection.
//!
//! Distance from the subject's centroid exposes misassigned faces; the
//! companion "missing embeddings" report lists markers assigned to the
//! subject that no stored face supports, which usually means the marker
//! was drawn on a face the detector filtered or never saw.

use serde::Serialize;

use crate::error::Result;
use crate::geometry::{PixelBox, RelBox};
use crate::names;
use crate::pairing::MatchAction;
use crate::pls::PhotoLibrary;
use crate::store::VectorStore;
use crate::vector::{centroid, cosine_distance};

#[derive(Debug, Clone)]
pub struct OutlierOptions {
    /// Minimum centroid distance to report.
    pub threshold: f32,
    pub limit: usize,
}

impl Default for OutlierOptions {
    fn default() -> Self {
        Self {
            threshold: 0.0,
            limit: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Outlier {
    pub face_id: i64,
    pub photo_id: String,
    pub file_id: Option<String>,
    pub face_index: i32,
    /// Cosine distance from the subject centroid.
    pub dist: f32,
    pub bbox_px: PixelBox,
    pub bbox_rel: Option<RelBox>,
    pub marker_id: Option<String>,
    pub subject_name: Option<String>,
}

/// A marker assigned to the subject with no supporting stored face.
/// Reported with the sentinel face index −1 and distance −1; actionable
/// as `unassign_person`.
#[derive(Debug, Clone, Serialize)]
pub struct MissingEmbedding {
    pub photo_id: String,
    pub marker_id: String,
    pub subject_name: Option<String>,
    pub face_index: i32,
    pub dist: f32,
    pub action: MatchAction,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutlierReport {
    pub subject: String,
    pub source_faces: usize,
    pub outliers: Vec<Outlier>,
    pub missing: Vec<MissingEmbedding>,
}

pub fn detect_outliers(
    store: &VectorStore,
    library: &dyn PhotoLibrary,
    subject: &str,
    options: &OutlierOptions,
) -> Result<OutlierReport> {
    let normalized = names::normalize_subject(subject);
    let faces = store.faces_by_subject(subject)?;

    let mut report = OutlierReport {
        subject: normalized.clone(),
        source_faces: faces.len(),
        outliers: Vec::new(),
        missing: Vec::new(),
    };

    if let Some(center) = centroid(faces.iter().map(|f| f.vector.as_slice())) {
        let mut outliers: Vec<Outlier> = faces
            .iter()
            .map(|face| Outlier {
                face_id: face.id,
                photo_id: face.photo_id.clone(),
                file_id: face.file_id.clone(),
                face_index: face.face_index,
                dist: cosine_distance(&face.vector, &center),
                bbox_px: face.bbox,
                bbox_rel: face.relative_bbox(),
                marker_id: face.marker_id.clone(),
                subject_name: face.subject_name.clone(),
            })
            .filter(|outlier| outlier.dist >= options.threshold)
            .collect();

        outliers.sort_by(|a, b| {
            b.dist
                .partial_cmp(&a.dist)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        outliers.truncate(options.limit);
        report.outliers = outliers;
    }

    // Markers assigned to the subject whose photo has internal faces but
    // none paired to that marker.
    for photo_id in library.photos_with_subject(&normalized)? {
        let stored = store.faces_by_photo(&photo_id)?;
        if stored.is_empty() {
            continue;
        }
        for marker in library.markers(&photo_id)? {
            let marker_subject = marker
                .subject_name
                .as_deref()
                .map(names::normalize_subject);
            if marker_subject.as_deref() != Some(normalized.as_str()) {
                continue;
            }
            let supported = stored
                .iter()
                .any(|face| face.marker_id.as_deref() == Some(marker.id.as_str()));
            if !supported {
                report.missing.push(MissingEmbedding {
                    photo_id: photo_id.clone(),
                    marker_id: marker.id.clone(),
                    subject_name: marker.subject_name.clone(),
                    face_index: -1,
                    dist: -1.0,
                    action: MatchAction::UnassignPerson,
                });
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::geometry::RelBox;
    use crate::store::{MarkerFields, NewFace, SqliteStore};
    use crate::testutil::{face_vec, FakeLibrary};
    use crate::vector::{l2_normalized, FACE_DIM};
    use std::sync::Arc;

    fn test_store() -> VectorStore {
        let backend = Arc::new(SqliteStore::open_in_memory().unwrap());
        let store = VectorStore::new(backend, &Config::default());
        store.initialize().unwrap();
        store
    }

    fn seed_assigned_face(
        store: &VectorStore,
        photo_id: &str,
        vector: Vec<f32>,
        marker_id: &str,
        subject: &str,
    ) {
        let rows = store
            .put_faces(
                photo_id,
                &[NewFace {
                    face_index: 0,
                    vector,
                    bbox: crate::geometry::PixelBox::new(10.0, 10.0, 110.0, 120.0),
                    det_score: 0.95,
                }],
            )
            .unwrap();
        store
            .update_marker(
                &rows[0],
                &MarkerFields {
                    marker_id: Some(marker_id.to_string()),
                    subject_id: None,
                    subject_name: Some(subject.to_string()),
                },
            )
            .unwrap();
    }

    /// A vector close to axis 0 but tilted toward `axis`.
    fn near(axis: usize, weight: f32) -> Vec<f32> {
        let mut v = vec![0.0; FACE_DIM];
        v[0] = 1.0;
        v[axis] = weight;
        l2_normalized(v)
    }

    #[test]
    fn test_outlier_detection_finds_the_stray() {
        let store = test_store();
        let library = FakeLibrary::new();

        // Four tightly clustered faces plus one orthogonal stray.
        for n in 0..4 {
            seed_assigned_face(
                &store,
                &format!("p{n}"),
                near(n + 1, 0.05),
                &format!("m{n}"),
                "anna",
            );
        }
        seed_assigned_face(&store, "stray", face_vec(10), "m-stray", "anna");

        let report = detect_outliers(
            &store,
            &library,
            "anna",
            &OutlierOptions {
                threshold: 0.0,
                limit: 1,
            },
        )
        .unwrap();

        assert_eq!(report.source_faces, 5);
        assert_eq!(report.outliers.len(), 1);
        assert_eq!(report.outliers[0].photo_id, "stray");
        // The stray is nearly orthogonal to the centroid.
        assert!(report.outliers[0].dist > 0.5);
    }

    #[test]
    fn test_outliers_sorted_descending() {
        let store = test_store();
        let library = FakeLibrary::new();

        seed_assigned_face(&store, "a", near(1, 0.02), "ma", "anna");
        seed_assigned_face(&store, "b", near(2, 0.4), "mb", "anna");
        seed_assigned_face(&store, "c", face_vec(9), "mc", "anna");

        let report =
            detect_outliers(&store, &library, "anna", &OutlierOptions::default()).unwrap();
        let dists: Vec<f32> = report.outliers.iter().map(|o| o.dist).collect();
        assert!(dists.windows(2).all(|w| w[0] >= w[1]));
        assert_eq!(report.outliers[0].photo_id, "c");
    }

    #[test]
    fn test_missing_embeddings_reported_with_sentinels() {
        let store = test_store();
        let library = FakeLibrary::new();

        // The photo has one stored face paired to its own marker, plus a
        // second upstream marker for anna that nothing supports.
        library.add_photo("p1", 1000, 800, 1);
        let supported =
            library.add_marker("p1", RelBox::new(0.1, 0.1, 0.1, 0.15), Some("anna"));
        let unsupported =
            library.add_marker("p1", RelBox::new(0.6, 0.6, 0.1, 0.15), Some("anna"));
        seed_assigned_face(&store, "p1", face_vec(0), &supported, "anna");

        let report =
            detect_outliers(&store, &library, "anna", &OutlierOptions::default()).unwrap();
        assert_eq!(report.missing.len(), 1);
        let missing = &report.missing[0];
        assert_eq!(missing.marker_id, unsupported);
        assert_eq!(missing.face_index, -1);
        assert_eq!(missing.dist, -1.0);
        assert_eq!(missing.action, MatchAction::UnassignPerson);
    }

    #[test]
    fn test_photo_without_stored_faces_not_reported_missing() {
        let store = test_store();
        let library = FakeLibrary::new();

        // Marker for anna on a photo with no internal faces at all; the
        // detector never ran or found nothing, so nothing to unassign.
        library.add_photo("p1", 1000, 800, 1);
        library.add_marker("p1", RelBox::new(0.1, 0.1, 0.1, 0.15), Some("anna"));

        let report =
            detect_outliers(&store, &library, "anna", &OutlierOptions::default()).unwrap();
        assert!(report.missing.is_empty());
    }
}
