//! Face match: find faces across the library that belong to a subject.

use serde::Serialize;
use std::collections::HashMap;

use crate::config::MatchingConfig;
use crate::error::Result;
use crate::geometry::{self, PixelBox, RelBox};
use crate::names;
use crate::pairing::{classify_cached, MatchAction};
use crate::store::{FaceRecord, VectorStore};

#[derive(Debug, Clone)]
pub struct FaceMatchOptions {
    /// Maximum candidates returned.
    pub limit: usize,
    /// Cosine distance ceiling for a candidate.
    pub threshold: f32,
    /// Per-source ANN queries ask for `limit × overfetch` neighbors.
    pub overfetch: usize,
    /// Fraction of source faces that must hit a candidate (the "10%
    /// rule"); the floor is always one hit.
    pub consistency_fraction: f64,
}

impl FaceMatchOptions {
    pub fn from_config(config: &MatchingConfig) -> Self {
        Self {
            limit: 50,
            threshold: config.face_match_threshold,
            overfetch: config.face_match_overfetch.max(1),
            consistency_fraction: config.subject_consistency_fraction,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FaceMatchCandidate {
    pub face_id: i64,
    pub photo_id: String,
    pub file_id: Option<String>,
    pub face_index: i32,
    /// Minimum cosine distance to any source face.
    pub distance: f32,
    pub bbox_px: PixelBox,
    pub bbox_rel: Option<RelBox>,
    pub marker_id: Option<String>,
    pub subject_id: Option<String>,
    pub subject_name: Option<String>,
    pub action: MatchAction,
    /// How many source faces hit this candidate.
    pub hits: usize,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ActionCounts {
    pub already_done: usize,
    pub assign_person: usize,
    pub create_marker: usize,
}

impl ActionCounts {
    fn bump(&mut self, action: MatchAction) {
        match action {
            MatchAction::AlreadyDone => self.already_done += 1,
            MatchAction::AssignPerson => self.assign_person += 1,
            MatchAction::CreateMarker => self.create_marker += 1,
            MatchAction::UnassignPerson => {}
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FaceMatchResult {
    pub subject: String,
    pub source_faces: usize,
    /// Candidates hit by fewer sources than this were suppressed.
    pub min_hits: usize,
    pub candidates: Vec<FaceMatchCandidate>,
    pub counts: ActionCounts,
}

fn candidate_from(face: &FaceRecord, distance: f32, hits: usize, action: MatchAction) -> FaceMatchCandidate {
    FaceMatchCandidate {
        face_id: face.id,
        photo_id: face.photo_id.clone(),
        file_id: face.file_id.clone(),
        face_index: face.face_index,
        distance,
        bbox_px: face.bbox,
        bbox_rel: face.relative_bbox(),
        marker_id: face.marker_id.clone(),
        subject_id: face.subject_id.clone(),
        subject_name: face.subject_name.clone(),
        action,
        hits,
    }
}

/// Find faces matching a subject.
///
/// Every face already assigned to the subject queries the face ANN; a
/// candidate survives when enough distinct sources hit it (the
/// consistency rule suppresses single-photo false positives), it sits
/// within the distance threshold, and its cached marker state does not
/// assign it to someone else.
pub fn match_faces(
    store: &VectorStore,
    subject: &str,
    options: &FaceMatchOptions,
) -> Result<FaceMatchResult> {
    let normalized = names::normalize_subject(subject);
    let sources = store.faces_by_subject(subject)?;

    let mut result = FaceMatchResult {
        subject: normalized.clone(),
        source_faces: sources.len(),
        min_hits: 0,
        candidates: Vec::new(),
        counts: ActionCounts::default(),
    };
    if sources.is_empty() {
        return Ok(result);
    }

    let fetch_k = options.limit.max(1) * options.overfetch;
    let mut accumulated: HashMap<i64, (usize, f32, FaceRecord)> = HashMap::new();

    for source in &sources {
        let hits = store.find_similar_faces(&source.vector, fetch_k, Some(subject))?;
        for hit in hits {
            if hit.distance > options.threshold {
                continue;
            }
            // A source trivially matches itself; that says nothing about
            // consistency.
            if hit.face_id == source.id {
                continue;
            }
            accumulated
                .entry(hit.face_id)
                .and_modify(|(count, best, _)| {
                    *count += 1;
                    if hit.distance < *best {
                        *best = hit.distance;
                    }
                })
                .or_insert((1, hit.distance, hit.face));
        }
    }

    let min_hits = ((options.consistency_fraction * sources.len() as f64).ceil() as usize).max(1);
    result.min_hits = min_hits;

    let mut candidates: Vec<FaceMatchCandidate> = accumulated
        .into_values()
        .filter(|(hits, _, _)| *hits >= min_hits)
        .filter_map(|(hits, distance, face)| {
            // Cached subject equal to ours means already done; a different
            // subject was dropped at the store already, and this keeps the
            // database fallback honest too.
            classify_cached(&face, &normalized)
                .map(|action| candidate_from(&face, distance, hits, action))
        })
        .collect();

    candidates.sort_by(|a, b| {
        a.distance
            .partial_cmp(&b.distance)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.face_id.cmp(&b.face_id))
    });
    candidates.truncate(options.limit);

    for candidate in &candidates {
        result.counts.bump(candidate.action);
    }
    result.candidates = candidates;
    Ok(result)
}

/// One face of a photo for detail inspection. The minimum-size filter is
/// NOT applied here; `below_min_size` flags faces the matching paths
/// would have dropped so the caller can surface a warning.
#[derive(Debug, Clone, Serialize)]
pub struct PhotoFaceDetail {
    pub face_id: i64,
    pub face_index: i32,
    pub det_score: f32,
    pub bbox_px: PixelBox,
    pub bbox_rel: Option<RelBox>,
    pub marker_id: Option<String>,
    pub subject_id: Option<String>,
    pub subject_name: Option<String>,
    pub below_min_size: bool,
}

/// Unfiltered face listing for a photo.
pub fn photo_faces(
    store: &VectorStore,
    matching: &MatchingConfig,
    photo_id: &str,
) -> Result<Vec<PhotoFaceDetail>> {
    let faces = store.faces_by_photo(photo_id)?;
    Ok(faces
        .iter()
        .map(|face| {
            let below_min_size = match (face.photo_width, face.photo_height) {
                (Some(width), Some(height)) => {
                    let (display_width, _) = geometry::display_dimensions(
                        width,
                        height,
                        face.orientation.unwrap_or(1),
                    );
                    let min_width = matching
                        .min_face_px
                        .max(matching.min_face_rel * display_width as f64);
                    face.bbox.width() < min_width
                }
                _ => false,
            };
            PhotoFaceDetail {
                face_id: face.id,
                face_index: face.face_index,
                det_score: face.det_score,
                bbox_px: face.bbox,
                bbox_rel: face.relative_bbox(),
                marker_id: face.marker_id.clone(),
                subject_id: face.subject_id.clone(),
                subject_name: face.subject_name.clone(),
                below_min_size,
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::store::{MarkerFields, NewFace, SqliteStore};
    use crate::testutil::face_vec;
    use std::sync::Arc;

    fn test_store() -> VectorStore {
        let backend = Arc::new(SqliteStore::open_in_memory().unwrap());
        let config = Config::default();
        let store = VectorStore::new(backend, &config);
        store.initialize().unwrap();
        store
    }

    fn seed_face(store: &VectorStore, photo_id: &str, axis: usize) -> FaceRecord {
        store
            .put_faces(
                photo_id,
                &[NewFace {
                    face_index: 0,
                    vector: face_vec(axis),
                    bbox: crate::geometry::PixelBox::new(10.0, 10.0, 110.0, 120.0),
                    det_score: 0.95,
                }],
            )
            .unwrap()
            .remove(0)
    }

    fn assign(store: &VectorStore, face: &FaceRecord, marker_id: &str, subject: Option<&str>) {
        store
            .update_marker(
                face,
                &MarkerFields {
                    marker_id: Some(marker_id.to_string()),
                    subject_id: subject.map(|s| format!("subj-{s}")),
                    subject_name: subject.map(str::to_string),
                },
            )
            .unwrap();
    }

    fn options() -> FaceMatchOptions {
        FaceMatchOptions::from_config(&Config::default().matching)
    }

    #[test]
    fn test_assign_by_match() {
        let store = test_store();
        // p1 and p2 carry identical face vectors; p1 is assigned to anna,
        // p2 has an unassigned marker over its face.
        let f1 = seed_face(&store, "p1", 0);
        let f2 = seed_face(&store, "p2", 0);
        assign(&store, &f1, "m1", Some("anna"));
        assign(&store, &f2, "m2", None);

        let result = match_faces(&store, "anna", &options()).unwrap();
        assert_eq!(result.source_faces, 1);
        assert_eq!(result.min_hits, 1);

        let candidate = result
            .candidates
            .iter()
            .find(|c| c.photo_id == "p2")
            .expect("p2 must match");
        assert_eq!(candidate.action, MatchAction::AssignPerson);
        assert!(candidate.distance.abs() < 1e-6);
        assert_eq!(candidate.marker_id.as_deref(), Some("m2"));
        assert_eq!(result.counts.assign_person, 1);
    }

    #[test]
    fn test_markerless_face_gets_create_marker() {
        let store = test_store();
        let f1 = seed_face(&store, "p1", 0);
        seed_face(&store, "p2", 0); // no marker at all
        assign(&store, &f1, "m1", Some("anna"));

        let result = match_faces(&store, "anna", &options()).unwrap();
        let candidate = result
            .candidates
            .iter()
            .find(|c| c.photo_id == "p2")
            .expect("p2 must match");
        assert_eq!(candidate.action, MatchAction::CreateMarker);
        assert_eq!(result.counts.create_marker, 1);
    }

    #[test]
    fn test_other_subject_candidates_are_dropped() {
        let store = test_store();
        let f1 = seed_face(&store, "p1", 0);
        let f2 = seed_face(&store, "p2", 0);
        assign(&store, &f1, "m1", Some("anna"));
        assign(&store, &f2, "m2", Some("berta"));

        let result = match_faces(&store, "anna", &options()).unwrap();
        assert!(result.candidates.iter().all(|c| c.photo_id != "p2"));
    }

    #[test]
    fn test_consistency_rule_suppresses_single_source_hits() {
        let store = test_store();
        // Eleven sources share one vector; a twelfth source sits alone in
        // another cluster. min_hits = ceil(0.1 * 12) = 2.
        for n in 0..11 {
            let face = seed_face(&store, &format!("pa{n}"), 0);
            assign(&store, &face, &format!("ma{n}"), Some("anna"));
        }
        let lone_source = seed_face(&store, "pa11", 1);
        assign(&store, &lone_source, "ma11", Some("anna"));

        // Candidate matching only the lone source.
        seed_face(&store, "weak", 1);
        // Candidate matching the big cluster.
        seed_face(&store, "strong", 0);

        let result = match_faces(&store, "anna", &options()).unwrap();
        assert_eq!(result.min_hits, 2);
        assert!(result.candidates.iter().any(|c| c.photo_id == "strong"));
        assert!(result.candidates.iter().all(|c| c.photo_id != "weak"));
    }

    #[test]
    fn test_same_subject_candidates_marked_already_done() {
        let store = test_store();
        for n in 0..3 {
            let face = seed_face(&store, &format!("p{n}"), 0);
            assign(&store, &face, &format!("m{n}"), Some("anna"));
        }

        let result = match_faces(&store, "anna", &options()).unwrap();
        assert_eq!(result.counts.already_done, 3);
        assert!(result
            .candidates
            .iter()
            .all(|c| c.action == MatchAction::AlreadyDone));
    }

    #[test]
    fn test_unknown_subject_is_empty() {
        let store = test_store();
        let result = match_faces(&store, "nobody", &options()).unwrap();
        assert_eq!(result.source_faces, 0);
        assert!(result.candidates.is_empty());
    }

    #[test]
    fn test_photo_faces_reports_below_min_size_without_filtering() {
        let store = test_store();
        let config = Config::default();
        let rows = store
            .put_faces(
                "p1",
                &[
                    NewFace {
                        face_index: 0,
                        vector: face_vec(0),
                        bbox: crate::geometry::PixelBox::new(0.0, 0.0, 20.0, 22.0),
                        det_score: 0.9,
                    },
                    NewFace {
                        face_index: 1,
                        vector: face_vec(1),
                        bbox: crate::geometry::PixelBox::new(100.0, 100.0, 200.0, 210.0),
                        det_score: 0.9,
                    },
                ],
            )
            .unwrap();
        store
            .update_photo_info(
                "p1",
                &crate::store::PhotoInfo {
                    width: 1000,
                    height: 800,
                    orientation: 1,
                    file_id: "f1".into(),
                },
            )
            .unwrap();
        let _ = rows;

        let details = photo_faces(&store, &config.matching, "p1").unwrap();
        assert_eq!(details.len(), 2);
        assert!(details[0].below_min_size);
        assert!(!details[1].below_min_size);
    }
}
