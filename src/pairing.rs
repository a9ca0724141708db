//! Face pairing and action classification.
//!
//! Joins internally-detected faces with externally-owned markers on the
//! same photo via IoU in display-relative space, then classifies what a
//! recognition result means for each face. Classification is pure: it
//! never mutates library-service state; applying an action is the
//! adapter's call into the library client.

use serde::{Deserialize, Serialize};

use crate::geometry::{self, RelBox};
use crate::names;
use crate::pls::Marker;
use crate::store::{FaceRecord, MarkerFields, PhotoInfo};

/// What applying a recognition result to a face would do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchAction {
    /// Paired marker already carries the target subject.
    AlreadyDone,
    /// Paired marker exists but has no subject yet.
    AssignPerson,
    /// No marker covers this face; one would be created.
    CreateMarker,
    /// Marker assigned to the subject with no supporting face; the
    /// assignment would be cleared.
    UnassignPerson,
}

impl MatchAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchAction::AlreadyDone => "already_done",
            MatchAction::AssignPerson => "assign_person",
            MatchAction::CreateMarker => "create_marker",
            MatchAction::UnassignPerson => "unassign_person",
        }
    }
}

/// An internal face paired with at most one marker.
#[derive(Debug, Clone)]
pub struct FacePair {
    pub face_index: i32,
    pub face_box: RelBox,
    pub marker: Option<Marker>,
    pub iou: f64,
}

/// A marker no internal face claimed. Emitted with synthetic face
/// indexes -1, -2, … so downstream reports can reference them.
#[derive(Debug, Clone)]
pub struct UnmatchedMarker {
    pub face_index: i32,
    pub marker: Marker,
}

#[derive(Debug, Clone, Default)]
pub struct FacePairing {
    pub pairs: Vec<FacePair>,
    pub unmatched_markers: Vec<UnmatchedMarker>,
}

impl FacePairing {
    /// The marker paired with a given internal face index, if any.
    pub fn marker_for(&self, face_index: i32) -> Option<&Marker> {
        self.pairs
            .iter()
            .find(|p| p.face_index == face_index)
            .and_then(|p| p.marker.as_ref())
    }

    /// Cached fields a face row should carry after this pairing.
    pub fn marker_fields_for(&self, face_index: i32) -> MarkerFields {
        match self.marker_for(face_index) {
            Some(marker) => MarkerFields {
                marker_id: Some(marker.id.clone()),
                subject_id: marker.subject_id.clone(),
                subject_name: marker.subject_name.clone(),
            },
            None => MarkerFields::default(),
        }
    }
}

/// Pair internal faces (display-relative boxes) with markers.
///
/// A pair requires IoU ≥ `iou_threshold`; the threshold is deliberately
/// low because the two detectors locate the face consistently but
/// disagree on box tightness. Among competing candidates the highest IoU
/// wins, ties go to the lower face index.
pub fn pair_boxes(
    faces: &[(i32, RelBox)],
    markers: &[Marker],
    iou_threshold: f64,
) -> FacePairing {
    // Candidate edges above the threshold, best first.
    let mut candidates: Vec<(usize, usize, f64)> = Vec::new();
    for (face_pos, (_, face_box)) in faces.iter().enumerate() {
        for (marker_pos, marker) in markers.iter().enumerate() {
            let iou = geometry::iou(face_box, &marker.rel_box());
            if iou >= iou_threshold {
                candidates.push((face_pos, marker_pos, iou));
            }
        }
    }
    candidates.sort_by(|a, b| {
        b.2.partial_cmp(&a.2)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| faces[a.0].0.cmp(&faces[b.0].0))
            .then_with(|| a.1.cmp(&b.1))
    });

    let mut face_taken = vec![false; faces.len()];
    let mut marker_taken = vec![false; markers.len()];
    let mut chosen: Vec<Option<(usize, f64)>> = vec![None; faces.len()];

    for (face_pos, marker_pos, iou) in candidates {
        if face_taken[face_pos] || marker_taken[marker_pos] {
            continue;
        }
        face_taken[face_pos] = true;
        marker_taken[marker_pos] = true;
        chosen[face_pos] = Some((marker_pos, iou));
    }

    let pairs = faces
        .iter()
        .enumerate()
        .map(|(face_pos, (face_index, face_box))| match chosen[face_pos] {
            Some((marker_pos, iou)) => FacePair {
                face_index: *face_index,
                face_box: *face_box,
                marker: Some(markers[marker_pos].clone()),
                iou,
            },
            None => FacePair {
                face_index: *face_index,
                face_box: *face_box,
                marker: None,
                iou: 0.0,
            },
        })
        .collect();

    let mut synthetic = -1;
    let unmatched_markers = markers
        .iter()
        .enumerate()
        .filter(|(marker_pos, _)| !marker_taken[*marker_pos])
        .map(|(_, marker)| {
            let entry = UnmatchedMarker {
                face_index: synthetic,
                marker: marker.clone(),
            };
            synthetic -= 1;
            entry
        })
        .collect();

    FacePairing {
        pairs,
        unmatched_markers,
    }
}

/// Pair stored face rows with markers, converting pixel boxes through the
/// photo's display dimensions.
pub fn pair_photo_faces(
    faces: &[FaceRecord],
    markers: &[Marker],
    info: &PhotoInfo,
    iou_threshold: f64,
) -> FacePairing {
    let (dw, dh) = geometry::display_dimensions(info.width, info.height, info.orientation);
    let boxes: Vec<(i32, RelBox)> = faces
        .iter()
        .map(|face| (face.face_index, face.bbox.to_relative(dw, dh)))
        .collect();
    pair_boxes(&boxes, markers, iou_threshold)
}

/// Classify what assigning `subject` to a face would mean, given the
/// face's paired marker. `None` means the face is excluded from results
/// (its marker already belongs to someone else).
pub fn classify_action(marker: Option<&Marker>, subject: &str) -> Option<MatchAction> {
    match marker {
        Some(marker) if marker.has_subject() => {
            let marker_subject = marker.subject_name.as_deref().unwrap_or_default();
            if names::same_subject(marker_subject, subject) {
                Some(MatchAction::AlreadyDone)
            } else {
                None
            }
        }
        Some(_) => Some(MatchAction::AssignPerson),
        None => Some(MatchAction::CreateMarker),
    }
}

/// Same classification over the cached marker fields of a face row.
pub fn classify_cached(face: &FaceRecord, normalized_subject: &str) -> Option<MatchAction> {
    match (&face.marker_id, face.normalized_subject()) {
        (Some(_), Some(assigned)) => {
            if assigned == normalized_subject {
                Some(MatchAction::AlreadyDone)
            } else {
                None
            }
        }
        (Some(_), None) => Some(MatchAction::AssignPerson),
        (None, _) => Some(MatchAction::CreateMarker),
    }
}
