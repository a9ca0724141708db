//! In-memory fakes for the external collaborators, shared by the ingest,
//! sync and retrieval tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::embedder::{DetectedFace, EmbeddingService, ImageEmbedding};
use crate::error::{Error, Result};
use crate::geometry::RelBox;
use crate::names;
use crate::pls::{Album, Marker, PhotoDetails, PhotoLibrary, PhotoSummary};

pub fn unit(dim: usize, axis: usize) -> Vec<f32> {
    let mut v = vec![0.0; dim];
    v[axis % dim] = 1.0;
    v
}

pub fn image_vec(axis: usize) -> Vec<f32> {
    unit(crate::vector::IMAGE_DIM, axis)
}

pub fn face_vec(axis: usize) -> Vec<f32> {
    unit(crate::vector::FACE_DIM, axis)
}

/// A library photo as the fake serves it.
#[derive(Clone)]
pub struct FakePhoto {
    pub details: PhotoDetails,
}

/// In-memory photo library. `photo_bytes` returns the photo id as bytes
/// so the fake embedder can key its responses off them.
#[derive(Default)]
pub struct FakeLibrary {
    pub photos: Mutex<HashMap<String, FakePhoto>>,
    pub order: Mutex<Vec<String>>,
    pub albums: Mutex<Vec<(Album, Vec<String>)>>,
    pub created_markers: Mutex<Vec<(String, RelBox, String)>>,
    marker_seq: AtomicU64,
}

impl FakeLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_photo(&self, id: &str, width: u32, height: u32, orientation: u8) {
        let details = PhotoDetails {
            id: id.to_string(),
            file_id: format!("file-{id}"),
            width,
            height,
            orientation,
            deleted_at: None,
            markers: Vec::new(),
        };
        self.photos
            .lock()
            .unwrap()
            .insert(id.to_string(), FakePhoto { details });
        self.order.lock().unwrap().push(id.to_string());
    }

    pub fn add_marker(&self, photo_id: &str, bbox: RelBox, subject: Option<&str>) -> String {
        let marker_id = format!("marker-{}", self.marker_seq.fetch_add(1, Ordering::SeqCst) + 1);
        let marker = Marker {
            id: marker_id.clone(),
            x: bbox.x,
            y: bbox.y,
            w: bbox.w,
            h: bbox.h,
            subject_id: subject.map(|s| format!("subj-{s}")),
            subject_name: subject.map(str::to_string),
        };
        self.photos
            .lock()
            .unwrap()
            .get_mut(photo_id)
            .expect("unknown photo in fake")
            .details
            .markers
            .push(marker);
        marker_id
    }

    pub fn mark_deleted(&self, photo_id: &str) {
        if let Some(photo) = self.photos.lock().unwrap().get_mut(photo_id) {
            photo.details.deleted_at = Some("2024-03-01T10:00:00Z".to_string());
        }
    }

    pub fn remove_photo(&self, photo_id: &str) {
        self.photos.lock().unwrap().remove(photo_id);
        self.order.lock().unwrap().retain(|id| id != photo_id);
    }

    pub fn add_album(&self, id: &str, title: &str, photo_ids: &[&str]) {
        self.albums.lock().unwrap().push((
            Album {
                id: id.to_string(),
                title: title.to_string(),
            },
            photo_ids.iter().map(|s| s.to_string()).collect(),
        ));
    }
}

impl PhotoLibrary for FakeLibrary {
    fn photo_page(&self, offset: usize, limit: usize) -> Result<Vec<PhotoSummary>> {
        let order = self.order.lock().unwrap();
        Ok(order
            .iter()
            .skip(offset)
            .take(limit)
            .map(|id| PhotoSummary { id: id.clone() })
            .collect())
    }

    fn photo_bytes(&self, photo_id: &str, _size_px: u32) -> Result<Vec<u8>> {
        let photos = self.photos.lock().unwrap();
        if !photos.contains_key(photo_id) {
            return Err(Error::not_found(format!("photo {photo_id}")));
        }
        Ok(photo_id.as_bytes().to_vec())
    }

    fn photo_details(&self, photo_id: &str) -> Result<PhotoDetails> {
        self.photos
            .lock()
            .unwrap()
            .get(photo_id)
            .map(|p| p.details.clone())
            .ok_or_else(|| Error::not_found(format!("photo {photo_id}")))
    }

    fn markers(&self, photo_id: &str) -> Result<Vec<Marker>> {
        Ok(self.photo_details(photo_id)?.markers)
    }

    fn create_marker(&self, file_id: &str, bbox: &RelBox, subject_name: &str) -> Result<String> {
        let marker_id = format!("marker-{}", self.marker_seq.fetch_add(1, Ordering::SeqCst) + 1);
        self.created_markers.lock().unwrap().push((
            file_id.to_string(),
            *bbox,
            subject_name.to_string(),
        ));
        Ok(marker_id)
    }

    fn update_marker(&self, marker_id: &str, subject_name: &str) -> Result<()> {
        let mut photos = self.photos.lock().unwrap();
        for photo in photos.values_mut() {
            for marker in &mut photo.details.markers {
                if marker.id == marker_id {
                    marker.subject_name = Some(subject_name.to_string());
                    return Ok(());
                }
            }
        }
        Err(Error::not_found(format!("marker {marker_id}")))
    }

    fn clear_marker_subject(&self, marker_id: &str) -> Result<()> {
        let mut photos = self.photos.lock().unwrap();
        for photo in photos.values_mut() {
            for marker in &mut photo.details.markers {
                if marker.id == marker_id {
                    marker.subject_name = None;
                    marker.subject_id = None;
                    return Ok(());
                }
            }
        }
        Err(Error::not_found(format!("marker {marker_id}")))
    }

    fn photos_with_subject(&self, normalized_name: &str) -> Result<Vec<String>> {
        let photos = self.photos.lock().unwrap();
        let order = self.order.lock().unwrap();
        Ok(order
            .iter()
            .filter(|id| {
                photos.get(*id).is_some_and(|p| {
                    p.details.markers.iter().any(|m| {
                        m.subject_name
                            .as_deref()
                            .map(names::normalize_subject)
                            .as_deref()
                            == Some(normalized_name)
                    })
                })
            })
            .cloned()
            .collect())
    }

    fn albums(&self) -> Result<Vec<Album>> {
        Ok(self
            .albums
            .lock()
            .unwrap()
            .iter()
            .map(|(album, _)| album.clone())
            .collect())
    }

    fn album_photos(&self, album_id: &str) -> Result<Vec<String>> {
        self.albums
            .lock()
            .unwrap()
            .iter()
            .find(|(album, _)| album.id == album_id)
            .map(|(_, photos)| photos.clone())
            .ok_or_else(|| Error::not_found(format!("album {album_id}")))
    }
}

/// Deterministic embedding service keyed by the photo id the fake
/// library smuggles through the photo bytes.
#[derive(Default)]
pub struct FakeEmbedder {
    pub responses: Mutex<HashMap<String, ImageEmbedding>>,
    pub text_vectors: Mutex<HashMap<String, Vec<f32>>>,
}

impl FakeEmbedder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_photo(&self, photo_id: &str, image_vector: Vec<f32>, faces: Vec<DetectedFace>) {
        self.responses.lock().unwrap().insert(
            photo_id.to_string(),
            ImageEmbedding {
                image_vector,
                faces,
            },
        );
    }

    pub fn set_text(&self, text: &str, vector: Vec<f32>) {
        self.text_vectors
            .lock()
            .unwrap()
            .insert(text.to_string(), vector);
    }
}

pub fn detected_face(bbox: [f64; 4], vector: Vec<f32>) -> DetectedFace {
    DetectedFace {
        bbox,
        det_score: 0.97,
        vector,
    }
}

impl EmbeddingService for FakeEmbedder {
    fn embed_image(&self, bytes: &[u8]) -> Result<ImageEmbedding> {
        let photo_id = String::from_utf8(bytes.to_vec()).map_err(|_| Error::ExternalRejected {
            service: "embedding service",
            status: 400,
            reason: "bad bytes".to_string(),
        })?;
        self.responses
            .lock()
            .unwrap()
            .get(&photo_id)
            .cloned()
            .ok_or(Error::ExternalUnavailable {
                service: "embedding service",
                reason: format!("no fixture for {photo_id}"),
            })
    }

    fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        self.text_vectors
            .lock()
            .unwrap()
            .get(text)
            .cloned()
            .ok_or(Error::ExternalUnavailable {
                service: "embedding service",
                reason: format!("no text fixture for {text}"),
            })
    }

    fn model_name(&self) -> &str {
        "fake-model"
    }

    fn pretrained_tag(&self) -> &str {
        "fake"
    }
}
