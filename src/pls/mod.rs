//! Photo library service contract.
//!
//! The external library service ("PLS") owns photos, files, markers,
//! subjects and albums; this crate only consumes them. The [`PhotoLibrary`]
//! trait is the seam: the REST client in [`client`] implements it for the
//! real service, tests substitute an in-memory fake.

pub mod client;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::geometry::RelBox;

pub use client::RestLibraryClient;

/// One entry of the paged photo listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhotoSummary {
    pub id: String,
}

/// An externally-owned bounding box on a photo, optionally assigned to a
/// subject. Coordinates are display-relative fractions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Marker {
    pub id: String,
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
    #[serde(default)]
    pub subject_id: Option<String>,
    #[serde(default)]
    pub subject_name: Option<String>,
}

impl Marker {
    pub fn rel_box(&self) -> RelBox {
        RelBox::new(self.x, self.y, self.w, self.h)
    }

    pub fn has_subject(&self) -> bool {
        self.subject_name
            .as_deref()
            .map(|s| !s.is_empty())
            .unwrap_or(false)
    }
}

/// Full photo record: primary file info, deletion state and markers. The
/// reported width/height are raw file dimensions; the orientation tag
/// (EXIF convention, 1-8) decides the display-space swap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhotoDetails {
    pub id: String,
    pub file_id: String,
    pub width: u32,
    pub height: u32,
    #[serde(default = "default_orientation")]
    pub orientation: u8,
    #[serde(default)]
    pub deleted_at: Option<String>,
    #[serde(default)]
    pub markers: Vec<Marker>,
}

fn default_orientation() -> u8 {
    1
}

impl PhotoDetails {
    /// A non-empty deletion timestamp means the photo is gone upstream.
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.as_deref().map(|s| !s.is_empty()).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Album {
    pub id: String,
    pub title: String,
}

/// Operations the core needs from the library service. Every call carries
/// the client's session token; implementations map upstream 404s to
/// [`crate::error::Error::NotFound`].
pub trait PhotoLibrary: Send + Sync {
    /// One page of the photo listing, oldest first. An empty page ends
    /// the stream.
    fn photo_page(&self, offset: usize, limit: usize) -> Result<Vec<PhotoSummary>>;

    /// Photo bytes at a bounded thumbnail size.
    fn photo_bytes(&self, photo_id: &str, size_px: u32) -> Result<Vec<u8>>;

    fn photo_details(&self, photo_id: &str) -> Result<PhotoDetails>;

    fn markers(&self, photo_id: &str) -> Result<Vec<Marker>>;

    /// Create a marker on the photo's primary file, assigned to a
    /// subject. Returns the new marker id.
    fn create_marker(&self, file_id: &str, bbox: &RelBox, subject_name: &str) -> Result<String>;

    /// Assign an existing marker to a subject.
    fn update_marker(&self, marker_id: &str, subject_name: &str) -> Result<()>;

    fn clear_marker_subject(&self, marker_id: &str) -> Result<()>;

    /// Photo ids that carry a marker assigned to the subject (canonical
    /// name form).
    fn photos_with_subject(&self, normalized_name: &str) -> Result<Vec<String>>;

    fn albums(&self) -> Result<Vec<Album>>;

    fn album_photos(&self, album_id: &str) -> Result<Vec<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_rel_box() {
        let marker = Marker {
            id: "m1".into(),
            x: 0.1,
            y: 0.2,
            w: 0.3,
            h: 0.4,
            subject_id: None,
            subject_name: None,
        };
        let rel = marker.rel_box();
        assert_eq!(rel.corners(), (0.1, 0.2, 0.4, 0.6000000000000001));
    }

    #[test]
    fn test_deleted_flag() {
        let mut details = PhotoDetails {
            id: "p1".into(),
            file_id: "f1".into(),
            width: 100,
            height: 100,
            orientation: 1,
            deleted_at: None,
            markers: vec![],
        };
        assert!(!details.is_deleted());
        details.deleted_at = Some(String::new());
        assert!(!details.is_deleted());
        details.deleted_at = Some("2024-03-01T10:00:00Z".into());
        assert!(details.is_deleted());
    }

    #[test]
    fn test_marker_has_subject() {
        let mut marker = Marker {
            id: "m1".into(),
            x: 0.0,
            y: 0.0,
            w: 0.1,
            h: 0.1,
            subject_id: None,
            subject_name: None,
        };
        assert!(!marker.has_subject());
        marker.subject_name = Some(String::new());
        assert!(!marker.has_subject());
        marker.subject_name = Some("anna".into());
        assert!(marker.has_subject());
    }
}
