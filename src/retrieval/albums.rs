//! Album completion: suggest photos that belong with an album's theme.

use serde::Serialize;

use crate::config::MatchingConfig;
use crate::error::Result;
use crate::pls::PhotoLibrary;
use crate::store::VectorStore;
use crate::vector::centroid;

#[derive(Debug, Clone)]
pub struct AlbumOptions {
    /// Albums with fewer embedded photos than this are skipped; small
    /// samples make meaningless centroids.
    pub min_photos: usize,
    /// Cosine distance ceiling from the album centroid (`1 − sim`).
    pub max_distance: f32,
    pub max_per_album: usize,
}

impl AlbumOptions {
    pub fn from_config(config: &MatchingConfig) -> Self {
        Self {
            min_photos: config.album_min_photos,
            max_distance: 0.25,
            max_per_album: config.album_max_suggestions,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SuggestedPhoto {
    pub photo_id: String,
    pub distance: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct AlbumSuggestion {
    pub album_id: String,
    pub title: String,
    /// Embedded album photos that formed the centroid.
    pub sample_size: usize,
    pub suggestions: Vec<SuggestedPhoto>,
}

pub fn complete_albums(
    store: &VectorStore,
    library: &dyn PhotoLibrary,
    options: &AlbumOptions,
) -> Result<Vec<AlbumSuggestion>> {
    let mut results = Vec::new();

    for album in library.albums()? {
        let member_ids = library.album_photos(&album.id)?;

        let mut vectors = Vec::new();
        for photo_id in &member_ids {
            if let Some(record) = store.get_embedding(photo_id)? {
                vectors.push(record.vector);
            }
        }
        if vectors.len() < options.min_photos {
            continue;
        }

        let Some(center) = centroid(vectors.iter().map(|v| v.as_slice())) else {
            continue;
        };

        // Overfetch past the member count so removals cannot starve the
        // suggestion list.
        let fetch_k = options.max_per_album + member_ids.len();
        let suggestions: Vec<SuggestedPhoto> = store
            .find_similar_photos(&center, fetch_k)?
            .into_iter()
            .filter(|(photo_id, distance)| {
                *distance <= options.max_distance && !member_ids.contains(photo_id)
            })
            .take(options.max_per_album)
            .map(|(photo_id, distance)| SuggestedPhoto { photo_id, distance })
            .collect();

        if !suggestions.is_empty() {
            results.push(AlbumSuggestion {
                album_id: album.id,
                title: album.title,
                sample_size: vectors.len(),
                suggestions,
            });
        }
    }

    Ok(results)
}
