//! Retrieval primitives.
//!
//! Pure reads over the store, the ANN indexes, the coordinate bridge and
//! the pairing rules: face match, person-outlier detection, duplicate
//! grouping, album completion and text-to-image search. Nothing in here
//! mutates library-service state; classified actions are handed to the
//! adapter to apply.

pub mod albums;
pub mod duplicates;
pub mod face_match;
pub mod outliers;
pub mod search;

pub use albums::{complete_albums, AlbumOptions, AlbumSuggestion, SuggestedPhoto};
pub use duplicates::{find_duplicates, DuplicateGroup, DuplicateMember, DuplicateOptions};
pub use face_match::{
    match_faces, photo_faces, ActionCounts, FaceMatchCandidate, FaceMatchOptions, FaceMatchResult,
    PhotoFaceDetail,
};
pub use outliers::{detect_outliers, MissingEmbedding, Outlier, OutlierOptions, OutlierReport};
pub use search::{search_by_text, TextSearchHit, TextSearchOptions, TextSearchResult};
