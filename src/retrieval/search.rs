//! Text-to-image search.

use serde::Serialize;

use crate::config::MatchingConfig;
use crate::embedder::EmbeddingService;
use crate::error::Result;
use crate::llm::QueryTranslator;
use crate::store::VectorStore;
use crate::vector::{l2_normalized, similarity};

#[derive(Debug, Clone)]
pub struct TextSearchOptions {
    /// Cosine distance ceiling for a hit.
    pub threshold: f32,
    pub limit: usize,
}

impl TextSearchOptions {
    pub fn from_config(config: &MatchingConfig) -> Self {
        Self {
            threshold: config.text_search_threshold,
            limit: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TextSearchHit {
    pub photo_id: String,
    pub distance: f32,
    pub similarity: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct TextSearchResult {
    pub query: String,
    /// The CLIP-friendly sentence actually embedded, when a translator
    /// was available and answered.
    pub translated: Option<String>,
    pub hits: Vec<TextSearchHit>,
}

/// Search photos by free text. Translation failures fall back to the raw
/// query; a dead sidecar LLM must never take search down with it.
pub fn search_by_text(
    store: &VectorStore,
    embedder: &dyn EmbeddingService,
    translator: Option<&dyn QueryTranslator>,
    query: &str,
    options: &TextSearchOptions,
) -> Result<TextSearchResult> {
    let translated = translator.and_then(|t| match t.translate(query) {
        Ok(sentence) => Some(sentence),
        Err(e) => {
            tracing::warn!(error = %e, "query translation failed; using raw query");
            None
        }
    });

    let text = translated.as_deref().unwrap_or(query);
    let vector = l2_normalized(embedder.embed_text(text)?);

    let hits = store
        .find_similar_photos(&vector, options.limit)?
        .into_iter()
        .filter(|(_, distance)| *distance <= options.threshold)
        .map(|(photo_id, distance)| TextSearchHit {
            photo_id,
            distance,
            similarity: similarity(distance),
        })
        .collect();

    Ok(TextSearchResult {
        query: query.to_string(),
        translated,
        hits,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::store::SqliteStore;
    use crate::testutil::FakeEmbedder;
    use crate::vector::l2_normalized as norm;
    use std::sync::Arc;

    struct EchoTranslator;

    impl QueryTranslator for EchoTranslator {
        fn translate(&self, query: &str) -> anyhow::Result<String> {
            Ok(format!("a photo of {query}"))
        }
    }

    struct BrokenTranslator;

    impl QueryTranslator for BrokenTranslator {
        fn translate(&self, _query: &str) -> anyhow::Result<String> {
            anyhow::bail!("llm offline")
        }
    }

    fn test_store(dim: usize) -> VectorStore {
        let backend = Arc::new(SqliteStore::open_in_memory().unwrap());
        let mut config = Config::default();
        config.embedding.embedding_dim = dim;
        let store = VectorStore::new(backend, &config);
        store.initialize().unwrap();
        store
    }

    fn unit(dim: usize, axis: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[axis] = 1.0;
        v
    }

    fn options() -> TextSearchOptions {
        TextSearchOptions {
            threshold: 0.5,
            limit: 10,
        }
    }

    #[test]
    fn test_search_uses_translated_sentence() {
        let store = test_store(8);
        let embedder = FakeEmbedder::new();

        store.put_embedding("dog", &unit(8, 0), "m", "p").unwrap();
        store.put_embedding("cat", &unit(8, 4), "m", "p").unwrap();
        store.image_index().set_ready(true);

        embedder.set_text("a photo of dog", norm(vec![1.0, 0.1, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]));

        let result = search_by_text(
            &store,
            &embedder,
            Some(&EchoTranslator),
            "dog",
            &options(),
        )
        .unwrap();

        assert_eq!(result.translated.as_deref(), Some("a photo of dog"));
        assert_eq!(result.hits.len(), 1);
        assert_eq!(result.hits[0].photo_id, "dog");
        assert!(result.hits[0].similarity > 0.9);
    }

    #[test]
    fn test_translator_failure_falls_back_to_raw_query() {
        let store = test_store(8);
        let embedder = FakeEmbedder::new();

        store.put_embedding("dog", &unit(8, 0), "m", "p").unwrap();
        store.image_index().set_ready(true);
        embedder.set_text("dog", unit(8, 0));

        let result = search_by_text(
            &store,
            &embedder,
            Some(&BrokenTranslator),
            "dog",
            &options(),
        )
        .unwrap();

        assert!(result.translated.is_none());
        assert_eq!(result.hits.len(), 1);
    }

    #[test]
    fn test_threshold_filters_far_photos() {
        let store = test_store(8);
        let embedder = FakeEmbedder::new();

        store.put_embedding("near", &unit(8, 0), "m", "p").unwrap();
        store.put_embedding("far", &unit(8, 5), "m", "p").unwrap();
        store.image_index().set_ready(true);
        embedder.set_text("query", unit(8, 0));

        let result = search_by_text(&store, &embedder, None, "query", &options()).unwrap();
        assert_eq!(result.hits.len(), 1);
        assert_eq!(result.hits[0].photo_id, "near");
    }
}
