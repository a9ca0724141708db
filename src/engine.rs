//! Engine wiring and lifecycle.
//!
//! The adapter layer constructs one [`Engine`] and drives everything
//! through it: startup (load-or-rebuild the ANN indexes), background
//! jobs, the retrieval primitives and graceful shutdown (snapshot both
//! indexes). The engine owns no protocol surface of its own.

use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

use crate::ann::{load_snapshot, save_snapshot, IndexStats, LoadOutcome};
use crate::config::{Config, StoreBackendType};
use crate::embedder::EmbeddingService;
use crate::error::{Error, Result};
use crate::ingest::{IngestOptions, Ingester};
use crate::jobs::{JobId, JobKind, JobRunner};
use crate::llm::QueryTranslator;
use crate::pls::PhotoLibrary;
use crate::retrieval::{
    complete_albums, detect_outliers, find_duplicates, match_faces, photo_faces, search_by_text,
    AlbumOptions, AlbumSuggestion, DuplicateGroup, DuplicateOptions, FaceMatchOptions,
    FaceMatchResult, OutlierOptions, OutlierReport, PhotoFaceDetail, TextSearchOptions,
    TextSearchResult,
};
use crate::store::{SqliteStore, StoreBackend, StoreStats, VectorStore};
use crate::syncer::Synchronizer;

/// Health/metrics view the adapter exposes.
#[derive(Debug, Clone, Serialize)]
pub struct Health {
    pub hnsw_ready: bool,
    pub store: StoreStats,
    pub face_index: IndexStats,
    pub image_index: IndexStats,
}

pub struct Engine {
    config: Config,
    store: Arc<VectorStore>,
    library: Arc<dyn PhotoLibrary>,
    embedder: Arc<dyn EmbeddingService>,
    translator: Option<Arc<dyn QueryTranslator>>,
    jobs: JobRunner,
}

impl Engine {
    /// Build an engine with the backend chosen by configuration.
    pub fn new(
        config: Config,
        library: Arc<dyn PhotoLibrary>,
        embedder: Arc<dyn EmbeddingService>,
        translator: Option<Arc<dyn QueryTranslator>>,
    ) -> Result<Self> {
        let backend: Arc<dyn StoreBackend> = match config.store.backend {
            StoreBackendType::Sqlite => Arc::new(SqliteStore::open(&config.store.sqlite_path)?),
            StoreBackendType::Postgresql => Self::open_postgres(&config)?,
        };
        Ok(Self::with_backend(
            config, backend, library, embedder, translator,
        ))
    }

    #[cfg(feature = "postgres")]
    fn open_postgres(config: &Config) -> Result<Arc<dyn StoreBackend>> {
        let url = config
            .store
            .store_url
            .as_deref()
            .ok_or_else(|| Error::ExternalRejected {
                service: "store",
                status: 0,
                reason: "store_url required for the postgresql backend".to_string(),
            })?;
        Ok(Arc::new(crate::store::PgStore::open(
            url,
            config.store.store_max_open_conns,
            config.store.store_max_idle_conns,
        )?))
    }

    #[cfg(not(feature = "postgres"))]
    fn open_postgres(_config: &Config) -> Result<Arc<dyn StoreBackend>> {
        Err(Error::ExternalRejected {
            service: "store",
            status: 0,
            reason: "built without the postgres feature".to_string(),
        })
    }

    /// Build an engine over an already-constructed backend. Tests use
    /// this with an in-memory store.
    pub fn with_backend(
        config: Config,
        backend: Arc<dyn StoreBackend>,
        library: Arc<dyn PhotoLibrary>,
        embedder: Arc<dyn EmbeddingService>,
        translator: Option<Arc<dyn QueryTranslator>>,
    ) -> Self {
        let store = Arc::new(VectorStore::new(backend, &config));
        Self {
            config,
            store,
            library,
            embedder,
            translator,
            jobs: JobRunner::new(),
        }
    }

    pub fn store(&self) -> &Arc<VectorStore> {
        &self.store
    }

    pub fn jobs(&self) -> &JobRunner {
        &self.jobs
    }

    /// Initialize the schema and bring both ANN indexes up: load a fresh
    /// snapshot when one exists, rebuild from the store otherwise.
    pub fn start(&self) -> Result<()> {
        self.store.initialize()?;
        self.warm_face_index()?;
        self.warm_image_index()?;
        Ok(())
    }

    fn warm_face_index(&self) -> Result<()> {
        let snapshot = self.config.ann.face_ann_snapshot_path.clone();
        let loaded = match &snapshot {
            Some(base) => {
                let freshness = self.store.face_freshness()?;
                self.try_load(base, |b| {
                    load_snapshot(self.store.face_index().as_ref(), b, &freshness)
                })?
            }
            None => false,
        };
        if !loaded {
            let count = self.store.rebuild_face_index()?;
            tracing::info!(count, "face index rebuilt from store");
            if let Some(base) = &snapshot {
                self.save_one(self.store.face_index().as_ref(), base);
            }
        }
        Ok(())
    }

    fn warm_image_index(&self) -> Result<()> {
        let snapshot = self.config.ann.image_ann_snapshot_path.clone();
        let loaded = match &snapshot {
            Some(base) => {
                let freshness = self.store.image_freshness()?;
                self.try_load(base, |b| {
                    load_snapshot(self.store.image_index().as_ref(), b, &freshness)
                })?
            }
            None => false,
        };
        if !loaded {
            let count = self.store.rebuild_image_index()?;
            tracing::info!(count, "image index rebuilt from store");
            if let Some(base) = &snapshot {
                self.save_one(self.store.image_index().as_ref(), base);
            }
        }
        Ok(())
    }

    fn try_load(
        &self,
        base: &Path,
        load: impl FnOnce(&Path) -> Result<LoadOutcome>,
    ) -> Result<bool> {
        match load(base)? {
            LoadOutcome::Loaded { count } => {
                tracing::info!(base = %base.display(), count, "ANN snapshot loaded");
                Ok(true)
            }
            LoadOutcome::MissingSnapshot => Ok(false),
            LoadOutcome::MissingPayload => {
                tracing::warn!(
                    base = %base.display(),
                    "snapshot has no payload sidecar (pre-payload layout), rebuilding"
                );
                Ok(false)
            }
            LoadOutcome::Stale { reason } => {
                tracing::warn!(base = %base.display(), reason, "stale ANN snapshot discarded");
                Ok(false)
            }
            LoadOutcome::Corrupt { reason } => {
                tracing::warn!(base = %base.display(), reason, "corrupt ANN snapshot discarded");
                Ok(false)
            }
        }
    }

    fn save_one<K: crate::ann::AnnKey, P: crate::ann::AnnPayload>(
        &self,
        index: &crate::ann::AnnIndex<K, P>,
        base: &Path,
    ) {
        if let Err(e) = save_snapshot(index, base) {
            tracing::warn!(base = %base.display(), error = %e, "snapshot save failed");
        }
    }

    /// Snapshot both indexes. Called on graceful shutdown and after
    /// rebuild jobs.
    pub fn save_snapshots(&self) {
        if let Some(base) = &self.config.ann.face_ann_snapshot_path {
            self.save_one(self.store.face_index().as_ref(), base);
        }
        if let Some(base) = &self.config.ann.image_ann_snapshot_path {
            self.save_one(self.store.image_index().as_ref(), base);
        }
    }

    pub fn shutdown(&self) {
        self.save_snapshots();
    }

    pub fn health(&self) -> Result<Health> {
        let (face_ready, image_ready) = self.store.hnsw_ready();
        Ok(Health {
            hnsw_ready: face_ready && image_ready,
            store: self.store.stats()?,
            face_index: self.store.face_index().stats(),
            image_index: self.store.image_index().stats(),
        })
    }

    // === Background jobs ===

    pub fn start_ingest(&self, options: IngestOptions) -> JobId {
        let ingester = Ingester::new(
            Arc::clone(&self.store),
            Arc::clone(&self.library),
            Arc::clone(&self.embedder),
            &self.config,
        );
        self.jobs.submit(
            JobKind::Ingest,
            Box::new(move |ctx| match ingester.run(&options, ctx) {
                Ok(report) => {
                    Ok(serde_json::to_value(&report).unwrap_or(serde_json::Value::Null))
                }
                Err(e) => Err(e.to_string()),
            }),
        )
    }

    pub fn start_sync(&self) -> JobId {
        let syncer = Synchronizer::new(
            Arc::clone(&self.store),
            Arc::clone(&self.library),
            &self.config,
        );
        self.jobs.submit(
            JobKind::Sync,
            Box::new(move |ctx| match syncer.run(ctx) {
                Ok(report) => {
                    Ok(serde_json::to_value(&report).unwrap_or(serde_json::Value::Null))
                }
                Err(e) => Err(e.to_string()),
            }),
        )
    }

    pub fn start_rebuild(&self) -> JobId {
        let store = Arc::clone(&self.store);
        let face_base = self.config.ann.face_ann_snapshot_path.clone();
        let image_base = self.config.ann.image_ann_snapshot_path.clone();
        self.jobs.submit(
            JobKind::Rebuild,
            Box::new(move |_ctx| {
                let faces = store.rebuild_face_index().map_err(|e| e.to_string())?;
                let images = store.rebuild_image_index().map_err(|e| e.to_string())?;
                if let Some(base) = &face_base {
                    if let Err(e) = save_snapshot(store.face_index().as_ref(), base) {
                        tracing::warn!(error = %e, "face snapshot save failed after rebuild");
                    }
                }
                if let Some(base) = &image_base {
                    if let Err(e) = save_snapshot(store.image_index().as_ref(), base) {
                        tracing::warn!(error = %e, "image snapshot save failed after rebuild");
                    }
                }
                Ok(serde_json::json!({ "faces": faces, "images": images }))
            }),
        )
    }

    // === Retrieval primitives ===

    pub fn face_match(&self, subject: &str) -> Result<FaceMatchResult> {
        let options = FaceMatchOptions::from_config(&self.config.matching);
        match_faces(&self.store, subject, &options)
    }

    pub fn face_match_with(
        &self,
        subject: &str,
        options: &FaceMatchOptions,
    ) -> Result<FaceMatchResult> {
        match_faces(&self.store, subject, options)
    }

    pub fn outliers(&self, subject: &str, options: &OutlierOptions) -> Result<OutlierReport> {
        detect_outliers(&self.store, self.library.as_ref(), subject, options)
    }

    pub fn duplicates(&self) -> Result<Vec<DuplicateGroup>> {
        let options = DuplicateOptions::from_config(&self.config.matching);
        find_duplicates(&self.store, &options)
    }

    pub fn duplicates_with(&self, options: &DuplicateOptions) -> Result<Vec<DuplicateGroup>> {
        find_duplicates(&self.store, options)
    }

    pub fn album_completion(&self) -> Result<Vec<AlbumSuggestion>> {
        let options = AlbumOptions::from_config(&self.config.matching);
        complete_albums(&self.store, self.library.as_ref(), &options)
    }

    pub fn text_search(&self, query: &str) -> Result<TextSearchResult> {
        let options = TextSearchOptions::from_config(&self.config.matching);
        search_by_text(
            &self.store,
            self.embedder.as_ref(),
            self.translator.as_deref(),
            query,
            &options,
        )
    }

    /// Unfiltered per-photo face listing for detail inspection.
    pub fn photo_faces(&self, photo_id: &str) -> Result<Vec<PhotoFaceDetail>> {
        photo_faces(&self.store, &self.config.matching, photo_id)
    }
}
