//! Embedding ingester.
//!
//! Pulls the photo stream from the library service page by page, runs
//! each photo through the embedding service and persists the results:
//! image embedding, face batch, processing marker, then the cached marker
//! metadata from pairing. N workers pull photo ids from a bounded
//! channel, so a lagging worker pool pushes back on the page fetcher.
//! A failure on any single photo is logged and counted; the job keeps
//! going and the processing marker is the authority on "done", which is
//! what makes re-runs resume instead of redoing work.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};

use crate::config::Config;
use crate::embedder::EmbeddingService;
use crate::geometry::{self, PixelBox};
use crate::jobs::{JobContext, JobProgress};
use crate::logging::sanitize_id;
use crate::pairing::pair_photo_faces;
use crate::pls::{PhotoDetails, PhotoLibrary};
use crate::store::{FaceRecord, MarkerFields, NewFace, PhotoInfo, VectorStore};
use crate::vector::l2_normalized;

#[derive(Debug, Clone, Default)]
pub struct IngestOptions {
    pub skip_embeddings: bool,
    pub skip_faces: bool,
    /// Re-run photos that already carry an embedding and a processing
    /// marker.
    pub force: bool,
}

/// Per-category counters reported when the job finishes.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub photos_seen: u64,
    pub photos_skipped: u64,
    pub embed_success: u64,
    pub embed_error: u64,
    pub face_success: u64,
    pub face_error: u64,
    pub total_new_faces: u64,
}

#[derive(Default)]
struct Counters {
    photos_seen: AtomicU64,
    photos_skipped: AtomicU64,
    embed_success: AtomicU64,
    embed_error: AtomicU64,
    face_success: AtomicU64,
    face_error: AtomicU64,
    total_new_faces: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> IngestReport {
        IngestReport {
            photos_seen: self.photos_seen.load(Ordering::Relaxed),
            photos_skipped: self.photos_skipped.load(Ordering::Relaxed),
            embed_success: self.embed_success.load(Ordering::Relaxed),
            embed_error: self.embed_error.load(Ordering::Relaxed),
            face_success: self.face_success.load(Ordering::Relaxed),
            face_error: self.face_error.load(Ordering::Relaxed),
            total_new_faces: self.total_new_faces.load(Ordering::Relaxed),
        }
    }
}

pub struct Ingester {
    store: Arc<VectorStore>,
    library: Arc<dyn PhotoLibrary>,
    embedder: Arc<dyn EmbeddingService>,
    concurrency: usize,
    min_face_px: f64,
    min_face_rel: f64,
    iou_threshold: f64,
    thumbnail_px: u32,
    page_size: usize,
    checkpoint_every: usize,
}

impl Ingester {
    pub fn new(
        store: Arc<VectorStore>,
        library: Arc<dyn PhotoLibrary>,
        embedder: Arc<dyn EmbeddingService>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            library,
            embedder,
            concurrency: config.jobs.ingest_concurrency.max(1),
            min_face_px: config.matching.min_face_px,
            min_face_rel: config.matching.min_face_rel,
            iou_threshold: config.matching.iou_threshold,
            thumbnail_px: config.embedding.thumbnail_px,
            page_size: config.library.page_size,
            checkpoint_every: config.jobs.checkpoint_every.max(1),
        }
    }

    /// Run a full ingest pass. Returns the counters; only a failure to
    /// read the very first photo page is treated as fatal.
    pub fn run(&self, options: &IngestOptions, ctx: &JobContext) -> anyhow::Result<IngestReport> {
        let concurrency = self.concurrency;
        let counters = Counters::default();
        let (tx, rx) = mpsc::sync_channel::<String>(concurrency);
        let rx = Mutex::new(rx);
        let fatal: Mutex<Option<anyhow::Error>> = Mutex::new(None);

        std::thread::scope(|scope| {
            // Page producer. Blocks on send when workers lag, which paces
            // the listing against the embedding throughput. The sender
            // moves into the producer so its exit disconnects the workers.
            let fatal_ref = &fatal;
            scope.spawn(move || {
                let mut offset = 0usize;
                loop {
                    if ctx.is_cancelled() {
                        break;
                    }
                    let page = match self.library.photo_page(offset, self.page_size) {
                        Ok(page) => page,
                        Err(e) if offset == 0 => {
                            *fatal_ref.lock().unwrap_or_else(|p| p.into_inner()) =
                                Some(anyhow::Error::from(e).context("listing photos"));
                            break;
                        }
                        Err(e) => {
                            tracing::warn!(offset, error = %e, "photo listing failed mid-run");
                            break;
                        }
                    };
                    if page.is_empty() {
                        break;
                    }
                    offset += page.len();
                    for photo in page {
                        if ctx.is_cancelled() || tx.send(photo.id).is_err() {
                            return;
                        }
                    }
                }
            });

            for _ in 0..concurrency {
                scope.spawn(|| loop {
                    let photo_id = {
                        let guard = rx.lock().unwrap_or_else(|p| p.into_inner());
                        guard.recv()
                    };
                    let Ok(photo_id) = photo_id else {
                        break;
                    };
                    if ctx.is_cancelled() {
                        break;
                    }

                    if let Err(e) = self.ingest_one(&photo_id, options, &counters) {
                        tracing::error!(
                            photo = %sanitize_id(&photo_id),
                            error = %e,
                            "photo ingest failed"
                        );
                        if !options.skip_embeddings {
                            counters.embed_error.fetch_add(1, Ordering::Relaxed);
                        }
                        if !options.skip_faces {
                            counters.face_error.fetch_add(1, Ordering::Relaxed);
                        }
                    }

                    let seen = counters.photos_seen.fetch_add(1, Ordering::Relaxed) + 1;
                    ctx.publish(
                        JobProgress::new(seen as usize, 0)
                            .with_message(sanitize_id(&photo_id)),
                    );
                    if seen as usize % self.checkpoint_every == 0 {
                        let snapshot = counters.snapshot();
                        tracing::info!(
                            photos = seen,
                            embed_success = snapshot.embed_success,
                            embed_error = snapshot.embed_error,
                            face_success = snapshot.face_success,
                            face_error = snapshot.face_error,
                            "ingest checkpoint"
                        );
                    }
                });
            }
        });

        if let Some(e) = fatal.into_inner().unwrap_or_else(|p| p.into_inner()) {
            return Err(e);
        }

        let report = counters.snapshot();
        tracing::info!(
            photos = report.photos_seen,
            skipped = report.photos_skipped,
            new_faces = report.total_new_faces,
            cancelled = ctx.is_cancelled(),
            "ingest finished"
        );
        Ok(report)
    }

    /// One photo, strictly ordered: embedding, faces, ANN upsert (inside
    /// the store), marker enrichment. Shared-prerequisite failures bubble
    /// up; phase failures are counted here.
    fn ingest_one(
        &self,
        photo_id: &str,
        options: &IngestOptions,
        counters: &Counters,
    ) -> anyhow::Result<()> {
        let has_embedding = self.store.has_embedding(photo_id)?;
        let processed = self.store.processing_marker(photo_id)?.is_some();

        let need_embedding = !options.skip_embeddings && (options.force || !has_embedding);
        let need_faces = !options.skip_faces && (options.force || !processed);
        if !need_embedding && !need_faces {
            counters.photos_skipped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let bytes = self.library.photo_bytes(photo_id, self.thumbnail_px)?;
        let embedding = self.embedder.embed_image(&bytes)?;
        let details = self.library.photo_details(photo_id)?;
        let info = PhotoInfo {
            width: details.width,
            height: details.height,
            orientation: details.orientation,
            file_id: details.file_id.clone(),
        };

        if need_embedding {
            let vector = l2_normalized(embedding.image_vector.clone());
            match self.store.put_embedding(
                photo_id,
                &vector,
                self.embedder.model_name(),
                self.embedder.pretrained_tag(),
            ) {
                Ok(()) => {
                    counters.embed_success.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    tracing::warn!(
                        photo = %sanitize_id(photo_id),
                        error = %e,
                        "embedding persist failed"
                    );
                    counters.embed_error.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        if need_faces {
            let faces = self.usable_faces(&embedding.faces, &info);
            let persisted = if faces.is_empty() {
                self.store.mark_processed(photo_id, 0).map(|_| Vec::new())
            } else {
                self.store.put_faces(photo_id, &faces)
            };
            match persisted {
                Ok(rows) => {
                    counters.face_success.fetch_add(1, Ordering::Relaxed);
                    counters
                        .total_new_faces
                        .fetch_add(rows.len() as u64, Ordering::Relaxed);
                    if let Err(e) = self.enrich(photo_id, &rows, &details, &info) {
                        tracing::warn!(
                            photo = %sanitize_id(photo_id),
                            error = %e,
                            "marker enrichment failed; cache sync will repair"
                        );
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        photo = %sanitize_id(photo_id),
                        error = %e,
                        "face persist failed"
                    );
                    counters.face_error.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        Ok(())
    }

    /// Apply the minimum-size filter and re-normalize. The
    /// filter belongs to the ingest/matching paths only; detail
    /// inspection sees every stored face.
    fn usable_faces(
        &self,
        detected: &[crate::embedder::DetectedFace],
        info: &PhotoInfo,
    ) -> Vec<NewFace> {
        let (display_width, _) =
            geometry::display_dimensions(info.width, info.height, info.orientation);
        let min_width = self
            .min_face_px
            .max(self.min_face_rel * display_width as f64);

        let mut faces = Vec::new();
        for face in detected {
            let bbox = PixelBox::from_corners(face.bbox);
            if bbox.width() < min_width {
                continue;
            }
            faces.push(NewFace {
                face_index: faces.len() as i32,
                vector: l2_normalized(face.vector.clone()),
                bbox,
                det_score: face.det_score,
            });
        }
        faces
    }

    /// Cache the library-side truth on the fresh face rows: photo info
    /// once, then the paired marker fields per face.
    fn enrich(
        &self,
        photo_id: &str,
        rows: &[FaceRecord],
        details: &PhotoDetails,
        info: &PhotoInfo,
    ) -> crate::error::Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        self.store.update_photo_info(photo_id, info)?;

        let pairing = pair_photo_faces(rows, &details.markers, info, self.iou_threshold);
        for row in rows {
            let fields = pairing.marker_fields_for(row.face_index);
            if fields != MarkerFields::default() {
                self.store.update_marker(row, &fields)?;
            }
        }
        Ok(())
    }
}
