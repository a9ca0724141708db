//! Cache synchronizer.
//!
//! Reconciles the cached library-service fields against upstream truth
//! for every photo the store knows about. Photos that vanished (404 or a
//! deletion timestamp) are evicted from the store and both ANN indexes;
//! for the rest, pairing is recomputed and only drifted cached fields are
//! rewritten. The whole pass is idempotent and retryable.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};

use crate::config::Config;
use crate::jobs::{JobContext, JobProgress};
use crate::logging::sanitize_id;
use crate::pairing::pair_photo_faces;
use crate::pls::PhotoLibrary;
use crate::store::{PhotoInfo, VectorStore};

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub photos_checked: u64,
    pub cleaned_up: u64,
    pub markers_updated: u64,
    pub info_updated: u64,
    pub errors: u64,
}

#[derive(Default)]
struct Counters {
    photos_checked: AtomicU64,
    cleaned_up: AtomicU64,
    markers_updated: AtomicU64,
    info_updated: AtomicU64,
    errors: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> SyncReport {
        SyncReport {
            photos_checked: self.photos_checked.load(Ordering::Relaxed),
            cleaned_up: self.cleaned_up.load(Ordering::Relaxed),
            markers_updated: self.markers_updated.load(Ordering::Relaxed),
            info_updated: self.info_updated.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

pub struct Synchronizer {
    store: Arc<VectorStore>,
    library: Arc<dyn PhotoLibrary>,
    iou_threshold: f64,
    concurrency: usize,
}

impl Synchronizer {
    pub fn new(
        store: Arc<VectorStore>,
        library: Arc<dyn PhotoLibrary>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            library,
            iou_threshold: config.matching.iou_threshold,
            concurrency: config.jobs.sync_concurrency.max(1),
        }
    }

    pub fn run(&self, ctx: &JobContext) -> anyhow::Result<SyncReport> {
        let photo_ids = self.store.known_photo_ids()?;
        let total = photo_ids.len();
        let counters = Counters::default();

        let (tx, rx) = mpsc::sync_channel::<String>(self.concurrency);
        let rx = Mutex::new(rx);

        std::thread::scope(|scope| {
            scope.spawn(move || {
                for photo_id in photo_ids {
                    if ctx.is_cancelled() || tx.send(photo_id).is_err() {
                        return;
                    }
                }
            });

            for _ in 0..self.concurrency {
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

                    if let Err(e) = self.sync_one(&photo_id, &counters) {
                        tracing::error!(
                            photo = %sanitize_id(&photo_id),
                            error = %e,
                            "photo sync failed"
                        );
                        counters.errors.fetch_add(1, Ordering::Relaxed);
                    }

                    let checked = counters.photos_checked.fetch_add(1, Ordering::Relaxed) + 1;
                    ctx.publish(
                        JobProgress::new(checked as usize, total)
                            .with_message(sanitize_id(&photo_id)),
                    );
                });
            }
        });

        let report = counters.snapshot();
        tracing::info!(
            checked = report.photos_checked,
            cleaned_up = report.cleaned_up,
            markers_updated = report.markers_updated,
            cancelled = ctx.is_cancelled(),
            "cache sync finished"
        );
        Ok(report)
    }

    fn sync_one(&self, photo_id: &str, counters: &Counters) -> anyhow::Result<()> {
        let details = match self.library.photo_details(photo_id) {
            Ok(details) => details,
            Err(e) if e.is_not_found() => {
                self.evict(photo_id, counters)?;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        if details.is_deleted() {
            self.evict(photo_id, counters)?;
            return Ok(());
        }

        let faces = self.store.faces_by_photo(photo_id)?;
        if faces.is_empty() {
            return Ok(());
        }

        let info = PhotoInfo {
            width: details.width,
            height: details.height,
            orientation: details.orientation,
            file_id: details.file_id.clone(),
        };

        // Photo info is written once per photo, not per face.
        let info_drifted = faces.iter().any(|face| {
            face.photo_width != Some(info.width)
                || face.photo_height != Some(info.height)
                || face.orientation != Some(info.orientation)
                || face.file_id.as_deref() != Some(info.file_id.as_str())
        });
        if info_drifted {
            self.store.update_photo_info(photo_id, &info)?;
            counters.info_updated.fetch_add(1, Ordering::Relaxed);
        }

        let pairing = pair_photo_faces(&faces, &details.markers, &info, self.iou_threshold);
        for face in &faces {
            let fresh = pairing.marker_fields_for(face.face_index);
            if fresh != face.marker_fields() {
                self.store.update_marker(face, &fresh)?;
                counters.markers_updated.fetch_add(1, Ordering::Relaxed);
            }
        }

        Ok(())
    }

    fn evict(&self, photo_id: &str, counters: &Counters) -> anyhow::Result<()> {
        let (faces_removed, had_embedding) = self.store.delete_photo(photo_id)?;
        counters.cleaned_up.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            photo = %sanitize_id(photo_id),
            faces_removed,
            had_embedding,
            "evicted photo deleted upstream"
        );
        Ok(())
    }
}
