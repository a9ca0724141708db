//! Embedding service client.
//!
//! The model service is a black box: photo bytes in, one 768-d image
//! vector plus a face list (bounding box, detection score, 512-d vector)
//! out. It auto-rotates input per EXIF before detection, so face boxes
//! arrive in display space. All vectors are L2-normalized upstream; the
//! ingester re-normalizes defensively anyway.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::error::{Error, Result};

const SERVICE: &str = "embedding service";

#[derive(Debug, Clone, Deserialize)]
pub struct DetectedFace {
    /// Pixel corners `[x1, y1, x2, y2]` in display space.
    pub bbox: [f64; 4],
    pub det_score: f32,
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageEmbedding {
    pub image_vector: Vec<f32>,
    #[serde(default)]
    pub faces: Vec<DetectedFace>,
}

#[derive(Debug, Serialize)]
struct TextRequest<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct TextResponse {
    vector: Vec<f32>,
}

/// Seam for the embedding service; tests substitute a deterministic fake.
pub trait EmbeddingService: Send + Sync {
    fn embed_image(&self, bytes: &[u8]) -> Result<ImageEmbedding>;

    fn embed_text(&self, text: &str) -> Result<Vec<f32>>;

    /// Model identity recorded on every embedding row.
    fn model_name(&self) -> &str;

    fn pretrained_tag(&self) -> &str;
}

#[derive(Clone)]
pub struct HttpEmbeddingClient {
    base_url: String,
    timeout: Duration,
    model: String,
    pretrained: String,
}

impl HttpEmbeddingClient {
    pub fn new(config: &EmbeddingConfig) -> Self {
        Self {
            base_url: config.embedding_service_url.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(config.timeout_secs),
            model: "ViT-L-14".to_string(),
            pretrained: "openai".to_string(),
        }
    }

    fn map_error(e: ureq::Error, what: &str) -> Error {
        match e {
            ureq::Error::Status(status, response) if status < 500 => {
                let reason = response
                    .into_string()
                    .unwrap_or_else(|_| "unreadable response body".to_string());
                Error::ExternalRejected {
                    service: SERVICE,
                    status,
                    reason,
                }
            }
            ureq::Error::Status(status, _) => Error::ExternalUnavailable {
                service: SERVICE,
                reason: format!("status {status} for {what}"),
            },
            ureq::Error::Transport(transport) => Error::ExternalUnavailable {
                service: SERVICE,
                reason: transport.to_string(),
            },
        }
    }
}

impl EmbeddingService for HttpEmbeddingClient {
    fn embed_image(&self, bytes: &[u8]) -> Result<ImageEmbedding> {
        let url = format!("{}/embed/image", self.base_url);

        // One retry on 5xx/transport; the ingester counts anything beyond
        // that as a per-photo error.
        let mut last_error = None;
        for _ in 0..2 {
            let result = ureq::post(&url)
                .timeout(self.timeout)
                .set("Content-Type", "application/octet-stream")
                .send_bytes(bytes);
            match result {
                Ok(response) => {
                    return response.into_json().map_err(|e| Error::ExternalRejected {
                        service: SERVICE,
                        status: 0,
                        reason: format!("bad embed response: {e}"),
                    });
                }
                Err(e @ ureq::Error::Status(status, _)) if status >= 500 => {
                    last_error = Some(Self::map_error(e, "image embedding"));
                }
                Err(e @ ureq::Error::Transport(_)) => {
                    last_error = Some(Self::map_error(e, "image embedding"));
                }
                Err(e) => return Err(Self::map_error(e, "image embedding")),
            }
        }
        Err(last_error.unwrap_or(Error::ExternalUnavailable {
            service: SERVICE,
            reason: "image embedding failed".to_string(),
        }))
    }

    fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/embed/text", self.base_url);
        let response = ureq::post(&url)
            .timeout(self.timeout)
            .send_json(&TextRequest { text })
            .map_err(|e| Self::map_error(e, "text embedding"))?;

        let parsed: TextResponse = response.into_json().map_err(|e| Error::ExternalRejected {
            service: SERVICE,
            status: 0,
            reason: format!("bad embed response: {e}"),
        })?;
        Ok(parsed.vector)
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn pretrained_tag(&self) -> &str {
        &self.pretrained
    }
}
