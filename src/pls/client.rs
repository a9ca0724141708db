//! REST client for the photo library service.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::time::Duration;

use crate::config::LibraryConfig;
use crate::error::{Error, Result};
use crate::geometry::RelBox;
use crate::logging::sanitize_id;

use super::{Album, Marker, PhotoDetails, PhotoLibrary, PhotoSummary};

const SERVICE: &str = "library service";

/// Cap on a single thumbnail download; anything larger is a service bug.
const MAX_PHOTO_BYTES: u64 = 64 * 1024 * 1024;

#[derive(Clone)]
pub struct RestLibraryClient {
    base_url: String,
    session_token: Option<String>,
    timeout: Duration,
}

#[derive(Debug, Serialize)]
struct CreateMarkerRequest<'a> {
    file_id: &'a str,
    x: f64,
    y: f64,
    w: f64,
    h: f64,
    subject_name: &'a str,
}

#[derive(Debug, Deserialize)]
struct CreateMarkerResponse {
    id: String,
}

#[derive(Debug, Serialize)]
struct SubjectRequest<'a> {
    subject_name: &'a str,
}

#[derive(Debug, Deserialize)]
struct PhotoIdList {
    photos: Vec<String>,
}

impl RestLibraryClient {
    pub fn new(config: &LibraryConfig) -> Self {
        Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            session_token: config.session_token.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn apply_headers(&self, request: ureq::Request) -> ureq::Request {
        let request = request.timeout(self.timeout);
        match &self.session_token {
            Some(token) => request.set("X-Session-Token", token),
            None => request,
        }
    }

    /// Run a request with one retry on 5xx or transport errors. 4xx is
    /// surfaced immediately; a 404 becomes `NotFound` so callers can tell
    /// "gone upstream" apart from "service down".
    fn call_with_retry(
        &self,
        build: impl Fn() -> ureq::Request,
        body: Option<&serde_json::Value>,
        what: &str,
    ) -> Result<ureq::Response> {
        let mut last_reason = String::new();
        for attempt in 0..2 {
            let request = self.apply_headers(build());
            let result = match body {
                Some(json) => request.send_json(json),
                None => request.call(),
            };
            match result {
                Ok(response) => return Ok(response),
                Err(ureq::Error::Status(404, _)) => {
                    return Err(Error::not_found(what.to_string()));
                }
                Err(ureq::Error::Status(status, response)) if status < 500 => {
                    let reason = response
                        .into_string()
                        .unwrap_or_else(|_| "unreadable response body".to_string());
                    return Err(Error::ExternalRejected {
                        service: SERVICE,
                        status,
                        reason: sanitize_id(&reason),
                    });
                }
                Err(ureq::Error::Status(status, _)) => {
                    last_reason = format!("status {status}");
                }
                Err(ureq::Error::Transport(transport)) => {
                    last_reason = transport.to_string();
                }
            }
            if attempt == 0 {
                tracing::debug!(what, reason = %last_reason, "library request failed, retrying");
            }
        }
        Err(Error::ExternalUnavailable {
            service: SERVICE,
            reason: last_reason,
        })
    }

    fn get_json<T: DeserializeOwned>(&self, path: &str, what: &str) -> Result<T> {
        let url = self.url(path);
        let response = self.call_with_retry(|| ureq::get(&url), None, what)?;
        response.into_json().map_err(|e| Error::ExternalRejected {
            service: SERVICE,
            status: 0,
            reason: format!("bad response for {what}: {e}"),
        })
    }
}

impl PhotoLibrary for RestLibraryClient {
    fn photo_page(&self, offset: usize, limit: usize) -> Result<Vec<PhotoSummary>> {
        self.get_json(
            &format!("/photos?offset={offset}&count={limit}"),
            "photo page",
        )
    }

    fn photo_bytes(&self, photo_id: &str, size_px: u32) -> Result<Vec<u8>> {
        let url = self.url(&format!("/photos/{photo_id}/thumbnail?size={size_px}"));
        let what = format!("photo {}", sanitize_id(photo_id));
        let response = self.call_with_retry(|| ureq::get(&url), None, &what)?;

        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(MAX_PHOTO_BYTES)
            .read_to_end(&mut bytes)?;
        Ok(bytes)
    }

    fn photo_details(&self, photo_id: &str) -> Result<PhotoDetails> {
        self.get_json(
            &format!("/photos/{photo_id}"),
            &format!("photo {}", sanitize_id(photo_id)),
        )
    }

    fn markers(&self, photo_id: &str) -> Result<Vec<Marker>> {
        self.get_json(
            &format!("/photos/{photo_id}/markers"),
            &format!("markers of photo {}", sanitize_id(photo_id)),
        )
    }

    fn create_marker(&self, file_id: &str, bbox: &RelBox, subject_name: &str) -> Result<String> {
        let url = self.url("/markers");
        let body = serde_json::to_value(CreateMarkerRequest {
            file_id,
            x: bbox.x,
            y: bbox.y,
            w: bbox.w,
            h: bbox.h,
            subject_name,
        })?;
        let response = self.call_with_retry(
            || ureq::post(&url),
            Some(&body),
            &format!("marker on file {}", sanitize_id(file_id)),
        )?;
        let created: CreateMarkerResponse =
            response.into_json().map_err(|e| Error::ExternalRejected {
                service: SERVICE,
                status: 0,
                reason: format!("bad create-marker response: {e}"),
            })?;
        Ok(created.id)
    }

    fn update_marker(&self, marker_id: &str, subject_name: &str) -> Result<()> {
        let url = self.url(&format!("/markers/{marker_id}/subject"));
        let body = serde_json::to_value(SubjectRequest { subject_name })?;
        self.call_with_retry(
            || ureq::put(&url),
            Some(&body),
            &format!("marker {}", sanitize_id(marker_id)),
        )?;
        Ok(())
    }

    fn clear_marker_subject(&self, marker_id: &str) -> Result<()> {
        let url = self.url(&format!("/markers/{marker_id}/subject"));
        self.call_with_retry(
            || ureq::delete(&url),
            None,
            &format!("marker {}", sanitize_id(marker_id)),
        )?;
        Ok(())
    }

    fn photos_with_subject(&self, normalized_name: &str) -> Result<Vec<String>> {
        let encoded: String = normalized_name
            .chars()
            .map(|c| if c == ' ' { '-' } else { c })
            .collect();
        let list: PhotoIdList = self.get_json(
            &format!("/subjects/{encoded}/photos"),
            &format!("subject {}", sanitize_id(normalized_name)),
        )?;
        Ok(list.photos)
    }

    fn albums(&self) -> Result<Vec<Album>> {
        self.get_json("/albums", "albums")
    }

    fn album_photos(&self, album_id: &str) -> Result<Vec<String>> {
        let list: PhotoIdList = self.get_json(
            &format!("/albums/{album_id}/photos"),
            &format!("album {}", sanitize_id(album_id)),
        )?;
        Ok(list.photos)
    }
}
