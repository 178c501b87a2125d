//! Local staging of post images
//!
//! The surface only accepts uploads from disk, so a post image (remote URL or
//! stored blob) is written to a temp file first. [`StagedMedia`] owns that
//! file and removes it when dropped, which covers success, failure and early
//! returns alike.

use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::config::MediaConfig;
use crate::error::PublishError;
use crate::types::ImageRef;

/// Downloads remote images with a bounded timeout and size
#[derive(Clone)]
pub struct MediaFetcher {
    client: reqwest::Client,
    max_bytes: u64,
}

impl MediaFetcher {
    pub fn new(config: &MediaConfig) -> Result<Self, PublishError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.fetch_timeout))
            .build()
            .map_err(|e| {
                PublishError::SessionInitFailed(format!("failed to build HTTP client: {}", e))
            })?;

        Ok(Self {
            client,
            max_bytes: config.max_bytes,
        })
    }

    pub async fn fetch(&self, url: &str) -> Result<Vec<u8>, PublishError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| PublishError::TransientSurfaceError(format!("image fetch {}: {}", url, e)))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(PublishError::TransientSurfaceError(format!(
                "image fetch {} returned {}",
                url, status
            )));
        }
        if !status.is_success() {
            return Err(PublishError::ComposeFailed(format!(
                "image fetch {} returned {}",
                url, status
            )));
        }

        if let Some(length) = response.content_length() {
            if length > self.max_bytes {
                return Err(self.too_large(url, length));
            }
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| PublishError::TransientSurfaceError(format!("image fetch {}: {}", url, e)))?;

        if bytes.len() as u64 > self.max_bytes {
            return Err(self.too_large(url, bytes.len() as u64));
        }

        Ok(bytes.to_vec())
    }

    fn too_large(&self, url: &str, size: u64) -> PublishError {
        PublishError::ComposeFailed(format!(
            "image {} is {} bytes, limit is {}",
            url, size, self.max_bytes
        ))
    }
}

/// An image written to a temp file, deleted on drop
#[derive(Debug)]
pub struct StagedMedia {
    file: NamedTempFile,
}

impl StagedMedia {
    /// Write the image behind `image` to a local temp file
    pub async fn stage(image: &ImageRef, fetcher: &MediaFetcher) -> Result<Self, PublishError> {
        match image {
            ImageRef::Url(url) => {
                let bytes = fetcher.fetch(url).await?;
                let extension = extension_from_url(url).unwrap_or_else(|| sniff_extension(&bytes));
                Self::from_bytes(&bytes, extension)
            }
            ImageRef::Blob(bytes) => Self::from_bytes(bytes, sniff_extension(bytes)),
        }
    }

    pub fn from_bytes(bytes: &[u8], extension: &str) -> Result<Self, PublishError> {
        let stage_err =
            |e: std::io::Error| PublishError::ComposeFailed(format!("failed to stage image: {}", e));

        let mut file = tempfile::Builder::new()
            .prefix("pagecast-media-")
            .suffix(&format!(".{}", extension))
            .tempfile()
            .map_err(stage_err)?;
        file.write_all(bytes).map_err(stage_err)?;
        file.flush().map_err(stage_err)?;

        debug!(path = %file.path().display(), size = bytes.len(), "Staged image");
        Ok(Self { file })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

fn extension_from_url(url: &str) -> Option<&'static str> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let ext = path.rsplit_once('.').map(|(_, ext)| ext)?;
    match ext.to_lowercase().as_str() {
        "jpg" | "jpeg" => Some("jpg"),
        "png" => Some("png"),
        "gif" => Some("gif"),
        "webp" => Some("webp"),
        _ => None,
    }
}

/// Guess an extension from magic bytes, defaulting to jpg
fn sniff_extension(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
        "png"
    } else if bytes.starts_with(b"GIF8") {
        "gif"
    } else if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        "webp"
    } else {
        "jpg"
    }
}
