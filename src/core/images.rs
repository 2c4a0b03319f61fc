//! Read-only view of the image repository.
//!
//! Image binaries live on an external file server. This process only needs
//! each image's name, expected MD5 digest, size and hardware compatibility
//! tag, which come from an `images.toml` manifest maintained next to the
//! binaries.

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::LazyLock;

// The release must stand alone between separators so the `9` of
// `universalk9` is never taken as a major number.
static VERSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[._-])(\d+\.\d+\.\d+[a-z]?)(?:\.|$)").expect("valid regex")
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageArtifact {
    pub filename: String,
    pub md5: String,
    #[serde(default)]
    pub size_bytes: u64,
    /// Image family the binary runs on, e.g. `cat9k`.
    #[serde(default)]
    pub compatibility: Option<String>,
}

impl ImageArtifact {
    pub fn version(&self) -> Option<String> {
        version_from_filename(&self.filename)
    }
}

#[async_trait]
pub trait ImageCatalog: Send + Sync {
    async fn get(&self, filename: &str) -> Result<Option<ImageArtifact>>;
    async fn list(&self) -> Result<Vec<ImageArtifact>>;
}

#[derive(Debug, Default, Deserialize)]
struct Manifest {
    #[serde(default)]
    image: Vec<ImageArtifact>,
}

/// Catalog backed by a TOML manifest, re-read on every call so edits are
/// picked up without a restart.
pub struct ManifestCatalog {
    path: PathBuf,
}

impl ManifestCatalog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn load(&self) -> Result<Manifest> {
        if !self.path.exists() {
            return Ok(Manifest::default());
        }
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing {}", self.path.display()))
    }
}

#[async_trait]
impl ImageCatalog for ManifestCatalog {
    async fn get(&self, filename: &str) -> Result<Option<ImageArtifact>> {
        Ok(self
            .load()
            .await?
            .image
            .into_iter()
            .find(|image| image.filename == filename))
    }

    async fn list(&self) -> Result<Vec<ImageArtifact>> {
        let mut images = self.load().await?.image;
        images.sort_by(|a, b| a.filename.cmp(&b.filename));
        Ok(images)
    }
}

/// Fixed catalog for tests.
#[cfg(test)]
pub struct StaticCatalog(pub Vec<ImageArtifact>);

#[cfg(test)]
#[async_trait]
impl ImageCatalog for StaticCatalog {
    async fn get(&self, filename: &str) -> Result<Option<ImageArtifact>> {
        Ok(self.0.iter().find(|i| i.filename == filename).cloned())
    }

    async fn list(&self) -> Result<Vec<ImageArtifact>> {
        Ok(self.0.clone())
    }
}

/// Release embedded in an image filename, e.g. `17.09.04a` from
/// `cat9k_iosxe.17.09.04a.SPA.bin`.
pub fn version_from_filename(filename: &str) -> Option<String> {
    VERSION_RE
        .captures(&filename.to_ascii_lowercase())
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Download URL of an image on the file server.
pub fn image_url(base_url: &str, filename: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        urlencoding::encode(filename)
    )
}
