//! Skip items whose artifact from an earlier run is still good.
//!
//! Only a bounded prefix of the artifact is inspected. A stale artifact that
//! carries a bad marker is left in place; the operation overwrites it.

use std::path::Path;

use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use newsdigest_shared::EngineConfig;

/// Number of leading characters inspected for bad markers.
pub const PREFIX_CHARS: usize = 1000;

/// Decides whether an existing artifact can stand in for a fresh result.
#[derive(Debug, Clone)]
pub struct IdempotencyGuard {
    markers: Vec<String>,
    prefix_chars: usize,
}

impl IdempotencyGuard {
    pub fn new(markers: Vec<String>) -> Self {
        Self {
            markers,
            prefix_chars: PREFIX_CHARS,
        }
    }

    /// Rejection markers plus the stage's extra skip markers.
    pub fn from_config(config: &EngineConfig) -> Self {
        let mut markers = config.rejection_markers.clone();
        for marker in &config.skip_markers {
            if !markers.contains(marker) {
                markers.push(marker.clone());
            }
        }
        Self::new(markers)
    }

    pub fn with_prefix_chars(mut self, prefix_chars: usize) -> Self {
        self.prefix_chars = prefix_chars;
        self
    }

    /// `true` if `path` exists and its prefix is free of bad markers.
    pub async fn should_skip(&self, path: &Path) -> bool {
        let prefix = match self.read_prefix(path).await {
            Ok(Some(prefix)) => prefix,
            Ok(None) => return false,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not inspect existing artifact");
                return false;
            }
        };

        if let Some(marker) = self.markers.iter().find(|m| prefix.contains(m.as_str())) {
            info!(path = %path.display(), %marker, "existing artifact is a placeholder, recomputing");
            return false;
        }

        debug!(path = %path.display(), "existing artifact looks valid");
        true
    }

    async fn read_prefix(&self, path: &Path) -> std::io::Result<Option<String>> {
        let file = match tokio::fs::File::open(path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        // A UTF-8 char is at most 4 bytes.
        let limit = (self.prefix_chars as u64).saturating_mul(4);
        let mut bytes = Vec::new();
        file.take(limit).read_to_end(&mut bytes).await?;

        let text = String::from_utf8_lossy(&bytes);
        Ok(Some(text.chars().take(self.prefix_chars).collect()))
    }
}
