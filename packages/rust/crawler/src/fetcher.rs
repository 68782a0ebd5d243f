//! Page-fetch operation: URL in, article file out.
//!
//! Every attempt builds its own HTTP client, so a wedged connection from a
//! failed attempt can never leak into the next one.

use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::Client;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument};
use url::Url;

use newsdigest_engine::{Operation, OperationError};
use newsdigest_shared::{DigestError, Result, SourceKind, WorkItem};

use crate::adapters::ExtractorRegistry;

/// User-Agent string for article requests.
const USER_AGENT: &str = concat!("newsdigest/", env!("CARGO_PKG_VERSION"));

/// Hex digits of the URL hash used in fallback stems.
const HASH_PREFIX_LEN: usize = 10;

// ---------------------------------------------------------------------------
// PageFetcher
// ---------------------------------------------------------------------------

/// Fetches an article page, extracts its text, and writes `<stem>.txt`.
pub struct PageFetcher {
    output_dir: PathBuf,
    timeout: Duration,
    /// Content carrying one of these is returned but never persisted.
    challenge_markers: Vec<String>,
    registry: ExtractorRegistry,
}

impl PageFetcher {
    /// Create a fetcher writing articles into `output_dir`.
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            timeout: Duration::from_secs(30),
            challenge_markers: Vec::new(),
            registry: ExtractorRegistry::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_challenge_markers(mut self, markers: Vec<String>) -> Self {
        self.challenge_markers = markers;
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Where the article for `url` is written.
    pub fn artifact_for(&self, url: &str) -> PathBuf {
        let stem = artifact_stem(url, SourceKind::detect(url));
        self.output_dir.join(format!("{stem}.txt"))
    }

    #[instrument(skip_all, fields(index = item.index, url = %item.payload))]
    async fn fetch_article(&self, item: &WorkItem) -> Result<String> {
        let url = Url::parse(&item.payload)
            .map_err(|e| DigestError::validation(format!("invalid URL {}: {e}", item.payload)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(DigestError::validation(format!(
                "unsupported URL scheme: {}",
                item.payload
            )));
        }

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(self.timeout)
            .build()
            .map_err(|e| DigestError::Network(format!("failed to build HTTP client: {e}")))?;

        debug!("fetching page");
        let response = client
            .get(url.as_str())
            .send()
            .await
            .map_err(|e| DigestError::Network(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DigestError::Network(format!("{url}: HTTP {status}")));
        }

        let body = response
            .text()
            .await
            .map_err(|e| DigestError::Network(format!("{url}: body read failed: {e}")))?;

        let kind = item.source_kind();
        let extractor = self.registry.for_kind(kind).name().to_string();
        let text = self.registry.extract(kind, &body, &url);
        if text.trim().is_empty() {
            return Err(DigestError::Extraction(format!(
                "{url}: {extractor} extractor found no text"
            )));
        }

        let content = format!("{}\n\n{text}", item.payload);

        if let Some(marker) = self
            .challenge_markers
            .iter()
            .find(|m| content.contains(m.as_str()))
        {
            debug!(%marker, "challenge page, not persisting");
            return Ok(content);
        }

        let path = self.artifact_for(&item.payload);
        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|e| DigestError::io(&self.output_dir, e))?;
        tokio::fs::write(&path, &content)
            .await
            .map_err(|e| DigestError::io(&path, e))?;

        info!(path = %path.display(), %extractor, chars = text.chars().count(), "saved article");
        Ok(content)
    }
}

impl Operation for PageFetcher {
    async fn process(&self, item: &WorkItem) -> std::result::Result<String, OperationError> {
        Ok(self.fetch_article(item).await?)
    }

    fn artifact_path(&self, item: &WorkItem) -> Option<PathBuf> {
        Some(self.artifact_for(&item.payload))
    }
}

// ---------------------------------------------------------------------------
// Artifact naming
// ---------------------------------------------------------------------------

/// Filesystem-safe file stem for an article URL.
///
/// TechCrunch uses the slug (last path segment) when the URL is deep enough,
/// WeChat uses the token after `/s/`. Everything else, and any URL that
/// doesn't fit its kind's pattern, gets `<prefix>_<first 10 hex of SHA-256>`.
pub fn artifact_stem(url: &str, kind: SourceKind) -> String {
    let trimmed = url.trim_end_matches('/');

    let preferred = match kind {
        SourceKind::TechCrunch => {
            let parts: Vec<&str> = trimmed.split('/').collect();
            (parts.len() > 4).then(|| parts[parts.len() - 1])
        }
        SourceKind::WeChat => trimmed.split_once("/s/").map(|(_, token)| token),
        SourceKind::Generic => None,
    };

    preferred
        .map(sanitize)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| {
            let prefix = match kind {
                SourceKind::TechCrunch => "techcrunch",
                SourceKind::WeChat => "wechat",
                SourceKind::Generic => "article",
            };
            format!("{prefix}_{}", url_hash(trimmed))
        })
}

/// Keep alphanumerics, `-` and `_`; everything else becomes `_`.
fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect::<String>()
        .trim_matches('_')
        .to_string()
}

/// First hex digits of the SHA-256 of `url`.
fn url_hash(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    let hex = format!("{:x}", hasher.finalize());
    hex[..HASH_PREFIX_LEN].to_string()
}
