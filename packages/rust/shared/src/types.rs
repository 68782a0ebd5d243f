//! Core domain types for newsdigest work runs.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// WorkItem
// ---------------------------------------------------------------------------

/// One unit of input (a URL or a file path) with its position in the list.
///
/// `index` is the only key used to restore input order after processing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Zero-based position in the original input list.
    pub index: usize,
    /// URL or file path.
    pub payload: String,
}

impl WorkItem {
    /// Create a new work item.
    pub fn new(index: usize, payload: impl Into<String>) -> Self {
        Self {
            index,
            payload: payload.into(),
        }
    }

    /// Which kind of source this item points at.
    pub fn source_kind(&self) -> SourceKind {
        SourceKind::detect(&self.payload)
    }
}

/// Parse a plain-text work list: every non-empty trimmed line is one item.
pub fn parse_work_list(text: &str) -> Vec<WorkItem> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .enumerate()
        .map(|(index, line)| WorkItem::new(index, line))
        .collect()
}

// ---------------------------------------------------------------------------
// SourceKind
// ---------------------------------------------------------------------------

/// The closed set of sources the pipeline treats differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// WeChat official-account articles (`mp.weixin.qq.com`).
    WeChat,
    /// TechCrunch articles.
    TechCrunch,
    /// Anything else.
    Generic,
}

impl SourceKind {
    /// Classify a payload by its host.
    pub fn detect(payload: &str) -> Self {
        if payload.contains("weixin.qq.com") {
            Self::WeChat
        } else if payload.contains("techcrunch.com") {
            Self::TechCrunch
        } else {
            Self::Generic
        }
    }

    /// Stable name for logs and file prefixes.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WeChat => "wechat",
            Self::TechCrunch => "techcrunch",
            Self::Generic => "article",
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Why an item failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Summary of the last failure.
    pub message: String,
    /// `true` when the attempt budget ran out, `false` for conditions that
    /// were never retried (permanent input errors, cancellation, panics).
    pub exhausted: bool,
}

impl ErrorInfo {
    /// Retries ran out.
    pub fn exhausted(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            exhausted: true,
        }
    }

    /// Not retried at all.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            exhausted: false,
        }
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// Terminal result of processing one [`WorkItem`].
///
/// Produced exactly once per item no matter how many attempts were made.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Outcome {
    /// Index of the originating work item.
    pub index: usize,
    /// Payload of the originating work item.
    pub payload: String,
    /// Output text on success, error info on failure.
    pub result: std::result::Result<String, ErrorInfo>,
    /// Artifact written (or reused) for this item, if the operation keeps one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<PathBuf>,
    /// Number of attempts made (0 when reused from a prior artifact).
    pub attempts: u32,
    /// Whether the result was reused from an existing artifact.
    pub reused: bool,
}

impl Outcome {
    /// A successful outcome.
    pub fn success(item: &WorkItem, output: String, attempts: u32) -> Self {
        Self {
            index: item.index,
            payload: item.payload.clone(),
            result: Ok(output),
            artifact: None,
            attempts,
            reused: false,
        }
    }

    /// A failed outcome.
    pub fn failure(item: &WorkItem, error: ErrorInfo, attempts: u32) -> Self {
        Self {
            index: item.index,
            payload: item.payload.clone(),
            result: Err(error),
            artifact: None,
            attempts,
            reused: false,
        }
    }

    /// Attach the artifact location.
    pub fn with_artifact(mut self, artifact: Option<PathBuf>) -> Self {
        self.artifact = artifact;
        self
    }

    /// Mark as reused from a prior run.
    pub fn reused(mut self) -> Self {
        self.reused = true;
        self
    }

    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn output(&self) -> Option<&str> {
        self.result.as_deref().ok()
    }

    pub fn error(&self) -> Option<&ErrorInfo> {
        self.result.as_ref().err()
    }

    /// The identifier downstream stages consume: the artifact path when one
    /// exists, otherwise the original payload.
    pub fn manifest_entry(&self) -> String {
        match &self.artifact {
            Some(path) => path.display().to_string(),
            None => self.payload.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_list_skips_blank_lines() {
        let items = parse_work_list("https://a.example/1\n\n   \n  https://b.example/2  \n");
        assert_eq!(items.len(), 2);
        assert_eq!(items[0], WorkItem::new(0, "https://a.example/1"));
        assert_eq!(items[1], WorkItem::new(1, "https://b.example/2"));
    }

    #[test]
    fn work_list_empty_input() {
        assert!(parse_work_list("\n\n").is_empty());
    }

    #[test]
    fn source_kind_detection() {
        assert_eq!(
            SourceKind::detect("https://mp.weixin.qq.com/s/FpisxJQ9AXHV26lHPwzy5A"),
            SourceKind::WeChat
        );
        assert_eq!(
            SourceKind::detect("https://techcrunch.com/2025/04/07/ibm-mainframe/"),
            SourceKind::TechCrunch
        );
        assert_eq!(
            SourceKind::detect("https://example.com/post"),
            SourceKind::Generic
        );
    }

    #[test]
    fn outcome_accessors() {
        let item = WorkItem::new(3, "https://example.com/a");
        let ok = Outcome::success(&item, "# Title".into(), 2);
        assert!(ok.is_success());
        assert_eq!(ok.output(), Some("# Title"));
        assert!(ok.error().is_none());

        let failed = Outcome::failure(&item, ErrorInfo::exhausted("HTTP 503"), 3);
        assert!(!failed.is_success());
        assert!(failed.output().is_none());
        assert!(failed.error().unwrap().exhausted);
    }

    #[test]
    fn manifest_entry_prefers_artifact() {
        let item = WorkItem::new(0, "https://example.com/a");
        let plain = Outcome::success(&item, "text".into(), 1);
        assert_eq!(plain.manifest_entry(), "https://example.com/a");

        let with_file = plain.with_artifact(Some(PathBuf::from("/out/article_1.txt")));
        assert_eq!(with_file.manifest_entry(), "/out/article_1.txt");
    }
}
