//! Generic (fallback) extractor.
//!
//! Takes the visible text of the whole page and squeezes runs of blank lines.

use std::sync::LazyLock;

use regex::Regex;
use scraper::{Html, Selector};
use url::Url;

use newsdigest_shared::SourceKind;

use super::{ArticleExtractor, visible_text_nodes};

static BODY: LazyLock<Selector> = LazyLock::new(|| Selector::parse("body").expect("valid selector"));

static BLANK_RUNS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid regex"));

/// Extractor for arbitrary pages.
pub struct GenericExtractor;

impl ArticleExtractor for GenericExtractor {
    fn kind(&self) -> SourceKind {
        SourceKind::Generic
    }

    fn extract(&self, doc: &Html, _url: &Url) -> String {
        let root = doc.select(&BODY).next().unwrap_or_else(|| doc.root_element());
        let raw: String = visible_text_nodes(root).collect();
        BLANK_RUNS_RE.replace_all(&raw, "\n\n").trim().to_string()
    }

    fn name(&self) -> &str {
        "generic"
    }
}
