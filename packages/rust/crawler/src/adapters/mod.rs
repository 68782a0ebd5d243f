//! Per-source article extractors.
//!
//! Each [`SourceKind`] has one extractor that turns a parsed page into plain
//! article text. The [`ExtractorRegistry`] picks it; [`GenericExtractor`] is
//! the fallback for anything unrecognised.

mod generic;
mod techcrunch;
mod wechat;

use scraper::{ElementRef, Html, Selector};
use url::Url;

use newsdigest_shared::SourceKind;

pub use generic::GenericExtractor;
pub use techcrunch::TechCrunchExtractor;
pub use wechat::WeChatExtractor;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Turns a fetched page into article text.
pub trait ArticleExtractor: Send + Sync {
    /// The source this extractor understands.
    fn kind(&self) -> SourceKind;

    /// Extract the article. May return an empty string when nothing was found.
    fn extract(&self, doc: &Html, url: &Url) -> String;

    /// Human-readable extractor name for tracing.
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Holds one extractor per source kind.
pub struct ExtractorRegistry {
    extractors: Vec<Box<dyn ArticleExtractor>>,
}

impl ExtractorRegistry {
    /// Create a registry with all built-in extractors.
    pub fn new() -> Self {
        Self {
            extractors: vec![
                Box::new(WeChatExtractor),
                Box::new(TechCrunchExtractor),
                Box::new(GenericExtractor),
            ],
        }
    }

    /// The extractor for `kind`, or the generic one.
    pub fn for_kind(&self, kind: SourceKind) -> &dyn ArticleExtractor {
        self.extractors
            .iter()
            .find(|e| e.kind() == kind)
            .map(|e| e.as_ref())
            .unwrap_or(&GenericExtractor)
    }

    /// Parse `html` and extract with the extractor for `kind`.
    pub fn extract(&self, kind: SourceKind, html: &str, url: &Url) -> String {
        let doc = Html::parse_document(html);
        self.for_kind(kind).extract(&doc, url)
    }
}

impl Default for ExtractorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Helpers shared by extractors
// ---------------------------------------------------------------------------

/// Trimmed text content of an element.
pub(crate) fn element_text(el: &ElementRef<'_>) -> String {
    el.text().collect::<String>().trim().to_string()
}

/// First match of `selector` with non-empty text.
pub(crate) fn first_text(doc: &Html, selector: &Selector) -> Option<String> {
    doc.select(selector)
        .next()
        .map(|el| element_text(&el))
        .filter(|t| !t.is_empty())
}

/// Visible text nodes under `el`, raw, in document order.
pub(crate) fn visible_text_nodes<'a>(el: ElementRef<'a>) -> impl Iterator<Item = &'a str> {
    el.descendants().filter_map(|node| {
        let text = node.value().as_text()?;
        let hidden = node
            .parent()
            .and_then(|p| p.value().as_element())
            .is_some_and(|e| matches!(e.name(), "script" | "style" | "noscript"));
        (!hidden).then_some(&**text)
    })
}

/// Number of chars, not bytes.
pub(crate) fn char_len(s: &str) -> usize {
    s.chars().count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_picks_extractor_per_kind() {
        let registry = ExtractorRegistry::new();
        assert_eq!(registry.for_kind(SourceKind::WeChat).name(), "wechat");
        assert_eq!(registry.for_kind(SourceKind::TechCrunch).name(), "techcrunch");
        assert_eq!(registry.for_kind(SourceKind::Generic).name(), "generic");
    }

    #[test]
    fn visible_text_skips_scripts() {
        let doc = Html::parse_document(
            "<html><body><p>shown</p><script>var hidden = 1;</script><style>p{}</style></body></html>",
        );
        let text: String = visible_text_nodes(doc.root_element()).collect();
        assert_eq!(text, "shown");
    }
}
