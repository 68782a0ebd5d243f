//! TechCrunch extractor.
//!
//! Title, a fixed author line, the publication date taken from the
//! `/YYYY/MM/DD/` URL path, then the article paragraphs.

use std::sync::LazyLock;

use scraper::{Html, Selector};
use url::Url;

use newsdigest_shared::SourceKind;

use super::{ArticleExtractor, char_len, element_text, first_text};

static TITLE: LazyLock<Selector> = LazyLock::new(|| Selector::parse("h1").expect("valid selector"));

static PARAGRAPHS: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("article p").expect("valid selector"));

static FALLBACK_PARAGRAPHS: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(".article-content p, .entry-content p").expect("valid selector")
});

/// Paragraphs this short are navigation crumbs or captions.
const MIN_PARAGRAPH_CHARS: usize = 5;

pub struct TechCrunchExtractor;

impl ArticleExtractor for TechCrunchExtractor {
    fn kind(&self) -> SourceKind {
        SourceKind::TechCrunch
    }

    fn extract(&self, doc: &Html, url: &Url) -> String {
        let mut text = String::new();

        if let Some(title) = first_text(doc, &TITLE) {
            text.push_str(&title);
            text.push_str("\n\n");
        }

        text.push_str("作者：TechCrunch\n");
        match date_from_path(url) {
            Some((y, m, d)) => text.push_str(&format!("日期：{y}年{m}月{d}日\n\n")),
            None => text.push('\n'),
        }

        let mut paragraphs: Vec<_> = doc.select(&PARAGRAPHS).collect();
        if paragraphs.is_empty() {
            paragraphs = doc.select(&FALLBACK_PARAGRAPHS).collect();
        }

        for p in paragraphs {
            let p_text = element_text(&p);
            if char_len(&p_text) > MIN_PARAGRAPH_CHARS {
                text.push_str(&p_text);
                text.push_str("\n\n");
            }
        }

        text.trim().to_string()
    }

    fn name(&self) -> &str {
        "techcrunch"
    }
}

/// The first three path segments when all are numeric.
fn date_from_path(url: &Url) -> Option<(String, String, String)> {
    let mut segments = url.path_segments()?;
    let mut next_numeric = || {
        segments
            .next()
            .filter(|s| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()))
            .map(str::to_string)
    };
    Some((next_numeric()?, next_numeric()?, next_numeric()?))
}
