//! WeChat public-account article extractor.
//!
//! Title, author and date lines, then the de-duplicated body paragraphs.
//! When that yields too little text (heavily styled articles nest text in
//! ways the paragraph walk misses) the plain text of the content block is
//! used instead if it is longer.

use std::collections::HashSet;
use std::sync::LazyLock;

use scraper::{ElementRef, Html, Selector};
use url::Url;

use newsdigest_shared::SourceKind;

use super::{ArticleExtractor, char_len, element_text, first_text, visible_text_nodes};

static TITLE: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse("h1.rich_media_title, #activity-name").expect("valid selector")
});

static AUTHOR: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(".rich_media_meta_nickname, #js_name").expect("valid selector")
});

static PUBLISH_TIME: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("#publish_time").expect("valid selector"));

static META_TEXT: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(".rich_media_meta.rich_media_meta_text:not(.rich_media_meta_nickname)")
        .expect("valid selector")
});

static CONTENT: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse("#js_content, .rich_media_content").expect("valid selector")
});

static RICH_MEDIA_CONTENT: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("div.rich_media_content").expect("valid selector"));

static BLOCKS: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("p, section").expect("valid selector"));

static IMG: LazyLock<Selector> = LazyLock::new(|| Selector::parse("img").expect("valid selector"));

const MIN_PARAGRAPH_CHARS: usize = 5;

/// Below this the paragraph walk is assumed to have missed the body.
const MIN_ARTICLE_CHARS: usize = 200;

pub struct WeChatExtractor;

impl ArticleExtractor for WeChatExtractor {
    fn kind(&self) -> SourceKind {
        SourceKind::WeChat
    }

    fn extract(&self, doc: &Html, _url: &Url) -> String {
        let mut text = String::new();

        if let Some(title) = first_text(doc, &TITLE) {
            text.push_str(&title);
            text.push_str("\n\n");
        }

        if let Some(author) = doc.select(&AUTHOR).next() {
            text.push_str(&format!("作者: {}\n", element_text(&author)));
        }

        let date = first_text(doc, &PUBLISH_TIME).or_else(|| first_text(doc, &META_TEXT));
        if let Some(date) = date {
            text.push_str(&format!("日期: {date}\n\n"));
        }

        if let Some(content) = doc.select(&CONTENT).next() {
            append_paragraphs(&mut text, content);
        }

        let text = text.trim().to_string();
        if char_len(&text) >= MIN_ARTICLE_CHARS {
            return text;
        }

        match doc.select(&RICH_MEDIA_CONTENT).next().map(plain_text) {
            Some(backup) if char_len(&backup) > char_len(&text) => backup,
            _ => text,
        }
    }

    fn name(&self) -> &str {
        "wechat"
    }
}

/// Paragraphs and sections, skipping image-only blocks, short crumbs and repeats.
fn append_paragraphs(text: &mut String, content: ElementRef<'_>) {
    let mut seen: HashSet<String> = HashSet::new();

    for block in content.select(&BLOCKS) {
        let block_text = element_text(&block);
        let len = char_len(&block_text);

        if len < MIN_PARAGRAPH_CHARS && block.select(&IMG).next().is_some() {
            continue;
        }
        if len > MIN_PARAGRAPH_CHARS && seen.insert(block_text.clone()) {
            text.push_str(&block_text);
            text.push_str("\n\n");
        }
    }
}

/// Non-empty visible text nodes joined by blank lines.
fn plain_text(el: ElementRef<'_>) -> String {
    visible_text_nodes(el)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}
