//! Article fetching and per-source extraction.
//!
//! This crate provides:
//! - [`adapters`]: per-source article extractors (WeChat, TechCrunch, generic)
//! - [`PageFetcher`]: the fetch-stage [`Operation`](newsdigest_engine::Operation)
//! - [`artifact_stem`]: stable, filesystem-safe article file names

pub mod adapters;
pub mod fetcher;

pub use adapters::{
    ArticleExtractor, ExtractorRegistry, GenericExtractor, TechCrunchExtractor, WeChatExtractor,
};
pub use fetcher::{PageFetcher, artifact_stem};
