//! Pipeline stages and remote-model plumbing for newsdigest.
//!
//! This crate ties the engine, the page fetcher and the chat-completions
//! client into the end-to-end stages: `fetch`, `abstract`, `digest`, `run`
//! and `report`.

pub mod llm;
pub mod operations;
pub mod pipeline;
pub mod report;

pub use llm::{ChatClient, ChatMessage, ChatRequest};
pub use operations::{AbstractWriter, DigestModels, DigestOperation, ReportSummarizer};
pub use pipeline::{
    RunContext, RunResult, StageOverrides, StageResult, abstract_articles, digest_urls,
    fetch_articles, run_pipeline,
};
pub use report::{ReportResult, build_report, render_deliverable};
