//! Shared types, error model, and configuration for newsdigest.
//!
//! This crate is the foundation depended on by all other newsdigest crates.
//! It provides:
//! - [`DigestError`]: the unified error type
//! - Domain types ([`WorkItem`], [`Outcome`], [`ErrorInfo`], [`SourceKind`])
//! - Configuration ([`AppConfig`], [`EngineConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    ApiConfig, AppConfig, Backoff, BackoffKind, DefaultsConfig, EngineConfig, Stage,
    StagePolicyConfig, WECHAT_CHALLENGE_MARKERS, WECHAT_LANDING_MARKER, config_dir,
    config_file_path, init_config, load_config, load_config_from, require_model,
    resolve_api_key,
};
pub use error::{DigestError, Result};
pub use types::{ErrorInfo, Outcome, SourceKind, WorkItem, parse_work_list};
