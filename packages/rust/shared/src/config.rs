//! Application configuration for newsdigest.
//!
//! User config lives at `~/.newsdigest/newsdigest.toml`.
//! CLI flags override config file values, which override stage defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DigestError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "newsdigest.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".newsdigest";

/// Markers of the WeChat anti-automation interstitial.
pub const WECHAT_CHALLENGE_MARKERS: [&str; 2] = ["环境异常", "完成验证后即可继续访问"];

/// Marker of the WeChat landing page the bot endpoint returns instead of an article.
pub const WECHAT_LANDING_MARKER: &str = "微信，是一个生活方式";

// ---------------------------------------------------------------------------
// Config structs (matching newsdigest.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Remote chat-completions API settings.
    #[serde(default)]
    pub api: ApiConfig,

    /// Engine policy overrides for the fetch stage.
    #[serde(default)]
    pub fetch: StagePolicyConfig,

    /// Engine policy overrides for the abstract stage.
    #[serde(default, rename = "abstract")]
    pub abstracts: StagePolicyConfig,

    /// Engine policy overrides for the digest stage.
    #[serde(default)]
    pub digest: StagePolicyConfig,

    /// Engine policy overrides for the report stage.
    #[serde(default)]
    pub report: StagePolicyConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            defaults: DefaultsConfig::default(),
            api: ApiConfig::default(),
            fetch: StagePolicyConfig::from(&EngineConfig::stage_defaults(Stage::Fetch)),
            abstracts: StagePolicyConfig::from(&EngineConfig::stage_defaults(Stage::Abstract)),
            digest: StagePolicyConfig::from(&EngineConfig::stage_defaults(Stage::Digest)),
            report: StagePolicyConfig::from(&EngineConfig::stage_defaults(Stage::Report)),
        }
    }
}

impl AppConfig {
    /// The policy section for a stage.
    pub fn stage_section(&self, stage: Stage) -> &StagePolicyConfig {
        match stage {
            Stage::Fetch => &self.fetch,
            Stage::Abstract => &self.abstracts,
            Stage::Digest => &self.digest,
            Stage::Report => &self.report,
        }
    }
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Root under which default output directories are created.
    #[serde(default = "default_output_root")]
    pub output_root: String,

    /// Directory holding `abstract_prompt.md` and `summary_prompt.md`.
    #[serde(default = "default_prompts_dir")]
    pub prompts_dir: String,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            output_root: default_output_root(),
            prompts_dir: default_prompts_dir(),
        }
    }
}

fn default_output_root() -> String {
    ".".into()
}
fn default_prompts_dir() -> String {
    "system_prompt".into()
}

/// `[api]` section.
///
/// Keys are never stored here, only the names of the env vars holding them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Base URL of the chat-completions API used by the abstract stage.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Name of the env var holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Model used to abstract fetched articles.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abstract_model: Option<String>,

    /// Base URL of the bot endpoint used by the digest stage.
    #[serde(default = "default_digest_base_url")]
    pub digest_base_url: String,

    /// Default bot model for the digest stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest_model: Option<String>,

    /// Bot model for WeChat URLs (falls back to `digest_model`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest_model_wechat: Option<String>,

    /// Bot model for TechCrunch URLs (falls back to `digest_model`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest_model_techcrunch: Option<String>,

    /// Base URL for the report summary call (falls back to `base_url`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_base_url: Option<String>,

    /// Name of the env var holding the report API key.
    #[serde(default = "default_report_api_key_env")]
    pub report_api_key_env: String,

    /// Model used for the overall report summary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_model: Option<String>,

    /// Sampling temperature for the report summary.
    #[serde(default = "default_report_temperature")]
    pub report_temperature: f32,

    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            abstract_model: None,
            digest_base_url: default_digest_base_url(),
            digest_model: None,
            digest_model_wechat: None,
            digest_model_techcrunch: None,
            report_base_url: None,
            report_api_key_env: default_report_api_key_env(),
            report_model: None,
            report_temperature: default_report_temperature(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_base_url() -> String {
    "https://ark.cn-beijing.volces.com/api/v3".into()
}
fn default_api_key_env() -> String {
    "API_KEY".into()
}
fn default_digest_base_url() -> String {
    "https://ark.cn-beijing.volces.com/api/v3/bots".into()
}
fn default_report_api_key_env() -> String {
    "REPORT_API_KEY".into()
}
fn default_report_temperature() -> f32 {
    0.5
}
fn default_request_timeout() -> u64 {
    120
}

/// Backoff shape as written in the config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Linear,
}

/// `[fetch]` / `[abstract]` / `[digest]` / `[report]` sections.
///
/// Every field is optional; unset fields keep the stage default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StagePolicyConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<BackoffKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_backoff: Option<BackoffKind>,
    /// `0` disables the pause after a rejected output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_backoff_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_second: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_minute: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_markers: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_markers: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_content_chars: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leading_marker: Option<char>,
}

impl From<&EngineConfig> for StagePolicyConfig {
    fn from(config: &EngineConfig) -> Self {
        let (kind, base) = config.backoff.parts();
        let (rejection_kind, rejection_base) = match config.rejection_backoff {
            Some(backoff) => {
                let (kind, base) = backoff.parts();
                (Some(kind), base)
            }
            None => (None, Duration::ZERO),
        };
        Self {
            concurrency: Some(config.concurrency),
            max_attempts: Some(config.max_attempts),
            backoff: Some(kind),
            backoff_ms: Some(base.as_millis() as u64),
            rejection_backoff: rejection_kind,
            rejection_backoff_ms: Some(rejection_base.as_millis() as u64),
            cooldown_ms: Some(config.cooldown.as_millis() as u64),
            per_second: config.per_second,
            per_minute: config.per_minute,
            rejection_markers: Some(config.rejection_markers.clone()),
            skip_markers: Some(config.skip_markers.clone()),
            min_content_chars: config.min_content_chars,
            leading_marker: config.leading_marker,
        }
    }
}

// ---------------------------------------------------------------------------
// Engine config (runtime, merged from stage defaults + config + CLI flags)
// ---------------------------------------------------------------------------

/// Pipeline stages that drive the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// URL list → article text files.
    Fetch,
    /// Article files → merged markdown abstracts.
    Abstract,
    /// URL list → merged markdown abstracts via the bot endpoint.
    Digest,
    /// Abstract markdown → deliverable with an overall summary.
    Report,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::Abstract => "abstract",
            Self::Digest => "digest",
            Self::Report => "report",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delay between failed attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay after every failure.
    Fixed(Duration),
    /// `base * attempt` after the n-th failure.
    Linear(Duration),
}

impl Backoff {
    fn from_parts(kind: BackoffKind, base: Duration) -> Self {
        match kind {
            BackoffKind::Fixed => Self::Fixed(base),
            BackoffKind::Linear => Self::Linear(base),
        }
    }

    fn parts(&self) -> (BackoffKind, Duration) {
        match *self {
            Self::Fixed(d) => (BackoffKind::Fixed, d),
            Self::Linear(d) => (BackoffKind::Linear, d),
        }
    }

    /// Delay after the given (1-based) failed attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Self::Fixed(d) => d,
            Self::Linear(base) => base.saturating_mul(attempt.max(1)),
        }
    }
}

/// Runtime engine configuration for one stage.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Items dispatched concurrently per batch.
    pub concurrency: usize,
    /// Attempt budget per item.
    pub max_attempts: u32,
    /// Delay after a transient failure.
    pub backoff: Backoff,
    /// Delay after output was rejected; `None` retries at once.
    pub rejection_backoff: Option<Backoff>,
    /// Pause between consecutive batches.
    pub cooldown: Duration,
    /// Cap on operations per one-second window.
    pub per_second: Option<u32>,
    /// Cap on operations per sixty-second window.
    pub per_minute: Option<u32>,
    /// Substrings marking challenge or placeholder output.
    pub rejection_markers: Vec<String>,
    /// Extra markers that invalidate an existing artifact.
    pub skip_markers: Vec<String>,
    /// Output shorter than this (in chars) is rejected.
    pub min_content_chars: Option<usize>,
    /// Output is trimmed to start at this character, when present.
    pub leading_marker: Option<char>,
}

impl EngineConfig {
    /// Built-in defaults for a stage.
    pub fn stage_defaults(stage: Stage) -> Self {
        let wechat_challenge: Vec<String> =
            WECHAT_CHALLENGE_MARKERS.iter().map(|m| m.to_string()).collect();

        match stage {
            Stage::Fetch => Self {
                concurrency: 2,
                max_attempts: 3,
                backoff: Backoff::Linear(Duration::from_secs(3)),
                // Challenge pages come back from the same endpoint; back off as for errors.
                rejection_backoff: Some(Backoff::Linear(Duration::from_secs(3))),
                cooldown: Duration::from_secs(5),
                per_second: None,
                per_minute: None,
                rejection_markers: wechat_challenge,
                skip_markers: Vec::new(),
                min_content_chars: None,
                leading_marker: None,
            },
            Stage::Abstract => Self {
                concurrency: 20,
                max_attempts: 3,
                backoff: Backoff::Fixed(Duration::from_secs(1)),
                rejection_backoff: None,
                cooldown: Duration::ZERO,
                per_second: None,
                per_minute: Some(1000),
                rejection_markers: Vec::new(),
                skip_markers: Vec::new(),
                min_content_chars: None,
                leading_marker: Some('#'),
            },
            Stage::Digest => Self {
                concurrency: 10,
                max_attempts: 10,
                backoff: Backoff::Fixed(Duration::from_secs(1)),
                rejection_backoff: None,
                cooldown: Duration::ZERO,
                per_second: Some(1),
                per_minute: Some(60),
                rejection_markers: vec![
                    WECHAT_LANDING_MARKER.to_string(),
                    WECHAT_CHALLENGE_MARKERS[0].to_string(),
                ],
                skip_markers: Vec::new(),
                min_content_chars: None,
                leading_marker: Some('#'),
            },
            Stage::Report => Self {
                concurrency: 1,
                max_attempts: 5,
                backoff: Backoff::Fixed(Duration::from_secs(1)),
                rejection_backoff: None,
                cooldown: Duration::ZERO,
                per_second: None,
                per_minute: None,
                rejection_markers: Vec::new(),
                skip_markers: Vec::new(),
                min_content_chars: None,
                leading_marker: None,
            },
        }
    }

    /// Stage defaults overlaid with the stage's config file section.
    pub fn resolve(stage: Stage, app: &AppConfig) -> Self {
        Self::stage_defaults(stage).overlay(app.stage_section(stage))
    }

    /// Apply every field set in `section`.
    pub fn overlay(mut self, section: &StagePolicyConfig) -> Self {
        if let Some(v) = section.concurrency {
            self.concurrency = v;
        }
        if let Some(v) = section.max_attempts {
            self.max_attempts = v;
        }
        if section.backoff.is_some() || section.backoff_ms.is_some() {
            let (kind, base) = self.backoff.parts();
            let kind = section.backoff.unwrap_or(kind);
            let base = section.backoff_ms.map(Duration::from_millis).unwrap_or(base);
            self.backoff = Backoff::from_parts(kind, base);
        }
        if section.rejection_backoff_ms == Some(0) {
            self.rejection_backoff = None;
        } else if section.rejection_backoff.is_some() || section.rejection_backoff_ms.is_some() {
            let (kind, base) = self.rejection_backoff.unwrap_or(self.backoff).parts();
            let kind = section.rejection_backoff.unwrap_or(kind);
            let base = section
                .rejection_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(base);
            self.rejection_backoff = Some(Backoff::from_parts(kind, base));
        }
        if let Some(v) = section.cooldown_ms {
            self.cooldown = Duration::from_millis(v);
        }
        if section.per_second.is_some() {
            self.per_second = section.per_second;
        }
        if section.per_minute.is_some() {
            self.per_minute = section.per_minute;
        }
        if let Some(v) = &section.rejection_markers {
            self.rejection_markers = v.clone();
        }
        if let Some(v) = &section.skip_markers {
            self.skip_markers = v.clone();
        }
        if section.min_content_chars.is_some() {
            self.min_content_chars = section.min_content_chars;
        }
        if section.leading_marker.is_some() {
            self.leading_marker = section.leading_marker;
        }
        self
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(DigestError::config("concurrency must be at least 1"));
        }
        if self.max_attempts == 0 {
            return Err(DigestError::config("max_attempts must be at least 1"));
        }
        if self.per_second == Some(0) || self.per_minute == Some(0) {
            return Err(DigestError::config(
                "rate caps must be at least 1 (omit the key to disable a window)",
            ));
        }
        if self.rejection_markers.iter().any(|m| m.is_empty()) {
            return Err(DigestError::config("rejection markers must not be empty"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.newsdigest/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| DigestError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.newsdigest/newsdigest.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| DigestError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| DigestError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| DigestError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| DigestError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| DigestError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Read an API key from the named env var, failing if unset or empty.
pub fn resolve_api_key(var_name: &str) -> Result<String> {
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(DigestError::config(format!(
            "API key not found. Set the {var_name} environment variable (or add it to .env)."
        ))),
    }
}

/// Require an optional model setting, naming the config key when missing.
pub fn require_model<'a>(model: &'a Option<String>, key: &str) -> Result<&'a str> {
    match model.as_deref() {
        Some(m) if !m.trim().is_empty() => Ok(m),
        _ => Err(DigestError::config(format!(
            "no model configured: set `{key}` in the [api] section or pass --model"
        ))),
    }
}
