//! Pipeline stages: URL list → articles → abstracts.
//!
//! Each stage reads its work list, drives the engine over it, merges the
//! outcomes, and leaves three things behind: the stage's main output, a
//! `failed_items.txt` that can be fed straight back in, and a
//! `run_summary.json`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use newsdigest_crawler::PageFetcher;
use newsdigest_engine::{
    EventSink, Merge, Operation, Orchestrator, TracingSink, failures, manifest, merge,
};
use newsdigest_shared::{
    AppConfig, DigestError, EngineConfig, Outcome, Result, Stage, WorkItem, parse_work_list,
    require_model, resolve_api_key,
};

use crate::llm::ChatClient;
use crate::operations::{AbstractWriter, DigestModels, DigestOperation};

/// Manifest of fetched article paths, one per line.
pub const ARTICLE_MANIFEST: &str = "successful_articles.txt";

/// Payloads of failed items, one per line.
pub const FAILED_ITEMS: &str = "failed_items.txt";

/// Machine-readable record of a stage run.
pub const RUN_SUMMARY: &str = "run_summary.json";

/// System prompt file for the abstract stage, under `prompts_dir`.
pub const ABSTRACT_PROMPT: &str = "abstract_prompt.md";

// ---------------------------------------------------------------------------
// Run context
// ---------------------------------------------------------------------------

/// Command-line overrides applied on top of the resolved stage config.
#[derive(Debug, Clone, Default)]
pub struct StageOverrides {
    pub concurrency: Option<usize>,
    pub max_attempts: Option<u32>,
    /// Replaces the stage's configured model.
    pub model: Option<String>,
}

/// Everything a stage needs besides its inputs.
#[derive(Clone)]
pub struct RunContext {
    pub config: AppConfig,
    pub overrides: StageOverrides,
    pub sink: Arc<dyn EventSink>,
    pub cancel: CancellationToken,
}

impl RunContext {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            overrides: StageOverrides::default(),
            sink: Arc::new(TracingSink),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_overrides(mut self, overrides: StageOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Stage defaults, then the config file, then CLI overrides; validated.
    pub fn engine_config(&self, stage: Stage) -> Result<EngineConfig> {
        let mut engine = EngineConfig::resolve(stage, &self.config);
        if let Some(concurrency) = self.overrides.concurrency {
            engine.concurrency = concurrency;
        }
        if let Some(max_attempts) = self.overrides.max_attempts {
            engine.max_attempts = max_attempts;
        }
        engine.validate()?;
        Ok(engine)
    }

    pub fn output_root(&self) -> PathBuf {
        PathBuf::from(&self.config.defaults.output_root)
    }

    pub fn prompt_path(&self, file_name: &str) -> PathBuf {
        PathBuf::from(&self.config.defaults.prompts_dir).join(file_name)
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.config.api.request_timeout_secs)
    }

    pub(crate) fn orchestrator<O: Operation>(&self, op: O, engine: &EngineConfig) -> Result<Orchestrator<O>> {
        Ok(Orchestrator::new(op, engine)?
            .with_sink(self.sink.clone())
            .with_cancellation(self.cancel.clone()))
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// What a stage run produced.
#[derive(Debug, Clone)]
pub struct StageResult {
    pub stage: Stage,
    /// One outcome per input item, in input order.
    pub outcomes: Vec<Outcome>,
    pub merge: Merge,
    /// Article manifest (fetch) or merged markdown; `None` when nothing was produced.
    pub output: Option<PathBuf>,
    pub failed_items: PathBuf,
    pub summary: PathBuf,
    pub elapsed: Duration,
}

impl StageResult {
    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn skipped(&self) -> usize {
        self.outcomes.iter().filter(|o| o.reused).count()
    }

    pub fn failures(&self) -> Vec<&Outcome> {
        failures(&self.outcomes)
    }
}

/// Result of `run`: fetch followed by abstract.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub fetch: StageResult,
    pub abstracts: StageResult,
}

#[derive(Debug, Serialize)]
struct RunSummary<'a> {
    run_id: String,
    stage: Stage,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    elapsed_ms: u64,
    total: usize,
    succeeded: usize,
    skipped: usize,
    failed: Vec<FailedItem<'a>>,
    outputs: Vec<String>,
}

#[derive(Debug, Serialize)]
struct FailedItem<'a> {
    index: usize,
    payload: &'a str,
    message: &'a str,
    exhausted: bool,
    attempts: u32,
}

// ---------------------------------------------------------------------------
// Stages
// ---------------------------------------------------------------------------

/// Fetch every URL in `input` into article files.
///
/// Articles land in `output_dir`, or a fresh timestamped directory under
/// `<output_root>/article_content/`.
#[instrument(skip_all, fields(stage = "fetch", input = %input.display()))]
pub async fn fetch_articles(
    ctx: &RunContext,
    input: &Path,
    output_dir: Option<&Path>,
) -> Result<StageResult> {
    let started = Stamp::now();
    let items = read_work_list(input).await?;
    let engine = ctx.engine_config(Stage::Fetch)?;

    let dir = match output_dir {
        Some(dir) => dir.to_path_buf(),
        None => ctx
            .output_root()
            .join("article_content")
            .join(format!("articles_{}", file_timestamp())),
    };
    create_dir(&dir).await?;

    info!(items = items.len(), dir = %dir.display(), "fetching articles");

    let fetcher = PageFetcher::new(&dir).with_challenge_markers(engine.rejection_markers.clone());
    let outcomes = ctx.orchestrator(fetcher, &engine)?.run(&items).await;

    let manifest_path = dir.join(ARTICLE_MANIFEST);
    write_file(&manifest_path, &manifest(&outcomes)).await?;

    let result = StageResult {
        stage: Stage::Fetch,
        merge: merge(&outcomes),
        output: Some(manifest_path),
        failed_items: dir.join(FAILED_ITEMS),
        summary: dir.join(RUN_SUMMARY),
        elapsed: started.elapsed(),
        outcomes,
    };
    record_run(&result, &started).await?;

    info!(
        succeeded = result.succeeded(),
        total = result.total(),
        skipped = result.skipped(),
        "fetch complete"
    );
    Ok(result)
}

/// Abstract every article listed in `manifest` into one markdown file.
#[instrument(skip_all, fields(stage = "abstract", manifest = %manifest.display()))]
pub async fn abstract_articles(
    ctx: &RunContext,
    manifest: &Path,
    output: Option<&Path>,
) -> Result<StageResult> {
    let started = Stamp::now();
    let items = read_work_list(manifest).await?;
    let engine = ctx.engine_config(Stage::Abstract)?;

    let api = &ctx.config.api;
    let api_key = resolve_api_key(&api.api_key_env)?;
    let model = match &ctx.overrides.model {
        Some(model) => model.clone(),
        None => require_model(&api.abstract_model, "abstract_model")?.to_string(),
    };
    let prompt = read_prompt(&ctx.prompt_path(ABSTRACT_PROMPT)).await?;

    let client = Arc::new(ChatClient::new(&api.base_url, api_key, ctx.request_timeout())?);
    let op = AbstractWriter::new(client, model, prompt);

    let output = markdown_output(ctx, output);
    run_markdown_stage(ctx, Stage::Abstract, op, &engine, &items, output, started).await
}

/// Ask the bot endpoint to fetch and abstract every URL in `input`.
#[instrument(skip_all, fields(stage = "digest", input = %input.display()))]
pub async fn digest_urls(
    ctx: &RunContext,
    input: &Path,
    output: Option<&Path>,
) -> Result<StageResult> {
    let started = Stamp::now();
    let items = read_work_list(input).await?;
    let engine = ctx.engine_config(Stage::Digest)?;

    let api = &ctx.config.api;
    let api_key = resolve_api_key(&api.api_key_env)?;
    let models = DigestModels::from_api(api, ctx.overrides.model.as_deref())?;

    let client = Arc::new(ChatClient::new(&api.digest_base_url, api_key, ctx.request_timeout())?);
    let op = DigestOperation::new(client, models);

    let output = markdown_output(ctx, output);
    run_markdown_stage(ctx, Stage::Digest, op, &engine, &items, output, started).await
}

/// Fetch, then abstract whatever was fetched.
///
/// `ctx.overrides` apply to the abstract half only; fetch runs on its own
/// stage policy.
#[instrument(skip_all, fields(input = %input.display()))]
pub async fn run_pipeline(
    ctx: &RunContext,
    input: &Path,
    articles_dir: Option<&Path>,
    output: Option<&Path>,
) -> Result<RunResult> {
    let fetch_ctx = ctx.clone().with_overrides(StageOverrides::default());
    let fetch = fetch_articles(&fetch_ctx, input, articles_dir).await?;

    let Some(manifest_path) = fetch.output.clone().filter(|_| fetch.succeeded() > 0) else {
        return Err(DigestError::validation(format!(
            "fetch produced no articles ({} of {} failed), nothing to abstract; see {}",
            fetch.total() - fetch.succeeded(),
            fetch.total(),
            fetch.failed_items.display()
        )));
    };

    let abstracts = abstract_articles(ctx, &manifest_path, output).await?;
    Ok(RunResult { fetch, abstracts })
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Run `op`, merge, and write the markdown only if something was produced.
async fn run_markdown_stage<O: Operation>(
    ctx: &RunContext,
    stage: Stage,
    op: O,
    engine: &EngineConfig,
    items: &[WorkItem],
    output: PathBuf,
    started: Stamp,
) -> Result<StageResult> {
    info!(%stage, items = items.len(), output = %output.display(), "starting stage");

    let outcomes = ctx.orchestrator(op, engine)?.run(items).await;
    let merged = merge(&outcomes);

    let written = match merged.text() {
        Some(text) => {
            write_file(&output, text).await?;
            info!(path = %output.display(), succeeded = merged.succeeded(), total = merged.total(), "wrote merged markdown");
            Some(output.clone())
        }
        None => {
            warn!(%stage, total = merged.total(), "nothing produced, no markdown written");
            None
        }
    };

    let result = StageResult {
        stage,
        merge: merged,
        output: written,
        failed_items: output.with_extension(FAILED_ITEMS),
        summary: output.with_extension(RUN_SUMMARY),
        elapsed: started.elapsed(),
        outcomes,
    };
    record_run(&result, &started).await?;
    Ok(result)
}

/// Explicit output path, or `<output_root>/abstract_md/abstract_md_<timestamp>.md`.
fn markdown_output(ctx: &RunContext, output: Option<&Path>) -> PathBuf {
    match output {
        Some(path) => path.to_path_buf(),
        None => ctx
            .output_root()
            .join("abstract_md")
            .join(format!("abstract_md_{}.md", file_timestamp())),
    }
}

/// Write `failed_items.txt` and `run_summary.json` for a finished stage.
async fn record_run(result: &StageResult, started: &Stamp) -> Result<()> {
    let failed = result.failures();

    let failed_list: String = failed.iter().map(|o| format!("{}\n", o.payload)).collect();
    write_file(&result.failed_items, &failed_list).await?;

    let summary = RunSummary {
        run_id: started.run_id.to_string(),
        stage: result.stage,
        started_at: started.at,
        finished_at: Utc::now(),
        elapsed_ms: result.elapsed.as_millis() as u64,
        total: result.total(),
        succeeded: result.succeeded(),
        skipped: result.skipped(),
        failed: failed
            .iter()
            .filter_map(|o| {
                let error = o.error()?;
                Some(FailedItem {
                    index: o.index,
                    payload: &o.payload,
                    message: &error.message,
                    exhausted: error.exhausted,
                    attempts: o.attempts,
                })
            })
            .collect(),
        outputs: result
            .output
            .iter()
            .map(|p| p.display().to_string())
            .collect(),
    };

    let json = serde_json::to_string_pretty(&summary)
        .map_err(|e| DigestError::parse(format!("failed to serialize run summary: {e}")))?;
    write_file(&result.summary, &json).await
}

/// Start of a stage run.
struct Stamp {
    run_id: Uuid,
    at: DateTime<Utc>,
    instant: Instant,
}

impl Stamp {
    fn now() -> Self {
        Self {
            run_id: Uuid::now_v7(),
            at: Utc::now(),
            instant: Instant::now(),
        }
    }

    fn elapsed(&self) -> Duration {
        self.instant.elapsed()
    }
}

/// Local-time stamp used in default file names.
pub(crate) fn file_timestamp() -> String {
    Local::now().format("%Y%m%d_%H%M%S").to_string()
}

pub(crate) async fn read_work_list(path: &Path) -> Result<Vec<WorkItem>> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| DigestError::io(path, e))?;
    let items = parse_work_list(&text);
    if items.is_empty() {
        return Err(DigestError::validation(format!(
            "no work items in {}",
            path.display()
        )));
    }
    Ok(items)
}

pub(crate) async fn read_prompt(path: &Path) -> Result<String> {
    let prompt = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| DigestError::io(path, e))?;
    if prompt.trim().is_empty() {
        return Err(DigestError::config(format!(
            "system prompt {} is empty",
            path.display()
        )));
    }
    Ok(prompt)
}

pub(crate) async fn create_dir(dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| DigestError::io(dir, e))
}

pub(crate) async fn write_file(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        create_dir(parent).await?;
    }
    tokio::fs::write(path, content)
        .await
        .map_err(|e| DigestError::io(path, e))
}
