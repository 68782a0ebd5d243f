//! Deliverable assembly: abstracts in, dated report with an overall summary out.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Local, NaiveDate};
use tracing::{info, instrument};

use newsdigest_engine::SEPARATOR;
use newsdigest_shared::{DigestError, Result, Stage, WorkItem, require_model, resolve_api_key};

use crate::llm::ChatClient;
use crate::operations::ReportSummarizer;
use crate::pipeline::{RunContext, file_timestamp, read_prompt, write_file};

/// System prompt file for the summary call, under `prompts_dir`.
pub const SUMMARY_PROMPT: &str = "summary_prompt.md";

/// What `build_report` wrote.
#[derive(Debug, Clone)]
pub struct ReportResult {
    /// The deliverable markdown.
    pub output: PathBuf,
    /// Concatenation of several inputs, saved next to the abstracts.
    pub combined: Option<PathBuf>,
    /// Attempts the summary call took.
    pub attempts: u32,
}

/// Combine abstract files, summarise them, and write the dated deliverable.
#[instrument(skip_all, fields(inputs = inputs.len()))]
pub async fn build_report(
    ctx: &RunContext,
    inputs: &[PathBuf],
    output: Option<&Path>,
) -> Result<ReportResult> {
    if inputs.is_empty() {
        return Err(DigestError::validation("no abstract files given"));
    }

    let mut parts = Vec::with_capacity(inputs.len());
    for path in inputs {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| DigestError::io(path, e))?;
        parts.push(text);
    }
    let abstracts = parts.join(SEPARATOR);
    if abstracts.trim().is_empty() {
        return Err(DigestError::validation("abstract files are empty"));
    }

    let combined = if inputs.len() > 1 {
        let path = ctx
            .output_root()
            .join("abstract_md")
            .join(format!("combined_abstract_md_{}.md", file_timestamp()));
        write_file(&path, &abstracts).await?;
        info!(path = %path.display(), "saved combined abstracts");
        Some(path)
    } else {
        None
    };

    let engine = ctx.engine_config(Stage::Report)?;
    let api = &ctx.config.api;
    let api_key = resolve_api_key(&api.report_api_key_env)?;
    let model = match &ctx.overrides.model {
        Some(model) => model.clone(),
        None => require_model(&api.report_model, "report_model")?.to_string(),
    };
    let prompt = read_prompt(&ctx.prompt_path(SUMMARY_PROMPT)).await?;
    let base_url = api.report_base_url.as_deref().unwrap_or(&api.base_url);

    let client = Arc::new(ChatClient::new(
        base_url,
        api_key,
        std::time::Duration::from_secs(api.request_timeout_secs),
    )?);
    let op = ReportSummarizer::new(client, model, prompt, api.report_temperature, abstracts.as_str());

    let outcomes = ctx
        .orchestrator(op, &engine)?
        .without_guard()
        .run(&[WorkItem::new(0, "weekly summary")])
        .await;

    let outcome = outcomes
        .into_iter()
        .next()
        .ok_or_else(|| DigestError::Api("summary produced no outcome".into()))?;
    let summary = match outcome.result {
        Ok(summary) => summary,
        Err(error) => {
            return Err(DigestError::Api(format!(
                "summary failed after {} attempt(s): {}",
                outcome.attempts, error.message
            )));
        }
    };

    let today = Local::now().date_naive();
    let output = match output {
        Some(path) => path.to_path_buf(),
        None => ctx.output_root().join("deliverable").join(deliverable_name(today)),
    };
    write_file(&output, &render_deliverable(today, &summary, &abstracts)).await?;

    info!(path = %output.display(), attempts = outcome.attempts, "wrote deliverable");
    Ok(ReportResult {
        output,
        combined,
        attempts: outcome.attempts,
    })
}

/// `AI News Update YYYY MM DD.md`
pub fn deliverable_name(date: NaiveDate) -> String {
    format!("AI News Update {}.md", date.format("%Y %m %d"))
}

pub fn render_deliverable(date: NaiveDate, summary: &str, abstracts: &str) -> String {
    format!(
        "# AI News Update - {}\n\n## Weekly Summary\n\n{summary}\n\n---\n\n## News Abstracts\n\n{abstracts}",
        date.format("%Y/%m/%d")
    )
}
