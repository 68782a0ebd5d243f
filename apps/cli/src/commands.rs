//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use newsdigest_core::{
    RunContext, StageOverrides, StageResult, abstract_articles, build_report, digest_urls,
    fetch_articles, run_pipeline,
};
use newsdigest_engine::{EngineEvent, EventSink, FanoutSink, Merge, TracingSink};
use newsdigest_shared::{AppConfig, init_config, load_config, load_config_from};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// newsdigest: batch news articles into abstracts and a weekly report.
#[derive(Parser)]
#[command(
    name = "newsdigest",
    version,
    about = "Fetch news articles, abstract them with an LLM and assemble a dated report.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Config file to use instead of ~/.newsdigest/newsdigest.toml.
    #[arg(long, global = true, env = "NEWSDIGEST_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Per-run overrides of the stage's engine config.
#[derive(Args, Debug, Default)]
pub(crate) struct OverrideArgs {
    /// Items processed concurrently per batch.
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Attempts per item before giving up.
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// Model id, replacing the configured one.
    #[arg(long)]
    pub model: Option<String>,
}

impl From<OverrideArgs> for StageOverrides {
    fn from(args: OverrideArgs) -> Self {
        Self {
            concurrency: args.concurrency,
            max_attempts: args.max_attempts,
            model: args.model,
        }
    }
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Download every URL in a list into article text files.
    Fetch {
        /// Text file with one URL per line.
        input: PathBuf,

        /// Directory for the article files (defaults to a timestamped one).
        #[arg(short, long)]
        out: Option<PathBuf>,

        #[command(flatten)]
        overrides: OverrideArgs,
    },

    /// Abstract the articles listed in a manifest into one markdown file.
    Abstract {
        /// Manifest of article paths, e.g. successful_articles.txt.
        manifest: PathBuf,

        /// Markdown output path.
        #[arg(short, long)]
        out: Option<PathBuf>,

        #[command(flatten)]
        overrides: OverrideArgs,
    },

    /// Have the bot endpoint fetch and abstract every URL in a list.
    Digest {
        /// Text file with one URL per line.
        input: PathBuf,

        /// Markdown output path.
        #[arg(short, long)]
        out: Option<PathBuf>,

        #[command(flatten)]
        overrides: OverrideArgs,
    },

    /// Fetch, then abstract whatever was fetched.
    ///
    /// --concurrency, --max-attempts and --model apply to the abstract step;
    /// fetching keeps the [fetch] policy.
    Run {
        /// Text file with one URL per line.
        input: PathBuf,

        /// Directory for the article files.
        #[arg(long)]
        articles_dir: Option<PathBuf>,

        /// Markdown output path.
        #[arg(short, long)]
        out: Option<PathBuf>,

        #[command(flatten)]
        overrides: OverrideArgs,
    },

    /// Summarise abstract files into the dated deliverable.
    Report {
        /// One or more abstract markdown files.
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Deliverable path.
        #[arg(short, long)]
        out: Option<PathBuf>,

        #[command(flatten)]
        overrides: OverrideArgs,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "newsdigest=info",
        1 => "newsdigest=debug",
        _ => "newsdigest=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt().with_env_filter(env_filter).with_target(false).init();
        }
        LogFormat::Json => {
            fmt().json().with_env_filter(env_filter).init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config;
    match cli.command {
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(config_path.as_deref()),
            ConfigAction::Show => cmd_config_show(config_path.as_deref()),
        },
        Command::Fetch {
            input,
            out,
            overrides,
        } => {
            let ctx = context(config_path.as_deref(), overrides)?;
            let result = fetch_articles(&ctx, &input, out.as_deref()).await?;
            print_stage(&result);
            ensure_produced(&result)
        }
        Command::Abstract {
            manifest,
            out,
            overrides,
        } => {
            let ctx = context(config_path.as_deref(), overrides)?;
            let result = abstract_articles(&ctx, &manifest, out.as_deref()).await?;
            print_stage(&result);
            ensure_produced(&result)
        }
        Command::Digest {
            input,
            out,
            overrides,
        } => {
            let ctx = context(config_path.as_deref(), overrides)?;
            let result = digest_urls(&ctx, &input, out.as_deref()).await?;
            print_stage(&result);
            ensure_produced(&result)
        }
        Command::Run {
            input,
            articles_dir,
            out,
            overrides,
        } => {
            let ctx = context(config_path.as_deref(), overrides)?;
            let result =
                run_pipeline(&ctx, &input, articles_dir.as_deref(), out.as_deref()).await?;
            print_stage(&result.fetch);
            print_stage(&result.abstracts);
            ensure_produced(&result.abstracts)
        }
        Command::Report {
            inputs,
            out,
            overrides,
        } => {
            let ctx = context(config_path.as_deref(), overrides)?;
            cmd_report(&ctx, &inputs, out.as_deref()).await
        }
    }
}

/// Load config, wire up progress output and ctrl-c cancellation.
fn context(config_path: Option<&Path>, overrides: OverrideArgs) -> Result<RunContext> {
    let config = read_config(config_path)?;

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(handle_interrupts(tokio::signal::ctrl_c, token, || {
        std::process::exit(130);
    }));

    let sinks: Vec<Arc<dyn EventSink>> = vec![Arc::new(TracingSink), Arc::new(CliProgress::new())];
    let sink = FanoutSink(sinks);
    Ok(RunContext::new(config)
        .with_overrides(overrides.into())
        .with_sink(Arc::new(sink))
        .with_cancellation(cancel))
}

/// First signal cancels `token`; a second one calls `force_quit`.
async fn handle_interrupts<S, F>(mut signal: S, token: CancellationToken, force_quit: impl FnOnce())
where
    S: FnMut() -> F,
    F: Future<Output = std::io::Result<()>>,
{
    if signal().await.is_err() {
        return;
    }
    warn!("interrupted, letting in-flight attempts finish (ctrl-c again to quit now)");
    token.cancel();

    if signal().await.is_ok() {
        warn!("interrupted twice, exiting");
        force_quit();
    }
}

fn read_config(path: Option<&Path>) -> Result<AppConfig> {
    let config = match path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    Ok(config)
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_report(ctx: &RunContext, inputs: &[PathBuf], out: Option<&Path>) -> Result<()> {
    info!(inputs = inputs.len(), "building report");
    let result = build_report(ctx, inputs, out).await?;

    println!();
    println!("  Report written.");
    println!("  Path:     {}", result.output.display());
    if let Some(combined) = &result.combined {
        println!("  Combined: {}", combined.display());
    }
    println!("  Attempts: {}", result.attempts);
    println!();
    Ok(())
}

fn cmd_config_init(path: Option<&Path>) -> Result<()> {
    let path = match path {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, toml::to_string_pretty(&AppConfig::default())?)?;
            path.to_path_buf()
        }
        None => init_config()?,
    };
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(path: Option<&Path>) -> Result<()> {
    let config = read_config(path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Result reporting
// ---------------------------------------------------------------------------

fn print_stage(result: &StageResult) {
    let failures = result.failures();

    println!();
    println!(
        "  {}: {}/{} succeeded ({} reused)",
        result.stage,
        result.succeeded(),
        result.total(),
        result.skipped()
    );
    match (&result.merge, &result.output) {
        (Merge::NothingProduced { .. }, _) => println!("  Nothing produced."),
        (Merge::Produced { .. }, Some(output)) => println!("  Output:  {}", output.display()),
        (Merge::Produced { .. }, None) => {}
    }
    if !failures.is_empty() {
        println!(
            "  Failed:  {} (re-run list in {})",
            failures.len(),
            result.failed_items.display()
        );
    }
    println!("  Summary: {}", result.summary.display());
    println!("  Time:    {:.1}s", result.elapsed.as_secs_f64());
    println!();
}

/// A finished stage that produced nothing is a failed command.
fn ensure_produced(result: &StageResult) -> Result<()> {
    match result.merge {
        Merge::Produced { .. } => Ok(()),
        Merge::NothingProduced { total } => Err(eyre!(
            "{}: nothing produced from {total} item(s)",
            result.stage
        )),
    }
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// Progress bar per engine run, driven by engine events.
struct CliProgress {
    bar: Mutex<Option<ProgressBar>>,
}

impl CliProgress {
    fn new() -> Self {
        Self {
            bar: Mutex::new(None),
        }
    }

    fn with_bar(&self, f: impl FnOnce(&ProgressBar)) {
        if let Ok(guard) = self.bar.lock() {
            if let Some(bar) = guard.as_ref() {
                f(bar);
            }
        }
    }

    fn start(&self, total: usize) {
        let bar = ProgressBar::new(total as u64);
        let style =
            ProgressStyle::with_template("{spinner:.cyan} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        bar.set_style(style);
        bar.enable_steady_tick(std::time::Duration::from_millis(80));

        if let Ok(mut guard) = self.bar.lock() {
            if let Some(previous) = guard.replace(bar) {
                previous.finish_and_clear();
            }
        }
    }

    fn finish(&self) {
        if let Some(bar) = self.bar.lock().ok().and_then(|mut guard| guard.take()) {
            bar.finish_and_clear();
        }
    }
}

impl EventSink for CliProgress {
    fn emit(&self, event: &EngineEvent<'_>) {
        match *event {
            EngineEvent::RunStarted { total, .. } => self.start(total),
            EngineEvent::BatchStarted { batch, batches, .. } => {
                self.with_bar(|bar| bar.set_message(format!("batch {batch}/{batches}")));
            }
            EngineEvent::AttemptFailed {
                payload,
                attempt,
                max_attempts,
                ..
            } => self.with_bar(|bar| {
                bar.set_message(format!("retrying {payload} ({attempt}/{max_attempts})"))
            }),
            EngineEvent::ItemSkipped { .. }
            | EngineEvent::ItemSucceeded { .. }
            | EngineEvent::ItemFailed { .. } => self.with_bar(|bar| bar.inc(1)),
            EngineEvent::BatchFinished { .. } => {}
            EngineEvent::RunFinished { .. } => self.finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn overrides_flow_into_stage_overrides() {
        let cli = Cli::parse_from([
            "newsdigest",
            "abstract",
            "articles/successful_articles.txt",
            "--concurrency",
            "4",
            "--model",
            "gpt-4o-mini",
        ]);
        let Command::Abstract { overrides, .. } = cli.command else {
            panic!("expected abstract");
        };
        let overrides = StageOverrides::from(overrides);
        assert_eq!(overrides.concurrency, Some(4));
        assert_eq!(overrides.max_attempts, None);
        assert_eq!(overrides.model.as_deref(), Some("gpt-4o-mini"));
    }

    #[tokio::test]
    async fn second_interrupt_forces_quit() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use tokio::sync::Notify;

        let interrupts = Arc::new(Notify::new());
        let forced = Arc::new(AtomicBool::new(false));
        let token = CancellationToken::new();

        let signal = {
            let interrupts = interrupts.clone();
            move || {
                let interrupts = interrupts.clone();
                async move {
                    interrupts.notified().await;
                    Ok(())
                }
            }
        };
        let handle = tokio::spawn(handle_interrupts(signal, token.clone(), {
            let forced = forced.clone();
            move || forced.store(true, Ordering::SeqCst)
        }));

        interrupts.notify_one();
        token.cancelled().await;
        assert!(!forced.load(Ordering::SeqCst));

        interrupts.notify_one();
        handle.await.unwrap();
        assert!(forced.load(Ordering::SeqCst));
    }

    #[test]
    fn report_needs_an_input() {
        assert!(Cli::try_parse_from(["newsdigest", "report"]).is_err());
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::parse_from(["newsdigest", "fetch", "urls.txt", "-vv", "--config", "nd.toml"]);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.config.as_deref(), Some(Path::new("nd.toml")));
    }
}
