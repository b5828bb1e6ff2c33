//! CLI command definitions, routing, and tracing setup.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr};
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use autotagger_claude::ClaudeClient;
use autotagger_core::{Pipeline, RunOutcome, RunReporter, RunStatus, SilentReporter, Stage};
use autotagger_raindrop::RaindropClient;
use autotagger_shared::{
    AppConfig, RunConfig, config_file_path, init_config, load_config, load_config_from,
    resolve_credentials,
};

use crate::logging::RedactingMakeWriter;

/// Conventional exit status after SIGINT.
const EXIT_INTERRUPTED: u8 = 130;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// autotagger: tag untagged Raindrop.io bookmarks with Claude.
#[derive(Parser)]
#[command(
    name = "autotagger",
    version,
    about = "Categorize untagged Raindrop.io bookmarks with Claude and apply the tags.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Also append logs to this file.
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// Config file (defaults to ~/.autotagger/autotagger.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Tag every bookmark that has no tags yet.
    Run {
        /// Categorize but do not write any tags.
        #[arg(long)]
        dry_run: bool,

        /// Bookmarks per model request (overrides the config file).
        #[arg(long)]
        batch_size: Option<usize>,

        /// Print the final statistics as JSON on stdout.
        #[arg(long)]
        json: bool,
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

/// Initialize tracing based on CLI flags. Every sink goes through redaction.
pub(crate) fn init_tracing(cli: &Cli) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "autotagger=info",
        1 => "autotagger=debug",
        _ => "autotagger=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    let writer = RedactingMakeWriter::new(cli.log_file.as_deref())
        .wrap_err("failed to open log file")?;

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_ansi(cli.log_file.is_none())
                .with_writer(writer)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(writer)
                .init();
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Command::Run {
            dry_run,
            batch_size,
            json,
        } => {
            let config = resolve_config(cli.config.as_ref())?;
            cmd_run(config, dry_run, batch_size, json).await
        }
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => {
                let config = resolve_config(cli.config.as_ref())?;
                cmd_config_show(&config, cli.config)
            }
        },
    }
}

/// `--config` wins over the default location.
fn resolve_config(path: Option<&PathBuf>) -> Result<AppConfig> {
    Ok(match path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    })
}

async fn cmd_run(
    mut config: AppConfig,
    dry_run: bool,
    batch_size: Option<usize>,
    json: bool,
) -> Result<ExitCode> {
    config.processing.dry_run |= dry_run;
    if let Some(size) = batch_size {
        config.processing.batch_size = size;
    }

    // Credentials are checked before any client exists.
    let credentials = resolve_credentials(&config)?;
    let store = RaindropClient::new(&config.raindrop, credentials.raindrop_token())?;
    let model = ClaudeClient::new(&config.claude, credentials.claude_api_key())?;

    info!(
        model = model.model(),
        dry_run = config.processing.dry_run,
        batch_size = config.processing.batch_size,
        "starting auto-tagger"
    );

    let cancel = CancellationToken::new();
    spawn_interrupt_handler(cancel.clone());

    let reporter: Arc<dyn RunReporter> = if json {
        Arc::new(SilentReporter)
    } else {
        Arc::new(CliProgress::new())
    };

    let mut pipeline = Pipeline::new(RunConfig::from(&config), Arc::new(store), Arc::new(model))
        .with_reporter(reporter)
        .with_cancellation(cancel);
    let outcome = pipeline.run().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        print_summary(&outcome);
    }

    Ok(ExitCode::from(exit_status(&outcome)))
}

/// First Ctrl-C stops the run after the current step; a second one exits at once.
fn spawn_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("interrupt received, stopping after the current step (Ctrl-C again to abort)");
        cancel.cancel();

        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(i32::from(EXIT_INTERRUPTED));
        }
    });
}

fn exit_status(outcome: &RunOutcome) -> u8 {
    match outcome.status {
        RunStatus::Interrupted => EXIT_INTERRUPTED,
        RunStatus::Completed if outcome.stats.has_failures() => 1,
        RunStatus::Completed => 0,
    }
}

fn print_summary(outcome: &RunOutcome) {
    let stats = &outcome.stats;

    println!();
    match (outcome.status, outcome.dry_run) {
        (RunStatus::Interrupted, _) => println!("  Run interrupted, partial results:"),
        (RunStatus::Completed, true) => println!("  Dry run complete, no tags were written."),
        (RunStatus::Completed, false) => println!("  Tagging run complete!"),
    }
    println!("  Run:           {}", outcome.run_id);
    println!("  Untagged:      {}", stats.fetched);
    println!("  Categorized:   {}", stats.categorized);
    println!("  Tags applied:  {}", stats.updated);
    println!("  Failed:        {}", stats.failed);
    println!("  Skipped:       {}", stats.skipped);
    println!("  Rate limited:  {}", stats.rate_limited);
    if let Some(rate) = stats.success_rate() {
        println!("  Success rate:  {rate:.1}%");
    }
    if let Some(finished) = stats.finished_at {
        let elapsed = (finished - stats.started_at).num_milliseconds() as f64 / 1000.0;
        println!("  Time:          {elapsed:.1}s");
    }
    println!();
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }
}

impl RunReporter for CliProgress {
    fn stage(&self, stage: &Stage) {
        self.spinner.set_message(stage.to_string());
    }

    fn batch_done(&self, batch: usize, total: usize, categorized: usize) {
        self.spinner
            .set_message(format!("Batch {batch}/{total}: {categorized} categorized"));
    }

    fn record_applied(&self, title: &str, labels: &[String]) {
        self.spinner
            .set_message(format!("Tagged {title} [{}]", labels.join(", ")));
    }

    fn record_failed(&self, title: &str, error: &str) {
        self.spinner.println(format!("  ✗ {title}: {error}"));
    }

    fn done(&self, _outcome: &RunOutcome) {
        self.spinner.finish_and_clear();
    }
}

// ---------------------------------------------------------------------------
// Config commands
// ---------------------------------------------------------------------------

fn cmd_config_init() -> Result<ExitCode> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(ExitCode::SUCCESS)
}

fn cmd_config_show(config: &AppConfig, path: Option<PathBuf>) -> Result<ExitCode> {
    let path = match path {
        Some(p) => p,
        None => config_file_path()?,
    };
    println!("# {}", path.display());
    println!("{}", toml::to_string_pretty(config)?);

    // Report presence only, never values.
    for name in [&config.raindrop.token_env, &config.claude.api_key_env] {
        let state = if std::env::var(name).is_ok_and(|v| !v.trim().is_empty()) {
            "set"
        } else {
            "not set"
        };
        println!("# {name}: {state}");
    }
    Ok(ExitCode::SUCCESS)
}
