//! Run the research pipeline for one query and print the decision.
//!
//! Reads the API key from the `OPENROUTER_KEY` environment variable unless
//! `--offline` is given.
//!
//! # Examples
//!
//! ```sh
//! # Default eleven-stage research pipeline
//! funnel --query "EV charging stations in Europe"
//!
//! # Deterministic dry run, no network
//! funnel --query "EV charging stations in Europe" --offline
//!
//! # Custom stage list, tighter window, JSON report
//! funnel --query "Home batteries" --config pipeline.json --retention 4 --json
//!
//! # Query from stdin with a time limit on the whole run
//! echo "Solar leasing" | funnel --timeout-secs 300
//! ```

use clap::Parser;
use funnel_rs::prelude::*;
use std::io::{self, Read};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tracing::level_filters::LevelFilter;
use tracing::{info, warn};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Run a staged research pipeline with bounded context.
#[derive(Parser)]
#[command(name = "funnel")]
struct Cli {
    // ── Input ──────────────────────────────────────────────────
    /// Research query. Read from stdin when omitted
    #[arg(long)]
    query: Option<String>,

    /// Pipeline config file (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    // ── Context ────────────────────────────────────────────────
    /// Non-system turns kept in the sliding window
    #[arg(long)]
    retention: Option<usize>,

    // ── Logging ────────────────────────────────────────────────
    /// Directory for per-run state logs
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Event log file
    #[arg(long)]
    event_log: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace). Falls back to LOG_LEVEL
    #[arg(long)]
    log_level: Option<String>,

    // ── Model ──────────────────────────────────────────────────
    /// Chat model for producers and synthesis
    #[arg(long)]
    model: Option<String>,

    /// Use deterministic extractive logic instead of a chat model
    #[arg(long)]
    offline: bool,

    // ── Run control ────────────────────────────────────────────
    /// Abort the run after this many seconds
    #[arg(long)]
    timeout_secs: Option<u64>,

    // ── Output mode ────────────────────────────────────────────
    /// Print the full run report as JSON
    #[arg(long)]
    json: bool,
}

fn init_tracing(level: Option<&str>) {
    let level = level
        .map(str::to_string)
        .or_else(|| std::env::var("LOG_LEVEL").ok())
        .and_then(|l| l.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::INFO);
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_target(false)
        .with_filter(level);
    tracing_subscriber::registry().with(layer).init();
}

fn read_query(cli: &Cli) -> Result<String, String> {
    if let Some(ref query) = cli.query {
        return Ok(query.clone());
    }
    let mut buf = String::new();
    io::stdin()
        .read_to_string(&mut buf)
        .map_err(|e| format!("failed to read query from stdin: {e}"))?;
    let query = buf.trim().to_string();
    if query.is_empty() {
        return Err("no query given (use --query or pipe one on stdin)".into());
    }
    Ok(query)
}

fn load_config(cli: &Cli) -> Result<PipelineConfig, String> {
    let config = match cli.config {
        Some(ref path) => PipelineConfig::load(path),
        None => Ok(PipelineConfig::default()),
    }
    .and_then(PipelineConfig::with_env)
    .map_err(|e| e.to_string())?;

    let mut config = config;
    if let Some(retention) = cli.retention {
        config.retention_limit = retention;
    }
    if let Some(ref dir) = cli.state_dir {
        config.state_log_dir = dir.clone();
    }
    if let Some(ref path) = cli.event_log {
        config.event_log = path.clone();
    }
    if let Some(ref model) = cli.model {
        config.model = model.clone();
    }
    Ok(config)
}

fn build_logic(cli: &Cli, config: &PipelineConfig) -> Result<Arc<dyn StageLogic>, String> {
    if cli.offline {
        info!("offline mode: using extractive stage logic");
        return Ok(Arc::new(ExtractiveLogic::default()));
    }
    let client = ChatClient::from_env().map_err(|e| e.to_string())?;
    let chat = ChatLogic::new(client, config.model.clone())
        .with_summary_model(config.summary_model.clone())
        .with_web_search(config.web_search);
    Ok(Arc::new(RetryLogic::new(
        chat,
        RetryConfig::with_retries(config.max_retries),
    )))
}

async fn run_pipeline(cli: &Cli) -> Result<(String, RunReport), String> {
    let query = read_query(cli)?;
    let config = load_config(cli)?;
    let logic = build_logic(cli, &config)?;

    let mut builder = PipelineBuilder::new()
        .retention_limit(config.retention_limit)
        .descriptors(config.resolved_stages(), |_| Some(Arc::clone(&logic)))
        .map_err(|e| e.to_string())?;
    for turn in &config.system_turns {
        builder = builder.system_turn(turn.clone());
    }
    let pipeline = builder.build().map_err(|e| e.to_string())?;

    let controller = PipelineController::new(Arc::new(pipeline));
    let state_sink = JsonlSink::for_run(&config.state_log_dir, controller.run_id());
    let mut controller = controller
        .with_state_sink(Arc::new(state_sink))
        .with_event_sink(Arc::new(JsonlSink::new(&config.event_log)));

    let result = match cli.timeout_secs {
        Some(secs) => {
            match tokio::time::timeout(Duration::from_secs(secs), controller.run(&query)).await {
                Ok(result) => result,
                Err(_) => {
                    warn!("run {} timed out after {secs}s", controller.run_id());
                    controller.abort(&format!("timed out after {secs}s")).await;
                    Ok(String::new())
                }
            }
        }
        None => controller.run(&query).await,
    };

    let report = controller.report();
    if controller.diagnostics().failure_count() > 0 {
        warn!(
            "{} log append(s) failed during the run",
            controller.diagnostics().failure_count()
        );
    }
    match result {
        Ok(_) if report.status != RunStatus::Completed => {
            Err(format!("run {} did not complete", report.run_id))
        }
        Ok(output) => Ok((output, report)),
        Err(e) => Err(e.to_string()),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    match run_pipeline(&cli).await {
        Ok((output, report)) => {
            if cli.json {
                match serde_json::to_string_pretty(&report) {
                    Ok(json) => println!("{json}"),
                    Err(e) => {
                        eprintln!("Error: failed to serialize report: {e}");
                        process::exit(1);
                    }
                }
            } else {
                println!("{output}");
            }
        }
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    }
}
