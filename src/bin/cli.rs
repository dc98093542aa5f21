//! Herald CLI
//!
//! Daemon and one-shot entry points for the alerting pipelines.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use herald::{
    error::AppError,
    models::Config,
    notify::{HttpTransport, Notifier},
    pipeline::{self, Pipeline, TickOutcome},
    storage::{FileStateStore, StateStore},
    utils::{self, Shutdown, http::HttpClient},
};

const EXIT_CONFIG: u8 = 2;
const EXIT_FAILED: u8 = 3;

/// Herald - external-data-to-chat alerting daemon
#[derive(Parser, Debug)]
#[command(name = "herald", version, about = "Poll HTTP sources and alert chat channels on change")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "herald.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run all pipelines on their intervals until interrupted
    Run,

    /// Run a single tick of one pipeline and exit
    RunOnce {
        /// Pipeline id to run
        #[arg(long)]
        pipeline: String,

        /// Exit 0 even when the source fails
        #[arg(long)]
        allow_source_fail: bool,
    },

    /// Delete the persisted state of one pipeline
    Reset {
        /// Pipeline id to reset
        #[arg(long)]
        pipeline: String,
    },

    /// Validate the configuration, including URLs and selectors
    Validate,

    /// Show the persisted state of every pipeline
    Status,
}

/// Initialize logging based on verbosity flag.
fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = match load_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            log::error!("Config error ({}): {e}", cli.config.display());
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    match cli.command {
        Command::Run => run_daemon(config).await,
        Command::RunOnce {
            pipeline,
            allow_source_fail,
        } => run_once(config, &pipeline, allow_source_fail).await,
        Command::Reset { pipeline } => reset(config, &pipeline).await,
        Command::Validate => validate(config),
        Command::Status => status(config).await,
    }
}

fn load_config(path: &Path) -> herald::error::Result<Config> {
    let config = Config::load(path)?;
    config.validate()?;
    Ok(config)
}

/// Run the scheduler until SIGINT/SIGTERM, then report.
async fn run_daemon(config: Config) -> ExitCode {
    let (handle, shutdown) = utils::shutdown_channel();
    tokio::spawn(async move {
        wait_for_signal().await;
        log::info!("Signal received, shutting down...");
        handle.trigger();
    });

    let summary = match pipeline::run(config, shutdown).await {
        Ok(summary) => summary,
        Err(e) => {
            log::error!("Scheduler failed to start: {e}");
            return exit_for(&e);
        }
    };

    for (id, s) in &summary.pipelines {
        log::info!(
            "pipeline '{id}': {} tick(s), {} successful, {} alert(s) sent",
            s.ticks,
            s.successes,
            s.alerts
        );
    }

    // A daemon that ticked but never once succeeded exits loudly so
    // supervisors notice.
    if summary.total_ticks() > 0 && !summary.any_success() {
        log::error!("Every tick failed; check source and destination config");
        return ExitCode::from(EXIT_FAILED);
    }
    ExitCode::SUCCESS
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                log::warn!("Cannot listen for SIGTERM: {e}");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// One tick of one pipeline, synchronously, for cron-style use.
async fn run_once(config: Config, pipeline_id: &str, allow_source_fail: bool) -> ExitCode {
    let Some(def) = config.pipeline(pipeline_id) else {
        log::error!("Unknown pipeline '{pipeline_id}'");
        return ExitCode::from(EXIT_CONFIG);
    };

    let pipeline = match Pipeline::build(def.clone()) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            log::error!("pipeline '{pipeline_id}': {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let http = match HttpClient::new(&config.http) {
        Ok(http) => Arc::new(http),
        Err(e) => {
            log::error!("Cannot build HTTP client: {e}");
            return ExitCode::FAILURE;
        }
    };
    let store = FileStateStore::new(&config.state_dir);
    let notifier = Notifier::new(Arc::new(HttpTransport::new(http.clone())));

    match pipeline
        .run_tick_bounded(&http, &store, &notifier, &Shutdown::inert())
        .await
    {
        Ok(TickOutcome::Delivered { alerts, report }) => {
            log::info!("{alerts} alert(s), {}", report.summary());
            ExitCode::SUCCESS
        }
        Ok(TickOutcome::Quiet) => {
            log::info!("Nothing to report");
            ExitCode::SUCCESS
        }
        Ok(TickOutcome::SourceFailed { error, .. }) => {
            if allow_source_fail {
                log::warn!("Source failed (tolerated): {error}");
                ExitCode::SUCCESS
            } else {
                log::error!("Source failed: {error}");
                ExitCode::from(EXIT_FAILED)
            }
        }
        Err(e) => {
            log::error!("Tick failed: {e}");
            exit_for(&e)
        }
    }
}

async fn reset(config: Config, pipeline_id: &str) -> ExitCode {
    if config.pipeline(pipeline_id).is_none() {
        log::error!("Unknown pipeline '{pipeline_id}'");
        return ExitCode::from(EXIT_CONFIG);
    }

    let store = FileStateStore::new(&config.state_dir);
    match store.reset(pipeline_id).await {
        Ok(true) => {
            log::info!("State for '{pipeline_id}' deleted; next tick runs as first-run");
            ExitCode::SUCCESS
        }
        Ok(false) => {
            log::info!("No state stored for '{pipeline_id}'");
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("Reset failed: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Deep validation: selectors and URLs are compiled, not just parsed.
fn validate(config: Config) -> ExitCode {
    for def in &config.pipelines {
        if let Err(e) = Pipeline::build(def.clone()) {
            log::error!("{e}");
            return ExitCode::from(EXIT_CONFIG);
        }
        log::info!(
            "✓ pipeline '{}': {} every {:?}, {} destination(s)",
            def.id,
            def.source.url(),
            def.interval(),
            def.destinations.len()
        );
    }
    log::info!("Configuration OK ({} pipeline(s))", config.pipelines.len());
    ExitCode::SUCCESS
}

async fn status(config: Config) -> ExitCode {
    let store = FileStateStore::new(&config.state_dir);
    match pipeline::collect_status(&config, &store).await {
        Ok(statuses) => {
            for s in statuses {
                match s.last_success_at {
                    Some(at) => log::info!(
                        "pipeline '{}': {} tracked, {} alert mark(s), {} consecutive failure(s), \
                         last success {}",
                        s.id,
                        s.tracked,
                        s.alert_marks,
                        s.consecutive_failures,
                        at.format("%Y-%m-%d %H:%M:%S UTC")
                    ),
                    None => log::info!("pipeline '{}': no state yet", s.id),
                }
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("Cannot read state: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Map an error to the documented exit codes: 2 for configuration
/// problems, 3 for an ordinary failed tick (delivery, missing reference
/// row, tick timeout), 1 for anything unexpected.
fn exit_code_for(e: &AppError) -> u8 {
    match e {
        AppError::Config(_) | AppError::Toml(_) | AppError::Url(_) => EXIT_CONFIG,
        AppError::Delivery(_) | AppError::MissingReference { .. } | AppError::Timeout(_) => {
            EXIT_FAILED
        }
        _ => 1,
    }
}

fn exit_for(e: &AppError) -> ExitCode {
    ExitCode::from(exit_code_for(e))
}
