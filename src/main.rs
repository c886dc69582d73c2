// src/main.rs

//! Gateway entry-point.
//!
//! 1. Parse CLI arguments and load the configuration
//! 2. Set up structured logging and, if configured, the metrics endpoint
//! 3. Build the vendor client, sinks and the offset-tracking queue
//! 4. Restore persisted offsets and start the checkpoint task
//! 5. Run the stream manager until it fails or Ctrl-C arrives

// ───── std / 3rd-party imports ──────────────────────────────────────────────
use anyhow::Context;
use chrono::Local;
use clap::Parser;
use fern::Dispatch;
use log::LevelFilter;
use std::{path::PathBuf, process, sync::Arc, thread};
use tokio_util::sync::CancellationToken;

// ───── local imports ────────────────────────────────────────────────────────
use gateway::Gateway;
use gateway::comms::FalconClient;
use gateway::config::{self, Config, DEFAULT_CONFIG_PATH, model::LoggingConfig};
use gateway::db::{OffsetStore, run_checkpoints};
use gateway::queue::OffsetTrackingQueue;
use gateway::sinks::{SinkRegistry, build_sinks};
use gateway::telemetry;

/// Forward vendor detection events to SIEMs and cloud consoles.
#[derive(Debug, Parser)]
#[command(name = "detection-gateway", version)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,
}

// ───── helpers ──────────────────────────────────────────────────────────────

/// Configure global logging as requested in `[logging]`.
fn setup_logging(logging: &LoggingConfig) -> Result<(), fern::InitError> {
    let level = match logging.level.to_uppercase().as_str() {
        "ERROR" => LevelFilter::Error,
        "WARN" | "WARNING" => LevelFilter::Warn,
        "DEBUG" => LevelFilter::Debug,
        "TRACE" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    };

    let log_path = logging
        .enable
        .then(|| PathBuf::from(logging.file.as_deref().unwrap_or("detection-gateway.log")));

    let mut dispatch = Dispatch::new()
        .format(|out, msg, record| {
            out.finish(format_args!(
                "[{}][{:5}][{}][pid={}][tid={:?}] {}",
                Local::now().to_rfc3339(),
                record.level(),
                record.target(),
                process::id(),
                thread::current().id(),
                msg
            ))
        })
        .level(level)
        // Connection-pool chatter drowns the pipeline at debug.
        .level_for("hyper_util", LevelFilter::Warn)
        .level_for("reqwest", LevelFilter::Warn)
        .chain(std::io::stdout());

    if let Some(path) = log_path {
        dispatch = dispatch.chain(fern::log_file(path)?);
    }

    dispatch.apply()?;
    Ok(())
}

/// Cancel `shutdown` on Ctrl-C.
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => log::info!("Ctrl-C received, shutting down"),
            Err(e) => log::error!("Cannot listen for Ctrl-C: {e}"),
        }
        shutdown.cancel();
    });
}

async fn run(cli: Cli, cfg: Config) -> anyhow::Result<()> {
    setup_logging(&cfg.logging).context("logging setup")?;
    log::info!("detection-gateway {} starting", env!("CARGO_PKG_VERSION"));

    if let Some(addr) = cfg.metrics.listen {
        telemetry::install(addr).context("metrics endpoint")?;
    }

    let falcon = Arc::new(FalconClient::from_config(&cfg.falcon).context("falcon client")?);
    let registry = SinkRegistry::new(
        build_sinks(&cfg).await.context("backend setup")?,
        cfg.events.exclude_clouds.iter().copied(),
    )
    .context("backend setup")?;
    let queue = Arc::new(OffsetTrackingQueue::new(cfg.main.queue_capacity));
    let shutdown = CancellationToken::new();
    // Outlives the gateway so the drained offsets get a final flush.
    let flush = CancellationToken::new();

    let checkpoints = match &cfg.offsets.path {
        Some(path) => {
            let store = OffsetStore::open(path)
                .with_context(|| format!("offset store {}", path.display()))?;
            let restored = store.load().context("loading offsets")?;
            log::info!("Restored offsets for {} feed(s)", restored.len());
            queue.seed(restored);
            Some(tokio::spawn(run_checkpoints(
                store,
                Arc::clone(&queue),
                cfg.offsets.checkpoint_interval,
                flush.clone(),
            )))
        }
        None => None,
    };

    spawn_signal_handler(shutdown.clone());
    log::info!(
        "Using config {:?}: application_id={}, region={}",
        cli.config,
        cfg.falcon.application_id,
        cfg.falcon.cloud_region
    );

    let gateway = Gateway::start(
        &cfg,
        falcon.clone(),
        falcon,
        registry,
        queue,
        shutdown.clone(),
    );
    let result = gateway.run().await;

    flush.cancel();
    if let Some(handle) = checkpoints {
        if let Err(e) = handle.await {
            log::error!("Checkpoint task aborted: {e}");
        }
    }
    result.context("stream supervision")?;
    log::info!("detection-gateway stopped");
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let cfg = match config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("[{}][ERROR][config] {:?}: {e}", Local::now().to_rfc3339(), cli.config);
            process::exit(1);
        }
    };
    if cli.check {
        println!("{}: configuration OK ({:?})", cli.config.display(), cfg.main.backends);
        return;
    }

    if let Err(e) = run(cli, cfg).await {
        log::error!("{e:#}");
        eprintln!("[{}][ERROR][main] {e:#}", Local::now().to_rfc3339());
        process::exit(1);
    }
}
