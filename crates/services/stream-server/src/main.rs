//! camstream service binary
//!
//! # Usage
//!
//! ```bash
//! # Defaults plus CAMSTREAM_* environment overrides
//! camstream-server < commands.jsonl
//!
//! # Config file, fixed pool size, JSON logs on stderr
//! camstream-server --config /etc/camstream.toml --workers 4 --log-format json
//! ```
//!
//! Commands are read from stdin, state updates are written to stdout and
//! logs go to stderr.

use anyhow::Context;
use camstream_core::{PortPool, WorkerPool};
use camstream_server::{publish_updates, run_commands, AppConfig};
use camstream_webrtc::StreamLauncher;
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Camera restreaming service
///
/// Starts and stops live views and event relays on request and publishes
/// them to an RTSP server.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "CAMSTREAM_CONFIG")]
    config: Option<PathBuf>,

    /// Number of worker slots (defaults to the CPU count)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Log output format
    #[arg(long, value_enum, default_value = "pretty", env = "CAMSTREAM_LOG_FORMAT")]
    log_format: LogFormat,

    /// Transcoder executable
    #[arg(long)]
    ffmpeg: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum LogFormat {
    /// Human-readable lines
    Pretty,
    /// One JSON object per line
    Json,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    let mut config = AppConfig::load(args.config.as_ref()).context("loading configuration")?;
    if let Some(workers) = args.workers {
        config.pool.workers = Some(workers);
    }
    if let Some(program) = args.ffmpeg {
        config.transcoder.program = program;
    }
    config.validate().context("validating configuration")?;

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_handler = Arc::clone(&shutdown_flag);
    ctrlc::set_handler(move || {
        if shutdown_flag_handler.swap(true, Ordering::SeqCst) {
            eprintln!("shutdown already in progress, exiting now");
            std::process::exit(1);
        }
        eprintln!("interrupt received, stopping sessions");

        std::thread::spawn(|| {
            std::thread::sleep(Duration::from_secs(10));
            eprintln!("graceful shutdown timed out, exiting");
            std::process::exit(1);
        });
    })
    .context("installing Ctrl+C handler")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .thread_name("camstream")
        .enable_all()
        .build()?;

    let result = runtime.block_on(serve(config, shutdown_flag));
    // stdin reads run on a blocking thread that may never return
    runtime.shutdown_timeout(Duration::from_secs(1));
    result
}

async fn serve(config: AppConfig, shutdown_flag: Arc<AtomicBool>) -> anyhow::Result<()> {
    let ports = PortPool::new(&config.ports)?;
    let launcher = StreamLauncher::new(config.webrtc.clone(), config.transcoder.clone(), ports)?;
    let (pool, updates) = WorkerPool::start(&config.pool, Arc::new(launcher)).await?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        workers = pool.size(),
        ports = %format!("{}-{}", config.ports.range_start, config.ports.range_end),
        transcoder = %config.transcoder.program.display(),
        "camstream service started"
    );

    let publisher = tokio::spawn(publish_updates(updates, tokio::io::stdout()));
    let stats = run_commands(
        &pool,
        &config.output,
        BufReader::new(tokio::io::stdin()),
        wait_for_flag(shutdown_flag),
    )
    .await
    .context("reading commands")?;
    info!(
        accepted = stats.accepted,
        rejected = stats.rejected,
        active = pool.active_sessions(),
        "stopping all sessions"
    );

    pool.shutdown().await;
    match publisher.await {
        Ok(Ok(written)) => info!(updates = written, "camstream service stopped"),
        Ok(Err(e)) => warn!("state output failed: {}", e),
        Err(e) => warn!("state publisher task failed: {}", e),
    }
    Ok(())
}

async fn wait_for_flag(flag: Arc<AtomicBool>) {
    while !flag.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

fn init_tracing(format: LogFormat) {
    // stdout carries state updates
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init(),
    }
}
