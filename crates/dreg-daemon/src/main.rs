//! # dregd
//!
//! Registry daemon serving images from the local Docker store.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::signal;

use dreg_cas::{sweep, ContentStore, EvictionPolicy};
use dreg_config::logging::{init_logging, LogLevel};
use dreg_config::{log_server_info, Config};
use dreg_daemon::{app, spawn_eviction, AppState};
use dreg_runtime::DockerClient;

#[derive(Parser)]
#[command(name = "dregd")]
#[command(version, about = "Registry facade over the local Docker image store", long_about = None)]
struct Cli {
    /// Config file (defaults to <config-dir>/dreg/config.toml)
    #[arg(long, global = true, env = "DREG_CONFIG")]
    config: Option<PathBuf>,

    /// error, warn, info, debug or trace; RUST_LOG takes precedence
    #[arg(long, global = true, default_value = "info")]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the registry API (default)
    Serve(ServeArgs),
    /// Run one eviction sweep over the cache
    Gc(GcArgs),
    /// Print the default configuration
    Config,
}

#[derive(Args, Default)]
struct ServeArgs {
    /// Address to listen on, e.g. 127.0.0.1:5000
    #[arg(long)]
    listen: Option<String>,

    /// Cache root directory
    #[arg(long)]
    cache_root: Option<PathBuf>,
}

#[derive(Args)]
struct GcArgs {
    #[arg(long)]
    cache_root: Option<PathBuf>,

    /// Keep total blob bytes at or below this size
    #[arg(long)]
    max_bytes: Option<u64>,

    /// Remove entries not modified within this many seconds
    #[arg(long)]
    max_age_secs: Option<u64>,

    /// Report what would be removed without deleting
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level);

    let config = Config::load(cli.config.as_deref()).context("Failed to load config")?;

    match cli.command.unwrap_or(Commands::Serve(ServeArgs::default())) {
        Commands::Serve(args) => serve(config, args).await,
        Commands::Gc(args) => gc(config, args),
        Commands::Config => {
            print!("{}", Config::default_toml());
            Ok(())
        }
    }
}

async fn serve(mut config: Config, args: ServeArgs) -> Result<()> {
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }
    if let Some(root) = args.cache_root {
        config.storage.cache_root = root;
    }

    let runtime = Arc::new(DockerClient::from_config(&config.runtime));
    let state = AppState::new(&config, runtime)
        .with_context(|| format!("Failed to open cache at {:?}", config.storage.cache_root))?;

    let policy = config.eviction.policy();
    let eviction = (!policy.is_noop()).then(|| {
        spawn_eviction(
            state.resolver.store().clone(),
            policy,
            config.eviction.interval(),
        )
    });

    let listener = tokio::net::TcpListener::bind(&config.server.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.listen))?;
    log_server_info!(
        "Listening",
        addr = config.server.listen.as_str(),
        cache_root = config.storage.cache_root.display().to_string(),
        docker = config.runtime.socket.display().to_string()
    );

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    if let Some(task) = eviction {
        task.abort();
    }
    log_server_info!("Shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

fn gc(mut config: Config, args: GcArgs) -> Result<()> {
    if let Some(root) = args.cache_root {
        config.storage.cache_root = root;
    }
    let mut policy = config.eviction.policy();
    if args.max_bytes.is_some() {
        policy.max_bytes = args.max_bytes;
    }
    if let Some(secs) = args.max_age_secs {
        policy.max_age = Some(Duration::from_secs(secs));
    }
    if policy.is_noop() {
        println!("No eviction limits set; nothing to do.");
        return Ok(());
    }

    let store = ContentStore::new(&config.storage.cache_root)?;
    let report = sweep(&store, &policy, SystemTime::now(), args.dry_run)?;

    let verb = if args.dry_run { "Would remove" } else { "Removed" };
    println!();
    println!("  Cache: {}", store.root().display());
    println!("  Blobs scanned:   {}", report.blobs_scanned);
    println!(
        "  {verb}: {} blobs ({}), {} indexes",
        report.blobs_removed,
        format_bytes(report.bytes_removed),
        report.indexes_removed
    );
    println!("  Remaining:       {}", format_bytes(report.bytes_remaining));
    describe_policy(&policy);
    Ok(())
}

fn describe_policy(policy: &EvictionPolicy) {
    if let Some(max) = policy.max_bytes {
        println!("  Size limit:      {}", format_bytes(max));
    }
    if let Some(age) = policy.max_age {
        println!("  Age limit:       {}s", age.as_secs());
    }
}

fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}
