//! sentryd - in-line packet inspection daemon
//!
//! Binds the host's netfilter packet queue and conntrack streams, runs
//! every received flow's first packets through a priority-ordered plugin
//! pipeline, and answers the kernel with accept/drop/mark verdicts.
//!
//! # Usage
//! ```bash
//! # Run with defaults (queue base 2000, 4 workers)
//! sudo ./sentryd
//!
//! # Load settings from a YAML file
//! sudo ./sentryd --config /etc/sentryd/settings.yaml
//!
//! # Capture live traffic to a warehouse file instead of just dispatching
//! sudo ./sentryd --capture /tmp/run.utpdcf
//!
//! # Replay a previously captured file with no kernel binding at all
//! ./sentryd --replay /tmp/run.utpdcf --replay-speed 200
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};
use sentry_core::classify::UpstreamConfig;
use sentry_core::orchestrator::{self, Engine, EngineConfig};

use sentryd::config::Settings;
use sentryd::metrics;

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Debug, Parser)]
#[command(name = "sentryd")]
#[command(about = "In-line packet inspection daemon over netfilter queue/conntrack")]
#[command(version)]
struct Args {
    /// Settings file path (YAML). Missing file falls back to built-in
    /// defaults with a warning (spec.md §7 configuration fault policy).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// First NFQUEUE number; overrides the settings file.
    #[arg(long)]
    queue_base: Option<u16>,

    /// Number of packet-queue workers; overrides the settings file.
    #[arg(long)]
    queue_count: Option<u16>,

    /// Append every ingress event to this warehouse capture file.
    #[arg(long)]
    capture: Option<PathBuf>,

    /// Replay a warehouse capture file instead of binding live kernel
    /// queues.
    #[arg(long)]
    replay: Option<PathBuf>,

    /// Replay pacing, as a percentage of real time. 0 = no pacing.
    #[arg(long, default_value = "100")]
    replay_speed: u32,

    /// Prometheus `/metrics` and `/health` bind address; overrides the
    /// settings file.
    #[arg(long)]
    metrics_bind: Option<String>,

    /// Enable debug logging.
    #[arg(short, long)]
    debug: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let settings = load_settings(&args);

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if args.debug { "debug" } else { &settings.logging.level }),
    )
    .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build the Tokio runtime")?;
    runtime.block_on(run(args, settings))
}

/// Loads the settings file if one was given, falling back to defaults on
/// any failure (missing file, bad YAML) — a warn, not a fatal error
/// (spec.md §7).
fn load_settings(args: &Args) -> Settings {
    match &args.config {
        Some(path) => match Settings::load(path) {
            Ok(settings) => settings,
            Err(err) => {
                eprintln!("warning: failed to load settings from {}: {err}; using defaults", path.display());
                Settings::default()
            }
        },
        None => Settings::default(),
    }
}

async fn run(args: Args, settings: Settings) -> Result<()> {
    info!("sentryd starting");

    let engine_config = build_engine_config(&args, &settings);
    let engine = Engine::start(engine_config).context("engine failed to start")?;

    let ready = Arc::new(AtomicBool::new(false));
    let metrics_addr: SocketAddr = args
        .metrics_bind
        .as_deref()
        .unwrap_or(&settings.metrics.bind)
        .parse()
        .context("invalid --metrics-bind address")?;
    metrics::spawn(metrics_addr, engine.counters.clone(), ready.clone());
    info!("metrics available at http://{metrics_addr}/metrics");

    match &args.replay {
        Some(path) => {
            info!("replaying {} at speed {}", path.display(), args.replay_speed);
            ready.store(true, Ordering::Release);
            let replay_engine = engine.clone();
            let replay_path = path.clone();
            let replay_speed = args.replay_speed;
            let replay_handle =
                tokio::spawn(async move { orchestrator::run_replay(replay_engine, replay_path, replay_speed).await });

            tokio::select! {
                result = replay_handle => {
                    match result {
                        Ok(Ok(())) => info!("replay finished"),
                        Ok(Err(err)) => error!("replay failed: {err}"),
                        Err(err) => error!("replay task panicked: {err}"),
                    }
                }
                _ = wait_for_shutdown_signal() => {
                    info!("received shutdown signal during replay");
                }
            }
        }
        None => {
            orchestrator::run(engine.clone()).context("engine failed to start its workers")?;
            ready.store(true, Ordering::Release);
            info!("sentryd running; press Ctrl+C or send SIGTERM to stop");
            wait_for_shutdown_signal().await;
        }
    }

    info!("shutting down");
    let drained = orchestrator::shutdown_engine(&engine).await;
    if !drained {
        warn!("shutdown drain timed out; exiting anyway");
    }
    info!("sentryd stopped");
    Ok(())
}

/// Waits for `SIGTERM` (graceful shutdown) or `SIGQUIT` (spec.md §6 stack
/// dump aid). Ctrl+C maps to the same path as `SIGTERM` so interactive
/// runs behave like the teacher's binary.
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sig) => sig,
        Err(err) => {
            error!("failed to install SIGTERM handler: {err}");
            return;
        }
    };
    let mut sigquit = match signal(SignalKind::quit()) {
        Ok(sig) => sig,
        Err(err) => {
            error!("failed to install SIGQUIT handler: {err}");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received Ctrl+C");
                return;
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM");
                return;
            }
            _ = sigquit.recv() => {
                warn!("received SIGQUIT; dumping worker stack snapshot is not implemented natively, logging state instead");
                dump_fault_diagnostics();
            }
        }
    }
}

/// Stand-in for the source's "raise a process-level fault signal to dump
/// stacks" (spec.md §4.8): logs the request at error level so it is
/// visible in the same place a stack dump would be. A full thread-stack
/// dump needs platform-specific signal plumbing the `nix`/`libc` stack
/// here does not attempt to abstract.
fn dump_fault_diagnostics() {
    error!("SIGQUIT received: worker stack dump requested (diagnostic log only)");
}

fn build_engine_config(args: &Args, settings: &Settings) -> EngineConfig {
    EngineConfig {
        queue_base: args.queue_base.unwrap_or(settings.queue.base),
        queue_count: args.queue_count.unwrap_or(settings.queue.count),
        dict_path: settings.dict.path.clone(),
        cert_ttl: Duration::from_secs(settings.certificate.ttl_secs),
        classify_upstream: UpstreamConfig {
            host: settings.classify.host.clone(),
            port: settings.classify.port,
            auth_key: settings.classify.auth_key.clone(),
        },
        classify_worker_count: settings.classify.workers,
        classify_ttl: Duration::from_secs(settings.classify.ttl_secs),
        reputation_host: settings.reputation.host.clone(),
        reputation_port: settings.reputation.port,
        threat_sensitivity: settings.threat.sensitivity,
        geoip_table_path: settings.geoip.table_path.clone(),
        session_min_idle: Duration::from_secs(60),
        conntrack_dump_family: libc::AF_INET as u8,
        capture_path: args.capture.clone().or_else(|| settings.warehouse.capture_path.clone()),
    }
}
