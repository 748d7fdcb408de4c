// src/main.rs
//
// fraudguard — real-time layered fraud investigation pipeline
//
// Transactions arrive on a Redis stream, gain historical context from
// Postgres, pass through a five-layer scoring cascade with short-circuit
// gates, and leave as verdicts POSTed to the case-management sink.
//
// Usage:
//   fraudguard                         # env-driven configuration
//   fraudguard --workers 32            # override WORKER_COUNT
//   fraudguard --state /var/lib/fg.bin # override STATE_PATH
//
// See src/config.rs for the full environment contract.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod error;
mod events;
mod features;
mod history;
mod layers;
mod persist;
mod publisher;
mod stream;
mod worker;

use config::Config;
use engine::orchestrator::Orchestrator;
use engine::patterns::PatternDiscovery;
use history::{HistoryReader, PgHistoryStore};
use layers::anomaly::{AnomalyDetector, PROJECTION_DIM};
use layers::ensemble::GradientEnsemble;
use layers::reasoner::Reasoner;
use publisher::VerdictPublisher;
use stream::StreamConsumer;
use worker::{spawn_pool, PerfStats};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name    = "fraudguard",
    about   = "Real-time layered fraud investigation pipeline",
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    #[arg(long, help = "Logical worker count (overrides WORKER_COUNT)")]
    workers: Option<usize>,

    #[arg(long, help = "State snapshot path (overrides STATE_PATH)")]
    state: Option<PathBuf>,
}

/// Periodic engine-state line, alongside the worker pool's latency report.
async fn state_stats_loop(
    anomaly: Arc<AnomalyDetector>,
    reasoner: Arc<Reasoner>,
    discovery: Arc<PatternDiscovery>,
) {
    loop {
        tokio::time::sleep(Duration::from_secs(30)).await;
        info!(
            tracked_users = anomaly.tracked_users(),
            llm_cache = reasoner.cache_len(),
            case_ring = discovery.ring_len(),
            patterns = discovery.patterns().len(),
            "engine state"
        );
    }
}

fn print_banner(cfg: &Config) {
    println!("\x1b[1mfraudguard\x1b[0m — real-time layered fraud investigation");
    println!(
        "  \x1b[90mworkers={}  gray area={:.2}–{:.2}  stream={}  sink={}\x1b[0m\n",
        cfg.worker_count, cfg.gray_min, cfg.gray_max, cfg.stream_key, cfg.verdict_url
    );
}

// ── Main ──────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env()
            .add_directive("fraudguard=info".parse()?))
        .compact()
        .init();

    let cli = Cli::parse();
    let mut cfg = Config::from_env()?;
    if let Some(workers) = cli.workers {
        cfg.worker_count = workers;
    }
    if let Some(state) = cli.state {
        cfg.state_path = state;
    }

    print_banner(&cfg);

    // Singletons — constructed once, shared by reference into the workers.
    let history: Arc<dyn HistoryReader> = Arc::new(PgHistoryStore::connect(&cfg.database_url)?);
    let ensemble = Arc::new(GradientEnsemble::new());
    let anomaly = Arc::new(AnomalyDetector::new());
    let reasoner = Arc::new(Reasoner::new(cfg.llm.clone()));
    let discovery = Arc::new(PatternDiscovery::new());
    let stats = Arc::new(PerfStats::new());

    // Warmup from the previous run's snapshot, if any.
    if let Some(state) = persist::load(&cfg.state_path) {
        ensemble.restore_weights(&state.model_weights);
        discovery.seed(state.learned_patterns);
        let centroids: Vec<(String, [f64; PROJECTION_DIM])> = discovery
            .patterns()
            .into_iter()
            .filter_map(|p| {
                <[f64; PROJECTION_DIM]>::try_from(p.centroid.as_slice())
                    .ok()
                    .map(|c| (p.pattern_type, c))
            })
            .collect();
        if !centroids.is_empty() {
            info!(patterns = centroids.len(), "anomaly layer warmed with discovered patterns");
            anomaly.load_patterns(centroids);
        }
    }

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&history),
        Arc::clone(&ensemble),
        Arc::clone(&anomaly),
        Arc::clone(&reasoner),
        Arc::clone(&discovery),
        cfg.gray_min,
        cfg.gray_max,
    ));
    let verdict_publisher = Arc::new(VerdictPublisher::new(&cfg.verdict_url));

    // Bounded hand-off: capacity = worker count, so the stream read blocks
    // when every worker is busy.
    let (entry_tx, entry_rx) = mpsc::channel(cfg.worker_count);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Background loops
    tokio::spawn(Arc::clone(&discovery).mining_loop());
    tokio::spawn(Arc::clone(&stats).report_loop());
    tokio::spawn(state_stats_loop(
        Arc::clone(&anomaly),
        Arc::clone(&reasoner),
        Arc::clone(&discovery),
    ));
    tokio::spawn(persist::checkpoint_loop(
        cfg.state_path.clone(),
        Arc::clone(&ensemble),
        Arc::clone(&discovery),
        Arc::clone(&stats),
    ));

    // Stream reader
    let consumer = StreamConsumer::new(
        &cfg.redis_url,
        &cfg.stream_key,
        &cfg.consumer_group,
        &cfg.consumer_name,
    )?;
    let reader = tokio::spawn(consumer.run(entry_tx, shutdown_rx));

    // Worker pool
    let mut pool = spawn_pool(
        cfg.worker_count,
        entry_rx,
        Arc::clone(&orchestrator),
        Arc::clone(&verdict_publisher),
        Arc::clone(&stats),
    );
    info!(workers = cfg.worker_count, "pipeline running, press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    info!("termination signal received, draining in-flight investigations");

    // Stop pulling new entries; the reader drops the channel sender and the
    // workers drain whatever is already queued.
    shutdown_tx.send(true).ok();
    reader.await.ok();

    let drain = async {
        while pool.join_next().await.is_some() {}
    };
    if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        warn!("drain exceeded {}s, aborting stragglers", DRAIN_TIMEOUT.as_secs());
        pool.abort_all();
    }

    // Final snapshot.
    let state = persist::capture(&ensemble, &discovery, &stats);
    persist::save(&cfg.state_path, &state)?;
    let report = stats.report();
    info!(
        cases = report.total_cases,
        blocked = report.auto_blocked,
        approved = report.auto_approved,
        review = report.human_review,
        "state saved, shutdown complete"
    );
    Ok(())
}
