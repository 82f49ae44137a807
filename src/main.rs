// src/main.rs
//
// sentryflow-engine — streaming anomaly detection and alert
// deduplication for the sentryflow observability platform.
//
// Two operational modes, mirroring how the reference engine drives its
// pipeline from a JSONL log instead of a live ingest API in dev/test:
//   tail    — tail a JSONL event log file, as it grows
//   replay  — replay a captured JSONL event log at scaled speed
//
// Usage:
//   sentryflow-engine --mode tail --path events.jsonl
//   sentryflow-engine --mode replay --path captured.jsonl --speed 10.0 --database-url postgres://...

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sentryflow_core::config::EngineConfig;
use sentryflow_core::events::IngestEvent;
use sentryflow_core::repository::{InMemoryRepository, Repository};
use sentryflow_core::repository_pg::PostgresRepository;
use sentryflow_core::Engine;

#[derive(Parser)]
#[command(
    name = "sentryflow-engine",
    about = "Streaming anomaly detection and alert deduplication engine",
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    #[arg(long, value_enum, default_value = "tail")]
    mode: Mode,

    #[arg(long, default_value = "/tmp/sentryflow_events.jsonl", help = "JSONL event log path (tail/replay modes)")]
    path: PathBuf,

    #[arg(long, default_value = "1.0", help = "Replay speed multiplier")]
    speed: f64,

    #[arg(long, help = "Optional TOML config file")]
    config: Option<PathBuf>,

    #[arg(long, help = "Postgres connection URL; falls back to an in-memory repository when absent")]
    database_url: Option<String>,
}

#[derive(Clone, ValueEnum)]
enum Mode {
    Tail,
    Replay,
}

async fn tail_jsonl(path: PathBuf, tx: mpsc::Sender<IngestEvent>, seek_end: bool) -> Result<()> {
    let file = tokio::fs::File::open(&path).await?;
    let mut lines = BufReader::new(file).lines();

    if seek_end {
        while lines.next_line().await?.is_some() {}
    }

    info!("tailing {}", path.display());
    loop {
        match lines.next_line().await? {
            Some(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<IngestEvent>(line) {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "dropping unparsable event line"),
                }
            }
            None => tokio::time::sleep(tokio::time::Duration::from_millis(50)).await,
        }
    }
    Ok(())
}

async fn replay_jsonl(path: PathBuf, tx: mpsc::Sender<IngestEvent>, speed: f64) -> Result<()> {
    let content = tokio::fs::read_to_string(&path).await?;
    let mut events: Vec<(i64, IngestEvent)> = Vec::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Ok(event) = serde_json::from_str::<IngestEvent>(line) {
            let ts = event.timestamp().timestamp_millis();
            events.push((ts, event));
        }
    }

    if events.is_empty() {
        return Ok(());
    }
    events.sort_by_key(|(ts, _)| *ts);

    let base_ts = events[0].0;
    let base_wall = std::time::Instant::now();

    for (ts, event) in events {
        let offset_secs = (ts - base_ts) as f64 / speed / 1000.0;
        let target = base_wall + std::time::Duration::from_secs_f64(offset_secs.max(0.0));
        let now = std::time::Instant::now();
        if target > now {
            tokio::time::sleep(target - now).await;
        }
        if tx.send(event).await.is_err() {
            break;
        }
    }
    Ok(())
}

async fn downtime_sweep_loop(engine: Arc<Engine>) {
    loop {
        tokio::time::sleep(tokio::time::Duration::from_secs(30)).await;
        engine.tick().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("sentryflow_core=info".parse()?))
        .compact()
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => EngineConfig::from_toml_file(path)?,
        None => EngineConfig::default(),
    };

    let repo: Arc<dyn Repository> = match &cli.database_url {
        Some(url) => {
            info!("connecting to postgres repository");
            let pg = PostgresRepository::connect(url, config.lock_timeout_ms).await?;
            pg.migrate().await?;
            Arc::new(pg)
        }
        None => {
            info!("no --database-url given, using in-memory repository");
            Arc::new(InMemoryRepository::new())
        }
    };

    let engine = Arc::new(Engine::new(config, repo));

    let sweep_engine = Arc::clone(&engine);
    tokio::spawn(downtime_sweep_loop(sweep_engine));

    let (tx, mut rx) = mpsc::channel::<IngestEvent>(16_384);

    match cli.mode {
        Mode::Tail => {
            info!(path = %cli.path.display(), "mode=tail");
            let path = cli.path.clone();
            tokio::spawn(async move { tail_jsonl(path, tx, true).await.ok(); });
        }
        Mode::Replay => {
            info!(path = %cli.path.display(), speed = cli.speed, "mode=replay");
            let path = cli.path.clone();
            let speed = cli.speed;
            tokio::spawn(async move { replay_jsonl(path, tx, speed).await.ok(); });
        }
    }

    while let Some(event) = rx.recv().await {
        let e = Arc::clone(&engine);
        tokio::spawn(async move { e.ingest(event).await; });
    }

    Ok(())
}
