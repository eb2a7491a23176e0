//! Access Ledger - Binary Entry Point
//!
//! ```text
//! access-ledger inspect [PATH]   summarize an overflow log as JSON
//! access-ledger demo [N]         run N events through an in-memory store
//! ```
//!
//! Configuration comes from `ACCESS_LEDGER_*` environment variables and
//! logging from `RUST_LOG`.

use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use access_ledger::overflow::parse_chunks;
use access_ledger::utils::millis_to_rfc3339;
use access_ledger::{AccessEvent, AccessLogQueue, LogNotifier, MemoryStore, QueueConfig};

const USAGE: &str = "usage: access-ledger <inspect [PATH] | demo [N]>";

const DEMO_ENTITLEMENTS: i64 = 5;
const DEMO_UNITS: u32 = 20;

#[derive(Serialize)]
struct ChunkSummary {
    comments: Vec<String>,
    events: usize,
    first_occurred_at: Option<String>,
    last_occurred_at: Option<String>,
}

#[derive(Serialize)]
struct OverflowSummary {
    path: PathBuf,
    exists: bool,
    chunks: Vec<ChunkSummary>,
    total_events: usize,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let config = QueueConfig::from_env();
    let args: Vec<String> = env::args().skip(1).collect();

    match args.first().map(String::as_str) {
        Some("inspect") => {
            let path = args
                .get(1)
                .map(PathBuf::from)
                .unwrap_or_else(|| config.overflow_path.clone());
            inspect(&path)
        }
        Some("demo") => {
            let count = match args.get(1).map(|raw| raw.parse::<usize>()) {
                None => 100,
                Some(Ok(count)) => count,
                Some(Err(_)) => {
                    eprintln!("{}", USAGE);
                    return ExitCode::from(2);
                }
            };
            demo(config, count).await
        }
        _ => {
            eprintln!("{}", USAGE);
            ExitCode::from(2)
        }
    }
}

fn inspect(path: &Path) -> ExitCode {
    let content = match fs::read_to_string(path) {
        Ok(content) => Some(content),
        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
        Err(e) => {
            error!(path = %path.display(), error = %e, "Cannot read overflow log");
            return ExitCode::FAILURE;
        }
    };

    let chunks = match content.as_deref().map(parse_chunks).transpose() {
        Ok(chunks) => chunks.unwrap_or_default(),
        Err(e) => {
            error!(path = %path.display(), error = %e, "Overflow log is malformed");
            return ExitCode::FAILURE;
        }
    };

    let chunks: Vec<ChunkSummary> = chunks
        .into_iter()
        .map(|chunk| {
            let times = chunk.events.iter().map(|e| e.occurred_at_millis);
            ChunkSummary {
                events: chunk.events.len(),
                first_occurred_at: times.clone().min().map(millis_to_rfc3339),
                last_occurred_at: times.max().map(millis_to_rfc3339),
                comments: chunk.comments,
            }
        })
        .collect();

    let summary = OverflowSummary {
        path: path.to_path_buf(),
        exists: content.is_some(),
        total_events: chunks.iter().map(|c| c.events).sum(),
        chunks,
    };

    match serde_json::to_string_pretty(&summary) {
        Ok(json) => {
            println!("{}", json);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Cannot serialize summary");
            ExitCode::FAILURE
        }
    }
}

/// Push `count` events through a queue backed by [`MemoryStore`], with a
/// simulated outage in the middle so the overflow log gets exercised.
async fn demo(config: QueueConfig, count: usize) -> ExitCode {
    let (interrupt, mut interrupted) = watch::channel(false);
    let interruptible = match ctrlc::set_handler(move || {
        interrupt.send_replace(true);
    }) {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "Cannot install Ctrl+C handler");
            false
        }
    };

    let store = MemoryStore::new();
    for id in 1..=DEMO_ENTITLEMENTS {
        store.add_entitlement(id, id as i32, DEMO_UNITS);
    }

    let queue = AccessLogQueue::new(config, Arc::new(store.clone()), Arc::new(LogNotifier));
    queue.start_worker();

    let outage = (count / 3)..(2 * count / 3);
    for n in 0..count {
        if *interrupted.borrow() {
            break;
        }
        if n == outage.start {
            info!("Simulating store outage");
            store.set_offline(true);
        }
        if n == outage.end {
            // Give the worker a moment to divert the outage backlog
            tokio::time::sleep(Duration::from_millis(200)).await;
            info!("Store back online");
            store.set_offline(false);
        }

        let id = (n as i64 % DEMO_ENTITLEMENTS) + 1;
        let event = AccessEvent::new(id, 100, id as i32, &format!("10.0.0.{}", n % 255))
            .with_attribute("seq", &n.to_string());
        if let Err(e) = queue.enqueue(event) {
            error!(error = %e, "Enqueue failed");
            break;
        }
    }
    store.set_offline(false);

    let mut ticker = tokio::time::interval(Duration::from_millis(100));
    loop {
        tokio::select! {
            _ = interrupted.changed(), if interruptible => break,
            _ = ticker.tick() => {
                if queue.is_empty() && overflow_drained(&queue).await {
                    break;
                }
            }
        }
    }

    queue.shutdown().await;

    info!(
        queued = queue.size(),
        alert_sent = queue.alert_sent(),
        "Demo finished"
    );
    match serde_json::to_string_pretty(&store.stats()) {
        Ok(json) => println!("{}", json),
        Err(e) => error!(error = %e, "Cannot serialize stats"),
    }
    ExitCode::SUCCESS
}

async fn overflow_drained(queue: &AccessLogQueue) -> bool {
    match queue.overflow_path().await {
        Ok(path) => fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true),
        Err(_) => true,
    }
}
