//! # Lookup Demo
//!
//! Purpose: Drive a small burst of tracked SETs and GETs against a live
//! lookup service so wiring and latency can be eyeballed without the full
//! simulation around the client.
//!
//! Usage: `lookup_demo [config.json]`. Without a config it targets
//! 127.0.0.1:10201 with default pool sizes. Set `RUST_LOG` for tracing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chainloc_client::{
    ClientConfig, DataKey, Endpoint, Entry, LookupClient, OperationResult, ResultConsumer,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEMO_KEYS: u64 = 32;
const DEFAULT_PORT: u16 = 10201;

#[derive(Default)]
struct CountingConsumer {
    gets: AtomicU64,
    sets: AtomicU64,
}

impl ResultConsumer for CountingConsumer {
    fn on_get_result(&self, result: OperationResult) {
        self.gets.fetch_add(1, Ordering::Relaxed);
        info!(
            key = %result.key,
            server = result.entry.server_id(),
            succeeded = result.succeeded,
            "get result"
        );
    }

    fn on_set_result(&self, result: OperationResult) {
        self.sets.fetch_add(1, Ordering::Relaxed);
        info!(
            key = %result.key,
            tracking_id = result.tracking_id,
            succeeded = result.succeeded,
            "set result"
        );
    }
}

fn demo_key(n: u64) -> Result<DataKey> {
    let text = format!("{n:033}");
    DataKey::new(text.as_bytes()).context("building demo key")
}

fn load_config() -> Result<ClientConfig> {
    match std::env::args().nth(1) {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading config file {path}"))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing config file {path}"))
        }
        None => Ok(ClientConfig {
            endpoints: vec![Endpoint::new("127.0.0.1", DEFAULT_PORT)],
            ..ClientConfig::default()
        }),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = load_config()?;
    let consumer = Arc::new(CountingConsumer::default());
    let client = LookupClient::new(config, consumer.clone()).context("starting lookup client")?;

    for n in 0..DEMO_KEYS {
        let key = demo_key(n)?;
        client.set(key, Entry::new((n % 7 + 1) as u32), true)?;
    }
    for n in 0..DEMO_KEYS {
        client.get(demo_key(n)?)?;
    }

    tokio::time::sleep(Duration::from_secs(2)).await;

    let snapshot = client.metrics();
    info!(
        enqueued = snapshot.enqueued,
        delivered = snapshot.delivered,
        requeued = snapshot.requeued,
        dead_lettered = snapshot.dead_lettered,
        timed_out = snapshot.timed_out,
        connects = snapshot.connects,
        queued = client.queue_size(),
        outstanding = client.num_still_processing(),
        gets = consumer.gets.load(Ordering::Relaxed),
        sets = consumer.sets.load(Ordering::Relaxed),
        "demo finished"
    );
    Ok(())
}
