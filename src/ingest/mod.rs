// src/ingest/mod.rs
pub mod sources;
pub mod types;

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::counter;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::aggregator::Aggregator;
use crate::ingest::types::{Event, EventMessage, EventSource};
use crate::metrics::{ensure_metrics_described, EVENTS_SKIPPED_TOTAL};

const THROUGHPUT_LOG_EVERY: Duration = Duration::from_secs(10);

/// Decode one wire value. Messages without a usable category or timestamp are
/// counted as skipped and never reach the aggregator.
pub fn decode_value(value: Value) -> Option<Event> {
    let decoded = serde_json::from_value::<EventMessage>(value)
        .ok()
        .and_then(EventMessage::into_event);
    if decoded.is_none() {
        counter!(EVENTS_SKIPPED_TOTAL).increment(1);
    }
    decoded
}

/// Decode one newline-delimited JSON message.
pub fn decode_line(line: impl AsRef<[u8]>) -> Option<Event> {
    match serde_json::from_slice::<Value>(line.as_ref()) {
        Ok(value) => decode_value(value),
        Err(e) => {
            tracing::debug!(target: "ingest", error = %e, "undecodable event line");
            counter!(EVENTS_SKIPPED_TOTAL).increment(1);
            None
        }
    }
}

/// Spawn the only task that writes into `aggregator`.
///
/// Runs until every sender of `rx` is dropped and returns how many events it recorded.
pub fn spawn_consumer(
    mut rx: mpsc::Receiver<Event>,
    aggregator: Arc<Aggregator>,
) -> JoinHandle<u64> {
    ensure_metrics_described();
    tokio::spawn(async move {
        tracing::info!(
            target: "ingest",
            window_minutes = aggregator.window_minutes(),
            "consumer started"
        );

        let mut recorded = 0u64;
        let mut since_log = 0u64;
        let mut last_log = Instant::now();

        while let Some(ev) = rx.recv().await {
            aggregator.record_text(&ev.category, &ev.timestamp);
            recorded += 1;
            since_log += 1;

            if last_log.elapsed() >= THROUGHPUT_LOG_EVERY {
                let per_sec = since_log as f64 / last_log.elapsed().as_secs_f64();
                tracing::info!(
                    target: "ingest",
                    events_per_sec = per_sec,
                    total = recorded,
                    "ingestion rate"
                );
                since_log = 0;
                last_log = Instant::now();
            }
        }

        tracing::info!(target: "ingest", recorded, "event channel closed, consumer stopping");
        recorded
    })
}

/// Run `source` on its own task. A failing source only ends itself.
pub fn spawn_source(source: Box<dyn EventSource>, tx: mpsc::Sender<Event>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let name = source.name();
        tracing::info!(target: "ingest", source = name, "source started");
        match source.run(tx).await {
            Ok(()) => tracing::info!(target: "ingest", source = name, "source finished"),
            Err(e) => tracing::warn!(target: "ingest", source = name, error = ?e, "source failed"),
        }
    })
}
