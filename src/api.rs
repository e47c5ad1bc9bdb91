use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;

use crate::aggregator::{Aggregator, WindowEntry};
use crate::ingest::{self, types::Event};

#[derive(Clone)]
pub struct AppState {
    pub aggregator: Arc<Aggregator>,
    /// Events posted over HTTP go through the consumer like every other source.
    pub events: mpsc::Sender<Event>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/emoji-data", get(emoji_data))
        .route("/api/total-data", get(total_data))
        .route("/api/stats", get(stats))
        .route("/api/events", post(post_events))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

#[derive(Debug, serde::Serialize, PartialEq, Eq)]
pub struct PointOut {
    pub timestamp: DateTime<Utc>,
    pub count: u64,
}

impl From<WindowEntry> for PointOut {
    fn from(e: WindowEntry) -> Self {
        Self {
            timestamp: e.minute.as_datetime(),
            count: e.count,
        }
    }
}

#[derive(Debug, serde::Serialize)]
pub struct StatsOut {
    pub total_emojis: u64,
    pub emoji_breakdown: HashMap<String, u64>,
    pub window_minutes: u32,
}

#[derive(Debug, serde::Serialize)]
pub struct AcceptedOut {
    pub accepted: usize,
    pub skipped: usize,
}

async fn emoji_data(State(state): State<AppState>) -> Json<HashMap<String, Vec<PointOut>>> {
    let out = state
        .aggregator
        .category_series()
        .into_iter()
        .map(|(category, series)| (category, series.into_iter().map(PointOut::from).collect()))
        .collect();
    Json(out)
}

async fn total_data(State(state): State<AppState>) -> Json<Vec<PointOut>> {
    let out = state
        .aggregator
        .total_series()
        .into_iter()
        .map(PointOut::from)
        .collect();
    Json(out)
}

async fn stats(State(state): State<AppState>) -> Json<StatsOut> {
    let s = state.aggregator.summary();
    Json(StatsOut {
        total_emojis: s.total_count,
        emoji_breakdown: s.per_category_totals,
        window_minutes: s.window_minutes,
    })
}

/// Accepts one message or an array of messages.
async fn post_events(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<AcceptedOut>) {
    let messages = match body {
        Value::Array(items) => items,
        single => vec![single],
    };

    let mut out = AcceptedOut {
        accepted: 0,
        skipped: 0,
    };
    for msg in messages {
        let Some(ev) = ingest::decode_value(msg) else {
            out.skipped += 1;
            continue;
        };
        if state.events.send(ev).await.is_err() {
            tracing::warn!(target: "api", "event channel closed, rejecting posted events");
            return (StatusCode::SERVICE_UNAVAILABLE, Json(out));
        }
        out.accepted += 1;
    }

    tracing::debug!(target: "api", accepted = out.accepted, skipped = out.skipped, "events posted");
    (StatusCode::ACCEPTED, Json(out))
}
