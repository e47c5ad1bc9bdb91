// src/metrics.rs
use anyhow::Context;
use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

pub const EVENTS_RECORDED_TOTAL: &str = "events_recorded_total";
pub const EVENTS_TIMESTAMP_FALLBACK_TOTAL: &str = "events_timestamp_fallback_total";
pub const EVENTS_SKIPPED_TOTAL: &str = "events_skipped_total";
pub const WINDOW_ROTATIONS_TOTAL: &str = "window_rotations_total";
pub const WINDOW_ENTRIES_EVICTED_TOTAL: &str = "window_entries_evicted_total";
pub const WINDOW_MINUTES: &str = "window_minutes";

/// One-time metrics registration (so series show up on /metrics).
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(EVENTS_RECORDED_TOTAL, "Events counted by the aggregator.");
        describe_counter!(
            EVENTS_TIMESTAMP_FALLBACK_TOTAL,
            "Events whose timestamp failed to parse and was replaced by now."
        );
        describe_counter!(
            EVENTS_SKIPPED_TOTAL,
            "Source messages dropped for missing category/timestamp or bad JSON."
        );
        describe_counter!(WINDOW_ROTATIONS_TOTAL, "Open minutes closed into the window.");
        describe_counter!(
            WINDOW_ENTRIES_EVICTED_TOTAL,
            "Window entries evicted for falling out of the window."
        );
        describe_gauge!(WINDOW_MINUTES, "Configured window size in minutes.");
    });
}

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and publish the window size gauge.
    pub fn init(window_minutes: u32) -> anyhow::Result<Self> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("prometheus: install recorder")?;

        ensure_metrics_described();
        gauge!(WINDOW_MINUTES).set(f64::from(window_minutes));

        Ok(Self { handle })
    }

    /// Returns a router exposing `/metrics` with the Prometheus exposition format.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}
