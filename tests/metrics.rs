// tests/metrics.rs
//
// One test per binary: the Prometheus recorder is process-global.

use axum::body::{self, Body};
use axum::http::{Request, StatusCode};
use chrono::{TimeZone, Utc};
use tower::ServiceExt;

use emoji_analytics::ingest::decode_line;
use emoji_analytics::metrics::Metrics;
use emoji_analytics::Aggregator;

#[tokio::test]
async fn metrics_endpoint_exposes_window_series() {
    let metrics = Metrics::init(3).expect("recorder");

    let agg = Aggregator::new(3);
    let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
    for m in 0..5 {
        agg.record("🔥", t0 + chrono::TimeDelta::minutes(m));
    }
    agg.record_text("🔥", "not a time");
    assert!(decode_line("garbage").is_none());
    let _ = agg.summary();

    let resp = metrics
        .router()
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    // axum::body::to_bytes requires an explicit limit
    let body = body::to_bytes(resp.into_body(), 1_048_576).await.unwrap(); // 1 MiB
    let text = String::from_utf8(body.to_vec()).unwrap();

    for needle in [
        "events_recorded_total 6",
        "events_timestamp_fallback_total 1",
        "events_skipped_total 1",
        "window_rotations_total",
        "window_entries_evicted_total",
        "window_minutes 3",
    ] {
        assert!(
            text.contains(needle),
            "metrics exposition missing '{needle}'\n{text}"
        );
    }
}
