// tests/concurrency.rs
//
// Concurrent writers and readers against one shared aggregator.

use std::sync::Arc;
use std::thread;

use chrono::{TimeDelta, TimeZone, Utc};
use tokio::sync::mpsc;

use emoji_analytics::ingest::{spawn_consumer, types::Event};
use emoji_analytics::Aggregator;

#[test]
fn two_writers_same_minute_lose_no_updates() {
    let agg = Aggregator::new(3);
    let minute = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

    thread::scope(|s| {
        for _ in 0..2 {
            s.spawn(|| {
                for i in 0..500 {
                    agg.record("🔥", minute + TimeDelta::milliseconds(i * 7));
                }
            });
        }
    });

    let totals = agg.total_series();
    assert_eq!(totals.len(), 1);
    assert_eq!(totals[0].count, 1_000);
    assert_eq!(agg.summary().per_category_totals["🔥"], 1_000);
}

#[test]
fn readers_see_monotonic_totals_while_writing() {
    let agg = Arc::new(Aggregator::new(60));
    let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

    thread::scope(|s| {
        let writer = Arc::clone(&agg);
        s.spawn(move || {
            for i in 0..5_000i64 {
                // Spans ~8 minutes, well inside the window: nothing is evicted.
                let cat = if i % 2 == 0 { "a" } else { "b" };
                writer.record(cat, start + TimeDelta::milliseconds(i * 100));
            }
        });

        for _ in 0..3 {
            let reader = Arc::clone(&agg);
            s.spawn(move || {
                let mut last = 0u64;
                for _ in 0..500 {
                    let summary = reader.summary();
                    assert!(summary.total_count >= last, "total went backwards");
                    let per_cat: u64 = summary.per_category_totals.values().sum();
                    assert_eq!(per_cat, summary.total_count, "torn snapshot");
                    last = summary.total_count;

                    let series = reader.total_series();
                    for pair in series.windows(2) {
                        assert!(pair[0].minute < pair[1].minute);
                    }
                }
            });
        }
    });

    assert_eq!(agg.summary().total_count, 5_000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn consumer_records_everything_from_concurrent_producers() {
    let agg = Arc::new(Aggregator::new(3));
    let (tx, rx) = mpsc::channel::<Event>(32);
    let consumer = spawn_consumer(rx, Arc::clone(&agg));

    let mut producers = Vec::new();
    for _ in 0..2 {
        let tx = tx.clone();
        producers.push(tokio::spawn(async move {
            for i in 0..500 {
                let ev = Event {
                    category: "💧".into(),
                    timestamp: format!("2024-05-01T12:00:{:02}Z", i % 60),
                };
                tx.send(ev).await.expect("consumer alive");
            }
        }));
    }
    drop(tx);
    for p in producers {
        p.await.expect("producer task");
    }

    assert_eq!(consumer.await.expect("consumer task"), 1_000);
    let s = agg.summary();
    assert_eq!(s.total_count, 1_000);
    assert_eq!(s.per_category_totals["💧"], 1_000);
}
