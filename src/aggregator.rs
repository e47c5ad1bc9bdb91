// src/aggregator.rs
//! # Minute Window Aggregator
//! Per-minute event counts over a sliding window of whole minutes.
//!
//! Events accumulate into one open minute bucket. When an event from a later
//! minute arrives the bucket is closed into the per-category and total series
//! and anything that fell out of the window is evicted. Every
//! query force-closes the open bucket first, so reads never wait for the next
//! rotation. Bucket and both series sit behind a single mutex.
//!
//! A series holds at most `window_minutes` distinct minutes: closing minute `M`
//! evicts every entry at or before `M - window_minutes`.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;
use tracing::{debug, warn};

use crate::metrics::{
    ensure_metrics_described, EVENTS_RECORDED_TOTAL, EVENTS_TIMESTAMP_FALLBACK_TOTAL,
    WINDOW_ENTRIES_EVICTED_TOTAL, WINDOW_ROTATIONS_TOTAL,
};
use crate::timestamp::{parse_timestamp, truncate_to_minute, Clock, MinuteKey, SystemClock};

/// A closed minute and how many events it held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WindowEntry {
    pub minute: MinuteKey,
    pub count: u64,
}

/// Totals over everything currently retained.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub total_count: u64,
    pub per_category_totals: HashMap<String, u64>,
    pub window_minutes: u32,
}

/// Thread-safe sliding window of per-minute counts.
pub struct Aggregator {
    inner: Mutex<Inner>,
    window_minutes: u32,
    clock: Arc<dyn Clock>,
}

#[derive(Debug, Default)]
struct Bucket {
    counts: HashMap<String, u64>,
    total: u64,
}

#[derive(Debug, Default)]
struct Inner {
    /// `None` until the first event arrives.
    open_minute: Option<MinuteKey>,
    bucket: Bucket,
    by_category: HashMap<String, VecDeque<WindowEntry>>,
    totals: VecDeque<WindowEntry>,
}

/// What one rotation did, reported once the lock is released.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Rotation {
    minute: Option<MinuteKey>,
    closed: usize,
    evicted: usize,
    dropped: usize,
}

impl Aggregator {
    /// Create an aggregator retaining `window_minutes` of history, using the
    /// wall clock for unparseable timestamps. A window of 0 is raised to 1.
    pub fn new(window_minutes: u32) -> Self {
        Self::with_clock(window_minutes, Arc::new(SystemClock))
    }

    /// Like [`Aggregator::new`] with an explicit clock. A window of 0 is raised to 1.
    pub fn with_clock(window_minutes: u32, clock: Arc<dyn Clock>) -> Self {
        ensure_metrics_described();
        Self {
            inner: Mutex::new(Inner::default()),
            // A zero window would evict each minute as it closes.
            window_minutes: window_minutes.max(1),
            clock,
        }
    }

    pub fn window_minutes(&self) -> u32 {
        self.window_minutes
    }

    /// Minute currently accumulating events, if any event was seen yet.
    pub fn open_minute(&self) -> Option<MinuteKey> {
        self.lock().open_minute
    }

    /// Count one event of `category` at `timestamp`.
    ///
    /// A timestamp from a minute at or before the open one is folded into the
    /// open bucket; past buckets are never reopened.
    pub fn record(&self, category: &str, timestamp: DateTime<Utc>) {
        let key = truncate_to_minute(timestamp);
        let rotation = self.lock().record(category, key, self.window_minutes);
        counter!(EVENTS_RECORDED_TOTAL).increment(1);
        self.report(rotation);
    }

    /// Like [`Aggregator::record`], with a textual timestamp. Unparseable input
    /// is replaced by the clock's current time; the event is still counted.
    pub fn record_text(&self, category: &str, raw_timestamp: &str) {
        let timestamp = match parse_timestamp(raw_timestamp) {
            Some(ts) => ts,
            None => {
                counter!(EVENTS_TIMESTAMP_FALLBACK_TOTAL).increment(1);
                debug!(target: "aggregator", raw = raw_timestamp, "unparseable timestamp, using now");
                self.clock.now()
            }
        };
        self.record(category, timestamp);
    }

    /// Retained series per category, oldest minute first. Categories without
    /// retained entries are absent.
    pub fn category_series(&self) -> HashMap<String, Vec<WindowEntry>> {
        let (out, rotation) = {
            let mut inner = self.lock();
            let rotation = inner.rotate(self.window_minutes);
            let out = inner
                .by_category
                .iter()
                .map(|(category, series)| (category.clone(), series.iter().copied().collect()))
                .collect();
            (out, rotation)
        };
        self.report(rotation);
        out
    }

    /// Retained totals series, oldest minute first.
    pub fn total_series(&self) -> Vec<WindowEntry> {
        let (out, rotation) = {
            let mut inner = self.lock();
            let rotation = inner.rotate(self.window_minutes);
            (inner.totals.iter().copied().collect(), rotation)
        };
        self.report(rotation);
        out
    }

    pub fn summary(&self) -> Summary {
        let (summary, rotation) = {
            let mut inner = self.lock();
            let rotation = inner.rotate(self.window_minutes);
            let summary = Summary {
                total_count: inner.totals.iter().map(|e| e.count).sum(),
                per_category_totals: inner
                    .by_category
                    .iter()
                    .map(|(category, series)| {
                        (category.clone(), series.iter().map(|e| e.count).sum())
                    })
                    .collect(),
                window_minutes: self.window_minutes,
            };
            (summary, rotation)
        };
        self.report(rotation);
        summary
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Nothing inside the critical section can panic midway through a mutation.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn report(&self, rotation: Rotation) {
        let Some(minute) = rotation.minute else {
            return;
        };
        counter!(WINDOW_ROTATIONS_TOTAL).increment(1);
        if rotation.evicted > 0 {
            counter!(WINDOW_ENTRIES_EVICTED_TOTAL).increment(rotation.evicted as u64);
        }
        if rotation.dropped > 0 {
            warn!(
                target: "aggregator",
                %minute,
                dropped = rotation.dropped,
                "dropped entries older than their series tail"
            );
        }
        debug!(
            target: "aggregator",
            %minute,
            closed = rotation.closed,
            evicted = rotation.evicted,
            "minute closed"
        );
    }
}

impl fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Aggregator")
            .field("window_minutes", &self.window_minutes)
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn record(&mut self, category: &str, key: MinuteKey, window_minutes: u32) -> Rotation {
        let mut rotation = Rotation::default();
        match self.open_minute {
            None => self.open_minute = Some(key),
            Some(open) if key > open => {
                rotation = self.rotate(window_minutes);
                self.open_minute = Some(key);
            }
            Some(_) => {}
        }

        match self.bucket.counts.get_mut(category) {
            Some(n) => *n += 1,
            None => {
                self.bucket.counts.insert(category.to_owned(), 1);
            }
        }
        self.bucket.total += 1;
        rotation
    }

    /// Close the open bucket into the series and evict. No-op on an empty bucket.
    fn rotate(&mut self, window_minutes: u32) -> Rotation {
        let Some(minute) = self.open_minute else {
            return Rotation::default();
        };
        if self.bucket.total == 0 {
            return Rotation::default();
        }

        let mut rotation = Rotation {
            minute: Some(minute),
            ..Rotation::default()
        };
        for (category, count) in self.bucket.counts.drain() {
            if count == 0 {
                continue;
            }
            let series = self.by_category.entry(category).or_default();
            if push_entry(series, minute, count) {
                rotation.closed += 1;
            } else {
                rotation.dropped += 1;
            }
        }
        if push_entry(&mut self.totals, minute, self.bucket.total) {
            rotation.closed += 1;
        } else {
            rotation.dropped += 1;
        }
        self.bucket.total = 0;

        rotation.evicted = self.evict(minute.minus_minutes(window_minutes));
        rotation
    }

    /// Evict every series through `cutoff`, forgetting categories left empty.
    fn evict(&mut self, cutoff: MinuteKey) -> usize {
        let mut evicted = evict_through(&mut self.totals, cutoff);
        self.by_category.retain(|_, series| {
            evicted += evict_through(series, cutoff);
            !series.is_empty()
        });
        evicted
    }
}

/// Append `(minute, count)`, merging into a tail entry with the same minute.
/// Returns `false` (and leaves the series untouched) if `minute` is older than the tail.
fn push_entry(series: &mut VecDeque<WindowEntry>, minute: MinuteKey, count: u64) -> bool {
    if let Some(last) = series.back_mut() {
        if last.minute == minute {
            last.count += count;
            return true;
        }
        if last.minute > minute {
            return false;
        }
    }
    series.push_back(WindowEntry { minute, count });
    true
}

fn evict_through(series: &mut VecDeque<WindowEntry>, cutoff: MinuteKey) -> usize {
    let mut n = 0;
    while let Some(front) = series.front() {
        if front.minute <= cutoff {
            series.pop_front();
            n += 1;
        } else {
            break;
        }
    }
    n
}
