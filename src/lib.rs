// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod aggregator;
pub mod api;
pub mod config;
pub mod ingest;
pub mod metrics;
pub mod timestamp;

// ---- Re-exports for stable public API ----
pub use crate::aggregator::{Aggregator, Summary, WindowEntry};
pub use crate::api::{router, AppState};
pub use crate::timestamp::MinuteKey;
