// src/ingest/types.rs
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

/// One event that passed the source-side checks and is ready for the aggregator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    pub category: String,  // e.g. "🔥"
    pub timestamp: String, // raw; parsed (or replaced) by the aggregator
}

/// Message as it arrives on the wire. Both fields are optional here so that
/// incomplete messages can be counted and skipped instead of failing the batch.
///
/// The category may be sent as `emoji_type` or `category`; when both are
/// present `emoji_type` wins.
#[derive(Debug, Clone, Deserialize)]
pub struct EventMessage {
    #[serde(default)]
    pub emoji_type: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub timestamp: Option<Value>,
}

impl EventMessage {
    /// `None` when the category is missing/blank or the timestamp is missing,
    /// empty, `false` or zero. The category label is kept exactly as sent.
    /// Any other non-string timestamp is kept as text.
    pub fn into_event(self) -> Option<Event> {
        let category = self.emoji_type.or(self.category)?;
        if category.trim().is_empty() {
            return None;
        }
        let timestamp = match self.timestamp? {
            Value::Null | Value::Bool(false) => return None,
            Value::String(s) if s.trim().is_empty() => return None,
            Value::Number(n) if n.as_f64() == Some(0.0) => return None,
            Value::String(s) => s,
            other => other.to_string(),
        };
        Some(Event {
            category,
            timestamp,
        })
    }
}

#[async_trait::async_trait]
pub trait EventSource: Send {
    fn name(&self) -> &'static str;

    /// Push decoded events into `tx` until the source is exhausted or every
    /// receiver is gone.
    async fn run(self: Box<Self>, tx: mpsc::Sender<Event>) -> Result<()>;
}
