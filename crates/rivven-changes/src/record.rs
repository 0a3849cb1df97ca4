//! Adapted records handed to downstream consumers
//!
//! Every change that carries a document becomes one [`AdaptedRecord`]: the
//! identity and sequence of the change, the raw feed row, and a rendered body.

use crate::error::{ChangesError, Result};
use crate::event::{RawChangeEvent, Seq};
use bytes::Bytes;
use serde_json::Value;

/// A change wrapped for downstream consumption.
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptedRecord {
    /// Document id of the change
    pub id: String,
    /// Feed sequence of the change
    pub seq: Seq,
    /// The raw feed row, unmodified
    pub raw: Value,
    /// Rendered content of the raw row
    pub body: Bytes,
}

impl AdaptedRecord {
    /// Body as UTF-8 text, if it is valid UTF-8.
    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    /// The document carried by the raw row.
    pub fn doc(&self) -> Option<&Value> {
        self.raw.get("doc")
    }
}

/// Converts raw change events into records.
pub trait RecordAdapter: Send + Sync {
    /// Wrap one change. Only called for changes that carry a document.
    fn adapt(&self, event: &RawChangeEvent) -> Result<AdaptedRecord>;
}

/// Renders the raw row as indented JSON with keys in sorted order, so record
/// bodies are stable across runs and diff cleanly.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonRecordAdapter;

impl RecordAdapter for JsonRecordAdapter {
    fn adapt(&self, event: &RawChangeEvent) -> Result<AdaptedRecord> {
        let rendered = serde_json::to_vec_pretty(&sorted(&event.payload))
            .map_err(|e| ChangesError::adaptation(&event.id, e.to_string()))?;

        Ok(AdaptedRecord {
            id: event.id.clone(),
            seq: event.seq.clone(),
            raw: event.payload.clone(),
            body: Bytes::from(rendered),
        })
    }
}

/// Rebuild `value` with every object's keys inserted in sorted order.
///
/// Key order must not depend on whether `serde_json` keeps insertion order.
fn sorted(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = serde_json::Map::with_capacity(map.len());
            for key in keys {
                out.insert(key.clone(), sorted(&map[key]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
        other => other.clone(),
    }
}
