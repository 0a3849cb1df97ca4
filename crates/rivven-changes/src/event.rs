//! Raw change event representation
//!
//! One row of a CouchDB-style `_changes` feed:
//!
//! ```json
//! {"seq":1283833,"id":"left-pad","changes":[{"rev":"12-abc"}],"doc":{...}}
//! ```
//!
//! The full payload is kept untouched so downstream consumers can inspect
//! fields this crate does not model.

use crate::error::{ChangesError, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A sequence number from a changes feed.
///
/// CouchDB 1.x emits integers. Clustered CouchDB emits opaque strings of the
/// form `"<n>-<opaque>"`, where `<n>` grows with the feed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum Seq {
    /// Integer sequence
    Number(u64),
    /// Opaque string sequence
    Opaque(String),
}

impl Seq {
    /// The comparable position of this sequence, if one can be derived.
    ///
    /// Numeric strings and the `"<n>-..."` clustered form yield `n`. Any other
    /// string has no ordinal and never takes part in catch-up comparisons.
    pub fn ordinal(&self) -> Option<u64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Opaque(s) => {
                let prefix = s.split_once('-').map(|(head, _)| head).unwrap_or(s);
                prefix.parse().ok()
            }
        }
    }

    /// Whether this sequence is at or beyond `mark`.
    ///
    /// Returns `false` when either side has no ordinal.
    pub fn reaches(&self, mark: &Seq) -> bool {
        match (self.ordinal(), mark.ordinal()) {
            (Some(this), Some(mark)) => this >= mark,
            _ => false,
        }
    }

    /// Parse a sequence from a JSON value (`update_seq`, `seq`, `last_seq`).
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_u64().map(Self::Number),
            Value::String(s) => Some(Self::Opaque(s.clone())),
            _ => None,
        }
    }

    /// Render for use as a `since` query parameter.
    pub fn as_query_value(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{}", n),
            Self::Opaque(s) => f.write_str(s),
        }
    }
}

impl From<u64> for Seq {
    fn from(n: u64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for Seq {
    fn from(s: &str) -> Self {
        match s.parse::<u64>() {
            Ok(n) => Self::Number(n),
            Err(_) => Self::Opaque(s.to_string()),
        }
    }
}

/// One change event as produced by the upstream feed.
#[derive(Debug, Clone, PartialEq)]
pub struct RawChangeEvent {
    /// Document id
    pub id: String,
    /// Feed sequence of this change
    pub seq: Seq,
    /// Full document body, present when the feed was opened with `include_docs`
    pub doc: Option<Value>,
    /// The untouched feed row
    pub payload: Value,
}

impl RawChangeEvent {
    /// Build an event together with a CouchDB-shaped payload.
    pub fn new(id: impl Into<String>, seq: impl Into<Seq>, doc: Option<Value>) -> Self {
        let id = id.into();
        let seq = seq.into();

        let mut payload = serde_json::Map::new();
        payload.insert("seq".into(), serde_json::to_value(&seq).unwrap_or(Value::Null));
        payload.insert("id".into(), Value::String(id.clone()));
        payload.insert("changes".into(), Value::Array(Vec::new()));
        if let Some(ref doc) = doc {
            payload.insert("doc".into(), doc.clone());
        }

        Self {
            id,
            seq,
            doc,
            payload: Value::Object(payload),
        }
    }

    /// Parse an event from a feed row.
    pub fn from_value(payload: Value) -> Result<Self> {
        let id = payload
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| ChangesError::feed("change row has no string 'id'"))?
            .to_string();

        let seq = payload
            .get("seq")
            .and_then(Seq::from_json)
            .ok_or_else(|| ChangesError::feed(format!("change '{}' has no usable 'seq'", id)))?;

        let doc = payload.get("doc").filter(|d| !d.is_null()).cloned();

        Ok(Self {
            id,
            seq,
            doc,
            payload,
        })
    }

    /// Whether this change carries a document body.
    pub fn has_doc(&self) -> bool {
        self.doc.is_some()
    }

    /// Whether this change records a deletion.
    pub fn is_deleted(&self) -> bool {
        self.payload
            .get("deleted")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Revisions listed in the `changes` array.
    pub fn revs(&self) -> Vec<&str> {
        self.payload
            .get("changes")
            .and_then(Value::as_array)
            .map(|changes| {
                changes
                    .iter()
                    .filter_map(|c| c.get("rev").and_then(Value::as_str))
                    .collect()
            })
            .unwrap_or_default()
    }
}
