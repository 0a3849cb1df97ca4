//! Baseline sequence resolution
//!
//! A [`SequenceResolver`] asks a database for its current `update_seq`. It
//! does not cache; the [`BaselineCache`](crate::BaselineCache) decides when a
//! resolution is needed and makes sure only one runs per target.

use crate::error::{ChangesError, Result};
use crate::event::Seq;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Fetches the "current" sequence of a target database.
#[async_trait]
pub trait SequenceResolver: Send + Sync {
    /// Resolve the current sequence of `db`.
    ///
    /// Fails with a network error on transport failure, non-success status or
    /// a malformed body, and with [`ChangesError::MissingUpdateSeq`] when the
    /// database answers without an `update_seq`.
    async fn resolve(&self, db: &str) -> Result<Seq>;
}

/// Resolves `update_seq` with a GET against the database URL.
#[derive(Debug, Clone)]
pub struct HttpSequenceResolver {
    client: reqwest::Client,
}

impl HttpSequenceResolver {
    /// Create a resolver with the given request timeout
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChangesError::config(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    /// Create a resolver on top of an existing client
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SequenceResolver for HttpSequenceResolver {
    async fn resolve(&self, db: &str) -> Result<Seq> {
        debug!("Fetching update_seq from {}", db);

        let resp = self
            .client
            .get(db)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| ChangesError::network(db, e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ChangesError::network(
                db,
                format!("unexpected status {}", status),
            ));
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| ChangesError::network(db, format!("invalid database info: {}", e)))?;

        parse_update_seq(db, &body)
    }
}

/// Extract `update_seq` from a database info document.
pub(crate) fn parse_update_seq(db: &str, body: &Value) -> Result<Seq> {
    match body.get("update_seq") {
        None | Some(Value::Null) => Err(ChangesError::MissingUpdateSeq { db: db.to_string() }),
        Some(value) => Seq::from_json(value).ok_or_else(|| {
            ChangesError::network(db, format!("malformed update_seq: {}", value))
        }),
    }
}
