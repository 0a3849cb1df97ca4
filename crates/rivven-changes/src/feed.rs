//! Upstream changes feed
//!
//! The [`ChangeFeed`] trait is what the transform consumes: a stream of raw
//! change events plus an idempotent `stop`. [`CouchChangeFeed`] implements it
//! over HTTP against a CouchDB-compatible `_changes` endpoint in continuous
//! mode:
//!
//! ```text
//! GET {db}/_changes?feed=continuous&include_docs=true&heartbeat=30000&since=42
//!
//! {"seq":43,"id":"a","changes":[{"rev":"1-x"}],"doc":{...}}\n
//! \n                                     <- heartbeat
//! {"seq":44,"id":"b","changes":[{"rev":"3-y"}],"deleted":true}\n
//! {"last_seq":44}\n                      <- feed closed by the server
//! ```

use crate::config::{ChangesConfig, FeedStyle};
use crate::error::{ChangesError, Result};
use crate::event::{RawChangeEvent, Seq};
use bytes::{Bytes, BytesMut};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Options the upstream feed is opened with.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedOptions {
    /// Database URL
    pub db: String,
    /// Resume after this sequence
    pub since: Option<Seq>,
    /// Include full documents in change rows
    pub include_docs: bool,
    /// Heartbeat interval requested from the server
    pub heartbeat: Duration,
    /// Server-side filter
    pub filter: Option<String>,
    /// Revision style
    pub style: FeedStyle,
    /// Extra query parameters
    pub query_params: BTreeMap<String, String>,
}

impl FeedOptions {
    /// Create options for `db` with defaults
    pub fn new(db: impl Into<String>) -> Self {
        Self::from_config(db, &ChangesConfig::default())
    }

    /// Derive feed options from a stream configuration
    pub fn from_config(db: impl Into<String>, config: &ChangesConfig) -> Self {
        Self {
            db: db.into(),
            since: config.since.clone(),
            include_docs: config.include_docs,
            heartbeat: config.heartbeat(),
            filter: config.filter.clone(),
            style: config.style,
            query_params: config.query_params.clone(),
        }
    }

    /// The `_changes` URL for these options
    pub fn changes_url(&self) -> Result<url::Url> {
        let mut url = url::Url::parse(&self.db)
            .map_err(|e| ChangesError::config(format!("Invalid database URL '{}': {}", self.db, e)))?;

        url.path_segments_mut()
            .map_err(|_| ChangesError::config(format!("Database URL '{}' cannot have a path", self.db)))?
            .pop_if_empty()
            .push("_changes");

        {
            let mut query = url.query_pairs_mut();
            query.append_pair("feed", "continuous");
            query.append_pair("include_docs", if self.include_docs { "true" } else { "false" });
            query.append_pair("heartbeat", &self.heartbeat.as_millis().to_string());
            query.append_pair("style", self.style.as_str());
            if let Some(ref since) = self.since {
                query.append_pair("since", &since.as_query_value());
            }
            if let Some(ref filter) = self.filter {
                query.append_pair("filter", filter);
            }
            for (key, value) in &self.query_params {
                query.append_pair(key, value);
            }
        }

        Ok(url)
    }
}

/// A producer of raw change events.
pub trait ChangeFeed: Send + Sync {
    /// Open the feed. Transport failures are yielded as errors on the stream.
    fn open(&self, options: &FeedOptions) -> BoxStream<'static, Result<RawChangeEvent>>;

    /// Stop emitting events. Safe to call more than once.
    fn stop(&self);
}

/// One decoded line of a continuous feed.
#[derive(Debug)]
pub(crate) enum FeedLine {
    Change(RawChangeEvent),
    Heartbeat,
    End(Option<Seq>),
    Invalid(ChangesError),
}

pub(crate) fn parse_line(line: &[u8]) -> FeedLine {
    if line.iter().all(u8::is_ascii_whitespace) {
        return FeedLine::Heartbeat;
    }

    let value: Value = match serde_json::from_slice(line) {
        Ok(value) => value,
        Err(e) => return FeedLine::Invalid(e.into()),
    };

    if let Some(error) = value.get("error").and_then(Value::as_str) {
        let reason = value.get("reason").and_then(Value::as_str).unwrap_or("");
        return FeedLine::Invalid(ChangesError::feed(format!("{}: {}", error, reason)));
    }

    if value.get("id").is_none() {
        if let Some(last_seq) = value.get("last_seq") {
            return FeedLine::End(Seq::from_json(last_seq));
        }
    }

    match RawChangeEvent::from_value(value) {
        Ok(event) => FeedLine::Change(event),
        Err(e) => FeedLine::Invalid(e),
    }
}

/// Splits a byte stream into newline-terminated lines.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buf: BytesMut,
}

impl LineDecoder {
    /// Create an empty decoder
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every line it completes (without the newline).
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let mut line = self.buf.split_to(pos + 1);
            line.truncate(pos);
            if line.last() == Some(&b'\r') {
                line.truncate(pos - 1);
            }
            lines.push(line.freeze());
        }
        lines
    }

    /// Flush a trailing line that was not newline-terminated.
    pub fn finish(&mut self) -> Option<Bytes> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = self.buf.split_to(self.buf.len()).freeze();
        Some(rest)
    }

    /// Bytes held back waiting for a newline
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Continuous `_changes` feed over HTTP.
#[derive(Debug, Clone)]
pub struct CouchChangeFeed {
    client: reqwest::Client,
    cancel: CancellationToken,
}

impl CouchChangeFeed {
    /// Create a feed client
    pub fn new() -> Result<Self> {
        // No overall request timeout: a continuous feed stays open until
        // the server closes it or the feed is stopped.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ChangesError::config(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self::with_client(client))
    }

    /// Create a feed on top of an existing client
    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            cancel: CancellationToken::new(),
        }
    }

    /// Check if the feed was stopped
    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl ChangeFeed for CouchChangeFeed {
    fn open(&self, options: &FeedOptions) -> BoxStream<'static, Result<RawChangeEvent>> {
        let client = self.client.clone();
        let cancel = self.cancel.clone();
        let url = options.changes_url();

        let stream = async_stream::stream! {
            let url = match url {
                Ok(url) => url,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };

            info!("Opening changes feed: {}", url);

            let sent = tokio::select! {
                _ = cancel.cancelled() => return,
                sent = client.get(url).send() => sent,
            };

            let resp = match sent {
                Ok(resp) if resp.status().is_success() => resp,
                Ok(resp) => {
                    yield Err(ChangesError::feed(format!(
                        "changes feed returned status {}",
                        resp.status()
                    )));
                    return;
                }
                Err(e) => {
                    yield Err(ChangesError::feed(format!("changes feed request failed: {}", e)));
                    return;
                }
            };

            let mut body = resp.bytes_stream();
            let mut decoder = LineDecoder::new();

            loop {
                let chunk = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        debug!("Changes feed stopped");
                        return;
                    }
                    chunk = body.next() => chunk,
                };

                let (lines, exhausted) = match chunk {
                    Some(Ok(bytes)) => (decoder.push(&bytes), false),
                    Some(Err(e)) => {
                        yield Err(ChangesError::feed(format!("changes feed interrupted: {}", e)));
                        return;
                    }
                    None => (decoder.finish().into_iter().collect::<Vec<_>>(), true),
                };

                for line in lines {
                    if cancel.is_cancelled() {
                        return;
                    }
                    match parse_line(&line) {
                        FeedLine::Change(event) => yield Ok(event),
                        FeedLine::Heartbeat => {}
                        FeedLine::End(last_seq) => {
                            debug!("Changes feed closed by server, last_seq={:?}", last_seq);
                            return;
                        }
                        FeedLine::Invalid(e) => {
                            warn!("Skipping malformed change row: {}", e);
                            yield Err(e);
                        }
                    }
                }

                if exhausted {
                    debug!("Changes feed body ended");
                    return;
                }
            }
        };

        Box::pin(stream)
    }

    fn stop(&self) {
        if !self.cancel.is_cancelled() {
            info!("Stopping changes feed");
        }
        self.cancel.cancel();
    }
}
