//! Test doubles for the feed, resolver and adapter seams
//!
//! These let a [`ChangeStream`](crate::ChangeStream) run end to end without
//! a database:
//!
//! ```rust,ignore
//! use rivven_changes::testing::{MockFeed, MockResolver};
//!
//! let feed = Arc::new(MockFeed::new(events));
//! let resolver = Arc::new(MockResolver::new(1283842u64));
//! let stream = ChangesAdapter::new("http://localhost:5984/registry")?
//!     .with_feed(feed.clone())
//!     .with_resolver(resolver.clone())
//!     .with_cache(Arc::new(BaselineCache::new()))
//!     .create_stream()?;
//! ```

use crate::error::{ChangesError, Result};
use crate::event::{RawChangeEvent, Seq};
use crate::feed::{ChangeFeed, FeedOptions};
use crate::record::{AdaptedRecord, JsonRecordAdapter, RecordAdapter};
use crate::resolver::SequenceResolver;
use async_trait::async_trait;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// One scripted item of a [`MockFeed`].
#[derive(Debug, Clone)]
pub enum MockItem {
    /// Deliver this change
    Change(RawChangeEvent),
    /// Deliver a feed error with this message
    Error(String),
}

/// A feed that replays a fixed script of changes.
///
/// Emission stops as soon as [`ChangeFeed::stop`] is called; stop calls are
/// counted so tests can check the stream stopped its source exactly once.
#[derive(Debug, Default)]
pub struct MockFeed {
    items: Vec<MockItem>,
    interval: Option<Duration>,
    stopped: Arc<AtomicBool>,
    stop_calls: AtomicUsize,
    opened: Mutex<Vec<FeedOptions>>,
}

impl MockFeed {
    /// Replay `events` in order
    pub fn new(events: impl IntoIterator<Item = RawChangeEvent>) -> Self {
        Self::scripted(events.into_iter().map(MockItem::Change))
    }

    /// Replay a mix of changes and errors in order
    pub fn scripted(items: impl IntoIterator<Item = MockItem>) -> Self {
        Self {
            items: items.into_iter().collect(),
            ..Default::default()
        }
    }

    /// A feed with nothing to say
    pub fn empty() -> Self {
        Self::default()
    }

    /// Wait `interval` before each item (builder-style)
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    /// Times `stop` was called
    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    /// Check if the feed was stopped
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Options of every `open` call so far
    pub fn opened_with(&self) -> Vec<FeedOptions> {
        self.opened.lock().clone()
    }
}

impl ChangeFeed for MockFeed {
    fn open(&self, options: &FeedOptions) -> BoxStream<'static, Result<RawChangeEvent>> {
        self.opened.lock().push(options.clone());

        let items = self.items.clone();
        let interval = self.interval;
        let stopped = self.stopped.clone();

        Box::pin(async_stream::stream! {
            for item in items {
                if let Some(interval) = interval {
                    tokio::time::sleep(interval).await;
                }
                if stopped.load(Ordering::SeqCst) {
                    return;
                }
                match item {
                    MockItem::Change(event) => yield Ok(event),
                    MockItem::Error(msg) => yield Err(ChangesError::feed(msg)),
                }
            }
        })
    }

    fn stop(&self) {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.stopped.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
enum Answer {
    Seq(Seq),
    Network(String),
    Missing,
}

/// A resolver with a fixed answer.
///
/// A gated resolver holds every resolution open until
/// [`release`](MockResolver::release) is called, which lets tests deliver
/// changes while the baseline is still unknown.
#[derive(Debug)]
pub struct MockResolver {
    answer: Answer,
    calls: AtomicUsize,
    targets: Mutex<Vec<String>>,
    gate: Option<Semaphore>,
    delay: Option<Duration>,
}

impl MockResolver {
    /// Always answer `seq`
    pub fn new(seq: impl Into<Seq>) -> Self {
        Self::with_answer(Answer::Seq(seq.into()))
    }

    /// Always fail with a network error
    pub fn failing(msg: impl Into<String>) -> Self {
        Self::with_answer(Answer::Network(msg.into()))
    }

    /// Always answer without an `update_seq`
    pub fn missing_update_seq() -> Self {
        Self::with_answer(Answer::Missing)
    }

    fn with_answer(answer: Answer) -> Self {
        Self {
            answer,
            calls: AtomicUsize::new(0),
            targets: Mutex::new(Vec::new()),
            gate: None,
            delay: None,
        }
    }

    /// Hold resolutions until released (builder-style)
    pub fn gated(mut self) -> Self {
        self.gate = Some(Semaphore::new(0));
        self
    }

    /// Sleep before answering (builder-style)
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Let held resolutions finish
    pub fn release(&self) {
        if let Some(ref gate) = self.gate {
            gate.add_permits(1 << 16);
        }
    }

    /// Number of resolutions started
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Targets resolved, in call order
    pub fn targets(&self) -> Vec<String> {
        self.targets.lock().clone()
    }
}

#[async_trait]
impl SequenceResolver for MockResolver {
    async fn resolve(&self, db: &str) -> Result<Seq> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.targets.lock().push(db.to_string());

        if let Some(ref gate) = self.gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|_| ChangesError::network(db, "resolver gate closed"))?;
            permit.forget();
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match &self.answer {
            Answer::Seq(seq) => Ok(seq.clone()),
            Answer::Network(msg) => Err(ChangesError::network(db, msg.clone())),
            Answer::Missing => Err(ChangesError::MissingUpdateSeq { db: db.to_string() }),
        }
    }
}

/// Adapter that fails for chosen document ids and renders the rest as JSON.
#[derive(Debug, Default)]
pub struct FailingAdapter {
    ids: HashSet<String>,
}

impl FailingAdapter {
    /// Fail for every id in `ids`
    pub fn for_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ids: ids.into_iter().map(Into::into).collect(),
        }
    }
}

impl RecordAdapter for FailingAdapter {
    fn adapt(&self, event: &RawChangeEvent) -> Result<AdaptedRecord> {
        if self.ids.contains(&event.id) {
            return Err(ChangesError::adaptation(&event.id, "rejected by test adapter"));
        }
        JsonRecordAdapter.adapt(event)
    }
}
