//! # Stream transform
//!
//! The stateful stage between the upstream feed and the consumer.
//!
//! ```text
//!                 first event              resolution ok
//!  ┌────────────┐ ───────────▶ ┌───────────┐ ───────────▶ ┌──────────┐
//!  │ Unresolved │              │ Resolving │              │ Resolved │
//!  └────────────┘              └───────────┘              └──────────┘
//!                                │  events are               │      │
//!                                │  buffered                 │      │ limit hit
//!                 resolution err ▼                 halt on   ▼      ▼
//!                              ┌─────────┐ ◀──── adapt err ──┘  ┌──────────────┐
//!                              │ Errored │                      │ LimitReached │
//!                              └─────────┘                      └──────────────┘
//! ```
//!
//! The transform is driven by discrete inputs ([`StreamTransform::on_event`],
//! [`StreamTransform::on_resolved`], [`StreamTransform::on_resolve_failed`])
//! and performs no I/O itself, apart from the stop signal it sends upstream
//! when the record limit is reached. The caller runs the baseline
//! resolution when a [`Step`] asks for it.

use crate::config::AdaptErrorPolicy;
use crate::error::{ChangesError, Result};
use crate::event::{RawChangeEvent, Seq};
use crate::feed::ChangeFeed;
use crate::record::RecordAdapter;
use crate::signal::ChangeSignal;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Lifecycle state of a [`StreamTransform`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformState {
    /// Baseline not yet requested
    Unresolved,
    /// Baseline request in flight, events are buffered
    Resolving,
    /// Baseline known, events are processed as they arrive
    Resolved,
    /// Record limit reached, upstream told to stop
    LimitReached,
    /// Unrecoverable error surfaced
    Errored,
}

impl TransformState {
    /// Check if no further events will be processed
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::LimitReached | Self::Errored)
    }
}

/// Output of feeding one input into the transform.
#[derive(Debug, Default)]
pub struct Step {
    /// Signals to hand downstream, in order
    pub signals: Vec<ChangeSignal>,
    /// Target whose baseline must be resolved now
    pub resolve: Option<String>,
}

impl Step {
    /// Check if the caller must start a baseline resolution
    pub fn needs_resolution(&self) -> bool {
        self.resolve.is_some()
    }
}

/// Statistics for a transform.
#[derive(Debug, Default)]
pub struct TransformStats {
    /// Change events received from upstream
    pub events_received: AtomicU64,
    /// Records emitted downstream
    pub records_emitted: AtomicU64,
    /// Changes that carried no document
    pub events_without_doc: AtomicU64,
    /// Catch-up announcements emitted
    pub current_announcements: AtomicU64,
    /// Changes that failed to adapt
    pub adapt_errors: AtomicU64,
    /// Upstream errors passed through
    pub upstream_errors: AtomicU64,
    /// Changes dropped after the transform became terminal
    pub events_dropped: AtomicU64,
    /// Largest number of changes buffered while resolving
    pub max_buffered: AtomicU64,
}

impl TransformStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn record_received(&self) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
    }

    fn record_emitted(&self) {
        self.records_emitted.fetch_add(1, Ordering::Relaxed);
    }

    fn record_without_doc(&self) {
        self.events_without_doc.fetch_add(1, Ordering::Relaxed);
    }

    fn record_current(&self) {
        self.current_announcements.fetch_add(1, Ordering::Relaxed);
    }

    fn record_adapt_error(&self) {
        self.adapt_errors.fetch_add(1, Ordering::Relaxed);
    }

    fn record_upstream_error(&self) {
        self.upstream_errors.fetch_add(1, Ordering::Relaxed);
    }

    fn record_dropped(&self, n: u64) {
        self.events_dropped.fetch_add(n, Ordering::Relaxed);
    }

    fn record_buffered(&self, depth: usize) {
        self.max_buffered.fetch_max(depth as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TransformStatsSnapshot {
        TransformStatsSnapshot {
            events_received: self.events_received.load(Ordering::Relaxed),
            records_emitted: self.records_emitted.load(Ordering::Relaxed),
            events_without_doc: self.events_without_doc.load(Ordering::Relaxed),
            current_announcements: self.current_announcements.load(Ordering::Relaxed),
            adapt_errors: self.adapt_errors.load(Ordering::Relaxed),
            upstream_errors: self.upstream_errors.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            max_buffered: self.max_buffered.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of transform statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformStatsSnapshot {
    pub events_received: u64,
    pub records_emitted: u64,
    pub events_without_doc: u64,
    pub current_announcements: u64,
    pub adapt_errors: u64,
    pub upstream_errors: u64,
    pub events_dropped: u64,
    pub max_buffered: u64,
}

/// The changes state machine for one target database.
pub struct StreamTransform {
    target: String,
    state: TransformState,
    pending: VecDeque<Result<RawChangeEvent>>,
    high_water_mark: Option<Seq>,
    emitted: u64,
    limit: Option<u64>,
    policy: AdaptErrorPolicy,
    adapter: Arc<dyn RecordAdapter>,
    upstream: Arc<dyn ChangeFeed>,
    stats: Arc<TransformStats>,
}

impl StreamTransform {
    /// Create a transform for `target` that stops `upstream` at the limit.
    pub fn new(
        target: impl Into<String>,
        adapter: Arc<dyn RecordAdapter>,
        upstream: Arc<dyn ChangeFeed>,
    ) -> Self {
        Self {
            target: target.into(),
            state: TransformState::Unresolved,
            pending: VecDeque::new(),
            high_water_mark: None,
            emitted: 0,
            limit: None,
            policy: AdaptErrorPolicy::default(),
            adapter,
            upstream,
            stats: Arc::new(TransformStats::new()),
        }
    }

    /// Set the record limit (builder-style). `None` means unbounded.
    pub fn with_limit(mut self, limit: Option<u64>) -> Self {
        self.limit = limit;
        self
    }

    /// Set the adaptation error policy (builder-style)
    pub fn with_policy(mut self, policy: AdaptErrorPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Target database of this transform
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Current state
    pub fn state(&self) -> TransformState {
        self.state
    }

    /// Highest sequence observed so far, starting at the baseline
    pub fn high_water_mark(&self) -> Option<&Seq> {
        self.high_water_mark.as_ref()
    }

    /// Records emitted so far
    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    /// Changes waiting for the baseline
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Shared statistics handle
    pub fn stats(&self) -> Arc<TransformStats> {
        self.stats.clone()
    }

    /// A raw change arrived from upstream.
    pub fn on_event(&mut self, event: RawChangeEvent) -> Step {
        let mut step = Step::default();

        match self.state {
            TransformState::Unresolved => {
                self.stats.record_received();
                debug!(
                    "First change for {} (seq {}), resolving baseline",
                    self.target, event.seq
                );
                self.pending.push_back(Ok(event));
                self.stats.record_buffered(self.pending.len());
                self.state = TransformState::Resolving;
                step.resolve = Some(self.target.clone());
            }
            TransformState::Resolving => {
                self.stats.record_received();
                self.pending.push_back(Ok(event));
                self.stats.record_buffered(self.pending.len());
            }
            TransformState::Resolved => {
                self.stats.record_received();
                self.process(event, &mut step.signals);
            }
            TransformState::LimitReached | TransformState::Errored => {
                self.stats.record_dropped(1);
            }
        }

        step
    }

    /// The baseline resolution finished successfully.
    ///
    /// Buffered changes are processed in arrival order.
    pub fn on_resolved(&mut self, baseline: Seq) -> Step {
        let mut step = Step::default();
        if self.state != TransformState::Resolving {
            return step;
        }

        debug!(
            "Baseline for {} is {}, replaying {} buffered change(s)",
            self.target,
            baseline,
            self.pending.len()
        );
        self.high_water_mark = Some(baseline);
        self.state = TransformState::Resolved;

        while let Some(buffered) = self.pending.pop_front() {
            match buffered {
                Ok(event) => self.process(event, &mut step.signals),
                Err(err) => step.signals.push(ChangeSignal::Error(err)),
            }
            if self.state.is_terminal() {
                break;
            }
        }
        self.drop_pending();

        step
    }

    /// The baseline resolution failed. The transform cannot classify any
    /// change without a baseline, so it stops here.
    pub fn on_resolve_failed(&mut self, err: ChangesError) -> Step {
        let mut step = Step::default();
        if self.state != TransformState::Resolving {
            return step;
        }

        warn!("Baseline resolution for {} failed: {}", self.target, err);
        self.drop_pending();
        self.state = TransformState::Errored;
        step.signals.push(ChangeSignal::Error(err));
        step
    }

    /// Feed the outcome of a resolution, successful or not.
    pub fn on_resolution(&mut self, outcome: Result<Seq>) -> Step {
        match outcome {
            Ok(seq) => self.on_resolved(seq),
            Err(err) => self.on_resolve_failed(err),
        }
    }

    /// The upstream feed reported an error. It is passed through unless the
    /// transform is already terminal. While resolving, it queues behind the
    /// changes that arrived before it.
    pub fn on_upstream_error(&mut self, err: ChangesError) -> Step {
        let mut step = Step::default();
        match self.state {
            TransformState::LimitReached | TransformState::Errored => return step,
            TransformState::Resolving => {
                self.stats.record_upstream_error();
                self.pending.push_back(Err(err));
            }
            TransformState::Unresolved | TransformState::Resolved => {
                self.stats.record_upstream_error();
                step.signals.push(ChangeSignal::Error(err));
            }
        }
        step
    }

    fn drop_pending(&mut self) {
        let changes = self.pending.iter().filter(|buffered| buffered.is_ok()).count();
        if changes > 0 {
            self.stats.record_dropped(changes as u64);
        }
        self.pending.clear();
    }

    fn process(&mut self, event: RawChangeEvent, out: &mut Vec<ChangeSignal>) {
        if self.limit_reached() {
            self.reach_limit();
            self.stats.record_dropped(1);
            return;
        }

        if event.has_doc() {
            match self.adapter.adapt(&event) {
                Ok(record) => {
                    out.push(ChangeSignal::Record(record));
                    self.emitted += 1;
                    self.stats.record_emitted();
                }
                Err(err) => {
                    self.stats.record_adapt_error();
                    warn!("Failed to adapt change {} (seq {}): {}", event.id, event.seq, err);
                    out.push(ChangeSignal::Error(err));
                    if self.policy == AdaptErrorPolicy::Halt {
                        self.state = TransformState::Errored;
                    }
                    return;
                }
            }
        } else {
            self.stats.record_without_doc();
        }

        if let Some(ref mark) = self.high_water_mark {
            if event.seq.reaches(mark) {
                debug!("Caught up to current update of {}: {}", self.target, event.seq);
                self.high_water_mark = Some(event.seq.clone());
                self.stats.record_current();
                out.push(ChangeSignal::Current(event.seq));
            }
        }

        if self.limit_reached() {
            self.reach_limit();
        }
    }

    fn limit_reached(&self) -> bool {
        self.limit.is_some_and(|limit| self.emitted >= limit)
    }

    fn reach_limit(&mut self) {
        if self.state == TransformState::LimitReached {
            return;
        }
        info!(
            "Record limit reached for {} after {} record(s), stopping feed",
            self.target, self.emitted
        );
        self.state = TransformState::LimitReached;
        self.upstream.stop();
    }
}

impl std::fmt::Debug for StreamTransform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTransform")
            .field("target", &self.target)
            .field("state", &self.state)
            .field("buffered", &self.pending.len())
            .field("high_water_mark", &self.high_water_mark)
            .field("emitted", &self.emitted)
            .field("limit", &self.limit)
            .field("policy", &self.policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::JsonRecordAdapter;
    use crate::testing::{FailingAdapter, MockFeed};
    use serde_json::json;

    const DB: &str = "http://localhost:5984/registry";

    fn doc_event(id: &str, seq: u64) -> RawChangeEvent {
        RawChangeEvent::new(id, seq, Some(json!({"_id": id})))
    }

    fn transform(feed: &Arc<MockFeed>) -> StreamTransform {
        StreamTransform::new(DB, Arc::new(JsonRecordAdapter), feed.clone())
    }

    fn record_seqs(signals: &[ChangeSignal]) -> Vec<u64> {
        signals
            .iter()
            .filter_map(|s| s.as_record())
            .filter_map(|r| r.seq.ordinal())
            .collect()
    }

    fn currents(signals: &[ChangeSignal]) -> Vec<u64> {
        signals
            .iter()
            .filter_map(|s| s.as_current())
            .filter_map(Seq::ordinal)
            .collect()
    }

    #[test]
    fn test_first_event_requests_resolution_once() {
        let feed = Arc::new(MockFeed::empty());
        let mut t = transform(&feed);

        let step = t.on_event(doc_event("a", 1));
        assert_eq!(step.resolve.as_deref(), Some(DB));
        assert_eq!(t.state(), TransformState::Resolving);

        for seq in 2..6 {
            let step = t.on_event(doc_event("b", seq));
            assert!(!step.needs_resolution());
            assert!(step.signals.is_empty());
        }
        assert_eq!(t.buffered(), 5);
        assert_eq!(t.stats().snapshot().max_buffered, 5);
    }

    #[test]
    fn test_buffer_replayed_in_arrival_order() {
        let feed = Arc::new(MockFeed::empty());
        let mut t = transform(&feed);

        t.on_event(doc_event("a", 10));
        t.on_event(doc_event("b", 11));
        t.on_event(doc_event("c", 12));

        let step = t.on_resolved(Seq::Number(100));
        assert_eq!(t.state(), TransformState::Resolved);
        assert_eq!(record_seqs(&step.signals), vec![10, 11, 12]);
        assert!(currents(&step.signals).is_empty());
        assert_eq!(t.buffered(), 0);
        assert_eq!(t.high_water_mark(), Some(&Seq::Number(100)));
    }

    #[test]
    fn test_record_precedes_announcement() {
        let feed = Arc::new(MockFeed::empty());
        let mut t = transform(&feed);

        t.on_event(doc_event("a", 500));
        let step = t.on_resolved(Seq::Number(500));

        assert_eq!(step.signals.len(), 2);
        assert!(step.signals[0].is_record());
        assert_eq!(step.signals[1].as_current(), Some(&Seq::Number(500)));
    }

    #[test]
    fn test_high_water_mark_tracks_max() {
        let feed = Arc::new(MockFeed::empty());
        let mut t = transform(&feed);

        t.on_event(doc_event("a", 1));
        t.on_resolved(Seq::Number(3));

        let mut announced = Vec::new();
        for seq in [2, 3, 3, 5, 4, 8] {
            let step = t.on_event(doc_event("x", seq));
            announced.extend(currents(&step.signals));
        }

        assert_eq!(announced, vec![3, 3, 5, 8]);
        assert_eq!(t.high_water_mark(), Some(&Seq::Number(8)));
    }

    #[test]
    fn test_doc_less_event_updates_mark_without_record() {
        let feed = Arc::new(MockFeed::empty());
        let mut t = transform(&feed).with_limit(Some(1));

        t.on_event(RawChangeEvent::new("a", 1u64, None));
        t.on_resolved(Seq::Number(5));
        assert_eq!(t.emitted(), 0);

        let step = t.on_event(RawChangeEvent::new("deleted", 6u64, None));
        assert!(record_seqs(&step.signals).is_empty());
        assert_eq!(currents(&step.signals), vec![6]);
        assert_eq!(t.high_water_mark(), Some(&Seq::Number(6)));
        assert_eq!(t.state(), TransformState::Resolved);
        assert_eq!(t.stats().snapshot().events_without_doc, 2);
    }

    #[test]
    fn test_limit_stops_upstream_once() {
        let feed = Arc::new(MockFeed::empty());
        let mut t = transform(&feed).with_limit(Some(2));

        t.on_event(doc_event("a", 1));
        t.on_event(doc_event("b", 2));
        t.on_event(doc_event("c", 3));
        let step = t.on_resolved(Seq::Number(0));

        assert_eq!(record_seqs(&step.signals), vec![1, 2]);
        assert_eq!(t.state(), TransformState::LimitReached);
        assert_eq!(feed.stop_calls(), 1);

        let step = t.on_event(doc_event("d", 4));
        assert!(step.signals.is_empty());
        assert_eq!(feed.stop_calls(), 1);

        let stats = t.stats().snapshot();
        assert_eq!(stats.records_emitted, 2);
        assert_eq!(stats.events_dropped, 2);
    }

    #[test]
    fn test_limit_reached_on_last_emission() {
        let feed = Arc::new(MockFeed::empty());
        let mut t = transform(&feed).with_limit(Some(1));

        t.on_event(doc_event("a", 7));
        let step = t.on_resolved(Seq::Number(7));

        // the record and its announcement still go out
        assert_eq!(record_seqs(&step.signals), vec![7]);
        assert_eq!(currents(&step.signals), vec![7]);
        assert_eq!(t.state(), TransformState::LimitReached);
        assert_eq!(feed.stop_calls(), 1);
    }

    #[test]
    fn test_zero_limit_emits_nothing() {
        let feed = Arc::new(MockFeed::empty());
        let mut t = transform(&feed).with_limit(Some(0));

        t.on_event(doc_event("a", 1));
        let step = t.on_resolved(Seq::Number(0));

        assert!(step.signals.is_empty());
        assert_eq!(t.state(), TransformState::LimitReached);
        assert_eq!(feed.stop_calls(), 1);
    }

    #[test]
    fn test_resolution_failure_is_terminal() {
        let feed = Arc::new(MockFeed::empty());
        let mut t = transform(&feed);

        t.on_event(doc_event("a", 1));
        t.on_event(doc_event("b", 2));
        let step = t.on_resolve_failed(ChangesError::network(DB, "connection refused"));

        assert_eq!(step.signals.len(), 1);
        assert!(matches!(
            step.signals[0].as_error(),
            Some(ChangesError::Network { .. })
        ));
        assert_eq!(t.state(), TransformState::Errored);
        assert_eq!(t.buffered(), 0);

        assert!(t.on_event(doc_event("c", 3)).signals.is_empty());
        assert!(t.on_resolved(Seq::Number(1)).signals.is_empty());
        assert_eq!(feed.stop_calls(), 0);
    }

    #[test]
    fn test_adapt_error_continue() {
        let feed = Arc::new(MockFeed::empty());
        let mut t = StreamTransform::new(DB, Arc::new(FailingAdapter::for_ids(["bad"])), feed.clone())
            .with_limit(Some(2));

        t.on_event(doc_event("ok-1", 1));
        t.on_event(doc_event("bad", 2));
        t.on_event(doc_event("ok-2", 3));
        let step = t.on_resolved(Seq::Number(2));

        let kinds: Vec<&str> = step
            .signals
            .iter()
            .map(|s| match s {
                ChangeSignal::Record(_) => "record",
                ChangeSignal::Current(_) => "current",
                ChangeSignal::Error(_) => "error",
            })
            .collect();
        // the failing change is skipped entirely, including its catch-up check
        assert_eq!(kinds, vec!["record", "error", "record", "current"]);
        assert_eq!(t.state(), TransformState::LimitReached);
        assert_eq!(t.stats().snapshot().adapt_errors, 1);
    }

    #[test]
    fn test_adapt_error_halt() {
        let feed = Arc::new(MockFeed::empty());
        let mut t = StreamTransform::new(DB, Arc::new(FailingAdapter::for_ids(["bad"])), feed.clone())
            .with_policy(AdaptErrorPolicy::Halt);

        t.on_event(doc_event("ok-1", 1));
        t.on_event(doc_event("bad", 2));
        t.on_event(doc_event("ok-2", 3));
        let step = t.on_resolved(Seq::Number(100));

        assert_eq!(record_seqs(&step.signals), vec![1]);
        assert!(step.signals.last().unwrap().is_error());
        assert_eq!(t.state(), TransformState::Errored);
        assert_eq!(t.stats().snapshot().events_dropped, 1);
    }

    #[test]
    fn test_upstream_error_passthrough() {
        let feed = Arc::new(MockFeed::empty());
        let mut t = transform(&feed).with_limit(Some(1));

        let step = t.on_upstream_error(ChangesError::feed("reset"));
        assert!(step.signals[0].is_error());

        t.on_event(doc_event("a", 1));
        t.on_resolved(Seq::Number(0));
        assert!(t.on_upstream_error(ChangesError::feed("late")).signals.is_empty());
    }

    #[test]
    fn test_upstream_error_keeps_arrival_order_while_resolving() {
        let feed = Arc::new(MockFeed::empty());
        let mut t = transform(&feed);

        t.on_event(doc_event("a", 1));
        let step = t.on_upstream_error(ChangesError::feed("malformed row"));
        assert!(step.signals.is_empty());
        t.on_event(doc_event("b", 2));
        assert_eq!(t.buffered(), 3);

        let step = t.on_resolved(Seq::Number(100));
        assert_eq!(step.signals.len(), 3);
        assert_eq!(step.signals[0].as_record().map(|r| r.id.as_str()), Some("a"));
        assert!(matches!(
            step.signals[1].as_error(),
            Some(ChangesError::Feed(_))
        ));
        assert_eq!(step.signals[2].as_record().map(|r| r.id.as_str()), Some("b"));
        assert_eq!(t.stats().snapshot().upstream_errors, 1);
    }

    #[test]
    fn test_buffered_errors_dropped_on_resolution_failure() {
        let feed = Arc::new(MockFeed::empty());
        let mut t = transform(&feed);

        t.on_event(doc_event("a", 1));
        t.on_upstream_error(ChangesError::feed("reset"));
        let step = t.on_resolve_failed(ChangesError::network(DB, "timeout"));

        assert_eq!(step.signals.len(), 1);
        assert!(matches!(
            step.signals[0].as_error(),
            Some(ChangesError::Network { .. })
        ));
        assert_eq!(t.stats().snapshot().events_dropped, 1);
    }

    #[test]
    fn test_opaque_baseline_never_announces() {
        let feed = Arc::new(MockFeed::empty());
        let mut t = transform(&feed);

        t.on_event(doc_event("a", 1));
        let step = t.on_resolved(Seq::Opaque("opaque".into()));
        assert_eq!(record_seqs(&step.signals), vec![1]);
        assert!(currents(&step.signals).is_empty());
    }
}
