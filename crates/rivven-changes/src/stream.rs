//! Consumer-facing change stream
//!
//! [`ChangeStream`] wires a [`ChangeFeed`], the baseline cache and a
//! [`StreamTransform`] together. It polls the feed and, while a baseline
//! resolution is in flight, keeps reading so arrivals are buffered in order
//! rather than held back in the socket.

use crate::cache::BaselineCache;
use crate::error::Result;
use crate::event::{RawChangeEvent, Seq};
use crate::feed::{ChangeFeed, FeedOptions};
use crate::record::AdaptedRecord;
use crate::resolver::SequenceResolver;
use crate::signal::ChangeSignal;
use crate::transform::{Step, StreamTransform, TransformStats};
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::{debug, info};

/// Ordered stream of [`ChangeSignal`]s for one target database.
///
/// The stream ends when the record limit is reached, after a fatal error,
/// or when the upstream feed ends.
pub struct ChangeStream {
    target: String,
    inner: BoxStream<'static, ChangeSignal>,
    stats: Arc<TransformStats>,
}

impl ChangeStream {
    pub(crate) fn new(
        mut transform: StreamTransform,
        feed: Arc<dyn ChangeFeed>,
        options: FeedOptions,
        cache: Arc<BaselineCache>,
        resolver: Arc<dyn SequenceResolver>,
    ) -> Self {
        let target = transform.target().to_string();
        let stats = transform.stats();

        let inner = async_stream::stream! {
            let mut upstream = feed.open(&options);
            let mut resolution: Option<BoxFuture<'static, Result<Seq>>> = None;
            let mut upstream_done = false;

            loop {
                if transform.state().is_terminal() {
                    break;
                }

                let step = match resolution.as_mut() {
                    Some(pending) if upstream_done => {
                        let outcome = pending.await;
                        resolution = None;
                        transform.on_resolution(outcome)
                    }
                    Some(pending) => {
                        let input = tokio::select! {
                            biased;
                            outcome = pending => Input::Resolution(outcome),
                            next = upstream.next() => Input::Upstream(next),
                        };
                        match input {
                            Input::Resolution(outcome) => {
                                resolution = None;
                                transform.on_resolution(outcome)
                            }
                            Input::Upstream(next) => {
                                intake(&mut transform, next, &mut upstream_done)
                            }
                        }
                    }
                    None if upstream_done => break,
                    None => {
                        let next = upstream.next().await;
                        intake(&mut transform, next, &mut upstream_done)
                    }
                };

                if let Some(ref db) = step.resolve {
                    resolution = Some(resolve(cache.clone(), resolver.clone(), db.clone()));
                }

                for signal in step.signals {
                    yield signal;
                }
            }

            info!(
                "Change stream for {} finished in state {:?} after {} record(s)",
                transform.target(),
                transform.state(),
                transform.emitted()
            );
        };

        Self {
            target,
            inner: Box::pin(inner),
            stats,
        }
    }

    /// Target database of this stream
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Live statistics of the underlying transform
    pub fn stats(&self) -> Arc<TransformStats> {
        self.stats.clone()
    }

    /// Only the records of this stream; announcements and errors are dropped.
    pub fn records(self) -> impl Stream<Item = AdaptedRecord> + Send {
        self.filter_map(|signal| async move { signal.into_record() })
    }
}

impl Stream for ChangeStream {
    type Item = ChangeSignal;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl std::fmt::Debug for ChangeStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeStream")
            .field("target", &self.target)
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}

enum Input {
    Resolution(Result<Seq>),
    Upstream(Option<Result<RawChangeEvent>>),
}

fn intake(
    transform: &mut StreamTransform,
    next: Option<Result<RawChangeEvent>>,
    upstream_done: &mut bool,
) -> Step {
    match next {
        Some(Ok(event)) => transform.on_event(event),
        Some(Err(err)) => transform.on_upstream_error(err),
        None => {
            debug!("Upstream feed for {} ended", transform.target());
            *upstream_done = true;
            Step::default()
        }
    }
}

fn resolve(
    cache: Arc<BaselineCache>,
    resolver: Arc<dyn SequenceResolver>,
    db: String,
) -> BoxFuture<'static, Result<Seq>> {
    Box::pin(async move { cache.get_or_resolve(&db, resolver.as_ref()).await })
}
