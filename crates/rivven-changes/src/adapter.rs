//! Entry point: turn options into a running change stream

use crate::cache::BaselineCache;
use crate::config::ChangesConfig;
use crate::error::Result;
use crate::feed::{ChangeFeed, CouchChangeFeed, FeedOptions};
use crate::record::{JsonRecordAdapter, RecordAdapter};
use crate::resolver::{HttpSequenceResolver, SequenceResolver};
use crate::stream::ChangeStream;
use crate::transform::StreamTransform;
use std::sync::Arc;
use tracing::info;

/// Builds [`ChangeStream`]s for one target database.
///
/// Any collaborator not supplied is created on [`create_stream`]:
/// a [`CouchChangeFeed`], an [`HttpSequenceResolver`] using the configured
/// request timeout, [`JsonRecordAdapter`], and the process-wide
/// [`BaselineCache`].
///
/// [`create_stream`]: ChangesAdapter::create_stream
pub struct ChangesAdapter {
    config: ChangesConfig,
    db: String,
    feed: Option<Arc<dyn ChangeFeed>>,
    resolver: Option<Arc<dyn SequenceResolver>>,
    cache: Option<Arc<BaselineCache>>,
    adapter: Arc<dyn RecordAdapter>,
}

impl ChangesAdapter {
    /// Validate `options` and prepare an adapter. Performs no I/O.
    ///
    /// Accepts a [`ChangesConfig`] or a bare database URL.
    pub fn new(options: impl Into<ChangesConfig>) -> Result<Self> {
        let config = options.into();
        let db = config.check()?.to_string();

        Ok(Self {
            config,
            db,
            feed: None,
            resolver: None,
            cache: None,
            adapter: Arc::new(JsonRecordAdapter),
        })
    }

    /// Use a custom upstream feed (builder-style)
    pub fn with_feed(mut self, feed: Arc<dyn ChangeFeed>) -> Self {
        self.feed = Some(feed);
        self
    }

    /// Use a custom baseline resolver (builder-style)
    pub fn with_resolver(mut self, resolver: Arc<dyn SequenceResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Use a private baseline cache instead of the process-wide one
    /// (builder-style)
    pub fn with_cache(mut self, cache: Arc<BaselineCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Use a custom record adapter (builder-style)
    pub fn with_adapter(mut self, adapter: Arc<dyn RecordAdapter>) -> Self {
        self.adapter = adapter;
        self
    }

    /// The validated configuration
    pub fn config(&self) -> &ChangesConfig {
        &self.config
    }

    /// The target database
    pub fn db(&self) -> &str {
        &self.db
    }

    /// Open the feed and return the stream of signals.
    ///
    /// The baseline is resolved lazily, when the first change arrives.
    pub fn create_stream(&self) -> Result<ChangeStream> {
        let feed = match self.feed {
            Some(ref feed) => feed.clone(),
            None => Arc::new(CouchChangeFeed::new()?) as Arc<dyn ChangeFeed>,
        };
        let resolver = match self.resolver {
            Some(ref resolver) => resolver.clone(),
            None => Arc::new(HttpSequenceResolver::new(self.config.request_timeout())?)
                as Arc<dyn SequenceResolver>,
        };
        let cache = self.cache.clone().unwrap_or_else(BaselineCache::process);

        let limit = self.config.effective_limit();
        info!(
            "Creating change stream for {} (since: {}, limit: {})",
            self.db,
            self.config
                .since
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "start".to_string()),
            limit.map_or_else(|| "none".to_string(), |l| l.to_string())
        );

        let transform = StreamTransform::new(self.db.clone(), self.adapter.clone(), feed.clone())
            .with_limit(limit)
            .with_policy(self.config.on_adapt_error);
        let options = FeedOptions::from_config(self.db.clone(), &self.config);

        Ok(ChangeStream::new(transform, feed, options, cache, resolver))
    }
}

impl std::fmt::Debug for ChangesAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangesAdapter")
            .field("db", &self.db)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Validate `options` and open a change stream with default collaborators.
///
/// ```rust,no_run
/// # async fn run() -> rivven_changes::Result<()> {
/// use futures::StreamExt;
/// use rivven_changes::{changes, ChangeSignal, ChangesConfig};
///
/// let config = ChangesConfig::new("https://skimdb.npmjs.com/registry")
///     .with_since(1283832u64)
///     .with_limit(10);
/// let mut stream = changes(config)?;
/// while let Some(signal) = stream.next().await {
///     match signal {
///         ChangeSignal::Record(record) => println!("{} {}", record.seq, record.id),
///         ChangeSignal::Current(seq) => println!("caught up at {}", seq),
///         ChangeSignal::Error(e) => eprintln!("error: {}", e),
///     }
/// }
/// # Ok(())
/// # }
/// ```
pub fn changes(options: impl Into<ChangesConfig>) -> Result<ChangeStream> {
    ChangesAdapter::new(options)?.create_stream()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChangesError;
    use crate::testing::{MockFeed, MockResolver};

    #[test]
    fn test_missing_db_is_config_error() {
        let err = ChangesAdapter::new(ChangesConfig::default()).unwrap_err();
        assert!(matches!(err, ChangesError::Config(_)));
        assert!(changes(ChangesConfig::default()).is_err());
    }

    #[test]
    fn test_bare_target() {
        let adapter = ChangesAdapter::new("http://localhost:5984/registry").unwrap();
        assert_eq!(adapter.db(), "http://localhost:5984/registry");
        assert!(adapter.config().include_docs);
    }

    #[tokio::test]
    async fn test_feed_opened_with_config() {
        let feed = Arc::new(MockFeed::empty());
        let config = ChangesConfig::new("http://localhost:5984/registry")
            .with_since(42u64)
            .with_include_docs(false);
        let stream = ChangesAdapter::new(config)
            .unwrap()
            .with_feed(feed.clone())
            .with_resolver(Arc::new(MockResolver::new(1u64)))
            .with_cache(Arc::new(BaselineCache::new()))
            .create_stream()
            .unwrap();

        let signals: Vec<_> = futures::StreamExt::collect(stream).await;
        assert!(signals.is_empty());

        let opened = feed.opened_with();
        assert_eq!(opened.len(), 1);
        assert_eq!(opened[0].since, Some(crate::event::Seq::Number(42)));
        assert!(!opened[0].include_docs);
    }
}
