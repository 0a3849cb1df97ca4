//! Per-target baseline cache with single-flight resolution
//!
//! Each target gets one `OnceCell`. Concurrent callers for the same target
//! wait on the same initialisation, so at most one resolution is in flight
//! per target. A failed resolution leaves the cell empty; the next caller
//! tries again.

use crate::error::Result;
use crate::event::Seq;
use crate::resolver::SequenceResolver;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use tokio::sync::OnceCell;
use tracing::{debug, info};

static PROCESS_CACHE: LazyLock<Arc<BaselineCache>> =
    LazyLock::new(|| Arc::new(BaselineCache::new()));

/// Resolved baselines keyed by target database.
#[derive(Debug, Default)]
pub struct BaselineCache {
    entries: Mutex<HashMap<String, Arc<OnceCell<Seq>>>>,
    resolutions: AtomicU64,
}

impl BaselineCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// The cache shared by every stream in this process.
    pub fn process() -> Arc<BaselineCache> {
        PROCESS_CACHE.clone()
    }

    /// The cached baseline of `db`, if resolved.
    pub fn get(&self, db: &str) -> Option<Seq> {
        self.entries
            .lock()
            .get(&cache_key(db))
            .and_then(|cell| cell.get().cloned())
    }

    /// Return the baseline of `db`, resolving it on first use.
    pub async fn get_or_resolve(&self, db: &str, resolver: &dyn SequenceResolver) -> Result<Seq> {
        let cell = {
            let mut entries = self.entries.lock();
            entries.entry(cache_key(db)).or_default().clone()
        };

        if let Some(seq) = cell.get() {
            debug!("Baseline for {} served from cache: {}", db, seq);
            return Ok(seq.clone());
        }

        let seq = cell
            .get_or_try_init(|| async {
                self.resolutions.fetch_add(1, Ordering::Relaxed);
                let seq = resolver.resolve(db).await?;
                info!("Resolved baseline for {}: update_seq={}", db, seq);
                Ok::<_, crate::error::ChangesError>(seq)
            })
            .await?;

        Ok(seq.clone())
    }

    /// Forget the resolved baseline of `db` so the next caller resolves it
    /// again. A resolution still in flight is left alone; returns whether a
    /// baseline was removed.
    pub fn invalidate(&self, db: &str) -> bool {
        let key = cache_key(db);
        let mut entries = self.entries.lock();
        let resolved = entries.get(&key).is_some_and(|cell| cell.initialized());
        if resolved {
            entries.remove(&key);
        }
        resolved
    }

    /// Number of resolutions started through this cache.
    pub fn resolutions(&self) -> u64 {
        self.resolutions.load(Ordering::Relaxed)
    }

    /// Number of targets with a resolved baseline.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|cell| cell.initialized())
            .count()
    }

    /// Check if no baseline has been resolved yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `http://host/db` and `http://host/db/` name the same database.
fn cache_key(db: &str) -> String {
    db.trim_end_matches('/').to_string()
}
