//! rivven-changes - CouchDB changes feed adapter
//!
//! Turns a database's continuous `_changes` feed into an ordered stream of
//! records, with a catch-up announcement once the feed reaches the
//! database's update sequence as of the first change, and an optional
//! record limit after which the feed is stopped.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   raw    ┌─────────────────┐  signals  ┌────────────┐
//! │  ChangeFeed  │─────────▶│ StreamTransform │──────────▶│  consumer  │
//! │  (_changes)  │  events  │  (state machine)│           │            │
//! └──────────────┘          └─────────────────┘           └────────────┘
//!        ▲ stop()                    │ first event
//!        │ (limit reached)           ▼
//!        │                  ┌─────────────────┐   GET db  ┌────────────┐
//!        └──────────────────│  BaselineCache  │──────────▶│  Resolver  │
//!                           │ (single-flight) │           │(update_seq)│
//!                           └─────────────────┘           └────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! # async fn run() -> rivven_changes::Result<()> {
//! use futures::StreamExt;
//! use rivven_changes::{ChangeSignal, ChangesAdapter, ChangesConfig};
//!
//! let adapter = ChangesAdapter::new(
//!     ChangesConfig::new("https://skimdb.npmjs.com/registry")
//!         .with_since(1283832u64)
//!         .with_limit(10),
//! )?;
//!
//! let mut stream = adapter.create_stream()?;
//! while let Some(signal) = stream.next().await {
//!     match signal {
//!         ChangeSignal::Record(record) => println!("{} {}", record.seq, record.id),
//!         ChangeSignal::Current(seq) => println!("caught up at {}", seq),
//!         ChangeSignal::Error(e) => eprintln!("{}", e),
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # CLI Usage
//!
//! ```bash
//! rivven-changes --db https://skimdb.npmjs.com/registry --since 1283832 --limit 10
//! rivven-changes --config changes.yaml
//! rivven-changes schema
//! ```

pub mod adapter;
pub mod cache;
pub mod config;
pub mod error;
pub mod event;
pub mod feed;
pub mod record;
pub mod resolver;
pub mod signal;
pub mod stream;
pub mod testing;
pub mod transform;

pub use adapter::{changes, ChangesAdapter};
pub use cache::BaselineCache;
pub use config::{AdaptErrorPolicy, ChangesConfig, FeedStyle};
pub use error::{ChangesError, ErrorCategory, Result};
pub use event::{RawChangeEvent, Seq};
pub use feed::{ChangeFeed, CouchChangeFeed, FeedOptions, LineDecoder};
pub use record::{AdaptedRecord, JsonRecordAdapter, RecordAdapter};
pub use resolver::{HttpSequenceResolver, SequenceResolver};
pub use signal::ChangeSignal;
pub use stream::ChangeStream;
pub use transform::{StreamTransform, TransformState, TransformStats, TransformStatsSnapshot};
