//! # Ouroboros Query (ouroboros-query)
//!
//! An async query cache for Rust: deduplicated fetches, observable entries
//! and garbage collection of data nobody is looking at.
//!
//! ## Features
//!
//! - Structured query keys with order-independent object hashing
//! - One entry per key, shared by every consumer
//! - Concurrent fetches of the same key collapse into one
//! - Synchronous change notifications for entries and for the whole store
//! - Timed eviction of unobserved entries (5 minutes by default)
//! - Async-first design using tokio
//!
//! ## Quick Start
//!
//! ```no_run
//! use ouroboros_query::{CacheConfig, QueryCache, QueryCacheNotifyEvent, QueryOptions, Subscribable};
//! use ouroboros_query::query_key;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cache = Arc::new(QueryCache::new(CacheConfig::from_env()?));
//!
//!     let events = cache.subscribe(Arc::new(|event: &QueryCacheNotifyEvent| {
//!         println!("{} {}", event.event_type(), event.query().hash());
//!     }));
//!
//!     let query = cache.build(query_key!["user", 42], &QueryOptions::default());
//!     let user = query.fetch(|_key| async { Ok(json!({"name": "Ada"})) }).await?;
//!     println!("Fetched: {}", user);
//!
//!     events.unsubscribe();
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod error;

// Re-export main types for convenience
pub use cache::{
    Action, CacheConfig, CacheConfigBuilder, CacheHooks, FetchStatus, NotifyEventType, NotifyOutcome, Query,
    QueryCache, QueryCacheNotifyEvent, QueryCacheStats, QueryHash, QueryKey, QueryObserver, QueryObserverResult,
    QueryOptions, QueryState, QueryStatus, Removable, Subscribable, Unsubscribe,
};
pub use error::{CacheError, Result};

#[doc(hidden)]
pub use serde_json as __serde_json;
