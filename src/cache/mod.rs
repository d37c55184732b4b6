//! # Query Cache
//!
//! In-memory store of asynchronously resolved data, keyed by structured
//! query keys, with change notifications and timed eviction of entries
//! nobody observes.
//!
//! ## Building blocks
//!
//! - [`Subscribable`]: listener registry with idempotent [`Unsubscribe`] handles
//! - [`Removable`]: debounced, cancellable gc timer
//! - [`Query`]: one entry's state machine, fetch deduplication and observers
//! - [`QueryCache`]: hash → query map publishing `added`/`removed`/`updated`
//! - [`QueryObserver`]: consumer view producing [`QueryObserverResult`]s
//!
//! ## Example
//!
//! ```rust
//! use ouroboros_query::cache::{CacheConfig, QueryCache, QueryObserver, QueryOptions};
//! use ouroboros_query::query_key;
//! use serde_json::json;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let cache = Arc::new(QueryCache::new(CacheConfig::default()));
//!
//! let observer = QueryObserver::new(
//!     &cache,
//!     query_key!["todos", {"page": 1}],
//!     QueryOptions::default().stale_time(Duration::from_secs(30)),
//! );
//!
//! let result = observer.refetch(|_key| async { Ok(json!(["write docs"])) }).await;
//! assert!(result.is_success());
//!
//! // Once detached, the query is evicted after its gc time
//! observer.detach();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod entry;
pub mod observer;
pub mod removable;
pub mod store;
pub mod subscribable;
pub mod types;


pub use config::{CacheConfig, CacheConfigBuilder, CacheHooks, QueryOptions, ResolvedOptions};
pub use entry::{Action, Query, QueryListener, QueryState};
pub use observer::{ObserverListener, QueryObserver, QueryObserverResult, ResultMeta};
pub use removable::{GcTimer, Removable, DEFAULT_GC_TIME};
pub use store::{NotifyEventType, QueryCache, QueryCacheListener, QueryCacheNotifyEvent};
pub use subscribable::{ListenerSet, NotifyOutcome, Subscribable, Unsubscribe};
pub use types::{hash_key, FetchStatus, QueryCacheStats, QueryHash, QueryKey, QueryStatus};
