//! Query cache store: hash → query map with structural change notifications

use crate::cache::{
    config::{CacheConfig, CacheHooks, QueryOptions},
    entry::{Action, Query},
    removable::Removable,
    subscribable::{panic_message, ListenerSet, NotifyOutcome, Subscribable},
    types::{QueryCacheStats, QueryHash, QueryKey},
};
use crate::error::Result;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Kind of structural change published by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyEventType {
    Added,
    Removed,
    Updated,
}

impl fmt::Display for NotifyEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotifyEventType::Added => write!(f, "added"),
            NotifyEventType::Removed => write!(f, "removed"),
            NotifyEventType::Updated => write!(f, "updated"),
        }
    }
}

/// Event delivered to store listeners
#[derive(Debug, Clone)]
pub enum QueryCacheNotifyEvent {
    /// A query was inserted
    Added { query: Arc<Query> },

    /// A query was removed (explicitly, by `clear` or by eviction)
    Removed { query: Arc<Query> },

    /// A stored query's state changed
    Updated { query: Arc<Query>, action: Action },
}

impl QueryCacheNotifyEvent {
    pub fn event_type(&self) -> NotifyEventType {
        match self {
            QueryCacheNotifyEvent::Added { .. } => NotifyEventType::Added,
            QueryCacheNotifyEvent::Removed { .. } => NotifyEventType::Removed,
            QueryCacheNotifyEvent::Updated { .. } => NotifyEventType::Updated,
        }
    }

    /// The query the event is about
    pub fn query(&self) -> &Arc<Query> {
        match self {
            QueryCacheNotifyEvent::Added { query }
            | QueryCacheNotifyEvent::Removed { query }
            | QueryCacheNotifyEvent::Updated { query, .. } => query,
        }
    }
}

/// Listener attached to the store
pub type QueryCacheListener = dyn Fn(&QueryCacheNotifyEvent) + Send + Sync;

/// Keyed collection of queries
///
/// This implementation provides:
/// - At most one query per hash
/// - Synchronous, non-suspending add/remove/get/find
/// - `added`/`removed`/`updated` events delivered in listener registration order
/// - Eviction of unobserved queries once their gc time elapses
///
/// Methods that hand out new queries or attach timers take `self: &Arc<Self>`
/// because queries keep a weak reference back to their cache.
pub struct QueryCache {
    config: CacheConfig,
    hooks: CacheHooks,
    store: RwLock<QueryStore>,
    listeners: ListenerSet<QueryCacheListener>,
}

/// Internal storage
#[derive(Default)]
struct QueryStore {
    /// Main storage: hash -> query
    queries: HashMap<QueryHash, Arc<Query>>,

    /// Insertion order, used by `get_all` and `find`
    order: Vec<QueryHash>,

    stats: QueryCacheStats,

    /// Mirrors `CacheConfig::enable_metrics`
    metrics: bool,
}

impl QueryStore {
    fn new(metrics: bool) -> Self {
        Self {
            metrics,
            ..Default::default()
        }
    }

    fn insert(&mut self, query: Arc<Query>) {
        self.order.push(query.hash().clone());
        self.queries.insert(query.hash().clone(), query);
        if self.metrics {
            self.stats.added += 1;
        }
    }

    fn remove_if_same(&mut self, query: &Arc<Query>) -> bool {
        match self.queries.get(query.hash()) {
            Some(stored) if Arc::ptr_eq(stored, query) => {
                self.queries.remove(query.hash());
                self.order.retain(|hash| hash != query.hash());
                if self.metrics {
                    self.stats.removed += 1;
                }
                true
            }
            _ => false,
        }
    }

    fn ordered(&self) -> impl Iterator<Item = &Arc<Query>> + '_ {
        self.order.iter().filter_map(|hash| self.queries.get(hash))
    }
}

impl QueryCache {
    /// Create an empty cache
    pub fn new(config: CacheConfig) -> Self {
        Self::with_hooks(config, CacheHooks::default())
    }

    /// Create an empty cache with resolution callbacks
    pub fn with_hooks(config: CacheConfig, hooks: CacheHooks) -> Self {
        info!("Initializing query cache with config: {:?}", config);
        let store = QueryStore::new(config.enable_metrics);

        Self {
            config,
            hooks,
            store: RwLock::new(store),
            listeners: ListenerSet::new(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Get the query for `key`, creating and adding it if absent
    ///
    /// Either way the query's gc time is raised to the options' gc time (or
    /// the configured default). A newly created query is unobserved, so its
    /// eviction is scheduled right away.
    pub fn build(self: &Arc<Self>, key: QueryKey, options: &QueryOptions) -> Arc<Query> {
        let gc_time = self.config.resolve(options).gc_time;
        let hash = key.hash();

        let (query, created) = {
            let mut store = self.store.write();
            match store.queries.get(&hash) {
                Some(existing) => (Arc::clone(existing), false),
                None => {
                    let query = Query::new(self, key);
                    store.insert(Arc::clone(&query));
                    (query, true)
                }
            }
        };

        query.raise_gc_time(Some(gc_time));

        if created {
            debug!(query = %hash, "Built new query");
            self.notify(QueryCacheNotifyEvent::Added {
                query: Arc::clone(&query),
            });
            if !query.has_listeners() {
                query.schedule_eviction();
            }
        }

        query
    }

    /// Like [`QueryCache::build`], for any serializable key
    pub fn build_from<K: Serialize + ?Sized>(
        self: &Arc<Self>,
        key: &K,
        options: &QueryOptions,
    ) -> Result<Arc<Query>> {
        Ok(self.build(QueryKey::from_serialize(key)?, options))
    }

    /// Insert `query` if no query with its hash is stored
    ///
    /// Returns `false` (and emits nothing) when the hash is already present,
    /// whether by this very query or another one.
    pub fn add(&self, query: Arc<Query>) -> bool {
        let inserted = {
            let mut store = self.store.write();
            if store.queries.contains_key(query.hash()) {
                false
            } else {
                store.insert(Arc::clone(&query));
                true
            }
        };

        if inserted {
            debug!(query = %query.hash(), "Added query");
            self.notify(QueryCacheNotifyEvent::Added { query });
        }

        inserted
    }

    /// Remove `query` if it is the one stored under its hash
    ///
    /// The removed query is destroyed. A different query stored under the
    /// same hash, or no query at all, makes this a no-op.
    pub fn remove(&self, query: &Arc<Query>) -> bool {
        let removed = self.store.write().remove_if_same(query);

        if removed {
            query.destroy();
            debug!(query = %query.hash(), "Removed query");
            self.notify(QueryCacheNotifyEvent::Removed {
                query: Arc::clone(query),
            });
        }

        removed
    }

    /// Remove a query whose gc timer expired
    pub(crate) fn evict(&self, query: &Arc<Query>) -> bool {
        let evicted = self.remove(query);
        if evicted {
            self.record(|stats| stats.evicted += 1);
            debug!(query = %query.hash(), "Evicted inactive query");
        }
        evicted
    }

    /// Remove every query, observed or not, emitting one `removed` each
    pub fn clear(&self) {
        let queries = self.get_all();
        let count = queries.len();

        for query in &queries {
            self.remove(query);
        }

        info!("Cleared {} queries from cache", count);
    }

    /// Look up a query by hash
    pub fn get(&self, hash: &str) -> Option<Arc<Query>> {
        let found = self.store.read().queries.get(hash).cloned();
        self.record_lookup(found.is_some());
        found
    }

    /// All stored queries in insertion order
    pub fn get_all(&self) -> Vec<Arc<Query>> {
        self.store.read().ordered().cloned().collect()
    }

    /// First stored query whose key canonically equals `key`
    pub fn find(&self, key: &QueryKey) -> Option<Arc<Query>> {
        let hash = key.hash();
        let found = self
            .store
            .read()
            .ordered()
            .find(|query| *query.hash() == hash)
            .cloned();
        self.record_lookup(found.is_some());
        found
    }

    /// All stored queries matching `predicate`, in insertion order
    pub fn find_all(&self, predicate: impl Fn(&Query) -> bool) -> Vec<Arc<Query>> {
        self.get_all()
            .into_iter()
            .filter(|query| predicate(query))
            .collect()
    }

    /// Check whether `query` itself (not just its hash) is stored
    pub fn contains(&self, query: &Arc<Query>) -> bool {
        self.store
            .read()
            .queries
            .get(query.hash())
            .map_or(false, |stored| Arc::ptr_eq(stored, query))
    }

    /// Number of stored queries
    pub fn len(&self) -> usize {
        self.store.read().queries.len()
    }

    /// Check if the cache is empty
    pub fn is_empty(&self) -> bool {
        self.store.read().queries.is_empty()
    }

    /// Deliver `event` to every store listener, synchronously
    ///
    /// A panicking listener does not stop delivery; failures are logged and
    /// counted in the returned outcome and in the stats.
    pub fn notify(&self, event: QueryCacheNotifyEvent) -> NotifyOutcome {
        let outcome = self.listeners.broadcast(|listener| listener(&event));

        let updated = event.event_type() == NotifyEventType::Updated;
        if updated || outcome.failed > 0 {
            self.record(|stats| {
                if updated {
                    stats.updated += 1;
                }
                stats.listener_failures += outcome.failed as u64;
            });
        }

        outcome
    }

    /// Get cache statistics
    pub fn stats(&self) -> QueryCacheStats {
        let store = self.store.read();
        let mut stats = store.stats.clone();
        stats.queries = store.queries.len();
        stats
    }

    /// Run the resolution hooks for a finished fetch
    ///
    /// A panicking hook is logged and counted like a failed listener; the
    /// query keeps the state it was resolved to.
    pub(crate) fn fetch_resolved(&self, query: &Query, result: &Result<Value>) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| match result {
            Ok(data) => {
                if let Some(on_success) = &self.hooks.on_success {
                    on_success(data, query);
                }
            }
            Err(error) => {
                if let Some(on_error) = &self.hooks.on_error {
                    on_error(error, query);
                }
            }
        }));

        if let Err(payload) = outcome {
            error!(query = %query.hash(), "Cache hook panicked: {}", panic_message(&*payload));
            self.record(|stats| stats.listener_failures += 1);
        }
    }

    fn record_lookup(&self, hit: bool) {
        self.record(|stats| {
            if hit {
                stats.hits += 1;
            } else {
                stats.misses += 1;
            }
        });
    }

    /// Update the counters, only when metrics are enabled
    fn record(&self, update: impl FnOnce(&mut QueryCacheStats)) {
        if self.config.enable_metrics {
            update(&mut self.store.write().stats);
        }
    }
}

impl Subscribable for QueryCache {
    type Listener = QueryCacheListener;

    fn listeners(&self) -> &ListenerSet<QueryCacheListener> {
        &self.listeners
    }
}

impl fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryCache")
            .field("config", &self.config)
            .field("queries", &self.len())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}
