//! Consumer-facing view of one query
//!
//! A [`QueryObserver`] attaches to the query for its key, counting as one
//! observer for eviction purposes, and turns every state change into a
//! [`QueryObserverResult`] computed against its own stale time.

use crate::cache::config::{QueryOptions, ResolvedOptions};
use crate::cache::entry::{Query, QueryState};
use crate::cache::store::QueryCache;
use crate::cache::subscribable::{ListenerSet, Subscribable, Unsubscribe};
use crate::cache::types::{FetchStatus, QueryKey, QueryStatus};
use crate::error::{CacheError, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Listener attached to an observer
pub type ObserverListener = dyn Fn(&QueryObserverResult) + Send + Sync;

/// Fields shared by every result variant
#[derive(Debug, Clone, PartialEq)]
pub struct ResultMeta {
    pub fetch_status: FetchStatus,
    pub data_updated_at: Option<DateTime<Utc>>,
    pub error_updated_at: Option<DateTime<Utc>>,
    pub failure_count: u32,

    /// Stale relative to the observer's stale time
    pub is_stale: bool,
}

/// What an observer sees of its query
#[derive(Debug, Clone, PartialEq)]
pub enum QueryObserverResult {
    /// Data is available and the last fetch succeeded
    Success { data: Value, meta: ResultMeta },

    /// Nothing resolved yet
    Loading { meta: ResultMeta },

    /// The first fetch failed; there is no data
    LoadingError { error: CacheError, meta: ResultMeta },

    /// A refetch failed; the previous data is kept
    RefetchError {
        data: Value,
        error: CacheError,
        meta: ResultMeta,
    },
}

impl QueryObserverResult {
    /// Derive the result for `state` as seen with `stale_time`
    pub fn from_state(state: &QueryState, stale_time: Duration) -> Self {
        let meta = ResultMeta {
            fetch_status: state.fetch_status,
            data_updated_at: state.data_updated_at,
            error_updated_at: state.error_updated_at,
            failure_count: state.fetch_failure_count,
            is_stale: state.is_stale_by_time(stale_time),
        };

        match (state.status, &state.data, &state.error) {
            (QueryStatus::Success, Some(data), _) => Self::Success {
                data: data.clone(),
                meta,
            },
            (QueryStatus::Error, Some(data), Some(error)) => Self::RefetchError {
                data: data.clone(),
                error: error.clone(),
                meta,
            },
            (QueryStatus::Error, None, Some(error)) => Self::LoadingError {
                error: error.clone(),
                meta,
            },
            _ => Self::Loading { meta },
        }
    }

    pub fn meta(&self) -> &ResultMeta {
        match self {
            Self::Success { meta, .. }
            | Self::Loading { meta }
            | Self::LoadingError { meta, .. }
            | Self::RefetchError { meta, .. } => meta,
        }
    }

    pub fn status(&self) -> QueryStatus {
        match self {
            Self::Success { .. } => QueryStatus::Success,
            Self::Loading { .. } => QueryStatus::Pending,
            Self::LoadingError { .. } | Self::RefetchError { .. } => QueryStatus::Error,
        }
    }

    pub fn fetch_status(&self) -> FetchStatus {
        self.meta().fetch_status
    }

    pub fn data(&self) -> Option<&Value> {
        match self {
            Self::Success { data, .. } | Self::RefetchError { data, .. } => Some(data),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&CacheError> {
        match self {
            Self::LoadingError { error, .. } | Self::RefetchError { error, .. } => Some(error),
            _ => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status() == QueryStatus::Pending
    }

    pub fn is_success(&self) -> bool {
        self.status() == QueryStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.status() == QueryStatus::Error
    }

    pub fn is_fetching(&self) -> bool {
        self.fetch_status() == FetchStatus::Fetching
    }

    pub fn is_paused(&self) -> bool {
        self.fetch_status() == FetchStatus::Paused
    }

    /// First fetch running
    pub fn is_loading(&self) -> bool {
        self.is_pending() && self.is_fetching()
    }

    /// Background fetch running while a result already exists
    pub fn is_refetching(&self) -> bool {
        self.is_fetching() && !self.is_pending()
    }

    pub fn is_loading_error(&self) -> bool {
        matches!(self, Self::LoadingError { .. })
    }

    pub fn is_refetch_error(&self) -> bool {
        matches!(self, Self::RefetchError { .. })
    }

    pub fn is_stale(&self) -> bool {
        self.meta().is_stale
    }
}

/// One consumer's attachment to a query
pub struct QueryObserver {
    query: Arc<Query>,
    options: ResolvedOptions,
    listeners: Arc<ListenerSet<ObserverListener>>,
    attachment: Unsubscribe,
}

impl QueryObserver {
    /// Build (or reuse) the query for `key` and attach to it
    pub fn new(cache: &Arc<QueryCache>, key: QueryKey, options: QueryOptions) -> Self {
        let resolved = cache.config().resolve(&options);
        let query = cache.build(key, &options);
        let listeners: Arc<ListenerSet<ObserverListener>> = Arc::new(ListenerSet::new());

        let forward = Arc::clone(&listeners);
        let stale_time = resolved.stale_time;
        let attachment = query.subscribe(Arc::new(move |state: &QueryState| {
            let result = QueryObserverResult::from_state(state, stale_time);
            forward.broadcast(|listener| listener(&result));
        }));

        debug!(query = %query.hash(), observers = query.observer_count(), "Observer attached");

        Self {
            query,
            options: resolved,
            listeners,
            attachment,
        }
    }

    /// The observed query
    pub fn query(&self) -> &Arc<Query> {
        &self.query
    }

    pub fn options(&self) -> &ResolvedOptions {
        &self.options
    }

    /// Current result
    pub fn result(&self) -> QueryObserverResult {
        QueryObserverResult::from_state(&self.query.state(), self.options.stale_time)
    }

    /// Receive a fresh result on every state change of the query
    pub fn subscribe(&self, listener: Arc<ObserverListener>) -> Unsubscribe {
        ListenerSet::register(&self.listeners, listener)
    }

    /// Fetch through the query unless this observer is disabled
    ///
    /// Fetch errors end up in the returned result rather than as `Err`.
    pub async fn refetch<F, Fut>(&self, fetcher: F) -> QueryObserverResult
    where
        F: FnOnce(QueryKey) -> Fut,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        if !self.options.enabled {
            debug!(query = %self.query.hash(), "Refetch skipped for disabled observer");
            return self.result();
        }

        if let Err(e) = self.query.fetch(fetcher).await {
            debug!(query = %self.query.hash(), "Refetch failed: {}", e);
        }
        self.result()
    }

    /// Check whether this observer is still attached
    pub fn is_attached(&self) -> bool {
        self.attachment.is_active()
    }

    /// Detach from the query; later calls do nothing
    pub fn detach(&self) -> bool {
        let detached = self.attachment.unsubscribe();
        if detached {
            self.listeners.clear();
            debug!(query = %self.query.hash(), "Observer detached");
        }
        detached
    }
}

impl Drop for QueryObserver {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for QueryObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryObserver")
            .field("query", &self.query.hash())
            .field("options", &self.options)
            .field("attached", &self.is_attached())
            .finish()
    }
}
