//! Cache entry: one query's state, listeners and gc timer
//!
//! A [`Query`] is created by the [`QueryCache`] on first reference to a key
//! and is owned by it until removal. Observers attach through
//! [`Subscribable::subscribe`]; the first listener cancels any pending
//! eviction and the last one to leave arms it again.

use crate::cache::removable::{GcTimer, Removable};
use crate::cache::store::{QueryCache, QueryCacheNotifyEvent};
use crate::cache::subscribable::{panic_message, ListenerSet, Subscribable};
use crate::cache::types::{FetchStatus, QueryHash, QueryKey, QueryStatus};
use crate::error::{CacheError, Result};
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, error, warn};

/// Listener attached to a single query
pub type QueryListener = dyn Fn(&QueryState) + Send + Sync;

/// Snapshot of a query's resolution state
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryState {
    /// Last successfully resolved data
    pub data: Option<Value>,

    /// Error of the last failed resolution
    pub error: Option<CacheError>,

    pub status: QueryStatus,
    pub fetch_status: FetchStatus,

    /// When `data` was last set
    pub data_updated_at: Option<DateTime<Utc>>,

    /// When `error` was last set
    pub error_updated_at: Option<DateTime<Utc>>,

    pub data_update_count: u64,
    pub error_update_count: u64,

    /// Consecutive failed fetches; reset on success
    pub fetch_failure_count: u32,

    /// Set by [`Query::invalidate`]; forces staleness until the next success
    pub is_invalidated: bool,
}

impl QueryState {
    /// Apply one action to the state
    pub fn apply(&mut self, action: &Action) {
        match action {
            Action::Fetch => {
                self.fetch_status = FetchStatus::Fetching;
            }
            Action::Pause => {
                self.fetch_status = FetchStatus::Paused;
            }
            Action::Continue => {
                self.fetch_status = FetchStatus::Fetching;
            }
            Action::Success { data } => {
                self.data = Some(data.clone());
                self.data_updated_at = Some(Utc::now());
                self.data_update_count += 1;
                self.error = None;
                self.status = QueryStatus::Success;
                self.fetch_status = FetchStatus::Idle;
                self.fetch_failure_count = 0;
                self.is_invalidated = false;
            }
            Action::Error { error } => {
                self.error = Some(error.clone());
                self.error_updated_at = Some(Utc::now());
                self.error_update_count += 1;
                self.fetch_failure_count += 1;
                self.status = QueryStatus::Error;
                self.fetch_status = FetchStatus::Idle;
            }
            Action::Invalidate => {
                self.is_invalidated = true;
            }
            Action::SetState(state) => {
                *self = state.clone();
            }
        }
    }

    /// Check whether data is missing, invalidated or older than `stale_time`
    pub fn is_stale_by_time(&self, stale_time: Duration) -> bool {
        if self.is_invalidated {
            return true;
        }

        match (&self.data, self.data_updated_at) {
            (Some(_), Some(updated_at)) => {
                let age = (Utc::now() - updated_at).to_std().unwrap_or(Duration::ZERO);
                age >= stale_time
            }
            _ => true,
        }
    }
}

/// State transition applied by [`Query::dispatch`]
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// A fetch started
    Fetch,

    /// The running fetch waits on an external condition
    Pause,

    /// A paused fetch resumed
    Continue,

    /// A fetch resolved with data
    Success { data: Value },

    /// A fetch failed
    Error { error: CacheError },

    /// Mark the data stale regardless of its age
    Invalidate,

    /// Replace the whole state
    SetState(QueryState),
}

impl Action {
    /// Short action name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Action::Fetch => "fetch",
            Action::Pause => "pause",
            Action::Continue => "continue",
            Action::Success { .. } => "success",
            Action::Error { .. } => "error",
            Action::Invalidate => "invalidate",
            Action::SetState(_) => "set_state",
        }
    }
}

struct InFlight {
    id: u64,
    result: Shared<BoxFuture<'static, Result<Value>>>,
    abort: AbortHandle,
}

/// One cached query
pub struct Query {
    hash: QueryHash,
    key: QueryKey,
    state: RwLock<QueryState>,
    listeners: ListenerSet<QueryListener>,
    gc: GcTimer,
    cache: Weak<QueryCache>,
    in_flight: Mutex<Option<InFlight>>,
    fetch_seq: AtomicU64,
}

impl Query {
    /// Create a query for `key` owned by `cache`
    ///
    /// The query is not added to the cache and no eviction is scheduled;
    /// [`QueryCache::build`] does both.
    pub fn new(cache: &Arc<QueryCache>, key: QueryKey) -> Arc<Self> {
        Arc::new(Self {
            hash: key.hash(),
            key,
            state: RwLock::new(QueryState::default()),
            listeners: ListenerSet::new(),
            gc: GcTimer::new(),
            cache: Arc::downgrade(cache),
            in_flight: Mutex::new(None),
            fetch_seq: AtomicU64::new(0),
        })
    }

    pub fn hash(&self) -> &QueryHash {
        &self.hash
    }

    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// Copy of the current state
    pub fn state(&self) -> QueryState {
        self.state.read().clone()
    }

    pub fn status(&self) -> QueryStatus {
        self.state.read().status
    }

    pub fn fetch_status(&self) -> FetchStatus {
        self.state.read().fetch_status
    }

    pub fn data(&self) -> Option<Value> {
        self.state.read().data.clone()
    }

    pub fn error(&self) -> Option<CacheError> {
        self.state.read().error.clone()
    }

    /// Decode the cached data into `T`
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        match self.data() {
            Some(data) => Ok(Some(serde_json::from_value(data)?)),
            None => Ok(None),
        }
    }

    /// Number of attached observers
    pub fn observer_count(&self) -> usize {
        self.listeners.len()
    }

    /// Check whether anyone observes this query
    pub fn is_active(&self) -> bool {
        self.has_listeners()
    }

    pub fn is_stale_by_time(&self, stale_time: Duration) -> bool {
        self.state.read().is_stale_by_time(stale_time)
    }

    /// Check whether `destroy` was called
    pub fn is_destroyed(&self) -> bool {
        self.gc.is_destroyed()
    }

    /// Apply `action`, notify this query's listeners, then publish `updated`
    /// on the owning cache while the query is still stored there
    pub fn dispatch(self: &Arc<Self>, action: Action) {
        let state = {
            let mut state = self.state.write();
            state.apply(&action);
            state.clone()
        };
        debug!(query = %self.hash, action = action.name(), status = %state.status, "Query state updated");

        self.listeners.broadcast(|listener| listener(&state));

        if let Some(cache) = self.cache.upgrade() {
            if cache.contains(self) {
                cache.notify(QueryCacheNotifyEvent::Updated {
                    query: Arc::clone(self),
                    action,
                });
            }
        }
    }

    /// Store data as if a fetch had resolved with it
    pub fn set_data(self: &Arc<Self>, data: Value) {
        self.dispatch(Action::Success { data });
    }

    /// Mark the data stale
    pub fn invalidate(self: &Arc<Self>) {
        self.dispatch(Action::Invalidate);
    }

    /// Return to the initial pending state
    pub fn reset(self: &Arc<Self>) {
        self.dispatch(Action::SetState(QueryState::default()));
    }

    /// Resolve the query with `fetcher`, sharing any fetch already in flight
    ///
    /// Concurrent callers receive the same result. The fetch runs on its own
    /// task, so it completes even if every caller stops waiting; only
    /// [`Query::destroy`] aborts it.
    pub async fn fetch<F, Fut>(self: &Arc<Self>, fetcher: F) -> Result<Value>
    where
        F: FnOnce(QueryKey) -> Fut,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        if self.is_destroyed() {
            return Err(CacheError::Cancelled(self.hash.to_string()));
        }

        if let Some(current) = self.in_flight_result() {
            debug!(query = %self.hash, "Joining in-flight fetch");
            return current.await;
        }

        // The fetcher runs without any lock held; if another caller started a
        // fetch meanwhile, this future is dropped unpolled and theirs is joined.
        let future = fetcher(self.key.clone());
        let (result, start) = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.as_ref() {
                Some(current) => (current.result.clone(), None),
                None => {
                    let (started, start) = self.start_fetch(future);
                    let result = started.result.clone();
                    *in_flight = Some(started);
                    (result, Some(start))
                }
            }
        };

        // The task waits for this signal, so `Fetching` is always recorded
        // before the outcome.
        if let Some(start) = start {
            self.dispatch(Action::Fetch);
            start.send(()).ok();
        }

        result.await
    }

    fn in_flight_result(&self) -> Option<Shared<BoxFuture<'static, Result<Value>>>> {
        self.in_flight.lock().as_ref().map(|current| current.result.clone())
    }

    fn start_fetch<Fut>(self: &Arc<Self>, future: Fut) -> (InFlight, oneshot::Sender<()>)
    where
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let id = self.fetch_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let query = Arc::clone(self);
        let (start, started) = oneshot::channel();

        let task = tokio::spawn(async move {
            started.await.ok();
            let result = match AssertUnwindSafe(future).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => {
                    let message = panic_message(&*payload);
                    error!(query = %query.hash, "Fetcher panicked: {}", message);
                    Err(CacheError::FetchError(format!("fetcher panicked: {message}")))
                }
            };
            query.complete_fetch(id, &result);
            result
        });
        let abort = task.abort_handle();

        let query = Arc::downgrade(self);
        let hash = self.hash.clone();
        let result = async move {
            match task.await {
                Ok(result) => result,
                Err(join_error) if join_error.is_cancelled() => Err(CacheError::Cancelled(hash.to_string())),
                Err(join_error) => {
                    // Completion itself failed; the state keeps whatever was
                    // already dispatched.
                    if let Some(query) = query.upgrade() {
                        query.release_in_flight(id);
                    }
                    Err(CacheError::FetchError(format!("fetch task panicked: {join_error}")))
                }
            }
        }
        .boxed()
        .shared();

        (InFlight { id, result, abort }, start)
    }

    fn complete_fetch(self: &Arc<Self>, id: u64, result: &Result<Value>) {
        match result {
            Ok(data) => self.dispatch(Action::Success { data: data.clone() }),
            Err(error) => self.dispatch(Action::Error { error: error.clone() }),
        }

        self.release_in_flight(id);

        if let Some(cache) = self.cache.upgrade() {
            cache.fetch_resolved(self, result);
        }

        // Eviction was skipped while fetching
        if !self.has_listeners() {
            self.schedule_eviction();
        }
    }

    fn release_in_flight(&self, id: u64) {
        let mut in_flight = self.in_flight.lock();
        if in_flight.as_ref().map_or(false, |current| current.id == id) {
            *in_flight = None;
        }
    }

    /// Release everything this query holds; terminal
    ///
    /// Cancels the gc timer, aborts an in-flight fetch and drops all listeners.
    pub fn destroy(&self) {
        self.gc.destroy();

        if let Some(in_flight) = self.in_flight.lock().take() {
            warn!(query = %self.hash, "Aborting in-flight fetch of destroyed query");
            in_flight.abort.abort();
        }

        let dropped = self.listeners.clear();
        debug!(query = %self.hash, listeners = dropped, "Query destroyed");
    }
}

impl Subscribable for Query {
    type Listener = QueryListener;

    fn listeners(&self) -> &ListenerSet<QueryListener> {
        &self.listeners
    }

    fn on_subscribe(self: &Arc<Self>) {
        self.cancel_eviction();
    }

    fn on_unsubscribe(self: &Arc<Self>) {
        if !self.has_listeners() {
            self.schedule_eviction();
        }
    }
}

impl Removable for Query {
    fn gc_timer(&self) -> &GcTimer {
        &self.gc
    }

    fn attempt_eviction(self: &Arc<Self>) {
        if self.has_listeners() || self.fetch_status() != FetchStatus::Idle {
            debug!(query = %self.hash, "Skipping eviction of active query");
            return;
        }

        if let Some(cache) = self.cache.upgrade() {
            cache.evict(self);
        }
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("Query")
            .field("hash", &self.hash)
            .field("status", &state.status)
            .field("fetch_status", &state.fetch_status)
            .field("observers", &self.listeners.len())
            .field("gc_time", &self.gc.gc_time())
            .finish()
    }
}
