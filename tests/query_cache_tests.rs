//! Integration tests for the query cache
//!
//! These tests verify the complete cache behaviour including:
//! - Store add/remove/get/find and event emission
//! - Observer attachment and eviction protection
//! - Timed eviction of unobserved queries
//! - Resolution hooks and fetch deduplication

use ouroboros_query::cache::{
    CacheConfig, CacheHooks, FetchStatus, NotifyEventType, Query, QueryCache, QueryCacheNotifyEvent, QueryKey,
    QueryObserver, QueryOptions, QueryState, QueryStatus, Removable, Subscribable, Unsubscribe,
};
use ouroboros_query::{query_key, CacheError};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("ouroboros_query=debug")),
        )
        .with_test_writer()
        .try_init();
}

fn new_cache() -> Arc<QueryCache> {
    init_tracing();
    Arc::new(QueryCache::new(CacheConfig::default()))
}

/// Collects `(event type, hash)` pairs published by a cache
struct EventLog {
    events: Arc<Mutex<Vec<(NotifyEventType, String)>>>,
    _handle: Unsubscribe,
}

impl EventLog {
    fn attach(cache: &Arc<QueryCache>) -> Self {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let handle = cache.subscribe(Arc::new(move |event: &QueryCacheNotifyEvent| {
            sink.lock()
                .unwrap()
                .push((event.event_type(), event.query().hash().to_string()));
        }));
        Self {
            events,
            _handle: handle,
        }
    }

    fn count(&self, event_type: NotifyEventType) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| *t == event_type)
            .count()
    }

    fn structural(&self) -> Vec<(NotifyEventType, String)> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| *t != NotifyEventType::Updated)
            .cloned()
            .collect()
    }
}

#[tokio::test]
async fn test_add_get_find_scenario() {
    let cache = new_cache();
    let log = EventLog::attach(&cache);
    let key = query_key!["h1"];
    let query = Query::new(&cache, key.clone());

    assert!(cache.add(Arc::clone(&query)));

    let hash = query.hash().to_string();
    assert_eq!(log.structural(), vec![(NotifyEventType::Added, hash.clone())]);
    assert!(Arc::ptr_eq(&cache.get(&hash).unwrap(), &query));
    assert!(Arc::ptr_eq(&cache.find(&key).unwrap(), &query));
}

#[tokio::test]
async fn test_adding_twice_keeps_one_entry() {
    let cache = new_cache();
    let log = EventLog::attach(&cache);
    let query = Query::new(&cache, query_key!["todos", {"page": 1}]);

    cache.add(Arc::clone(&query));
    cache.add(Arc::clone(&query));

    assert_eq!(cache.len(), 1);
    assert_eq!(log.count(NotifyEventType::Added), 1);
}

#[tokio::test]
async fn test_field_order_does_not_split_entries() {
    let cache = new_cache();
    let options = QueryOptions::default();

    let a = cache.build(query_key!["todos", {"status": "done", "page": 1}], &options);
    let b = cache.build(query_key!["todos", {"page": 1, "status": "done"}], &options);

    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(cache.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unobserved_query_is_evicted_after_gc_time() {
    let cache = new_cache();
    let log = EventLog::attach(&cache);
    let query = cache.build(query_key!["h1"], &QueryOptions::default().gc_time(Duration::from_millis(100)));
    let hash = query.hash().to_string();

    assert!(query.is_eviction_scheduled());

    tokio::time::sleep(Duration::from_millis(99)).await;
    assert!(cache.get(&hash).is_some());

    tokio::time::sleep(Duration::from_millis(2)).await;
    assert!(cache.get(&hash).is_none());
    assert!(query.is_destroyed());
    assert_eq!(
        log.structural(),
        vec![(NotifyEventType::Added, hash.clone()), (NotifyEventType::Removed, hash)]
    );
}

#[tokio::test(start_paused = true)]
async fn test_attaching_before_timer_fires_prevents_eviction() {
    let cache = new_cache();
    let query = cache.build(query_key!["h1"], &QueryOptions::default().gc_time(Duration::from_millis(100)));
    let hash = query.hash().to_string();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let observer = QueryObserver::new(&cache, query_key!["h1"], QueryOptions::default());
    assert!(Arc::ptr_eq(observer.query(), &query));

    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert!(cache.get(&hash).is_some());
    assert!(!query.is_destroyed());
}

#[tokio::test(start_paused = true)]
async fn test_n_subscribes_then_n_detaches() {
    let cache = new_cache();
    let query = cache.build(query_key!["shared"], &QueryOptions::default().gc_time(Duration::from_millis(100)));
    let hash = query.hash().to_string();

    let handles: Vec<_> = (0..5)
        .map(|_| query.subscribe(Arc::new(|_: &QueryState| {})))
        .collect();
    assert_eq!(query.observer_count(), 5);
    assert!(!query.is_eviction_scheduled());

    for (i, handle) in handles.iter().enumerate() {
        assert!(handle.unsubscribe());
        // Still observed until the last one leaves
        assert_eq!(query.is_eviction_scheduled(), i == 4);
    }
    assert!(!query.has_listeners());

    // Extra detaches are harmless
    assert!(!handles[0].unsubscribe());

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(cache.get(&hash).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_observer_detach_rearms_eviction() {
    let cache = new_cache();
    let options = QueryOptions::default().gc_time(Duration::from_millis(200));
    let observer = QueryObserver::new(&cache, query_key!["todos"], options);
    let hash = observer.query().hash().to_string();

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(cache.get(&hash).is_some());

    observer.detach();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(cache.get(&hash).is_some());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(cache.get(&hash).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_longest_gc_time_wins() {
    let cache = new_cache();
    let long = QueryOptions::default().gc_time(Duration::from_millis(1000));
    let short = QueryOptions::default().gc_time(Duration::from_millis(500));

    let query = cache.build(query_key!["todos"], &long);
    cache.build(query_key!["todos"], &short);
    assert_eq!(query.gc_timer().gc_time(), Duration::from_millis(1000));

    let hash = query.hash().to_string();
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(cache.get(&hash).is_some());

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(cache.get(&hash).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_fetching_query_outlives_gc_time() {
    let cache = new_cache();
    let log = EventLog::attach(&cache);
    let query = cache.build(query_key!["slow"], &QueryOptions::default().gc_time(Duration::from_millis(100)));
    let hash = query.hash().to_string();

    let fetch = {
        let query = Arc::clone(&query);
        tokio::spawn(async move {
            query
                .fetch(|_| async {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    Ok(json!("done"))
                })
                .await
        })
    };
    tokio::task::yield_now().await;
    assert_eq!(query.fetch_status(), FetchStatus::Fetching);

    // The gc timer fired at 100ms but the fetch was still running
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(cache.get(&hash).is_some());

    assert_eq!(fetch.await.unwrap(), Ok(json!("done")));
    assert!(query.is_eviction_scheduled());

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(cache.get(&hash).is_none());
    assert_eq!(log.count(NotifyEventType::Removed), 1);
}

async fn panicking_fetcher() -> ouroboros_query::Result<Value> {
    tokio::time::sleep(Duration::from_millis(10)).await;
    panic!("fetcher bug")
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_panicking_fetch_still_settles() {
    let cache = new_cache();
    let query = cache.build(query_key!["buggy"], &QueryOptions::default().gc_time(Duration::from_millis(100)));
    let hash = query.hash().to_string();

    // Nobody waits for the outcome
    let waited = tokio::time::timeout(Duration::from_millis(1), query.fetch(|_| panicking_fetcher())).await;
    assert!(waited.is_err());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(query.status(), QueryStatus::Error);
    assert_eq!(query.fetch_status(), FetchStatus::Idle);

    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert!(cache.get(&hash).is_none());
}

#[tokio::test]
async fn test_panicking_success_hook_does_not_fail_fetch() {
    init_tracing();
    let errors = Arc::new(AtomicUsize::new(0));
    let error_count = Arc::clone(&errors);
    let hooks = CacheHooks::default()
        .on_success(|_, _| panic!("hook bug"))
        .on_error(move |_, _| {
            error_count.fetch_add(1, Ordering::SeqCst);
        });
    let cache = Arc::new(QueryCache::with_hooks(CacheConfig::default(), hooks));
    let query = cache.build(query_key!["user", 1], &QueryOptions::default());

    let result = query.fetch(|_| async { Ok(json!(1)) }).await;

    assert_eq!(result, Ok(json!(1)));
    assert_eq!(query.status(), QueryStatus::Success);
    assert_eq!(query.data(), Some(json!(1)));
    assert_eq!(errors.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_clear_removes_everything_even_when_observed() {
    let cache = new_cache();
    let observers: Vec<_> = (0..4)
        .map(|i| QueryObserver::new(&cache, query_key!["item", i], QueryOptions::default()))
        .collect();
    let log = EventLog::attach(&cache);

    cache.clear();

    assert!(cache.get_all().is_empty());
    assert_eq!(log.count(NotifyEventType::Removed), 4);
    for observer in &observers {
        assert!(observer.query().is_destroyed());
    }
}

#[tokio::test]
async fn test_remove_ignores_replaced_query() {
    let cache = new_cache();
    let stale = cache.build(query_key!["todos"], &QueryOptions::default());
    cache.remove(&stale);

    let fresh = cache.build(query_key!["todos"], &QueryOptions::default());
    assert!(!Arc::ptr_eq(&stale, &fresh));

    assert!(!cache.remove(&stale));
    assert!(Arc::ptr_eq(&cache.get(fresh.hash().as_str()).unwrap(), &fresh));
}

#[tokio::test]
async fn test_updated_events_follow_state_changes() {
    let cache = new_cache();
    let actions = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&actions);
    let _handle = cache.subscribe(Arc::new(move |event: &QueryCacheNotifyEvent| {
        if let QueryCacheNotifyEvent::Updated { action, .. } = event {
            sink.lock().unwrap().push(action.name());
        }
    }));

    let query = cache.build(query_key!["user", 1], &QueryOptions::default());
    query.fetch(|_| async { Ok(json!({"id": 1})) }).await.unwrap();
    query.invalidate();

    assert_eq!(*actions.lock().unwrap(), vec!["fetch", "success", "invalidate"]);
}

#[tokio::test]
async fn test_concurrent_fetches_share_one_call() {
    let cache = new_cache();
    let query = cache.build(query_key!["expensive"], &QueryOptions::default());
    let calls = Arc::new(AtomicUsize::new(0));

    let fetches = (0..8).map(|_| {
        let calls = Arc::clone(&calls);
        query.fetch(move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                tokio::task::yield_now().await;
                Ok(json!(42))
            }
        })
    });
    let results = futures::future::join_all(fetches).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(results.iter().all(|r| r.as_ref().ok() == Some(&json!(42))));
}

#[tokio::test]
async fn test_hooks_see_every_resolution() {
    init_tracing();
    let successes = Arc::new(AtomicUsize::new(0));
    let errors = Arc::new(Mutex::new(Vec::new()));

    let success_count = Arc::clone(&successes);
    let error_log = Arc::clone(&errors);
    let hooks = CacheHooks::default()
        .on_success(move |_, _| {
            success_count.fetch_add(1, Ordering::SeqCst);
        })
        .on_error(move |error, query| {
            error_log
                .lock()
                .unwrap()
                .push((query.hash().to_string(), error.to_string()));
        });
    let cache = Arc::new(QueryCache::with_hooks(CacheConfig::default(), hooks));

    let ok = cache.build(query_key!["ok"], &QueryOptions::default());
    let failing = cache.build(query_key!["failing"], &QueryOptions::default());

    ok.fetch(|_| async { Ok(json!(true)) }).await.unwrap();
    let _ = failing
        .fetch(|_| async { Err(CacheError::FetchError("timeout".to_string())) })
        .await;

    assert_eq!(successes.load(Ordering::SeqCst), 1);
    assert_eq!(
        *errors.lock().unwrap(),
        vec![(r#"["failing"]"#.to_string(), "Fetch error: timeout".to_string())]
    );
}

#[tokio::test]
async fn test_failing_listener_does_not_block_others() {
    let cache = new_cache();
    let _bad = cache.subscribe(Arc::new(|_: &QueryCacheNotifyEvent| panic!("bad listener")));
    let log = EventLog::attach(&cache);

    cache.build(query_key!["todos"], &QueryOptions::default());

    assert_eq!(log.count(NotifyEventType::Added), 1);
    assert_eq!(cache.stats().listener_failures, 1);
}

#[tokio::test]
async fn test_serializable_keys() -> anyhow::Result<()> {
    #[derive(serde::Serialize)]
    struct Filter {
        status: &'static str,
        page: u32,
    }

    let cache = new_cache();
    let query = cache.build_from(&("todos", Filter { status: "open", page: 2 }), &QueryOptions::default())?;

    let same = QueryKey::new(vec![json!("todos"), json!({"page": 2, "status": "open"})]);
    assert!(Arc::ptr_eq(&cache.find(&same).unwrap(), &query));
    Ok(())
}
