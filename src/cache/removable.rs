//! Debounced, cancellable garbage-collection timer
//!
//! [`GcTimer`] is the state an evictable entity embeds; [`Removable`] is the
//! capability built on top of it. The entity supplies `attempt_eviction`, which
//! decides whether eviction actually proceeds when the timer fires.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Retention window used when nobody asks for a specific one
pub const DEFAULT_GC_TIME: Duration = Duration::from_secs(5 * 60);

/// Gc timer state: retention window plus at most one pending timer
///
/// Every arm or cancel bumps a generation counter. A timer only fires its
/// callback if the generation it was armed with is still current, so a timer
/// whose sleep already finished cannot evict after being superseded.
#[derive(Debug)]
pub struct GcTimer {
    gc_time: Mutex<Option<Duration>>,
    pending: Mutex<Option<JoinHandle<()>>>,
    generation: Arc<AtomicU64>,
    destroyed: AtomicBool,
}

impl Default for GcTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl GcTimer {
    /// Create an unarmed timer with no retention window set yet
    pub fn new() -> Self {
        Self {
            gc_time: Mutex::new(None),
            pending: Mutex::new(None),
            generation: Arc::new(AtomicU64::new(0)),
            destroyed: AtomicBool::new(false),
        }
    }

    /// Current retention window, [`DEFAULT_GC_TIME`] if never raised
    pub fn gc_time(&self) -> Duration {
        self.gc_time.lock().unwrap_or(DEFAULT_GC_TIME)
    }

    /// Raise the retention window to `max(current, candidate)`
    ///
    /// A missing candidate counts as [`DEFAULT_GC_TIME`]. The window never
    /// shrinks.
    pub fn raise(&self, candidate: Option<Duration>) -> Duration {
        let candidate = candidate.unwrap_or(DEFAULT_GC_TIME);
        let mut gc_time = self.gc_time.lock();
        let raised = gc_time.unwrap_or(Duration::ZERO).max(candidate);
        *gc_time = Some(raised);
        raised
    }

    /// Cancel any pending timer and arm a new one for `delay`
    ///
    /// Returns `false` without arming when the timer was destroyed or when no
    /// tokio runtime is available on this thread.
    pub fn arm(&self, delay: Duration, fire: impl FnOnce() + Send + 'static) -> bool {
        if self.is_destroyed() {
            return false;
        }

        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                warn!("Cannot arm gc timer outside a tokio runtime; entry will not be evicted");
                return false;
            }
        };

        let mut pending = self.pending.lock();
        if let Some(previous) = pending.take() {
            previous.abort();
        }

        let generation = Arc::clone(&self.generation);
        let armed = generation.fetch_add(1, Ordering::AcqRel) + 1;

        *pending = Some(runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if generation.load(Ordering::Acquire) == armed {
                fire();
            }
        }));

        true
    }

    /// Cancel the pending timer; returns `false` if none was pending
    pub fn cancel(&self) -> bool {
        let mut pending = self.pending.lock();
        self.generation.fetch_add(1, Ordering::AcqRel);
        match pending.take() {
            Some(handle) => {
                let was_pending = !handle.is_finished();
                handle.abort();
                was_pending
            }
            None => false,
        }
    }

    /// Check whether a timer is armed and has not fired yet
    pub fn is_pending(&self) -> bool {
        self.pending.lock()
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }

    /// Cancel the timer permanently; later `arm` calls are refused
    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::Release);
        self.cancel();
    }

    /// Check whether `destroy` was called
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }
}

impl Drop for GcTimer {
    fn drop(&mut self) {
        if let Some(handle) = self.pending.lock().take() {
            handle.abort();
        }
    }
}

/// An entity that can schedule its own eviction after a period of inactivity
pub trait Removable: Send + Sync + Sized + 'static {
    /// Embedded timer state
    fn gc_timer(&self) -> &GcTimer;

    /// Called when the gc timer fires; decides whether eviction proceeds
    fn attempt_eviction(self: &Arc<Self>);

    /// Cancel any pending timer and arm a new one for the current gc time
    ///
    /// The timer keeps only a weak reference to the entity.
    fn schedule_eviction(self: &Arc<Self>) -> bool {
        let delay = self.gc_timer().gc_time();
        let entity = Arc::downgrade(self);

        let armed = self.gc_timer().arm(delay, move || {
            if let Some(entity) = entity.upgrade() {
                entity.attempt_eviction();
            }
        });
        if armed {
            debug!("Scheduled eviction in {:?}", delay);
        }
        armed
    }

    /// Cancel the pending eviction, if any
    fn cancel_eviction(&self) -> bool {
        self.gc_timer().cancel()
    }

    /// Raise the gc time; see [`GcTimer::raise`]
    fn raise_gc_time(&self, candidate: Option<Duration>) -> Duration {
        self.gc_timer().raise(candidate)
    }

    /// Check whether an eviction timer is pending
    fn is_eviction_scheduled(&self) -> bool {
        self.gc_timer().is_pending()
    }
}
