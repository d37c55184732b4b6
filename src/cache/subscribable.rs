//! Notification bus shared by the store and its queries
//!
//! A [`ListenerSet`] keeps listeners in registration order with set semantics
//! (the same `Arc` registered twice is stored once). Broadcasting iterates over
//! a snapshot taken when the broadcast starts, so listeners may subscribe or
//! unsubscribe from inside a callback:
//! - listeners added during a broadcast are not called for that broadcast
//! - listeners removed during a broadcast are not called afterwards
//! - a panicking listener is logged and skipped; delivery continues

use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use tracing::error;

/// Result of delivering one event to a listener set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotifyOutcome {
    /// Listeners that returned normally
    pub delivered: usize,

    /// Listeners that panicked
    pub failed: usize,
}

/// Ordered set of listeners of one type
pub struct ListenerSet<L: ?Sized> {
    listeners: Mutex<Vec<Arc<L>>>,
}

impl<L: ?Sized> Default for ListenerSet<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: ?Sized> ListenerSet<L> {
    /// Create an empty listener set
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Register a listener; returns `false` if it was already registered
    pub fn insert(&self, listener: Arc<L>) -> bool {
        let mut listeners = self.listeners.lock();
        if listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            return false;
        }
        listeners.push(listener);
        true
    }

    /// Remove a listener; returns `false` if it was not registered
    pub fn remove(&self, listener: &Arc<L>) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    /// Check whether a listener is registered
    pub fn contains(&self, listener: &Arc<L>) -> bool {
        self.listeners.lock().iter().any(|l| Arc::ptr_eq(l, listener))
    }

    /// Number of registered listeners
    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Check if no listener is registered
    pub fn is_empty(&self) -> bool {
        self.listeners.lock().is_empty()
    }

    /// Drop every listener, returning how many were registered
    pub fn clear(&self) -> usize {
        let mut listeners = self.listeners.lock();
        let count = listeners.len();
        listeners.clear();
        count
    }

    /// Point-in-time copy of the listeners in registration order
    pub fn snapshot(&self) -> Vec<Arc<L>> {
        self.listeners.lock().clone()
    }

    /// Call `deliver` for every listener registered when the broadcast starts
    pub fn broadcast(&self, mut deliver: impl FnMut(&L)) -> NotifyOutcome {
        let mut outcome = NotifyOutcome::default();

        for listener in self.snapshot() {
            if !self.contains(&listener) {
                continue;
            }

            match panic::catch_unwind(AssertUnwindSafe(|| deliver(&listener))) {
                Ok(()) => outcome.delivered += 1,
                Err(payload) => {
                    outcome.failed += 1;
                    error!("Listener panicked during broadcast: {}", panic_message(&*payload));
                }
            }
        }

        outcome
    }
}

impl<L: ?Sized + Send + Sync + 'static> ListenerSet<L> {
    /// Register a listener on a shared set and get its detach handle
    pub fn register(set: &Arc<Self>, listener: Arc<L>) -> Unsubscribe {
        set.insert(Arc::clone(&listener));
        let set: Weak<Self> = Arc::downgrade(set);
        Unsubscribe::new(move || {
            if let Some(set) = set.upgrade() {
                set.remove(&listener);
            }
        })
    }
}

impl<L: ?Sized> fmt::Debug for ListenerSet<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerSet")
            .field("listeners", &self.len())
            .finish()
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Handle returned by `subscribe`; detaches the listener when called
///
/// Only the first call has an effect. Dropping the handle leaves the listener
/// registered.
#[must_use = "the listener stays registered until `unsubscribe` is called"]
pub struct Unsubscribe {
    detach: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Unsubscribe {
    pub(crate) fn new(detach: impl FnOnce() + Send + 'static) -> Self {
        Self {
            detach: Mutex::new(Some(Box::new(detach))),
        }
    }

    /// Detach the listener; returns `false` if this handle was already used
    pub fn unsubscribe(&self) -> bool {
        let detach = self.detach.lock().take();
        match detach {
            Some(detach) => {
                detach();
                true
            }
            None => false,
        }
    }

    /// Check whether the handle can still detach its listener
    pub fn is_active(&self) -> bool {
        self.detach.lock().is_some()
    }
}

impl fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("active", &self.is_active())
            .finish()
    }
}

/// A publisher with a listener set and subscription hooks
///
/// Implementors supply the listener storage; the hooks let a publisher react
/// to listeners arriving or leaving (a query cancels or arms its gc timer).
pub trait Subscribable: Send + Sync + 'static {
    /// Listener type, usually `dyn Fn(&Event) + Send + Sync`
    type Listener: ?Sized + Send + Sync + 'static;

    /// Listener storage
    fn listeners(&self) -> &ListenerSet<Self::Listener>;

    /// Called after every `subscribe`
    fn on_subscribe(self: &Arc<Self>) {}

    /// Called after a listener is detached
    fn on_unsubscribe(self: &Arc<Self>) {}

    /// Register `listener` and return its detach handle
    ///
    /// Registering the same `Arc` twice is a no-op apart from the hook call.
    /// The handle holds a weak reference, so detaching after the publisher is
    /// gone does nothing.
    fn subscribe(self: &Arc<Self>, listener: Arc<Self::Listener>) -> Unsubscribe {
        self.listeners().insert(Arc::clone(&listener));
        self.on_subscribe();

        let owner: Weak<Self> = Arc::downgrade(self);
        Unsubscribe::new(move || {
            if let Some(owner) = owner.upgrade() {
                if owner.listeners().remove(&listener) {
                    owner.on_unsubscribe();
                }
            }
        })
    }

    /// Check if any listener is registered
    fn has_listeners(&self) -> bool {
        !self.listeners().is_empty()
    }
}
