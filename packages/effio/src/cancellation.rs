//! Cooperative cancellation: handles and the per-fiber cancellation tree.
//!
//! Anything exposing a single `cancel` operation can be registered: a child
//! fiber, a scheduled job, an in-flight async registration, a memoized
//! subscription. Cancelling the list cancels every currently-registered
//! handle in registration order; entries added and removed dynamically as
//! sub-work starts and finishes.

use std::sync::{Arc, Mutex};

use crate::ids::CancelToken;

/// A handle whose only operation is to request cancellation.
///
/// `cancel` must be idempotent and safe to call from any thread.
pub trait Cancellable: Send + Sync {
    fn cancel(&self);
}

struct NoopCancel;

impl Cancellable for NoopCancel {
    fn cancel(&self) {}
}

/// A cancel handle that does nothing. For async registrations with no
/// underlying operation to abort.
pub fn noop() -> Arc<dyn Cancellable> {
    Arc::new(NoopCancel)
}

struct ListInner {
    cancelled: bool,
    slots: Vec<Option<Arc<dyn Cancellable>>>,
}

/// The cancellation tree node owned by one fiber.
///
/// Tolerates concurrent push/remove from the interpreter loop and externally
/// triggered cancellation. `cancel` fires each entry at most once; a
/// `remove` that loses the race with `cancel` is a no-op.
pub struct CancellationList {
    inner: Mutex<ListInner>,
}

impl CancellationList {
    pub fn new() -> Self {
        CancellationList {
            inner: Mutex::new(ListInner {
                cancelled: false,
                slots: Vec::new(),
            }),
        }
    }

    /// Register a handle. If the list has already been cancelled the handle
    /// is cancelled immediately and a dead token is returned.
    pub fn push(&self, handle: Arc<dyn Cancellable>) -> CancelToken {
        let token = {
            let mut inner = self.inner.lock().expect("cancellation lock poisoned");
            if inner.cancelled {
                None
            } else {
                inner.slots.push(Some(handle.clone()));
                Some(CancelToken::from_index(inner.slots.len() - 1))
            }
        };
        match token {
            Some(token) => token,
            None => {
                handle.cancel();
                CancelToken::DEAD
            }
        }
    }

    /// Deregister a handle without cancelling it. O(1); no-op for dead or
    /// already-removed tokens.
    pub fn remove(&self, token: CancelToken) -> Option<Arc<dyn Cancellable>> {
        if token.is_dead() {
            return None;
        }
        let mut inner = self.inner.lock().expect("cancellation lock poisoned");
        inner.slots.get_mut(token.index()).and_then(Option::take)
    }

    /// Cancel every currently-registered handle, in registration order.
    ///
    /// Entries are drained under the lock and cancelled outside it: a
    /// cancelled child deregistering from this same list mid-cancel must not
    /// deadlock. Handles registered afterwards cancel immediately.
    pub fn cancel(&self) {
        let drained = {
            let mut inner = self.inner.lock().expect("cancellation lock poisoned");
            inner.cancelled = true;
            std::mem::take(&mut inner.slots)
        };
        for handle in drained.into_iter().flatten() {
            handle.cancel();
        }
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock().expect("cancellation lock poisoned");
        inner.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner
            .lock()
            .expect("cancellation lock poisoned")
            .cancelled
    }
}

impl Default for CancellationList {
    fn default() -> Self {
        Self::new()
    }
}

enum GateState {
    /// Registration in progress; no underlying handle yet.
    Empty,
    /// Underlying handle available.
    Armed(Arc<dyn Cancellable>),
    /// Cancelled (possibly before the handle arrived).
    Cancelled,
}

/// Late-bound cancel handle for an in-flight `Async` registration.
///
/// The interpreter registers the gate in the cancellation list *before*
/// invoking the user's registration function, then arms it with the handle
/// the function returns. If cancellation arrives in the window between the
/// two, arming cancels the underlying handle on the spot.
pub struct AsyncRegistration {
    state: Mutex<GateState>,
}

impl AsyncRegistration {
    pub fn new() -> Self {
        AsyncRegistration {
            state: Mutex::new(GateState::Empty),
        }
    }

    /// Attach the underlying operation's cancel handle.
    pub fn arm(&self, handle: Arc<dyn Cancellable>) {
        let cancel_now = {
            let mut state = self.state.lock().expect("registration lock poisoned");
            match &*state {
                GateState::Cancelled => true,
                _ => {
                    *state = GateState::Armed(handle.clone());
                    false
                }
            }
        };
        if cancel_now {
            handle.cancel();
        }
    }
}

impl Default for AsyncRegistration {
    fn default() -> Self {
        Self::new()
    }
}

impl Cancellable for AsyncRegistration {
    fn cancel(&self) {
        let armed = {
            let mut state = self.state.lock().expect("registration lock poisoned");
            match std::mem::replace(&mut *state, GateState::Cancelled) {
                GateState::Armed(handle) => Some(handle),
                _ => None,
            }
        };
        if let Some(handle) = armed {
            handle.cancel();
        }
    }
}
