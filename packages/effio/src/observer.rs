//! Ordered observer callbacks with O(1) removal.
//!
//! Each registration is logically a one-shot message send: callbacks are
//! consumed when the fiber reaches a terminal state. Removal by key supports
//! a caller losing interest (e.g. a timed-out join) without leaking the
//! callback. Notification drains a snapshot, so observers that re-register
//! or deregister while firing never mutate a structure mid-traversal.

use crate::exit::Exit;
use crate::ids::ObserverKey;

/// Callback invoked once with `Some(exit)` on completion or `None` on
/// cancellation. The exit passed is never `Pending`.
pub type ObserverFn = Box<dyn FnOnce(Option<Exit>) + Send>;

/// Insertion-ordered list of pending observers. Keys are slot indices;
/// removed slots stay vacant so keys remain stable.
pub struct ObserverList {
    slots: Vec<Option<ObserverFn>>,
    live: usize,
}

impl ObserverList {
    pub fn new() -> Self {
        ObserverList {
            slots: Vec::new(),
            live: 0,
        }
    }

    /// Append a callback; the returned key removes it in O(1).
    pub fn push(&mut self, callback: ObserverFn) -> ObserverKey {
        self.slots.push(Some(callback));
        self.live += 1;
        ObserverKey::from_index(self.slots.len() - 1)
    }

    /// Remove a callback by key. Returns false if it was already removed or
    /// consumed (a lost race with firing is a no-op, not an error).
    pub fn remove(&mut self, key: ObserverKey) -> bool {
        match self.slots.get_mut(key.index()).and_then(Option::take) {
            Some(_) => {
                self.live -= 1;
                true
            }
            None => false,
        }
    }

    /// Take every pending callback, in registration order, leaving the list
    /// empty.
    pub fn drain(&mut self) -> Vec<ObserverFn> {
        self.live = 0;
        std::mem::take(&mut self.slots).into_iter().flatten().collect()
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }
}

impl Default for ObserverList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_drain_preserves_registration_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut list = ObserverList::new();
        for i in 0..3 {
            let order = order.clone();
            list.push(Box::new(move |_| {
                order.lock().unwrap().push(i);
            }));
        }

        for cb in list.drain() {
            cb(None);
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
        assert!(list.is_empty());
    }

    #[test]
    fn test_removed_observer_not_drained() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut list = ObserverList::new();

        let f = fired.clone();
        let key = list.push(Box::new(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        }));
        let f = fired.clone();
        list.push(Box::new(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(list.remove(key));
        assert_eq!(list.len(), 1);
        for cb in list.drain() {
            cb(None);
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_after_drain_is_noop() {
        let mut list = ObserverList::new();
        let key = list.push(Box::new(|_| {}));
        let _ = list.drain();
        assert!(!list.remove(key));
    }
}
