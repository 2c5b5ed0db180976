//! Core identifier types for the engine.
//!
//! All IDs are lightweight Copy types using newtype pattern for type safety.

use std::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier for fibers.
///
/// Every interpreter run gets a fresh FiberId; ids are process-unique and
/// never reused.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct FiberId(pub u64);

/// Token returned by [`crate::cancellation::CancellationList::push`].
///
/// Tokens are slot indices into the owning list. A dead token (returned when
/// pushing onto an already-cancelled list) is ignored by `remove`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct CancelToken(pub u32);

/// Key for an entry in a fiber's observer list.
///
/// Keys are slot indices; removal by key is O(1) and stable across other
/// insertions/removals.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ObserverKey(pub u32);

// Global counter for ID generation
static FIBER_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

impl FiberId {
    /// Create a fresh unique FiberId.
    pub fn fresh() -> Self {
        FiberId(FIBER_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw value.
    pub fn raw(&self) -> u64 {
        self.0
    }

    pub fn from_raw(value: u64) -> Self {
        FiberId(value)
    }
}

impl std::fmt::Display for FiberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fiber-{}", self.0)
    }
}

impl CancelToken {
    /// Sentinel for a registration that was cancelled on arrival.
    pub const DEAD: CancelToken = CancelToken(u32::MAX);

    pub fn from_index(index: usize) -> Self {
        CancelToken(index as u32)
    }

    pub fn index(&self) -> usize {
        self.0 as usize
    }

    pub fn is_dead(&self) -> bool {
        *self == Self::DEAD
    }
}

impl ObserverKey {
    pub fn from_index(index: usize) -> Self {
        ObserverKey(index as u32)
    }

    pub fn index(&self) -> usize {
        self.0 as usize
    }
}
