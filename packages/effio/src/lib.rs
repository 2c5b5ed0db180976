//! effio: a stack-based effect execution engine.
//!
//! Evaluates declarative descriptions of asynchronous, possibly failing
//! computations without growing the native call stack.
//!
//! # Architecture
//!
//! - **Instruction trees**: effects compile to a closed tagged enum;
//!   matching is exhaustive at the dispatch site.
//! - **Trampoline**: an explicit instruction stack plus environment stack,
//!   owned by one fiber, evaluated iteratively in budgeted slices.
//! - **Fibers**: one interpreter run each, with a three-state lifecycle,
//!   observers, and a cancellation tree that propagates aborts through
//!   children and in-flight async registrations.
//! - **Scheduler boundary**: an injected capability; work is deferred, never
//!   run synchronously inside the scheduling call.
//! - **Once**: memoizes a multiply-subscribed effect into a single shared
//!   execution with reference-counted cancellation.

pub mod cancellation;
pub mod error;
mod eval;
pub mod exit;
pub mod fiber;
pub mod ids;
pub mod instruction;
pub mod observer;
pub mod once;
pub mod runtime;
pub mod scheduler;
pub mod value;

// Re-exports for convenience
pub use cancellation::{noop, AsyncRegistration, Cancellable, CancellationList};
pub use error::Fault;
pub use exit::Exit;
pub use fiber::{Fiber, FiberStatus, Resumer};
pub use ids::{CancelToken, FiberId, ObserverKey};
pub use instruction::{
    AccessFn, CallFn, Instruction, InstructionFn, RegisterFn, ValueFn,
};
pub use observer::{ObserverFn, ObserverList};
pub use once::{Once, OnceCallback};
pub use runtime::{
    default_runtime, test_runtime, Runtime, TestRuntime, DEFAULT_INSTRUCTION_BUDGET,
};
pub use scheduler::{Job, JobHandle, Scheduler, TestScheduler, ThreadScheduler};
pub use value::Value;
