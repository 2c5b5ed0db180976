//! Fibers: one interpreter run with observation and cancellation.
//!
//! A fiber owns its instruction and environment stacks exclusively; they are
//! only ever touched by interpreter slices executing on behalf of that fiber
//! (see `eval`). The coordination surface (lifecycle status, final exit,
//! observers, the cancellation tree) sits behind a mutex because a parent
//! may cancel a child running on a different worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, trace};

use crate::cancellation::{Cancellable, CancellationList};
use crate::exit::Exit;
use crate::ids::{CancelToken, FiberId};
use crate::instruction::Instruction;
use crate::observer::{ObserverFn, ObserverList};
use crate::scheduler::Scheduler;
use crate::value::Value;

/// Fiber lifecycle. `Completed` and `Cancelled` are terminal, mutually
/// exclusive and irreversible.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum FiberStatus {
    Pending,
    Completed,
    Cancelled,
}

/// The evaluation frame: instruction stack, environment stack and the
/// accumulated data value. Moved out of the fiber for the duration of an
/// interpreter slice, parked inside it across suspensions.
pub(crate) struct EvalFrame {
    pub(crate) stack: Vec<Instruction>,
    pub(crate) env: Vec<Value>,
    pub(crate) data: Value,
}

pub(crate) struct FiberState {
    pub(crate) status: FiberStatus,
    pub(crate) result: Exit,
    pub(crate) observers: ObserverList,
    pub(crate) park: Option<EvalFrame>,
    /// Token of the scheduled continuation slice, if one is in flight.
    pub(crate) resume_token: Option<CancelToken>,
    /// Token of the async registration currently awaited, if any. Doubles
    /// as the one-shot guard for resume callbacks.
    pub(crate) pending_async: Option<CancelToken>,
}

pub struct Fiber {
    id: FiberId,
    budget: usize,
    scheduler: Arc<dyn Scheduler>,
    /// Fast-path cancel flag checked between instructions by the
    /// interpreter loop.
    cancel_requested: AtomicBool,
    state: Mutex<FiberState>,
    cancellations: Arc<CancellationList>,
    /// Registration of this fiber in its parent's cancellation tree, used
    /// for deregistration on terminal transition.
    parent: Mutex<Option<(Arc<CancellationList>, CancelToken)>>,
}

impl Fiber {
    fn new(
        instruction: Instruction,
        scheduler: Arc<dyn Scheduler>,
        budget: usize,
    ) -> Arc<Self> {
        Arc::new(Fiber {
            id: FiberId::fresh(),
            budget: budget.max(1),
            scheduler,
            cancel_requested: AtomicBool::new(false),
            state: Mutex::new(FiberState {
                status: FiberStatus::Pending,
                result: Exit::Pending,
                observers: ObserverList::new(),
                park: Some(EvalFrame {
                    stack: vec![instruction],
                    env: Vec::new(),
                    data: Value::None,
                }),
                resume_token: None,
                pending_async: None,
            }),
            cancellations: Arc::new(CancellationList::new()),
            parent: Mutex::new(None),
        })
    }

    /// Start evaluating `instruction` as a root fiber on `scheduler`.
    pub fn spawn(
        instruction: Instruction,
        scheduler: Arc<dyn Scheduler>,
        budget: usize,
    ) -> Arc<Self> {
        let fiber = Self::new(instruction, scheduler, budget);
        trace!(fiber = %fiber.id, "fiber spawned");
        fiber.schedule_slice();
        fiber
    }

    /// Start `instruction` as a child of `parent`: the child registers in
    /// the parent's cancellation tree and deregisters itself on terminal
    /// transition. Inherits the parent's scheduler and budget.
    pub(crate) fn fork_from(parent: &Arc<Fiber>, instruction: Instruction) -> Arc<Self> {
        let child = Self::new(instruction, parent.scheduler.clone(), parent.budget);
        trace!(fiber = %child.id, parent = %parent.id, "fiber forked");
        let token = parent.cancellations.push(child.clone());
        child.set_parent(parent.cancellations.clone(), token);
        child.schedule_slice();
        child
    }

    pub fn id(&self) -> FiberId {
        self.id
    }

    pub fn status(&self) -> FiberStatus {
        self.state.lock().expect("fiber lock poisoned").status
    }

    /// Snapshot of the final outcome; `Exit::Pending` until completed.
    pub fn exit(&self) -> Exit {
        self.state.lock().expect("fiber lock poisoned").result.clone()
    }

    pub(crate) fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    pub(crate) fn budget(&self) -> usize {
        self.budget
    }

    pub(crate) fn state(&self) -> &Mutex<FiberState> {
        &self.state
    }

    pub(crate) fn cancellations(&self) -> &Arc<CancellationList> {
        &self.cancellations
    }

    pub(crate) fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::Relaxed)
    }

    fn set_parent(&self, list: Arc<CancellationList>, token: CancelToken) {
        if token.is_dead() {
            return;
        }
        {
            let mut parent = self.parent.lock().expect("fiber lock poisoned");
            *parent = Some((list, token));
        }
        // The push itself may have raced this fiber's cancellation; make
        // sure a terminal fiber never stays registered.
        if self.status() != FiberStatus::Pending {
            self.deregister_from_parent();
        }
    }

    fn deregister_from_parent(&self) {
        let slot = {
            let mut parent = self.parent.lock().expect("fiber lock poisoned");
            parent.take()
        };
        if let Some((list, token)) = slot {
            list.remove(token);
        }
    }

    /// Register for notification of the terminal outcome.
    ///
    /// If the fiber is already terminal the callback is dispatched through
    /// the scheduler's immediate queue, never synchronously within this
    /// call. The returned handle deregisters the observer; losing a race
    /// with firing is a no-op.
    pub fn observe(self: &Arc<Self>, callback: ObserverFn) -> Arc<dyn Cancellable> {
        let replay = {
            let mut state = self.state.lock().expect("fiber lock poisoned");
            match state.status {
                FiberStatus::Pending => {
                    let key = state.observers.push(callback);
                    return Arc::new(ObserverHandle {
                        fiber: Arc::downgrade(self),
                        key,
                    });
                }
                FiberStatus::Completed => Some(state.result.clone()),
                FiberStatus::Cancelled => None,
            }
        };
        self.scheduler.asap(Box::new(move || callback(replay)))
    }

    /// An effect that suspends the caller until this fiber is terminal,
    /// then yields its success or failure. If the fiber is cancelled the
    /// joiner stays suspended; race against another effect to observe that.
    pub fn join(self: &Arc<Self>) -> Instruction {
        let fiber = Arc::clone(self);
        Instruction::async_(move |resumer| {
            fiber.observe(Box::new(move |outcome| match outcome {
                Some(Exit::Success(value)) => resumer.succeed(value),
                Some(Exit::Failure(error)) => resumer.fail(error),
                Some(Exit::Pending) | None => {}
            }))
        })
    }

    /// Like `join` but never fails: yields `Value::None` on cancellation
    /// and `Value::Exit(..)` wrapping the outcome otherwise.
    pub fn await_(self: &Arc<Self>) -> Instruction {
        let fiber = Arc::clone(self);
        Instruction::async_(move |resumer| {
            fiber.observe(Box::new(move |outcome| match outcome {
                Some(exit) if !exit.is_pending() => {
                    resumer.succeed(Value::Exit(Box::new(exit)))
                }
                _ => resumer.succeed(Value::None),
            }))
        })
    }

    /// An effect that requests cancellation of this fiber.
    pub fn abort(self: &Arc<Self>) -> Instruction {
        let fiber = Arc::clone(self);
        Instruction::effect(move |_| {
            fiber.cancel();
            Value::Unit
        })
    }

    /// Register a finalizer effect that is spawned if this fiber is
    /// cancelled. Returns the cancellation-tree token for early removal.
    pub fn release(&self, finalizer: Instruction) -> CancelToken {
        self.cancellations.push(Arc::new(FinalizerCancel {
            scheduler: self.scheduler.clone(),
            budget: self.budget,
            finalizer: Mutex::new(Some(finalizer)),
        }))
    }

    /// Request cancellation. Idempotent; a terminal fiber ignores it.
    ///
    /// Cancels every entry in this fiber's cancellation tree (children,
    /// in-flight async registrations, scheduled continuation slices) and
    /// fires all observers with "cancelled".
    pub fn cancel(&self) {
        let observers = {
            let mut state = self.state.lock().expect("fiber lock poisoned");
            if state.status != FiberStatus::Pending {
                return;
            }
            state.status = FiberStatus::Cancelled;
            self.cancel_requested.store(true, Ordering::Relaxed);
            state.park = None;
            state.resume_token = None;
            state.pending_async = None;
            state.observers.drain()
        };
        debug!(fiber = %self.id, "fiber cancelled");
        self.cancellations.cancel();
        self.deregister_from_parent();
        for callback in observers {
            callback(None);
        }
    }

    /// Terminal transition on behalf of the interpreter loop.
    pub(crate) fn finish(&self, exit: Exit) {
        let observers = {
            let mut state = self.state.lock().expect("fiber lock poisoned");
            if state.status != FiberStatus::Pending {
                return;
            }
            state.status = FiberStatus::Completed;
            state.result = exit.clone();
            state.observers.drain()
        };
        trace!(fiber = %self.id, failed = exit.is_failure(), "fiber completed");
        self.deregister_from_parent();
        for callback in observers {
            callback(Some(exit.clone()));
        }
    }
}

impl Cancellable for Fiber {
    fn cancel(&self) {
        Fiber::cancel(self)
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("status", &self.status())
            .finish()
    }
}

/// Deregistration handle returned by [`Fiber::observe`].
struct ObserverHandle {
    fiber: Weak<Fiber>,
    key: crate::ids::ObserverKey,
}

impl Cancellable for ObserverHandle {
    fn cancel(&self) {
        if let Some(fiber) = self.fiber.upgrade() {
            let mut state = fiber.state.lock().expect("fiber lock poisoned");
            state.observers.remove(self.key);
        }
    }
}

/// Runs a finalizer effect when the owning fiber is cancelled.
struct FinalizerCancel {
    scheduler: Arc<dyn Scheduler>,
    budget: usize,
    finalizer: Mutex<Option<Instruction>>,
}

impl Cancellable for FinalizerCancel {
    fn cancel(&self) {
        let finalizer = {
            let mut slot = self.finalizer.lock().expect("finalizer lock poisoned");
            slot.take()
        };
        if let Some(instruction) = finalizer {
            Fiber::spawn(instruction, self.scheduler.clone(), self.budget);
        }
    }
}

/// One-shot resume callbacks handed to an `Async` registration function.
///
/// The first of `succeed`/`fail` to arrive resumes the suspended fiber;
/// later invocations are no-ops, as are invocations after cancellation.
#[derive(Clone)]
pub struct Resumer {
    pub(crate) fiber: Arc<Fiber>,
    pub(crate) token: CancelToken,
}

impl Resumer {
    pub fn succeed(&self, value: impl Into<Value>) {
        self.fiber
            .resume_with(Instruction::Constant(value.into()), self.token);
    }

    pub fn fail(&self, error: impl Into<Value>) {
        self.fiber
            .resume_with(Instruction::Reject(error.into()), self.token);
    }
}

impl std::fmt::Debug for Resumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resumer")
            .field("fiber", &self.fiber.id())
            .finish()
    }
}
