//! Memoizing "run once" combinator.
//!
//! Wraps a source effect so that any number of subscribers share exactly one
//! underlying execution. The first subscriber triggers the real fork; while
//! it is outstanding, further subscribers queue up and all receive the same
//! eventual outcome; subscribers arriving after the outcome is known get it
//! replayed through the scheduler without re-execution. Cancellation is
//! reference-counted: a subscriber's cancel handle removes only that
//! subscriber, and the underlying fiber is cancelled exactly once, when a
//! removal empties the wait queue before the outcome is decided.

use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, trace};

use crate::cancellation::Cancellable;
use crate::exit::Exit;
use crate::fiber::Fiber;
use crate::instruction::Instruction;
use crate::runtime::Runtime;
use crate::value::Value;

/// Callback receiving the shared outcome.
pub type OnceCallback = Box<dyn FnOnce(Result<Value, Value>) + Send>;

enum OnceState {
    /// Source not yet forked; holds the instruction to run.
    Idle { source: Option<Instruction> },
    Running {
        waiters: Vec<(u64, OnceCallback)>,
        next_waiter: u64,
        underlying: Option<Arc<Fiber>>,
        /// Set when the queue emptied before the fiber handle was recorded;
        /// the fork is cancelled as soon as it is.
        abandoned: bool,
    },
    Done { outcome: Result<Value, Value> },
}

pub struct Once {
    runtime: Runtime,
    state: Mutex<OnceState>,
}

impl Once {
    pub fn new(runtime: &Runtime, source: Instruction) -> Arc<Self> {
        Arc::new(Once {
            runtime: runtime.clone(),
            state: Mutex::new(OnceState::Idle {
                source: Some(source),
            }),
        })
    }

    /// Subscribe to the shared outcome. The callback fires at most once;
    /// the returned handle withdraws this subscription only.
    pub fn subscribe(self: &Arc<Self>, callback: OnceCallback) -> Arc<dyn Cancellable> {
        enum Action {
            Fork(Instruction),
            Wait(u64),
            Replay(Result<Value, Value>, OnceCallback),
        }

        let action = {
            let mut state = self.state.lock().expect("once lock poisoned");
            match &mut *state {
                OnceState::Idle { source } => {
                    let source = source.take().expect("once source already taken");
                    *state = OnceState::Running {
                        waiters: vec![(0, callback)],
                        next_waiter: 1,
                        underlying: None,
                        abandoned: false,
                    };
                    Action::Fork(source)
                }
                OnceState::Running {
                    waiters,
                    next_waiter,
                    ..
                } => {
                    let id = *next_waiter;
                    *next_waiter += 1;
                    waiters.push((id, callback));
                    Action::Wait(id)
                }
                OnceState::Done { outcome } => Action::Replay(outcome.clone(), callback),
            }
        };

        match action {
            Action::Fork(source) => {
                trace!("once: forking underlying effect");
                let me = Arc::clone(self);
                let fiber = self.runtime.execute(source);
                fiber.observe(Box::new(move |outcome| match outcome {
                    Some(Exit::Success(value)) => me.complete(Ok(value)),
                    Some(Exit::Failure(error)) => me.complete(Err(error)),
                    // A cancelled source decides nothing; remaining
                    // subscribers stay queued.
                    Some(Exit::Pending) | None => {}
                }));
                self.record_underlying(fiber);
                self.subscription_handle(0)
            }
            Action::Wait(id) => self.subscription_handle(id),
            Action::Replay(outcome, callback) => {
                trace!("once: replaying cached outcome");
                self.runtime
                    .scheduler()
                    .asap(Box::new(move || callback(outcome)))
            }
        }
    }

    /// Adapt this shared effect into an instruction, so it can be embedded
    /// in any tree. Every evaluation is one subscription.
    pub fn instruction(self: &Arc<Self>) -> Instruction {
        let once = Arc::clone(self);
        Instruction::async_(move |resumer| {
            once.subscribe(Box::new(move |outcome| match outcome {
                Ok(value) => resumer.succeed(value),
                Err(error) => resumer.fail(error),
            }))
        })
    }

    fn record_underlying(&self, fiber: Arc<Fiber>) {
        let cancel_now = {
            let mut state = self.state.lock().expect("once lock poisoned");
            match &mut *state {
                OnceState::Running {
                    underlying,
                    abandoned,
                    ..
                } => {
                    if *abandoned {
                        true
                    } else {
                        *underlying = Some(fiber.clone());
                        false
                    }
                }
                // Completed before the handle came back; nothing to track.
                _ => false,
            }
        };
        if cancel_now {
            fiber.cancel();
        }
    }

    fn complete(&self, outcome: Result<Value, Value>) {
        let waiters = {
            let mut state = self.state.lock().expect("once lock poisoned");
            match std::mem::replace(
                &mut *state,
                OnceState::Done {
                    outcome: outcome.clone(),
                },
            ) {
                OnceState::Running { waiters, .. } => waiters,
                previous => {
                    // Outcomes are decided once; anything else is a stale
                    // notification.
                    *state = previous;
                    return;
                }
            }
        };
        debug!(waiters = waiters.len(), "once: outcome decided");
        for (_, callback) in waiters {
            callback(outcome.clone());
        }
    }

    fn subscription_handle(self: &Arc<Self>, id: u64) -> Arc<dyn Cancellable> {
        Arc::new(OnceSubscription {
            once: Arc::downgrade(self),
            id,
        })
    }

    fn withdraw(&self, id: u64) {
        let cancel_fiber = {
            let mut state = self.state.lock().expect("once lock poisoned");
            match &mut *state {
                OnceState::Running {
                    waiters,
                    underlying,
                    abandoned,
                    ..
                } => {
                    let before = waiters.len();
                    waiters.retain(|(waiter, _)| *waiter != id);
                    if waiters.len() == before || !waiters.is_empty() {
                        None
                    } else {
                        match underlying.take() {
                            Some(fiber) => Some(fiber),
                            None => {
                                *abandoned = true;
                                None
                            }
                        }
                    }
                }
                _ => None,
            }
        };
        if let Some(fiber) = cancel_fiber {
            debug!("once: last subscriber gone, cancelling underlying fiber");
            fiber.cancel();
        }
    }
}

struct OnceSubscription {
    once: Weak<Once>,
    id: u64,
}

impl Cancellable for OnceSubscription {
    fn cancel(&self) {
        if let Some(once) = self.once.upgrade() {
            once.withdraw(self.id);
        }
    }
}
