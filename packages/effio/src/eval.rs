//! The instruction interpreter: an explicit-stack trampoline.
//!
//! One `run_slice` call pops and dispatches instructions until the stack is
//! exhausted (terminal success), a rejection propagates unhandled (terminal
//! failure), an `Async` instruction suspends evaluation, `Never` abandons
//! it, or the instruction budget forces a cooperative yield back to the
//! scheduler. Native call-stack depth stays constant regardless of tree
//! depth.
//!
//! Native closures are invoked through a catch_unwind boundary; a panic
//! anywhere in dispatch is rewritten as a rejection carrying
//! [`Fault::Panic`]. Panics never escape the loop.

use std::sync::Arc;

use tracing::trace;

use crate::cancellation::AsyncRegistration;
use crate::error::Fault;
use crate::exit::Exit;
use crate::fiber::{EvalFrame, Fiber, FiberStatus, Resumer};
use crate::instruction::{Instruction, RegisterFn};
use crate::value::Value;

/// Run `f`, converting a panic into a `Fault`.
fn guarded<T>(f: impl FnOnce() -> T) -> Result<T, Fault> {
    std::panic::catch_unwind(std::panic::AssertUnwindSafe(f))
        .map_err(|payload| Fault::panic(panic_message(&*payload)))
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic of unknown type".to_string()
    }
}

/// Push either the produced instruction or the rejection of the fault.
fn push_outcome(stack: &mut Vec<Instruction>, outcome: Result<Instruction, Fault>) {
    match outcome {
        Ok(instruction) => stack.push(instruction),
        Err(fault) => stack.push(Instruction::Reject(Value::Fault(fault))),
    }
}

impl Fiber {
    /// Enqueue the next slice for the parked frame, registering the
    /// scheduled job in the cancellation tree so an abort also cancels the
    /// pending continuation.
    pub(crate) fn schedule_slice(self: &Arc<Self>) {
        let me = Arc::clone(self);
        let handle = self.scheduler().asap(Box::new(move || me.run_slice()));
        let token = self.cancellations().push(handle);
        if token.is_dead() {
            return;
        }
        let mut state = self.state().lock().expect("fiber lock poisoned");
        if state.status == FiberStatus::Pending {
            state.resume_token = Some(token);
        }
    }

    fn park_and_schedule(self: &Arc<Self>, frame: EvalFrame) {
        {
            let mut state = self.state().lock().expect("fiber lock poisoned");
            if state.status != FiberStatus::Pending {
                return;
            }
            state.park = Some(frame);
        }
        self.schedule_slice();
    }

    /// One interpreter slice: evaluate until terminal, suspension, or
    /// budget exhaustion.
    pub(crate) fn run_slice(self: &Arc<Self>) {
        let mut frame = {
            let mut state = self.state().lock().expect("fiber lock poisoned");
            if state.status != FiberStatus::Pending || state.pending_async.is_some() {
                return;
            }
            let token = state.resume_token.take();
            let frame = state.park.take();
            drop(state);
            if let Some(token) = token {
                self.cancellations().remove(token);
            }
            match frame {
                Some(frame) => frame,
                None => return,
            }
        };

        let mut count: usize = 0;
        loop {
            // Cancellation is observed between instructions; native code
            // mid-dispatch is never preempted.
            if self.is_cancel_requested() {
                return;
            }
            count += 1;
            if count > self.budget() {
                trace!(fiber = %self.id(), "budget exhausted, yielding");
                return self.park_and_schedule(frame);
            }

            let Some(instruction) = frame.stack.pop() else {
                let data = std::mem::take(&mut frame.data);
                return self.finish(Exit::Success(data));
            };

            match instruction {
                Instruction::Constant(value) => frame.data = value,

                Instruction::Call { f, args } => {
                    push_outcome(&mut frame.stack, guarded(move || f(args)));
                }

                Instruction::Map { inner, f } => {
                    frame.stack.push(Instruction::Try(f));
                    frame.stack.push(*inner);
                }

                Instruction::Chain { inner, f } => {
                    frame.stack.push(Instruction::TryM(f));
                    frame.stack.push(*inner);
                }

                Instruction::Try(f) => {
                    let data = std::mem::take(&mut frame.data);
                    match guarded(move || f(data)) {
                        Ok(value) => frame.data = value,
                        Err(fault) => {
                            frame.stack.push(Instruction::Reject(Value::Fault(fault)))
                        }
                    }
                }

                Instruction::TryM(f) => {
                    let data = std::mem::take(&mut frame.data);
                    push_outcome(&mut frame.stack, guarded(move || f(data)));
                }

                // A catch boundary is a no-op on the success path.
                Instruction::Capture(_) => {}

                Instruction::Catch { inner, handler } => {
                    frame.stack.push(Instruction::Capture(handler));
                    frame.stack.push(*inner);
                }

                Instruction::Reject(error) => {
                    // Unwind to the nearest catch boundary. Environment
                    // entries bracketed by discarded PopEnv frames are
                    // popped with them.
                    let mut handler = None;
                    while let Some(top) = frame.stack.pop() {
                        match top {
                            Instruction::Capture(h) => {
                                handler = Some(h);
                                break;
                            }
                            Instruction::PopEnv => {
                                frame.env.pop();
                            }
                            _ => {}
                        }
                    }
                    match handler {
                        Some(h) => {
                            push_outcome(&mut frame.stack, guarded(move || h(error)));
                        }
                        None => return self.finish(Exit::Failure(error)),
                    }
                }

                Instruction::Never => {
                    trace!(fiber = %self.id(), "never: evaluation abandoned");
                    return;
                }

                Instruction::Fork(inner) => {
                    let child = Fiber::fork_from(self, *inner);
                    frame.data = Value::Fiber(child);
                }

                Instruction::Provide { inner, env } => {
                    frame.stack.push(Instruction::PopEnv);
                    frame.stack.push(*inner);
                    frame.env.push(env);
                }

                Instruction::PopEnv => {
                    if frame.env.pop().is_none() {
                        frame.stack.push(Instruction::Reject(Value::Fault(
                            Fault::invalid_instruction("PopEnv"),
                        )));
                    }
                }

                Instruction::Access(f) => match frame.env.last() {
                    Some(env) => match guarded(|| f(env)) {
                        Ok(value) => frame.data = value,
                        Err(fault) => {
                            frame.stack.push(Instruction::Reject(Value::Fault(fault)))
                        }
                    },
                    None => frame.stack.push(Instruction::Reject(Value::Fault(
                        Fault::empty_environment(),
                    ))),
                },

                Instruction::Async(register) => {
                    return self.suspend(frame, register);
                }
            }
        }
    }

    /// Suspend on an async registration. The registration gate enters the
    /// cancellation tree *before* user code runs, so a callback fired
    /// synchronously during registration (or a racing abort) cannot slip
    /// past the handle.
    fn suspend(self: &Arc<Self>, frame: EvalFrame, register: RegisterFn) {
        let gate = Arc::new(AsyncRegistration::new());
        let token = self.cancellations().push(gate.clone());
        if token.is_dead() {
            return;
        }
        {
            let mut state = self.state().lock().expect("fiber lock poisoned");
            if state.status != FiberStatus::Pending {
                return;
            }
            state.park = Some(frame);
            state.pending_async = Some(token);
        }
        trace!(fiber = %self.id(), "suspended on async registration");

        let resumer = Resumer {
            fiber: Arc::clone(self),
            token,
        };
        match guarded(|| register(resumer.clone())) {
            Ok(handle) => gate.arm(handle),
            Err(fault) => resumer.fail(Value::Fault(fault)),
        }
    }

    /// Resume a suspended evaluation with `instruction` as the next step.
    ///
    /// One-shot: only the registration token recorded by the current
    /// suspension may resume, and only once. Stale or duplicate callbacks
    /// are no-ops.
    pub(crate) fn resume_with(self: &Arc<Self>, instruction: Instruction, token: crate::ids::CancelToken) {
        self.cancellations().remove(token);
        {
            let mut state = self.state().lock().expect("fiber lock poisoned");
            if state.status != FiberStatus::Pending {
                return;
            }
            if state.pending_async != Some(token) {
                return;
            }
            state.pending_async = None;
            match state.park.as_mut() {
                Some(frame) => frame.stack.push(instruction),
                None => return,
            }
        }
        trace!(fiber = %self.id(), "async resumed");
        self.schedule_slice();
    }
}
