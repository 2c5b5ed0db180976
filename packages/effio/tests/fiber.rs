//! Fiber lifecycle: fork/join, await, cancellation, async suspension,
//! observers and finalizers.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use effio::{
    noop, test_runtime, Cancellable, Exit, FiberStatus, Instruction, Resumer, Value,
};

struct CountingCancel(Arc<AtomicUsize>);

impl Cancellable for CountingCancel {
    fn cancel(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_fork_join_round_trip() {
    let runtime = test_runtime();
    for _ in 0..10 {
        let tree = Instruction::chain(
            Instruction::fork(Instruction::constant(42i64)),
            |handle| match handle.as_fiber() {
                Some(fiber) => fiber.join(),
                None => Instruction::reject("not a fiber"),
            },
        );
        assert_eq!(runtime.run_to_exit(tree), Exit::Success(Value::Int(42)));
    }
}

#[test]
fn test_join_propagates_child_failure() {
    let runtime = test_runtime();
    let tree = Instruction::chain(
        Instruction::fork(Instruction::reject("child failed")),
        |handle| match handle.as_fiber() {
            Some(fiber) => fiber.join(),
            None => Instruction::reject("not a fiber"),
        },
    );
    assert_eq!(
        runtime.run_to_exit(tree),
        Exit::Failure(Value::String("child failed".into()))
    );
}

#[test]
fn test_await_wraps_outcome_in_exit() {
    let runtime = test_runtime();
    let tree = Instruction::chain(
        Instruction::fork(Instruction::constant(5i64)),
        |handle| match handle.as_fiber() {
            Some(fiber) => fiber.await_(),
            None => Instruction::reject("not a fiber"),
        },
    );
    assert_eq!(
        runtime.run_to_exit(tree),
        Exit::Success(Value::Exit(Box::new(Exit::Success(Value::Int(5)))))
    );
}

#[test]
fn test_abort_propagates_to_forked_children() {
    let runtime = test_runtime();
    let children: Arc<Mutex<Vec<Arc<effio::Fiber>>>> = Arc::new(Mutex::new(Vec::new()));

    let first = children.clone();
    let second = children.clone();
    let tree = Instruction::chain(
        Instruction::fork(Instruction::never()),
        move |handle| {
            if let Some(fiber) = handle.as_fiber() {
                first.lock().unwrap().push(fiber.clone());
            }
            Instruction::fork(Instruction::never())
        },
    );
    let tree = Instruction::chain(tree, move |handle| {
        if let Some(fiber) = handle.as_fiber() {
            second.lock().unwrap().push(fiber.clone());
        }
        Instruction::never()
    });

    let parent = runtime.execute(tree);
    runtime.run();
    assert_eq!(parent.status(), FiberStatus::Pending);
    assert_eq!(children.lock().unwrap().len(), 2);

    parent.cancel();
    runtime.run();
    assert_eq!(parent.status(), FiberStatus::Cancelled);

    for child in children.lock().unwrap().iter() {
        assert_eq!(child.status(), FiberStatus::Cancelled);
        // Awaiting a cancelled fiber resolves to "none".
        let observer = runtime.execute(child.await_());
        runtime.run();
        assert_eq!(observer.exit(), Exit::Success(Value::None));
    }
}

#[test]
fn test_completed_child_deregisters_from_parent_tree() {
    let runtime = test_runtime();
    let children: Arc<Mutex<Vec<Arc<effio::Fiber>>>> = Arc::new(Mutex::new(Vec::new()));

    let sink = children.clone();
    let tree = Instruction::chain(
        Instruction::fork(Instruction::constant(1i64)),
        move |handle| {
            if let Some(fiber) = handle.as_fiber() {
                sink.lock().unwrap().push(fiber.clone());
            }
            Instruction::never()
        },
    );

    let parent = runtime.execute(tree);
    runtime.run();

    let child = children.lock().unwrap()[0].clone();
    assert_eq!(child.status(), FiberStatus::Completed);

    // Aborting the parent afterwards must not flip the completed child.
    parent.cancel();
    runtime.run();
    assert_eq!(child.status(), FiberStatus::Completed);
}

#[test]
fn test_async_synchronous_callback_completes_in_one_extra_turn() {
    let runtime = test_runtime();
    let fiber = runtime.execute(Instruction::async_(|resumer| {
        resumer.succeed(9i64);
        noop()
    }));
    let turns = runtime.run();
    assert_eq!(fiber.exit(), Exit::Success(Value::Int(9)));
    assert_eq!(turns, 2);
}

#[test]
fn test_async_external_resume() {
    let runtime = test_runtime();
    let slot: Arc<Mutex<Option<Resumer>>> = Arc::new(Mutex::new(None));

    let parked = slot.clone();
    let fiber = runtime.execute(Instruction::async_(move |resumer| {
        parked.lock().unwrap().replace(resumer);
        noop()
    }));
    runtime.run();
    assert_eq!(fiber.status(), FiberStatus::Pending);

    let resumer = slot.lock().unwrap().take().unwrap();
    resumer.succeed(5i64);
    runtime.run();
    assert_eq!(fiber.exit(), Exit::Success(Value::Int(5)));
}

#[test]
fn test_async_failure_resume() {
    let runtime = test_runtime();
    let slot: Arc<Mutex<Option<Resumer>>> = Arc::new(Mutex::new(None));

    let parked = slot.clone();
    let fiber = runtime.execute(Instruction::async_(move |resumer| {
        parked.lock().unwrap().replace(resumer);
        noop()
    }));
    runtime.run();

    let resumer = slot.lock().unwrap().take().unwrap();
    resumer.fail("nope");
    runtime.run();
    assert_eq!(fiber.exit(), Exit::Failure(Value::String("nope".into())));
}

#[test]
fn test_async_resume_is_one_shot() {
    let runtime = test_runtime();
    let slot: Arc<Mutex<Option<Resumer>>> = Arc::new(Mutex::new(None));

    let parked = slot.clone();
    let fiber = runtime.execute(Instruction::async_(move |resumer| {
        parked.lock().unwrap().replace(resumer);
        noop()
    }));
    runtime.run();

    let resumer = slot.lock().unwrap().take().unwrap();
    resumer.succeed(1i64);
    resumer.fail("late");
    resumer.succeed(2i64);
    runtime.run();
    assert_eq!(fiber.exit(), Exit::Success(Value::Int(1)));
}

#[test]
fn test_cancel_aborts_in_flight_async_registration() {
    let runtime = test_runtime();
    let cancels = Arc::new(AtomicUsize::new(0));

    let counter = cancels.clone();
    let fiber = runtime.execute(Instruction::async_(move |_resumer| {
        Arc::new(CountingCancel(counter.clone())) as Arc<dyn Cancellable>
    }));
    runtime.run();
    assert_eq!(fiber.status(), FiberStatus::Pending);

    fiber.cancel();
    assert_eq!(cancels.load(Ordering::SeqCst), 1);
    // Idempotent: a second abort cancels nothing further.
    fiber.cancel();
    assert_eq!(cancels.load(Ordering::SeqCst), 1);
}

#[test]
fn test_resume_after_cancel_is_ignored() {
    let runtime = test_runtime();
    let slot: Arc<Mutex<Option<Resumer>>> = Arc::new(Mutex::new(None));

    let parked = slot.clone();
    let fiber = runtime.execute(Instruction::async_(move |resumer| {
        parked.lock().unwrap().replace(resumer);
        noop()
    }));
    runtime.run();

    fiber.cancel();
    let resumer = slot.lock().unwrap().take().unwrap();
    resumer.succeed(1i64);
    runtime.run();
    assert_eq!(fiber.status(), FiberStatus::Cancelled);
    assert_eq!(fiber.exit(), Exit::Pending);
}

#[test]
fn test_cancel_on_terminal_fiber_does_not_refire_observers() {
    let runtime = test_runtime();
    let fired = Arc::new(AtomicUsize::new(0));

    let fiber = runtime.execute(Instruction::constant(1i64));
    let sink = fired.clone();
    fiber.observe(Box::new(move |_| {
        sink.fetch_add(1, Ordering::SeqCst);
    }));
    runtime.run();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(fiber.status(), FiberStatus::Completed);

    fiber.cancel();
    runtime.run();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(fiber.status(), FiberStatus::Completed);
}

#[test]
fn test_observer_on_terminal_fiber_is_dispatched_via_scheduler() {
    let runtime = test_runtime();
    let fiber = runtime.execute(Instruction::constant(1i64));
    runtime.run();

    let fired = Arc::new(AtomicBool::new(false));
    let sink = fired.clone();
    fiber.observe(Box::new(move |outcome| {
        sink.store(outcome == Some(Exit::Success(Value::Int(1))), Ordering::SeqCst);
    }));
    // Never synchronously within the registration call.
    assert!(!fired.load(Ordering::SeqCst));
    runtime.run();
    assert!(fired.load(Ordering::SeqCst));
}

#[test]
fn test_deregistered_observer_never_fires() {
    let runtime = test_runtime();
    let slot: Arc<Mutex<Option<Resumer>>> = Arc::new(Mutex::new(None));

    let parked = slot.clone();
    let fiber = runtime.execute(Instruction::async_(move |resumer| {
        parked.lock().unwrap().replace(resumer);
        noop()
    }));
    runtime.run();

    let fired = Arc::new(AtomicBool::new(false));
    let sink = fired.clone();
    let registration = fiber.observe(Box::new(move |_| {
        sink.store(true, Ordering::SeqCst);
    }));
    registration.cancel();

    slot.lock().unwrap().take().unwrap().succeed(1i64);
    runtime.run();
    assert_eq!(fiber.exit(), Exit::Success(Value::Int(1)));
    assert!(!fired.load(Ordering::SeqCst));
}

#[test]
fn test_release_finalizer_runs_on_cancel_only() {
    let runtime = test_runtime();
    let finalized = Arc::new(AtomicBool::new(false));

    let fiber = runtime.execute(Instruction::never());
    let flag = finalized.clone();
    fiber.release(Instruction::effect(move |_| {
        flag.store(true, Ordering::SeqCst);
        Value::Unit
    }));
    runtime.run();
    assert!(!finalized.load(Ordering::SeqCst));

    fiber.cancel();
    runtime.run();
    assert!(finalized.load(Ordering::SeqCst));
}

#[test]
fn test_release_finalizer_skipped_on_completion() {
    let runtime = test_runtime();
    let finalized = Arc::new(AtomicBool::new(false));

    let completed = runtime.execute(Instruction::constant(1i64));
    let flag = finalized.clone();
    completed.release(Instruction::effect(move |_| {
        flag.store(true, Ordering::SeqCst);
        Value::Unit
    }));
    runtime.run();
    assert_eq!(completed.status(), FiberStatus::Completed);
    assert!(!finalized.load(Ordering::SeqCst));
}

#[test]
fn test_abort_effect_cancels_target() {
    let runtime = test_runtime();
    let target = runtime.execute(Instruction::never());
    runtime.run();

    let aborter = runtime.execute(target.abort());
    runtime.run();
    assert_eq!(aborter.status(), FiberStatus::Completed);
    assert_eq!(target.status(), FiberStatus::Cancelled);
}

#[test]
fn test_default_runtime_completes_on_worker_thread() {
    let runtime = effio::default_runtime();
    let (tx, rx) = std::sync::mpsc::channel();

    let tree = Instruction::chain(
        Instruction::fork(Instruction::constant(21i64)),
        |handle| match handle.as_fiber() {
            Some(fiber) => Instruction::map(fiber.join(), |v| {
                Value::Int(v.as_int().unwrap_or(0) * 2)
            }),
            None => Instruction::reject("not a fiber"),
        },
    );
    runtime.execute_with(
        tree,
        move |value| {
            let _ = tx.send(value);
        },
        |_| {},
    );

    let value = rx
        .recv_timeout(std::time::Duration::from_secs(5))
        .expect("fiber did not complete");
    assert_eq!(value, Value::Int(42));
}

#[test]
fn test_never_keeps_fiber_pending() {
    let runtime = test_runtime();
    let fiber = runtime.execute(Instruction::never());
    runtime.run();
    assert_eq!(fiber.status(), FiberStatus::Pending);
    assert_eq!(fiber.exit(), Exit::Pending);
}
