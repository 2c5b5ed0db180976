//! Runtime entry points.
//!
//! A runtime is an explicit object constructed once and passed to call
//! sites; the scheduler boundary and the instruction budget are constructor
//! dependencies, not ambient globals.

use std::sync::Arc;

use crate::exit::Exit;
use crate::fiber::Fiber;
use crate::instruction::Instruction;
use crate::observer::ObserverFn;
use crate::scheduler::{Scheduler, TestScheduler, ThreadScheduler};
use crate::value::Value;

/// Default per-slice instruction budget.
///
/// Evaluation yields back to the scheduler after this many instructions so
/// one long effect cannot starve other scheduled work. Tunable via
/// [`Runtime::with_budget`]; `usize::MAX` opts out of forced yields.
pub const DEFAULT_INSTRUCTION_BUDGET: usize = 2048;

/// Executes instruction trees as fibers on a scheduler.
#[derive(Clone)]
pub struct Runtime {
    scheduler: Arc<dyn Scheduler>,
    budget: usize,
}

impl Runtime {
    pub fn new(scheduler: Arc<dyn Scheduler>) -> Self {
        Runtime {
            scheduler,
            budget: DEFAULT_INSTRUCTION_BUDGET,
        }
    }

    /// Override the per-slice instruction budget (minimum 1). Forked
    /// children inherit the budget of the fiber that forked them.
    pub fn with_budget(mut self, budget: usize) -> Self {
        self.budget = budget.max(1);
        self
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    /// Construct a root fiber for `instruction` and start it. The returned
    /// fiber is the cancel handle for the whole fiber tree.
    pub fn execute(&self, instruction: Instruction) -> Arc<Fiber> {
        Fiber::spawn(instruction, self.scheduler.clone(), self.budget)
    }

    /// Like [`Runtime::execute`], wiring completion callbacks to the
    /// terminal outcome. Cancellation invokes neither callback.
    pub fn execute_with<S, F>(
        &self,
        instruction: Instruction,
        on_success: S,
        on_failure: F,
    ) -> Arc<Fiber>
    where
        S: FnOnce(Value) + Send + 'static,
        F: FnOnce(Value) + Send + 'static,
    {
        let fiber = self.execute(instruction);
        let callback: ObserverFn = Box::new(move |outcome| match outcome {
            Some(Exit::Success(value)) => on_success(value),
            Some(Exit::Failure(error)) => on_failure(error),
            Some(Exit::Pending) | None => {}
        });
        fiber.observe(callback);
        fiber
    }
}

/// Runtime over a single-worker [`ThreadScheduler`].
pub fn default_runtime() -> Runtime {
    Runtime::new(Arc::new(ThreadScheduler::new()))
}

/// Runtime over a deterministic [`TestScheduler`], driven manually from the
/// test thread. Asynchronous code runs synchronously under the test's
/// control.
pub struct TestRuntime {
    runtime: Runtime,
    scheduler: Arc<TestScheduler>,
}

impl TestRuntime {
    pub fn new() -> Self {
        let scheduler = Arc::new(TestScheduler::new());
        TestRuntime {
            runtime: Runtime::new(scheduler.clone()),
            scheduler,
        }
    }

    pub fn with_budget(mut self, budget: usize) -> Self {
        self.runtime = self.runtime.with_budget(budget);
        self
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn scheduler(&self) -> &Arc<TestScheduler> {
        &self.scheduler
    }

    pub fn execute(&self, instruction: Instruction) -> Arc<Fiber> {
        self.runtime.execute(instruction)
    }

    /// Drain the scheduler to quiescence; returns the number of scheduler
    /// turns taken.
    pub fn run(&self) -> usize {
        self.scheduler.run_all()
    }

    /// Execute and drain, returning the fiber's exit.
    pub fn run_to_exit(&self, instruction: Instruction) -> Exit {
        let fiber = self.execute(instruction);
        self.run();
        fiber.exit()
    }
}

impl Default for TestRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// Creates a new [`TestRuntime`].
pub fn test_runtime() -> TestRuntime {
    TestRuntime::new()
}
