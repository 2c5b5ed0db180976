//! The instruction set an effect value compiles to.
//!
//! Instructions form an immutable tree; the interpreter consumes them from
//! an explicit stack, so tree depth never translates into native call-stack
//! depth. Closure payloads are `Arc`ed, making trees cheap to clone and
//! share across repeated forks.
//!
//! The enum is closed and the interpreter matches it exhaustively; adding
//! a variant is a compile error at the dispatch site, not a runtime
//! surprise.

use std::sync::Arc;

use crate::cancellation::Cancellable;
use crate::fiber::Resumer;
use crate::value::Value;

/// Pure transform applied to the accumulated data value (`Map`, `Try`).
pub type ValueFn = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// Effectful continuation building the next instruction from the data value
/// (`Chain`, `TryM`, `Capture` handlers).
pub type InstructionFn = Arc<dyn Fn(Value) -> Instruction + Send + Sync>;

/// Native function invoked with explicit arguments (`Call`).
pub type CallFn = Arc<dyn Fn(Vec<Value>) -> Instruction + Send + Sync>;

/// Read-only projection of the current environment (`Access`).
pub type AccessFn = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

/// Async registration: wires the resumer into an external operation and
/// returns a handle that aborts that operation.
pub type RegisterFn = Arc<dyn Fn(Resumer) -> Arc<dyn Cancellable> + Send + Sync>;

#[derive(Clone)]
pub enum Instruction {
    /// Produce a fixed value.
    Constant(Value),
    /// Invoke a native function; its result is the next instruction.
    /// Supports mutual recursion without native stack growth.
    Call { f: CallFn, args: Vec<Value> },
    /// Evaluate `inner`, then apply a pure transform to its data.
    Map { inner: Box<Instruction>, f: ValueFn },
    /// Evaluate `inner`, then evaluate the instruction built from its data.
    Chain {
        inner: Box<Instruction>,
        f: InstructionFn,
    },
    /// Apply a possibly-panicking native transform to the current data.
    Try(ValueFn),
    /// Build the next instruction from the current data.
    TryM(InstructionFn),
    /// Catch boundary frame; a no-op on the success path. Rejection search
    /// stops here and invokes the handler.
    Capture(InstructionFn),
    /// Evaluate `inner`; on failure the nearest `Capture` frame receives
    /// the error.
    Catch {
        inner: Box<Instruction>,
        handler: InstructionFn,
    },
    /// Initiate failure propagation.
    Reject(Value),
    /// Suspend forever.
    Never,
    /// Start `inner` as an independent concurrent fiber; yields the fiber
    /// handle as the data value.
    Fork(Box<Instruction>),
    /// Push `env` for the duration of `inner`.
    Provide {
        inner: Box<Instruction>,
        env: Value,
    },
    /// Internal frame pushed by `Provide`: pops the environment stack.
    PopEnv,
    /// Read the top of the environment stack.
    Access(AccessFn),
    /// Suspend until an externally invoked success/failure callback.
    Async(RegisterFn),
}

impl Instruction {
    pub fn constant(value: impl Into<Value>) -> Self {
        Instruction::Constant(value.into())
    }

    pub fn call<F>(f: F, args: Vec<Value>) -> Self
    where
        F: Fn(Vec<Value>) -> Instruction + Send + Sync + 'static,
    {
        Instruction::Call {
            f: Arc::new(f),
            args,
        }
    }

    pub fn map<F>(inner: Instruction, f: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        Instruction::Map {
            inner: Box::new(inner),
            f: Arc::new(f),
        }
    }

    pub fn chain<F>(inner: Instruction, f: F) -> Self
    where
        F: Fn(Value) -> Instruction + Send + Sync + 'static,
    {
        Instruction::Chain {
            inner: Box::new(inner),
            f: Arc::new(f),
        }
    }

    /// Run arbitrary native code over the current data value. Panics are
    /// caught at the dispatch boundary and become rejections.
    pub fn effect<F>(f: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        Instruction::Try(Arc::new(f))
    }

    /// Like [`Instruction::effect`], but the native code produces the next
    /// instruction.
    pub fn effect_m<F>(f: F) -> Self
    where
        F: Fn(Value) -> Instruction + Send + Sync + 'static,
    {
        Instruction::TryM(Arc::new(f))
    }

    pub fn catch<F>(inner: Instruction, handler: F) -> Self
    where
        F: Fn(Value) -> Instruction + Send + Sync + 'static,
    {
        Instruction::Catch {
            inner: Box::new(inner),
            handler: Arc::new(handler),
        }
    }

    pub fn reject(error: impl Into<Value>) -> Self {
        Instruction::Reject(error.into())
    }

    pub fn never() -> Self {
        Instruction::Never
    }

    pub fn fork(inner: Instruction) -> Self {
        Instruction::Fork(Box::new(inner))
    }

    pub fn provide(inner: Instruction, env: impl Into<Value>) -> Self {
        Instruction::Provide {
            inner: Box::new(inner),
            env: env.into(),
        }
    }

    pub fn access<F>(f: F) -> Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        Instruction::Access(Arc::new(f))
    }

    pub fn async_<F>(register: F) -> Self
    where
        F: Fn(Resumer) -> Arc<dyn Cancellable> + Send + Sync + 'static,
    {
        Instruction::Async(Arc::new(register))
    }

    /// Tag name used in diagnostics and `Debug` output.
    pub fn tag_name(&self) -> &'static str {
        match self {
            Instruction::Constant(_) => "Constant",
            Instruction::Call { .. } => "Call",
            Instruction::Map { .. } => "Map",
            Instruction::Chain { .. } => "Chain",
            Instruction::Try(_) => "Try",
            Instruction::TryM(_) => "TryM",
            Instruction::Capture(_) => "Capture",
            Instruction::Catch { .. } => "Catch",
            Instruction::Reject(_) => "Reject",
            Instruction::Never => "Never",
            Instruction::Fork(_) => "Fork",
            Instruction::Provide { .. } => "Provide",
            Instruction::PopEnv => "PopEnv",
            Instruction::Access(_) => "Access",
            Instruction::Async(_) => "Async",
        }
    }
}

impl std::fmt::Debug for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Instruction::Constant(v) => f.debug_tuple("Constant").field(v).finish(),
            Instruction::Reject(e) => f.debug_tuple("Reject").field(e).finish(),
            Instruction::Map { inner, .. } => {
                f.debug_struct("Map").field("inner", inner).finish()
            }
            Instruction::Chain { inner, .. } => {
                f.debug_struct("Chain").field("inner", inner).finish()
            }
            Instruction::Catch { inner, .. } => {
                f.debug_struct("Catch").field("inner", inner).finish()
            }
            Instruction::Fork(inner) => f.debug_tuple("Fork").field(inner).finish(),
            Instruction::Provide { inner, env } => f
                .debug_struct("Provide")
                .field("inner", inner)
                .field("env", env)
                .finish(),
            other => f.write_str(other.tag_name()),
        }
    }
}
