//! Terminal outcome encoding for a computation.
//!
//! Pure data, no behavior: a computation is either decided (success or
//! failure, each carrying a [`Value`]) or still pending. Cancellation is
//! deliberately *not* an `Exit` variant: observers receive `Option<Exit>`
//! and cancellation is the `None` arm, so it can never be confused with a
//! failure value or caught by a failure handler.

use crate::value::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum Exit {
    Success(Value),
    Failure(Value),
    Pending,
}

impl Exit {
    pub fn success(value: impl Into<Value>) -> Self {
        Exit::Success(value.into())
    }

    pub fn failure(value: impl Into<Value>) -> Self {
        Exit::Failure(value.into())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Exit::Success(_))
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Exit::Failure(_))
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Exit::Pending)
    }

    /// Convert a decided exit into a `Result`. Pending yields `None`.
    pub fn into_result(self) -> Option<Result<Value, Value>> {
        match self {
            Exit::Success(v) => Some(Ok(v)),
            Exit::Failure(e) => Some(Err(e)),
            Exit::Pending => None,
        }
    }
}

impl From<Result<Value, Value>> for Exit {
    fn from(result: Result<Value, Value>) -> Self {
        match result {
            Ok(v) => Exit::Success(v),
            Err(e) => Exit::Failure(e),
        }
    }
}
