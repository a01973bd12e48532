//! Runtime status codes and error values.

use crate::value::TValue;

/// Status of a thread or of a protected operation.
///
/// `CloseProtect` is internal: it marks an unwinding path on which
/// to-be-closed variables must still run their close metamethods in
/// protected mode. It never escapes to the embedder.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadStatus {
    Ok,
    Yield,
    ErrRun,
    ErrSyntax,
    ErrMem,
    ErrErr,
    ErrFile,
    CloseProtect,
}

impl ThreadStatus {
    /// True for every status that represents a real error (not Ok/Yield
    /// and not the close-protect placeholder).
    pub fn is_error(self) -> bool {
        !matches!(
            self,
            ThreadStatus::Ok | ThreadStatus::Yield | ThreadStatus::CloseProtect
        )
    }
}

/// A runtime error raised by the core.
#[derive(Clone, Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("{0}")]
    Runtime(String),
    #[error("not enough memory")]
    Mem,
    #[error("error in error handling")]
    ErrInErr,
    #[error("{message}")]
    Syntax { message: String },
    #[error("stack overflow")]
    StackOverflow,
    /// An error whose payload is an arbitrary script value.
    #[error("error object is not a string")]
    Value(TValue),
}

impl RuntimeError {
    /// The status code this error unwinds with.
    pub fn status(&self) -> ThreadStatus {
        match self {
            RuntimeError::Mem => ThreadStatus::ErrMem,
            RuntimeError::ErrInErr => ThreadStatus::ErrErr,
            RuntimeError::Syntax { .. } => ThreadStatus::ErrSyntax,
            _ => ThreadStatus::ErrRun,
        }
    }
}
