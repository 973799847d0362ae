//! Loop error taxonomy
//!
//! Every public operation returns [`LoopResult`]. Callers that need the
//! integer error-kind (for FFI or status reporting) use [`LoopError::code`]
//! or [`status_code`]; `0` ([`OK`]) denotes success.

use std::io;

/// Integer code reported for a successful operation
pub const OK: i32 = 0;

/// Errors produced by the event loop and its collaborators
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoopError {
    /// The pool (or the OS) could not provide memory for a timer, task or node
    #[error("Out of memory: {0}")]
    OutOfMemory(&'static str),

    /// Wrapped platform error code
    #[error("Platform error (code {0})")]
    Platform(i32),

    /// Operation invoked in a context where it cannot work
    #[error("Invalid state: {0}")]
    InvalidState(&'static str),

    /// The loop is shutting down; the operation was refused or abandoned
    #[error("Loop terminated")]
    Terminated,

    /// The completion port has already been closed
    #[error("Completion port closed")]
    HandleClosed,
}

/// Loop operation result
pub type LoopResult<T> = Result<T, LoopError>;

impl LoopError {
    /// Integer error-kind for this error (never [`OK`])
    pub fn code(&self) -> i32 {
        match self {
            LoopError::OutOfMemory(_) => 1,
            LoopError::Platform(_) => 2,
            LoopError::InvalidState(_) => 3,
            LoopError::Terminated => 4,
            LoopError::HandleClosed => 5,
        }
    }
}

/// Integer error-kind for a whole result
pub fn status_code<T>(result: &LoopResult<T>) -> i32 {
    match result {
        Ok(_) => OK,
        Err(e) => e.code(),
    }
}

/// Translate a raw platform error code into a [`LoopError`].
///
/// Codes that mean "no memory" on the supported platforms collapse into
/// [`LoopError::OutOfMemory`]; everything else is wrapped verbatim.
pub fn translate(code: i32) -> LoopError {
    #[cfg(windows)]
    const NO_MEMORY_CODES: &[i32] = &[8, 14]; // ERROR_NOT_ENOUGH_MEMORY, ERROR_OUTOFMEMORY
    #[cfg(not(windows))]
    const NO_MEMORY_CODES: &[i32] = &[12]; // ENOMEM

    if NO_MEMORY_CODES.contains(&code) {
        LoopError::OutOfMemory("platform allocation failed")
    } else {
        LoopError::Platform(code)
    }
}

impl From<io::Error> for LoopError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::OutOfMemory {
            return LoopError::OutOfMemory("platform allocation failed");
        }
        match err.raw_os_error() {
            Some(code) => translate(code),
            None => LoopError::Platform(-1),
        }
    }
}
