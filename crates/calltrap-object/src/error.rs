//! Errors raised by object views and by interceptors.

use thiserror::Error;

/// A misuse of an [`Object`](crate::Object) view.
///
/// These are reported synchronously to the interceptor that caused them. The
/// instrumented call itself never observes them unless the interceptor
/// forwards one as a [`TrapError`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ObjectError {
    #[error("field index {index} out of range for object of length {len}")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("type mismatch on field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: &'static str,
        got: &'static str,
    },

    #[error("field '{field}' is read-only")]
    ReadOnly { field: String },

    #[error("field '{field}' has not been set")]
    Unset { field: String },

    #[error("no field named '{0}'")]
    NoSuchField(String),
}

/// Error returned by interceptor callbacks.
///
/// A `TrapError` never unwinds into the instrumented body. The dispatcher
/// either writes it into an error-shaped result slot (see
/// [`SlotValue::from_trap_error`](crate::SlotValue::from_trap_error)) or logs
/// and drops it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrapError {
    #[error("{0}")]
    Message(String),

    #[error(transparent)]
    Object(#[from] ObjectError),

    #[error("call aborted by interceptor")]
    Aborted,
}

impl TrapError {
    /// Create a plain message error.
    pub fn msg(message: impl Into<String>) -> Self {
        TrapError::Message(message.into())
    }
}
