//! Error kinds produced by spec bodies, hooks, middleware, and the DSL.
//!
//! Errors raised inside a body/hook are never allowed to unwind out of the
//! executor as a bare panic payload: [`SpecError::from_panic`] recovers a
//! typed [`SpecError`] when one was deliberately raised via
//! `std::panic::panic_any` (as the expectation library does), and falls back
//! to [`SpecError::UserError`] for ordinary panics.

use std::any::Any;

/// The error kinds a run can produce, per the engine's error taxonomy.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SpecError {
    /// A failed [`crate::expect::Expectation`] check.
    #[error("{expression}: expected to {expectation} but was {actual}")]
    AssertionFailure {
        expression: String,
        expectation: String,
        actual: String,
    },

    /// Any other error raised by user code inside a spec body.
    #[error("{message}")]
    UserError {
        message: String,
        stack: Option<String>,
    },

    /// An error raised inside `before_all`/`after_all`/`before_each`/`after_each`.
    #[error("hook error: {message}")]
    HookError {
        message: String,
        stack: Option<String>,
    },

    /// Synthesized by the timeout middleware when a spec exceeds its budget.
    #[error("timed out after {elapsed_ms}ms (budget {budget_ms}ms)")]
    Timeout { elapsed_ms: u64, budget_ms: u64 },

    /// The run (or this spec) was cancelled.
    #[error("cancelled: {reason}")]
    Cancelled { reason: String },

    /// The DSL was misused: used outside a `describe` body, a hook was
    /// attached twice to the same context, or a description was empty.
    #[error("DSL misuse: {0}")]
    DslMisuse(String),

    /// A middleware was constructed with an invalid argument (non-positive
    /// timeout, empty tag-include list, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A regex match exceeded its fixed time budget.
    #[error("pattern match exceeded its time budget")]
    PatternTimeout,
}

impl SpecError {
    /// The externalized category label used by formatters and
    /// [`crate::report::SpecResultReport`].
    pub fn kind_label(&self) -> &'static str {
        match self {
            SpecError::AssertionFailure { .. } => "assertion_failure",
            SpecError::UserError { .. } => "user_error",
            SpecError::HookError { .. } => "hook_error",
            SpecError::Timeout { .. } => "timeout",
            SpecError::Cancelled { .. } => "cancelled",
            SpecError::DslMisuse(_) => "dsl_misuse",
            SpecError::InvalidArgument(_) => "invalid_argument",
            SpecError::PatternTimeout => "pattern_timeout",
        }
    }

    /// The first line of the error's message — what a default formatter shows.
    pub fn first_line(&self) -> String {
        self.to_string()
            .lines()
            .next()
            .unwrap_or_default()
            .to_string()
    }

    /// Full message plus stack (when available), for formatters that want detail.
    pub fn detail(&self) -> String {
        let stack = match self {
            SpecError::UserError { stack, .. } | SpecError::HookError { stack, .. } => {
                stack.as_deref()
            }
            _ => None,
        };
        match stack {
            Some(s) => format!("{self}\n{s}"),
            None => self.to_string(),
        }
    }

    /// Convert a caught panic payload into a `SpecError`, preserving the
    /// original kind when the panic was raised via `panic_any(SpecError)`
    /// (as the expectation library and the middleware layer do).
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let payload = match payload.downcast::<SpecError>() {
            Ok(err) => return *err,
            Err(payload) => payload,
        };
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "panic with a non-string payload".to_string()
        };
        SpecError::UserError {
            message,
            stack: None,
        }
    }
}
