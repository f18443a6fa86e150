//! Error Values and the Non-Fatal Classifier
//!
//! This module defines the error currency of the runtime and the boundary
//! between recoverable and unrecoverable failures.
//!
//! # Design
//!
//! - `Error` is a cheap-clone handle over an `ErrorKind`. Error values fan
//!   out to multiple waiters (memoized tasks, stream finalizers), so cloning
//!   must not allocate more than an `Arc` bump.
//! - Panics raised inside user thunks are the Rust analogue of thrown
//!   exceptions. The run-loop traps them through [`guard_panic`] and converts
//!   the payload into an `Error`, *unless* the payload is classified as
//!   fatal, in which case the unwind is resumed untouched and no handler in
//!   the engine will observe it.
//!
//! # Fatal conditions
//!
//! Conditions that must never be trapped (the moral equivalents of
//! out-of-memory or interrupted execution) are signalled by panicking with a
//! [`Fatal`] payload via `std::panic::panic_any`. Everything else is
//! considered non-fatal and recoverable.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use thiserror::Error as ThisError;

/// The failure value produced and consumed by the runtime.
///
/// Cloning is cheap; the payload is shared.
#[derive(Debug, Clone)]
pub struct Error {
    inner: Arc<ErrorKind>,
}

/// Classification of runtime failures.
#[derive(Debug, ThisError)]
pub enum ErrorKind {
    /// A plain error message, typically raised by user code.
    #[error("{0}")]
    Message(String),
    /// A non-fatal panic captured inside a guarded thunk.
    #[error("panicked: {0}")]
    Panic(String),
    /// A wrapped source error from outside the runtime.
    #[error(transparent)]
    Source(Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Create an error from a message.
    pub fn msg(message: impl Into<String>) -> Self {
        Error {
            inner: Arc::new(ErrorKind::Message(message.into())),
        }
    }

    /// Wrap an external error value.
    pub fn source(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Error {
            inner: Arc::new(ErrorKind::Source(Box::new(err))),
        }
    }

    /// Build an error from a captured panic payload.
    ///
    /// The payload has already been classified as non-fatal by the caller.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "opaque panic payload".to_string()
        };
        Error {
            inner: Arc::new(ErrorKind::Panic(message)),
        }
    }

    /// Get the underlying kind.
    pub fn kind(&self) -> &ErrorKind {
        &self.inner
    }

    /// Check whether this error carries the given message text.
    pub fn is_message(&self, message: &str) -> bool {
        matches!(self.kind(), ErrorKind::Message(m) if m == message)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        std::error::Error::source(&*self.inner)
    }
}

/// Panic payload marking an unrecoverable, VM-level condition.
///
/// A panic carrying a `Fatal` bypasses every error handler in the engine:
/// [`guard_panic`] resumes the unwind instead of capturing it.
#[derive(Debug)]
pub struct Fatal(pub String);

/// Classify a panic payload.
///
/// Returns `true` for ordinary, recoverable payloads and `false` for
/// [`Fatal`] markers.
pub fn non_fatal(payload: &(dyn Any + Send)) -> bool {
    !payload.is::<Fatal>()
}

/// Run a closure, trapping non-fatal panics as [`Error`] values.
///
/// Fatal payloads are resumed and never observed by callers.
pub fn guard_panic<T>(f: impl FnOnce() -> T) -> Result<T, Error> {
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
        Ok(value) => Ok(value),
        Err(payload) => {
            if !non_fatal(payload.as_ref()) {
                std::panic::resume_unwind(payload);
            }
            Err(Error::from_panic(payload))
        }
    }
}

/// Run a fallible closure, merging a trapped panic with its error channel.
pub fn guard_panic_result<T>(f: impl FnOnce() -> Result<T, Error>) -> Result<T, Error> {
    guard_panic(f).and_then(|r| r)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_is_cheap_clone() {
        let e = Error::msg("boom");
        let e2 = e.clone();
        assert_eq!(e.to_string(), e2.to_string());
    }

    #[test]
    fn test_guard_panic_captures_str_payload() {
        let r: Result<(), Error> = guard_panic(|| panic!("kaboom"));
        let err = r.unwrap_err();
        assert!(err.to_string().contains("kaboom"));
        assert!(matches!(err.kind(), ErrorKind::Panic(_)));
    }

    #[test]
    fn test_guard_panic_passes_values_through() {
        assert_eq!(guard_panic(|| 42).unwrap(), 42);
    }

    #[test]
    #[should_panic]
    fn test_fatal_payload_is_resumed() {
        let _ = guard_panic(|| std::panic::panic_any(Fatal("vm fault".into())));
    }

    #[test]
    fn test_non_fatal_classifier() {
        let ordinary: Box<dyn Any + Send> = Box::new("oops".to_string());
        assert!(non_fatal(ordinary.as_ref()));
        let fatal: Box<dyn Any + Send> = Box::new(Fatal("vm fault".into()));
        assert!(!non_fatal(fatal.as_ref()));
    }

    #[test]
    fn test_guard_panic_result_merges_channels() {
        let err = guard_panic_result::<i32>(|| Err(Error::msg("direct"))).unwrap_err();
        assert!(err.is_message("direct"));
        let err = guard_panic_result::<i32>(|| panic!("indirect")).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Panic(_)));
    }
}
