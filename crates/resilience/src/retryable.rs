//! Classification of operation errors for the retry stage
//!
//! Operations run under a policy chain return `Result<T, E>` where `E`
//! implements [`Retryable`]. Only errors reporting `is_retryable() == true`
//! are attempted again; everything else surfaces after the first attempt.

use std::error::Error;
use std::time::Duration;

use crate::core::ResilienceError;

/// Errors that know whether a repeat attempt could succeed
///
/// ```
/// use bulwark_resilience::Retryable;
/// use thiserror::Error;
///
/// #[derive(Debug, Error)]
/// enum BackendError {
///     #[error("backend unavailable")]
///     Unavailable,
///     #[error("bad request")]
///     BadRequest,
/// }
///
/// impl Retryable for BackendError {
///     fn is_retryable(&self) -> bool {
///         matches!(self, Self::Unavailable)
///     }
/// }
///
/// assert!(BackendError::Unavailable.is_retryable());
/// assert!(!BackendError::BadRequest.is_retryable());
/// ```
pub trait Retryable: Error {
    /// Whether the failed attempt may be repeated
    ///
    /// Default: `true`
    fn is_retryable(&self) -> bool {
        true
    }

    /// Minimum delay the error itself asks for before the next attempt
    ///
    /// When set and longer than the computed backoff, it replaces it.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Transient socket conditions are retryable, everything else is not
impl Retryable for std::io::Error {
    fn is_retryable(&self) -> bool {
        use std::io::ErrorKind::{
            ConnectionAborted, ConnectionRefused, ConnectionReset, Interrupted, TimedOut,
            WouldBlock,
        };
        matches!(
            self.kind(),
            Interrupted | WouldBlock | TimedOut | ConnectionReset | ConnectionAborted | ConnectionRefused
        )
    }
}

/// Nested chains: an inner chain's rejection is never retried by an outer one
impl Retryable for ResilienceError {
    fn is_retryable(&self) -> bool {
        Self::is_retryable(self)
    }

    fn retry_after(&self) -> Option<Duration> {
        Self::retry_after(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::io::ErrorKind;

    #[rstest]
    #[case(ErrorKind::TimedOut, true)]
    #[case(ErrorKind::ConnectionReset, true)]
    #[case(ErrorKind::ConnectionRefused, true)]
    #[case(ErrorKind::NotFound, false)]
    #[case(ErrorKind::PermissionDenied, false)]
    fn io_error_classification(#[case] kind: ErrorKind, #[case] expected: bool) {
        assert_eq!(std::io::Error::from(kind).is_retryable(), expected);
    }

    #[test]
    fn inner_rejection_is_not_retryable() {
        let err = ResilienceError::BulkheadFull {
            name: "bhX".into(),
            max_concurrent: 2,
            waited: Duration::ZERO,
        };
        assert!(!Retryable::is_retryable(&err));
    }
}
