//! Failure classification shared by the retry policy and the circuit breaker.
//!
//! Every error that crosses a resilience boundary is reduced to an
//! [`ErrorCategory`]. Retry policies whitelist categories to retry on, and
//! circuit breakers whitelist the categories that count toward their failure
//! accounting.

use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};

/// Coarse kind of a failure, independent of the concrete error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Local filesystem or pipe failure.
    Io,
    /// Access to a resource was refused.
    PermissionDenied,
    /// Connection refused, reset or dropped by a remote collaborator.
    Connection,
    /// The operation did not finish within its time limit.
    Timeout,
    /// A resource was temporarily held by someone else.
    Locked,
    /// The collaborator rejected the request and repeating it will not help.
    Permanent,
    /// A bug on our side. Never counted against an external collaborator.
    Internal,
}

impl ErrorCategory {
    /// Every category, in declaration order.
    pub const ALL: [ErrorCategory; 7] = [
        ErrorCategory::Io,
        ErrorCategory::PermissionDenied,
        ErrorCategory::Connection,
        ErrorCategory::Timeout,
        ErrorCategory::Locked,
        ErrorCategory::Permanent,
        ErrorCategory::Internal,
    ];

    /// Whether repeating the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorCategory::Io
                | ErrorCategory::Connection
                | ErrorCategory::Timeout
                | ErrorCategory::Locked
        )
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(error_category_label(self))
    }
}

/// Stable label used in structured log fields and stats output.
pub fn error_category_label(category: &ErrorCategory) -> &'static str {
    match category {
        ErrorCategory::Io => "io",
        ErrorCategory::PermissionDenied => "permission_denied",
        ErrorCategory::Connection => "connection",
        ErrorCategory::Timeout => "timeout",
        ErrorCategory::Locked => "locked",
        ErrorCategory::Permanent => "permanent",
        ErrorCategory::Internal => "internal",
    }
}

/// Errors that can report which [`ErrorCategory`] they belong to.
pub trait Classify {
    fn category(&self) -> ErrorCategory;
}

impl Classify for io::Error {
    fn category(&self) -> ErrorCategory {
        match self.kind() {
            io::ErrorKind::PermissionDenied => ErrorCategory::PermissionDenied,
            io::ErrorKind::TimedOut => ErrorCategory::Timeout,
            io::ErrorKind::WouldBlock => ErrorCategory::Locked,
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::AddrNotAvailable
            | io::ErrorKind::BrokenPipe => ErrorCategory::Connection,
            io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => ErrorCategory::Permanent,
            _ => ErrorCategory::Io,
        }
    }
}

impl Classify for tokio::time::error::Elapsed {
    fn category(&self) -> ErrorCategory {
        ErrorCategory::Timeout
    }
}

impl Classify for ErrorCategory {
    fn category(&self) -> ErrorCategory {
        *self
    }
}
