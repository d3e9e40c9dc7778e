//! Status values: a code plus a human readable reason. Every close and every
//! fallible mesh operation reports one of these.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Canonical status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    Ok,
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl StatusCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::Cancelled => "CANCELLED",
            StatusCode::Unknown => "UNKNOWN",
            StatusCode::InvalidArgument => "INVALID_ARGUMENT",
            StatusCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
            StatusCode::NotFound => "NOT_FOUND",
            StatusCode::AlreadyExists => "ALREADY_EXISTS",
            StatusCode::PermissionDenied => "PERMISSION_DENIED",
            StatusCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            StatusCode::FailedPrecondition => "FAILED_PRECONDITION",
            StatusCode::Aborted => "ABORTED",
            StatusCode::OutOfRange => "OUT_OF_RANGE",
            StatusCode::Unimplemented => "UNIMPLEMENTED",
            StatusCode::Internal => "INTERNAL",
            StatusCode::Unavailable => "UNAVAILABLE",
            StatusCode::DataLoss => "DATA_LOSS",
            StatusCode::Unauthenticated => "UNAUTHENTICATED",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A status code with context. `Status::ok()` is the successful status used
/// for graceful closes; everything else is an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {reason}")]
pub struct Status {
    code: StatusCode,
    reason: String,
}

/// Result alias used across the mesh.
pub type StatusOr<T> = Result<T, Status>;

impl Status {
    pub fn new(code: StatusCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    pub fn ok() -> Self {
        Self::new(StatusCode::Ok, "")
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::new(StatusCode::Cancelled, reason)
    }

    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::new(StatusCode::InvalidArgument, reason)
    }

    pub fn not_found(reason: impl Into<String>) -> Self {
        Self::new(StatusCode::NotFound, reason)
    }

    pub fn failed_precondition(reason: impl Into<String>) -> Self {
        Self::new(StatusCode::FailedPrecondition, reason)
    }

    pub fn resource_exhausted(reason: impl Into<String>) -> Self {
        Self::new(StatusCode::ResourceExhausted, reason)
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::new(StatusCode::Unavailable, reason)
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::new(StatusCode::Internal, reason)
    }

    pub fn code(&self) -> StatusCode {
        self.code
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }

    /// Prefix the reason with `context`, keeping the code.
    pub fn with_context(self, context: impl fmt::Display) -> Self {
        let reason = if self.reason.is_empty() {
            context.to_string()
        } else {
            format!("{}: {}", context, self.reason)
        };
        Self {
            code: self.code,
            reason,
        }
    }
}

impl From<std::io::Error> for Status {
    fn from(error: std::io::Error) -> Self {
        use std::io::ErrorKind;
        let code = match error.kind() {
            ErrorKind::NotFound => StatusCode::NotFound,
            ErrorKind::PermissionDenied => StatusCode::PermissionDenied,
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe => StatusCode::Unavailable,
            ErrorKind::InvalidInput => StatusCode::InvalidArgument,
            ErrorKind::InvalidData => StatusCode::DataLoss,
            ErrorKind::TimedOut => StatusCode::DeadlineExceeded,
            ErrorKind::Interrupted => StatusCode::Cancelled,
            _ => StatusCode::Unknown,
        };
        Status::new(code, error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_prefixes_reason() {
        let s = Status::unavailable("link lost").with_context("reading stream 3");
        assert_eq!(s.code(), StatusCode::Unavailable);
        assert_eq!(s.reason(), "reading stream 3: link lost");
        assert_eq!(s.to_string(), "UNAVAILABLE: reading stream 3: link lost");
    }

    #[test]
    fn context_on_empty_reason() {
        let s = Status::ok().with_context("closed by peer");
        assert!(s.is_ok());
        assert_eq!(s.reason(), "closed by peer");
    }

    #[test]
    fn io_error_maps_to_code() {
        let e = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        assert_eq!(Status::from(e).code(), StatusCode::Unavailable);
        let e = std::io::Error::new(std::io::ErrorKind::Other, "weird");
        assert_eq!(Status::from(e).code(), StatusCode::Unknown);
    }
}
