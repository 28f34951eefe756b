//! Error types for fetch operations.

use std::io;

use thiserror::Error;

use crate::reactor::ProcessStatus;

/// Transport-level failure classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Connection could not be established before the configured timeout.
    Timeout,
    /// Name resolution failed.
    Dns,
    /// TLS negotiation failed.
    Tls,
    /// Connection was refused or dropped.
    Connection,
    /// Some other socket-level failure.
    Io,
}

/// Primary error type for fetch operations.
///
/// Every variant is delivered to the bound completion callback; none of them
/// abort the process.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Connection, DNS, or TLS failure reported by the transfer engine.
    #[error("transport failure")]
    Transport {
        /// Failure classification.
        kind: TransportKind,
        /// Engine-reported detail.
        detail: String,
    },
    /// Repository answered with a non-success HTTP status.
    #[error("unexpected http status {status}")]
    HttpStatus {
        /// Status code received.
        status: u16,
    },
    /// Payload could not be decoded as the expected response variant.
    #[error("malformed payload")]
    Parse {
        /// Decode failure detail.
        #[source]
        source: serde_json::Error,
    },
    /// Repository reported an application-level error in the RPC envelope.
    #[error("repository error")]
    Service {
        /// Error message from the envelope.
        message: String,
    },
    /// Clone child exited non-zero or was killed by a signal.
    #[error("clone process failed")]
    Process {
        /// Exit classification captured from the child.
        status: ProcessStatus,
    },
    /// Operation was torn down by a callback's cancellation request.
    #[error("operation cancelled")]
    Cancelled,
    /// Request parameters were rejected before dispatch.
    #[error("invalid request")]
    Configuration {
        /// What was wrong with the input.
        detail: String,
    },
    /// Operating system interaction failed.
    #[error("os operation failed")]
    Io {
        /// Operation identifier.
        operation: &'static str,
        /// Source IO error.
        #[source]
        source: io::Error,
    },
}

/// Convenience alias for fetch results.
pub type FetchResult<T> = Result<T, FetchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_display_carries_the_code() {
        let err = FetchError::HttpStatus { status: 404 };
        assert_eq!(err.to_string(), "unexpected http status 404");
    }

    #[test]
    fn parse_errors_expose_their_source() {
        let source = serde_json::from_str::<serde_json::Value>("{").expect_err("broken json");
        let err = FetchError::Parse { source };
        assert!(std::error::Error::source(&err).is_some());
    }
}
