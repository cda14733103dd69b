//! Provider error taxonomy.
//!
//! SDK and transport failures are classified at the provider boundary into
//! [`ProviderError`], a sum type the retry wrapper can reason about without
//! string matching. Transience rules:
//!
//! - HTTP 429, 500, 502, 503 → transient
//! - connection reset / timed out / refused, broken pipe, DNS failure → transient
//! - operation timeouts → transient
//! - everything else (including other 4xx) → permanent

use std::time::Duration;

use thiserror::Error;

/// Network failure classes eligible for retry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetworkErrorKind {
    /// `ECONNRESET` and friends.
    ConnectionReset,
    /// Socket-level timeout.
    TimedOut,
    /// `ECONNREFUSED`.
    ConnectionRefused,
    /// `EPIPE`.
    BrokenPipe,
    /// Transient name-resolution failure.
    Dns,
}

/// Errors from provider operations.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The service answered with a non-success HTTP status.
    #[error("provider returned HTTP {status}: {message}")]
    Http {
        /// The HTTP status code.
        status: u16,
        /// Server-supplied `Retry-After`, if present and parseable.
        retry_after: Option<Duration>,
        /// Response body or reason text, for logs.
        message: String,
    },

    /// The request never completed at the transport level.
    #[error("network error ({kind:?}): {message}")]
    Network {
        /// Which transient class this failure falls into.
        kind: NetworkErrorKind,
        /// Underlying error text.
        message: String,
    },

    /// A configured operation timeout elapsed.
    #[error("provider operation timed out after {0:?}")]
    Timeout(Duration),

    /// Anything that does not fit the taxonomy; never retried.
    #[error("provider error: {0}")]
    Other(String),
}

impl ProviderError {
    /// Whether the retry wrapper may try this operation again.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http { status, .. } => matches!(status, 429 | 500 | 502 | 503),
            Self::Network { .. } | Self::Timeout(_) => true,
            Self::Other(_) => false,
        }
    }

    /// The server's `Retry-After` hint, if any.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Http { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Whether this is an HTTP 404.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Http { status: 404, .. })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
