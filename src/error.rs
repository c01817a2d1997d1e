//! Error types for the admission engine and its collaborators.
//!
//! Nothing in here is fatal to the process. Store failures degrade the engine,
//! malformed persisted values are skipped, and a denied admission is an
//! ordinary [`Admission::Deny`](crate::Admission) rather than an error.

use std::fmt;

/// Errors surfaced by an external limit store.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum StoreError {
    /// The store could not be reached at all.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The store answered but the operation failed.
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// True when the store itself could not be reached.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// A persisted limit that could not be parsed into a positive rate.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("malformed persisted limit for endpoint '{endpoint}': {raw:?}")]
pub struct MalformedPersistedValue {
    /// Endpoint the value was stored under.
    pub endpoint: String,
    /// Raw value as read from the store.
    pub raw: String,
}

/// The request adapter could not determine who is calling.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("unable to resolve client identity: {reason}")]
pub struct UnresolvedClientIdentity {
    /// Why resolution failed.
    pub reason: String,
}

impl UnresolvedClientIdentity {
    /// Create from any displayable reason.
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

/// Errors returned by the [`AdmissionLayer`](crate::middleware::AdmissionLayer) service.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum AdmissionError<E> {
    /// The engine denied admission for this endpoint.
    RateLimited {
        /// Endpoint the request was addressed to.
        endpoint: String,
    },
    /// The client could not be identified; the engine was never consulted.
    Unidentified(UnresolvedClientIdentity),
    /// The wrapped service failed.
    Inner(E),
}

/// HTTP status for "too many requests".
pub const STATUS_TOO_MANY_REQUESTS: u16 = 429;
/// HTTP status used for unidentifiable callers.
pub const STATUS_UNAUTHORIZED: u16 = 401;
/// HTTP status used when the wrapped service fails.
pub const STATUS_INTERNAL: u16 = 500;

impl<E> AdmissionError<E> {
    /// Check if this is a rate-limit rejection.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Check if the caller could not be identified.
    pub fn is_unidentified(&self) -> bool {
        matches!(self, Self::Unidentified(_))
    }

    /// Get the inner error if this is an Inner variant.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Protocol status the adapter should answer with.
    ///
    /// Rate-limit rejections are always distinguishable from identity and
    /// service failures.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::RateLimited { .. } => STATUS_TOO_MANY_REQUESTS,
            Self::Unidentified(_) => STATUS_UNAUTHORIZED,
            Self::Inner(_) => STATUS_INTERNAL,
        }
    }
}

impl<E: fmt::Display> fmt::Display for AdmissionError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimited { endpoint } => write!(f, "rate limit exceeded for {}", endpoint),
            Self::Unidentified(e) => write!(f, "{}", e),
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for AdmissionError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Unidentified(e) => Some(e),
            Self::RateLimited { .. } => None,
        }
    }
}
