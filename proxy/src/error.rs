//! Error taxonomy for the proxy and its mapping to RPC status codes.

use thiserror::Error;
use tonic::Status;

use crate::attestor::AttestError;

/// Errors produced while resolving an outbound connection for a caller.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProxyError {
    /// The caller's process could not be attested.
    #[error(transparent)]
    Attestation(#[from] AttestError),

    /// The wait for a first identity exceeded the caller's deadline.
    #[error("timed out waiting for an identity for selectors [{key}]")]
    IdentityTimeout {
        /// Canonical selector key of the caller.
        key: String,
    },

    /// The identity subscription could not be opened or failed before
    /// delivering an identity.
    #[error("identity subscription for selectors [{key}] failed: {reason}")]
    IdentityFetch {
        /// Canonical selector key of the caller.
        key: String,
        /// Description of the underlying stream failure.
        reason: String,
    },

    /// The authority has no identity registered for the selector set.
    #[error("no identity issued for selectors [{key}]")]
    IdentityUnavailable {
        /// Canonical selector key of the caller.
        key: String,
    },

    /// The wait for the first trust bundle snapshot exceeded the caller's
    /// deadline.
    #[error("timed out waiting for the first trust bundle snapshot")]
    TrustBundleTimeout,

    /// The latest snapshot carries no bundle for the trust domain.
    #[error("no trust bundle for trust domain {trust_domain}")]
    TrustBundleMissing {
        /// Name of the trust domain that was looked up.
        trust_domain: String,
    },

    /// The outbound dial or TLS handshake failed.
    #[error("failed to dial backend {backend}: {reason}")]
    Dial {
        /// Backend address that was dialed.
        backend: String,
        /// Description of the dial failure.
        reason: String,
    },

    /// Missing caller context, malformed certificate data, or another
    /// condition that should not occur in a healthy deployment.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    pub(crate) fn from_lock_err<T>(err: std::sync::PoisonError<T>) -> Self {
        ProxyError::Internal(format!("lock poisoned: {err}"))
    }
}

/// Maps proxy failures to caller-visible status codes: attestation and
/// identity failures surface as `unauthenticated`, everything else as
/// `internal`.
impl From<ProxyError> for Status {
    fn from(err: ProxyError) -> Self {
        let message = err.to_string();
        match err {
            ProxyError::Attestation(_)
            | ProxyError::IdentityTimeout { .. }
            | ProxyError::IdentityFetch { .. }
            | ProxyError::IdentityUnavailable { .. } => Status::unauthenticated(message),
            ProxyError::TrustBundleTimeout
            | ProxyError::TrustBundleMissing { .. }
            | ProxyError::Dial { .. }
            | ProxyError::Internal(_) => Status::internal(message),
        }
    }
}
