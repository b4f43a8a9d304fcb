//! In-memory representation of a workload's X.509 identity.

use std::fmt;

use bytes::Bytes;
use thiserror::Error;
use time::OffsetDateTime;
use zeroize::Zeroizing;

use crate::cert::{self, CertError};

/// Errors raised converting authority identity material into a usable
/// workload identity.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum IdentityError {
    /// The identity carries no certificates.
    #[error("identity has an empty certificate chain")]
    EmptyChain,

    /// The leaf certificate could not be parsed.
    #[error(transparent)]
    Certificate(#[from] CertError),
}

/// An X.509 identity document for one workload: a certificate chain with
/// the leaf first, plus the leaf's private key.
///
/// The leaf's `NotAfter` instant is parsed once at construction so expiry
/// checks never re-parse DER.
pub struct WorkloadIdentity {
    trust_domain: String,
    path: String,
    cert_chain: Vec<Bytes>,
    private_key: Zeroizing<Vec<u8>>,
    not_after: OffsetDateTime,
}

impl WorkloadIdentity {
    /// Builds a workload identity from authority identity material,
    /// parsing the leaf certificate to capture its expiration.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError`] if the chain is empty or the leaf
    /// certificate cannot be parsed.
    pub fn from_authority(identity: authority_api::X509Identity) -> Result<Self, IdentityError> {
        let leaf = identity
            .cert_chain
            .first()
            .ok_or(IdentityError::EmptyChain)?;
        let not_after = cert::not_after(leaf)?;

        Ok(WorkloadIdentity {
            trust_domain: identity.trust_domain,
            path: identity.path,
            cert_chain: identity.cert_chain,
            private_key: Zeroizing::new(identity.key.to_vec()),
            not_after,
        })
    }

    /// Returns the trust domain name the identity belongs to.
    #[must_use]
    pub fn trust_domain(&self) -> &str {
        &self.trust_domain
    }

    /// Returns the path component of the identity, unique within its
    /// trust domain.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the identity URI, e.g. `spiffe://example.org/service`.
    #[must_use]
    pub fn uri(&self) -> String {
        if self.path.starts_with('/') {
            format!("spiffe://{}{}", self.trust_domain, self.path)
        } else {
            format!("spiffe://{}/{}", self.trust_domain, self.path)
        }
    }

    /// Returns the DER-encoded certificate chain, leaf first.
    #[must_use]
    pub fn cert_chain(&self) -> &[Bytes] {
        &self.cert_chain
    }

    /// Returns the DER-encoded leaf certificate.
    #[must_use]
    pub fn leaf(&self) -> &Bytes {
        &self.cert_chain[0]
    }

    /// Returns the PKCS#8 DER-encoded private key of the leaf.
    #[must_use]
    pub fn private_key(&self) -> &[u8] {
        &self.private_key
    }

    /// Returns the expiration instant of the leaf certificate.
    #[must_use]
    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }

    /// Reports whether the leaf certificate has expired at the given
    /// instant.
    #[must_use]
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        now >= self.not_after
    }
}

impl fmt::Debug for WorkloadIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkloadIdentity")
            .field("trust_domain", &self.trust_domain)
            .field("path", &self.path)
            .field("cert_chain_len", &self.cert_chain.len())
            .field("private_key", &"<redacted>")
            .field("not_after", &self.not_after)
            .finish()
    }
}
