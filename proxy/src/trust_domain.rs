//! Validated trust domain names.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use thiserror::Error;

const VALID_TRUST_DOMAIN_CHARS: &str = "abcdefghijklmnopqrstuvwxyz0123456789-._";
const MAX_TRUST_DOMAIN_LENGTH: usize = 255;
const ID_SCHEME: &str = "spiffe";

/// Errors raised validating a trust domain name.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum TrustDomainError {
    /// The name is empty.
    #[error("trust domain is empty")]
    Empty,

    /// The name exceeds the maximum length.
    #[error("trust domain exceeds {MAX_TRUST_DOMAIN_LENGTH} characters")]
    TooLong,

    /// The name contains a character outside the allowed set.
    #[error("trust domain contains a character outside of [a-z0-9.-_]")]
    BadChar,
}

/// A namespace of cooperating identities sharing common roots of trust,
/// e.g. `example.org`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrustDomain {
    name: String,
}

impl TrustDomain {
    /// Validates and wraps a trust domain name.
    ///
    /// # Errors
    ///
    /// Returns [`TrustDomainError`] if the name is empty, too long, or
    /// contains a character outside of `[a-z0-9.-_]`.
    pub fn new(name: &str) -> Result<Self, TrustDomainError> {
        if name.is_empty() {
            return Err(TrustDomainError::Empty);
        }
        if name.len() > MAX_TRUST_DOMAIN_LENGTH {
            return Err(TrustDomainError::TooLong);
        }
        if name.chars().any(|c| !VALID_TRUST_DOMAIN_CHARS.contains(c)) {
            return Err(TrustDomainError::BadChar);
        }
        Ok(TrustDomain {
            name: name.to_string(),
        })
    }

    /// Returns the trust domain name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.name
    }

    /// Returns the identity URI of the trust domain itself,
    /// e.g. `spiffe://example.org`.
    #[must_use]
    pub fn id_string(&self) -> String {
        format!("{ID_SCHEME}://{}", self.name)
    }
}

impl Display for TrustDomain {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl AsRef<str> for TrustDomain {
    fn as_ref(&self) -> &str {
        self.name.as_str()
    }
}

impl FromStr for TrustDomain {
    type Err = TrustDomainError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        TrustDomain::new(name)
    }
}

impl TryFrom<&str> for TrustDomain {
    type Error = TrustDomainError;

    fn try_from(name: &str) -> Result<Self, Self::Error> {
        Self::new(name)
    }
}

impl TryFrom<String> for TrustDomain {
    type Error = TrustDomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_trust_domain() {
        let td = TrustDomain::new("example.org").unwrap();
        assert_eq!(td.as_str(), "example.org");
        assert_eq!(td.to_string(), "example.org");
        assert_eq!(td.id_string(), "spiffe://example.org");
    }

    #[test]
    fn test_empty_trust_domain() {
        assert_eq!(TrustDomain::new(""), Err(TrustDomainError::Empty));
    }

    #[test]
    fn test_uppercase_rejected() {
        assert_eq!(TrustDomain::new("Example.org"), Err(TrustDomainError::BadChar));
    }

    #[test]
    fn test_scheme_rejected() {
        assert_eq!(
            TrustDomain::new("spiffe://example.org"),
            Err(TrustDomainError::BadChar)
        );
    }

    #[test]
    fn test_too_long_rejected() {
        let name = "a".repeat(256);
        assert_eq!(TrustDomain::new(&name), Err(TrustDomainError::TooLong));
    }
}
