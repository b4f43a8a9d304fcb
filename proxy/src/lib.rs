//! Identity-aware mTLS forwarding proxy for local workloads.
//!
//! Local processes connect over a Unix socket and speak plain gRPC. For
//! every call the proxy attests the calling process, resolves an X.509
//! identity for its selectors from a delegated authority, and forwards
//! the call to a fixed backend over a mutually authenticated TLS
//! connection presenting that identity.
//!
//! Identity material is pushed, not polled: the proxy holds two
//! server-streaming subscriptions against the authority, one per caller
//! selector set for identities and one for trust bundle snapshots.
//! Certificates rotate underneath cached connections, which are rebuilt
//! shortly before their client certificate expires.

#![deny(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod attestor;
pub mod bundle_cache;
pub mod cert;
pub mod config;
pub mod conn_cache;
pub mod error;
pub mod identity;
pub mod identity_cache;
pub mod listener;
mod mtls;
pub mod pb;
pub mod server;
pub mod trust_domain;

pub use attestor::{AttestError, UnixAttestor, WorkloadAttestor};
pub use bundle_cache::TrustBundleCache;
pub use cert::CertError;
pub use config::{Config, ConfigError};
pub use conn_cache::{BackendChannel, ConnCache, DialRequest, Dialer};
pub use error::ProxyError;
pub use identity::{IdentityError, WorkloadIdentity};
pub use identity_cache::WorkloadIdentityCache;
pub use server::GreeterService;
pub use trust_domain::{TrustDomain, TrustDomainError};
