#![deny(missing_docs)]
#![warn(missing_debug_implementations)]

//! This library provides a client for the delegated identity authority gRPC
//! API: streaming X.509 identity issuance per workload selector set and
//! streaming trust bundle distribution.

pub mod pb;

pub mod client;
pub mod error;
pub mod selectors;
pub mod transport;

// Core crate types re-exported for simplified access.
pub use client::{DelegatedAuthorityClient, X509Identity, ADMIN_SOCKET_ENV};
pub use error::AuthorityError;
pub use selectors::{selectors_key, Selector, Unix};
