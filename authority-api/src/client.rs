//! Delegated identity authority client.
//!
//! Notes:
//! - This API must be used over the authority's **admin** socket, which is
//!   reachable only by the local delegate. Callers present already-attested
//!   selectors; the authority does not attest processes itself.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio_stream::{Stream, StreamExt};

use crate::error::AuthorityError;
use crate::pb::authority::delegated::v1::delegated_authority_client::DelegatedAuthorityClient as DelegatedAuthorityApiClient;
use crate::pb::authority::delegated::v1::{
    SubscribeToX509BundlesRequest, SubscribeToX509BundlesResponse,
    SubscribeToX509IdentitiesRequest, SubscribeToX509IdentitiesResponse,
    X509Identity as ProtoX509Identity,
};
use crate::selectors::Selector;

/// Name of the environment variable that holds the default authority socket path.
pub const ADMIN_SOCKET_ENV: &str = "AUTHORITY_ADMIN_ENDPOINT_SOCKET";

/// Load the admin endpoint socket path from the environment.
///
/// ## Errors
///
/// Returns [`AuthorityError::MissingEndpointSocket`] if the environment
/// variable is not set.
pub fn admin_socket_from_env() -> Result<PathBuf, AuthorityError> {
    let raw = std::env::var(ADMIN_SOCKET_ENV).map_err(|_| AuthorityError::MissingEndpointSocket)?;
    Ok(PathBuf::from(raw))
}

/// An X.509 identity document delivered by the authority, in raw DER form.
///
/// Certificate parsing is left to the consumer; this type only guarantees the
/// chain and key are present.
#[derive(Debug, Clone)]
pub struct X509Identity {
    /// Trust domain the identity belongs to.
    pub trust_domain: String,
    /// Path component of the workload identity.
    pub path: String,
    /// DER encoded certificates, leaf first.
    pub cert_chain: Vec<Bytes>,
    /// DER encoded PKCS#8 private key for the leaf.
    pub key: Bytes,
}

impl TryFrom<ProtoX509Identity> for X509Identity {
    type Error = AuthorityError;

    fn try_from(proto: ProtoX509Identity) -> Result<Self, Self::Error> {
        if proto.cert_chain.is_empty() {
            return Err(AuthorityError::MalformedIdentity("empty certificate chain"));
        }
        if proto.key.is_empty() {
            return Err(AuthorityError::MalformedIdentity("empty private key"));
        }
        Ok(Self {
            trust_domain: proto.trust_domain,
            path: proto.path,
            cert_chain: proto.cert_chain,
            key: proto.key,
        })
    }
}

/// Client for the `DelegatedAuthority` API.
#[derive(Debug, Clone)]
pub struct DelegatedAuthorityClient {
    client: DelegatedAuthorityApiClient<tonic::transport::Channel>,
}

/// Constructors
impl DelegatedAuthorityClient {
    /// Create a client by connecting to the authority socket at the given path.
    ///
    /// # Errors
    ///
    /// Returns [`AuthorityError`] if the connection cannot be established.
    pub async fn connect_to(path: impl AsRef<Path>) -> Result<Self, AuthorityError> {
        let channel = crate::transport::connect_unix(path).await?;
        Ok(Self::new(channel))
    }

    /// Create a client using the socket path from the [`ADMIN_SOCKET_ENV`]
    /// environment variable.
    ///
    /// # Errors
    ///
    /// Returns [`AuthorityError`] if the environment variable is not set or
    /// the connection cannot be established.
    pub async fn connect_env() -> Result<Self, AuthorityError> {
        let path = admin_socket_from_env()?;
        Self::connect_to(path).await
    }

    /// Creates a new [`DelegatedAuthorityClient`] from an established gRPC channel.
    ///
    /// This constructor does not perform any network I/O.
    #[must_use]
    pub fn new(conn: tonic::transport::Channel) -> Self {
        DelegatedAuthorityClient {
            client: DelegatedAuthorityApiClient::new(conn),
        }
    }
}

impl DelegatedAuthorityClient {
    /// Watches the stream of X.509 identity updates for a selector set.
    ///
    /// Each stream item carries the full list of identities currently issued
    /// for the selectors; the first entry is the default identity. The list
    /// may legitimately be empty if the authority has nothing registered for
    /// the selector set.
    ///
    /// # Errors
    ///
    /// Returns [`AuthorityError`] if the subscription cannot be opened.
    /// Individual stream items are errors if a response is malformed or the
    /// stream fails mid-flight.
    pub async fn stream_x509_identities(
        &self,
        selectors: Vec<Selector>,
    ) -> Result<
        impl Stream<Item = Result<Vec<X509Identity>, AuthorityError>> + Send + 'static,
        AuthorityError,
    > {
        let request = SubscribeToX509IdentitiesRequest {
            selectors: selectors.into_iter().map(Into::into).collect(),
        };

        let response = self
            .client
            .clone()
            .subscribe_to_x509_identities(request)
            .await?;

        let stream = response.into_inner().map(|message| {
            message
                .map_err(AuthorityError::from)
                .and_then(parse_identities_from_response)
        });

        Ok(stream)
    }

    /// Watches the stream of trust bundle updates.
    ///
    /// Each stream item is a complete snapshot mapping trust domain names to
    /// concatenated DER CA certificates; consumers replace, not merge.
    ///
    /// # Errors
    ///
    /// Returns [`AuthorityError`] if the subscription cannot be opened.
    /// Individual stream items are errors if the stream fails mid-flight.
    pub async fn stream_x509_bundles(
        &self,
    ) -> Result<
        impl Stream<Item = Result<HashMap<String, Bytes>, AuthorityError>> + Send + 'static,
        AuthorityError,
    > {
        let request = SubscribeToX509BundlesRequest::default();

        let response = self
            .client
            .clone()
            .subscribe_to_x509_bundles(request)
            .await?;

        Ok(response.into_inner().map(|msg| {
            msg.map_err(AuthorityError::from)
                .map(parse_bundles_from_response)
        }))
    }
}

fn parse_identities_from_response(
    response: SubscribeToX509IdentitiesResponse,
) -> Result<Vec<X509Identity>, AuthorityError> {
    response
        .identities
        .into_iter()
        .map(X509Identity::try_from)
        .collect()
}

fn parse_bundles_from_response(response: SubscribeToX509BundlesResponse) -> HashMap<String, Bytes> {
    response.ca_certificates
}
