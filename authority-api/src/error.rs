//! Errors returned by the delegated authority client.

use thiserror::Error;

/// Errors that may arise connecting to or consuming the authority API.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AuthorityError {
    /// The environment variable holding the endpoint socket path is not set.
    #[error("authority endpoint socket path is not set in the environment")]
    MissingEndpointSocket,

    /// The transport layer failed to establish or maintain the connection.
    #[error("cannot establish connection to the authority: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// The authority returned an error status.
    #[error("error response from the authority: {0}")]
    Grpc(#[from] tonic::Status),

    /// A response that was expected to carry at least one identity was empty.
    #[error("authority response contained no identity")]
    EmptyResponse,

    /// An identity in a response is missing required fields.
    #[error("malformed identity in authority response: {0}")]
    MalformedIdentity(&'static str),
}
