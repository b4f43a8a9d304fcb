//! gRPC channel connector for the authority's Unix domain socket endpoint.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint as TonicEndpoint, Uri};
use tower::service_fn;

use crate::error::AuthorityError;

const TONIC_DUMMY_URI: &str = "http://[::]:50051";

/// Connect to a Unix domain socket endpoint and return a `tonic` gRPC channel.
///
/// The URI passed to tonic is a placeholder; all traffic goes over the socket
/// at `path`.
///
/// ## Errors
///
/// Returns [`AuthorityError`] if the tonic endpoint could not be constructed
/// or the underlying connection fails.
pub async fn connect_unix(path: impl AsRef<Path>) -> Result<Channel, AuthorityError> {
    let path: Arc<PathBuf> = Arc::new(path.as_ref().to_path_buf());

    let channel = TonicEndpoint::try_from(TONIC_DUMMY_URI)?
        .connect_with_connector(service_fn(move |_: Uri| {
            let path = Arc::clone(&path);
            async move {
                let stream = UnixStream::connect(path.as_path()).await?;
                Ok::<_, std::io::Error>(TokioIo::new(stream))
            }
        }))
        .await?;

    Ok(channel)
}
