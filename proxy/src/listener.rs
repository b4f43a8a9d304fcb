//! Unix socket listener for local workload traffic.

use std::fs::Permissions;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use log::info;
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::server::UdsConnectInfo;

/// Binds the listening socket, replacing a stale socket file from a
/// previous run.
///
/// The socket is world-writable on purpose: any local process may
/// connect, and attestation of the connecting process decides what it
/// can reach.
pub fn bind(socket_path: &Path) -> io::Result<UnixListenerStream> {
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::remove_file(socket_path) {
        Ok(()) => info!("removed stale socket file {}", socket_path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    let listener = UnixListener::bind(socket_path)?;
    std::fs::set_permissions(socket_path, Permissions::from_mode(0o777))?;
    info!("listening on {}", socket_path.display());
    Ok(UnixListenerStream::new(listener))
}

/// Returns the process id of the connection's peer, taken from the
/// socket credentials the kernel attached at connect time.
pub fn peer_pid<T>(request: &tonic::Request<T>) -> Option<i32> {
    request
        .extensions()
        .get::<UdsConnectInfo>()
        .and_then(|info| info.peer_cred)
        .and_then(|cred| cred.pid())
}
