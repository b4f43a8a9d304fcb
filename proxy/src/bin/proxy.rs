//! Proxy daemon entry point.

use std::path::Path;
use std::sync::Arc;

use authority_api::DelegatedAuthorityClient;
use identity_proxy::{
    listener, Config, ConnCache, GreeterService, TrustBundleCache, UnixAttestor,
    WorkloadIdentityCache,
};
use log::info;
use tokio::signal::unix::{signal, SignalKind};
use tonic::transport::Server;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config_path = std::env::args()
        .nth(1)
        .ok_or("usage: proxy <config.json>")?;
    let config = Config::load(Path::new(&config_path))?;
    info!(
        "forwarding {} to {} for trust domain {}",
        config.listen_socket_path.display(),
        config.backend,
        config.trust_domain
    );

    let client = match &config.authority_socket_path {
        Some(path) => DelegatedAuthorityClient::connect_to(path).await?,
        None => DelegatedAuthorityClient::connect_env().await?,
    };

    let bundles = Arc::new(TrustBundleCache::new(client.clone()));
    bundles.init()?;
    let identities = Arc::new(WorkloadIdentityCache::new(client));
    let conns = Arc::new(ConnCache::new(
        Arc::new(UnixAttestor::new()),
        Arc::clone(&identities),
        Arc::clone(&bundles),
        config.trust_domain.clone(),
        config.backend.clone(),
        config.request_timeout,
    ));

    let incoming = listener::bind(&config.listen_socket_path)?;
    let service = GreeterService::new(Arc::clone(&conns)).into_server();

    let mut sigterm = signal(SignalKind::terminate())?;
    let shutdown = async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        info!("shutdown signal received");
    };

    Server::builder()
        .add_service(service)
        .serve_with_incoming_shutdown(incoming, shutdown)
        .await?;

    conns.close()?;
    identities.shutdown();
    bundles.shutdown().await;
    let _ = std::fs::remove_file(&config.listen_socket_path);
    info!("proxy stopped");
    Ok(())
}
