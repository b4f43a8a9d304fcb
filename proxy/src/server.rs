//! The forwarded demonstration service.

use std::sync::Arc;

use log::debug;
use tonic::{Request, Response, Status};

use crate::conn_cache::ConnCache;
use crate::listener;
use crate::pb::proxy::hello::v1::greeter_client::GreeterClient;
use crate::pb::proxy::hello::v1::greeter_server::{Greeter, GreeterServer};
use crate::pb::proxy::hello::v1::{HelloReply, HelloRequest};

/// Forwards greeting calls to the backend over the caller's mTLS
/// connection.
///
/// The service itself carries no identity logic. It asks the connection
/// cache for a channel on every call, so attestation, identity
/// resolution and connection reuse all happen in one place.
#[derive(Debug)]
pub struct GreeterService {
    conns: Arc<ConnCache>,
}

impl GreeterService {
    /// Creates the service on top of the given connection cache.
    #[must_use]
    pub fn new(conns: Arc<ConnCache>) -> Self {
        GreeterService { conns }
    }

    /// Wraps the service for registration with a tonic server.
    #[must_use]
    pub fn into_server(self) -> GreeterServer<GreeterService> {
        GreeterServer::new(self)
    }
}

#[tonic::async_trait]
impl Greeter for GreeterService {
    async fn say_hello(
        &self,
        request: Request<HelloRequest>,
    ) -> Result<Response<HelloReply>, Status> {
        let pid = listener::peer_pid(&request);
        debug!("forwarding SayHello for peer pid {pid:?}");

        let channel = self.conns.get(pid).await?;
        let mut client = GreeterClient::new(channel);
        client.say_hello(Request::new(request.into_inner())).await
    }
}
