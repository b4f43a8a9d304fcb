//! End-to-end forwarding: a local client calls the proxy over a Unix
//! socket and the proxy forwards to a TLS backend with the caller's
//! identity.

use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use authority_api::pb::authority::delegated::v1::delegated_authority_server::{
    DelegatedAuthority, DelegatedAuthorityServer,
};
use authority_api::pb::authority::delegated::v1::{
    SubscribeToX509BundlesRequest, SubscribeToX509BundlesResponse,
    SubscribeToX509IdentitiesRequest, SubscribeToX509IdentitiesResponse,
    X509Identity as ProtoX509Identity,
};
use authority_api::DelegatedAuthorityClient;
use bytes::Bytes;
use identity_proxy::pb::proxy::hello::v1::greeter_client::GreeterClient;
use identity_proxy::pb::proxy::hello::v1::greeter_server::{Greeter, GreeterServer};
use identity_proxy::pb::proxy::hello::v1::{HelloReply, HelloRequest};
use identity_proxy::{
    listener, ConnCache, GreeterService, TrustBundleCache, TrustDomain, UnixAttestor,
    WorkloadIdentityCache,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream, UnixListenerStream};
use tokio_stream::Stream;
use tonic::transport::{Server, Uri};
use tonic::{Request, Response, Status};

static SOCKET_COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_socket(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "{name}-{}-{}.sock",
        std::process::id(),
        SOCKET_COUNTER.fetch_add(1, Ordering::SeqCst)
    ))
}

/// Certificate authority and the leaves it issued for one test run.
struct TestPki {
    ca_der: Bytes,
    caller_identity: ProtoX509Identity,
    backend_cert: CertificateDer<'static>,
    backend_key: PrivateKeyDer<'static>,
}

fn build_pki(backend_uri_san: &str) -> TestPki {
    let ca_key = rcgen::KeyPair::generate().unwrap();
    let mut ca_params = rcgen::CertificateParams::default();
    ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    let ca_cert = ca_params.self_signed(&ca_key).unwrap();

    let caller_key = rcgen::KeyPair::generate().unwrap();
    let mut caller_params = rcgen::CertificateParams::default();
    caller_params.not_after = time::OffsetDateTime::now_utc() + time::Duration::hours(1);
    caller_params.subject_alt_names = vec![rcgen::SanType::URI(
        rcgen::Ia5String::try_from("spiffe://example.org/caller".to_string()).unwrap(),
    )];
    caller_params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ClientAuth];
    let caller_cert = caller_params
        .signed_by(&caller_key, &ca_cert, &ca_key)
        .unwrap();

    let backend_key = rcgen::KeyPair::generate().unwrap();
    let mut backend_params = rcgen::CertificateParams::default();
    backend_params.not_after = time::OffsetDateTime::now_utc() + time::Duration::hours(1);
    backend_params.subject_alt_names = vec![rcgen::SanType::URI(
        rcgen::Ia5String::try_from(backend_uri_san.to_string()).unwrap(),
    )];
    backend_params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ServerAuth];
    let backend_cert = backend_params
        .signed_by(&backend_key, &ca_cert, &ca_key)
        .unwrap();

    TestPki {
        ca_der: Bytes::copy_from_slice(ca_cert.der()),
        caller_identity: ProtoX509Identity {
            trust_domain: "example.org".to_string(),
            path: "/caller".to_string(),
            cert_chain: vec![Bytes::copy_from_slice(caller_cert.der())],
            key: Bytes::copy_from_slice(&caller_key.serialize_der()),
        },
        backend_cert: backend_cert.der().clone(),
        backend_key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(backend_key.serialize_der())),
    }
}

/// A static authority that serves one caller identity and one bundle
/// snapshot as soon as a subscription opens.
struct StaticAuthority {
    identity: ProtoX509Identity,
    bundle: HashMap<String, Bytes>,
    identity_senders:
        std::sync::Mutex<Vec<mpsc::Sender<Result<SubscribeToX509IdentitiesResponse, Status>>>>,
    bundle_senders:
        std::sync::Mutex<Vec<mpsc::Sender<Result<SubscribeToX509BundlesResponse, Status>>>>,
}

impl StaticAuthority {
    fn new(identity: ProtoX509Identity, bundle: HashMap<String, Bytes>) -> Self {
        StaticAuthority {
            identity,
            bundle,
            identity_senders: std::sync::Mutex::new(Vec::new()),
            bundle_senders: std::sync::Mutex::new(Vec::new()),
        }
    }
}

type ResponseStream<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send>>;

#[tonic::async_trait]
impl DelegatedAuthority for StaticAuthority {
    type SubscribeToX509IdentitiesStream = ResponseStream<SubscribeToX509IdentitiesResponse>;

    async fn subscribe_to_x509_identities(
        &self,
        _request: Request<SubscribeToX509IdentitiesRequest>,
    ) -> Result<Response<Self::SubscribeToX509IdentitiesStream>, Status> {
        let (tx, rx) = mpsc::channel(4);
        let _ = tx
            .send(Ok(SubscribeToX509IdentitiesResponse {
                identities: vec![self.identity.clone()],
            }))
            .await;
        // Keep the sender alive so the stream stays open after the first
        // message.
        self.identity_senders.lock().unwrap().push(tx);
        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    type SubscribeToX509BundlesStream = ResponseStream<SubscribeToX509BundlesResponse>;

    async fn subscribe_to_x509_bundles(
        &self,
        _request: Request<SubscribeToX509BundlesRequest>,
    ) -> Result<Response<Self::SubscribeToX509BundlesStream>, Status> {
        let (tx, rx) = mpsc::channel(4);
        let _ = tx
            .send(Ok(SubscribeToX509BundlesResponse {
                ca_certificates: self.bundle.clone(),
            }))
            .await;
        self.bundle_senders.lock().unwrap().push(tx);
        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}

struct BackendGreeter;

#[tonic::async_trait]
impl Greeter for BackendGreeter {
    async fn say_hello(
        &self,
        request: Request<HelloRequest>,
    ) -> Result<Response<HelloReply>, Status> {
        let name = request.into_inner().name;
        Ok(Response::new(HelloReply {
            message: format!("hello, {name}"),
        }))
    }
}

/// Starts the TLS backend, requiring and verifying client certificates
/// against the test CA. Returns the backend address.
async fn start_backend(pki: &TestPki) -> Uri {
    let mut roots = RootCertStore::empty();
    roots
        .add(CertificateDer::from(pki.ca_der.to_vec()))
        .unwrap();
    let client_verifier = WebPkiClientVerifier::builder(Arc::new(roots)).build().unwrap();

    let mut server_config = ServerConfig::builder()
        .with_client_cert_verifier(client_verifier)
        .with_single_cert(vec![pki.backend_cert.clone()], pki.backend_key.clone_key())
        .unwrap();
    server_config.alpn_protocols = vec![b"h2".to_vec()];

    let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = tcp.local_addr().unwrap();

    tokio::spawn(async move {
        tonic_rustls::Server::builder()
            .tls_config(server_config)
            .unwrap()
            .add_service(GreeterServer::new(BackendGreeter))
            .serve_with_incoming(TcpListenerStream::new(tcp))
            .await
            .unwrap();
    });

    format!("https://127.0.0.1:{}", addr.port())
        .parse()
        .unwrap()
}

/// Wires up authority, caches and the proxy service over a Unix socket.
/// Returns the proxy's socket path.
async fn start_proxy(pki: &TestPki, backend: Uri) -> PathBuf {
    let authority = Arc::new(StaticAuthority::new(
        pki.caller_identity.clone(),
        HashMap::from([("example.org".to_string(), pki.ca_der.clone())]),
    ));
    let authority_socket = unique_socket("static-authority");
    let authority_listener = UnixListener::bind(&authority_socket).unwrap();
    tokio::spawn(async move {
        Server::builder()
            .add_service(DelegatedAuthorityServer::from_arc(authority))
            .serve_with_incoming(UnixListenerStream::new(authority_listener))
            .await
            .unwrap();
    });

    let client = DelegatedAuthorityClient::connect_to(&authority_socket)
        .await
        .unwrap();
    let bundles = Arc::new(TrustBundleCache::new(client.clone()));
    bundles.init().unwrap();
    let identities = Arc::new(WorkloadIdentityCache::new(client));
    let conns = Arc::new(ConnCache::new(
        Arc::new(UnixAttestor::new()),
        identities,
        bundles,
        TrustDomain::new("example.org").unwrap(),
        backend,
        Duration::from_secs(5),
    ));

    let proxy_socket = unique_socket("proxy");
    let incoming = listener::bind(&proxy_socket).unwrap();
    tokio::spawn(async move {
        Server::builder()
            .add_service(GreeterService::new(conns).into_server())
            .serve_with_incoming(incoming)
            .await
            .unwrap();
    });
    proxy_socket
}

#[tokio::test]
async fn forwards_calls_over_mutual_tls() -> Result<(), Box<dyn std::error::Error>> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let pki = build_pki("spiffe://example.org/backend");
    let backend = start_backend(&pki).await;
    let proxy_socket = start_proxy(&pki, backend).await;

    let channel = authority_api::transport::connect_unix(&proxy_socket).await?;
    let mut client = GreeterClient::new(channel);

    let reply = client
        .say_hello(Request::new(HelloRequest {
            name: "world".to_string(),
        }))
        .await?
        .into_inner();
    assert_eq!(reply.message, "hello, world");

    // A second call travels over the same cached connection.
    let reply = client
        .say_hello(Request::new(HelloRequest {
            name: "again".to_string(),
        }))
        .await?
        .into_inner();
    assert_eq!(reply.message, "hello, again");
    Ok(())
}

#[tokio::test]
async fn rejects_a_backend_outside_the_trust_domain() -> Result<(), Box<dyn std::error::Error>> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let pki = build_pki("spiffe://other.org/backend");
    let backend = start_backend(&pki).await;
    let proxy_socket = start_proxy(&pki, backend).await;

    let channel = authority_api::transport::connect_unix(&proxy_socket).await?;
    let mut client = GreeterClient::new(channel);

    let status = client
        .say_hello(Request::new(HelloRequest {
            name: "world".to_string(),
        }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::Internal);
    Ok(())
}
