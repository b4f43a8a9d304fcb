//! Mutual TLS client configuration and outbound dialing.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use log::warn;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{
    CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, TrustAnchor, UnixTime,
};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tonic::transport::Uri;
use tonic_rustls::channel::Channel;
use tonic_rustls::Endpoint;
use webpki::{anchor_from_trusted_cert, EndEntityCert, KeyUsage};

use crate::cert;
use crate::error::ProxyError;
use crate::identity::WorkloadIdentity;
use crate::trust_domain::TrustDomain;

const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

static CRYPTO_PROVIDER: OnceLock<()> = OnceLock::new();

/// Installs the ring crypto provider as the process default. Later calls
/// are no-ops, as is losing the install race to other code in the
/// process.
pub(crate) fn ensure_crypto_provider_installed() {
    CRYPTO_PROVIDER.get_or_init(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Verifies that the backend presents a certificate chaining to the
/// trust bundle's CAs and carrying an identity URI inside the expected
/// trust domain.
///
/// DNS name validation is skipped: backend identity lives in the URI
/// subject alternative name, not in the hostname.
pub(crate) struct TrustDomainServerVerifier {
    trust_anchors: Vec<TrustAnchor<'static>>,
    trust_domain: TrustDomain,
    crypto_provider: Arc<CryptoProvider>,
}

impl TrustDomainServerVerifier {
    pub(crate) fn new(
        trust_anchors: Vec<TrustAnchor<'static>>,
        trust_domain: TrustDomain,
    ) -> Result<Self, ProxyError> {
        let crypto_provider = CryptoProvider::get_default().cloned().ok_or_else(|| {
            ProxyError::Internal("no TLS crypto provider installed".to_string())
        })?;
        Ok(TrustDomainServerVerifier {
            trust_anchors,
            trust_domain,
            crypto_provider,
        })
    }

    fn verify_chain(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<(), rustls::Error> {
        let ee_cert = EndEntityCert::try_from(end_entity).map_err(|e| {
            warn!("failed to parse backend certificate: {e:?}");
            rustls::Error::InvalidCertificate(rustls::CertificateError::BadEncoding)
        })?;

        let intermediate_certs: Vec<CertificateDer<'static>> = intermediates
            .iter()
            .map(|c| CertificateDer::from(c.as_ref().to_vec()))
            .collect();

        let time = UnixTime::since_unix_epoch(Duration::from_secs(now.as_secs()));

        ee_cert
            .verify_for_usage(
                webpki::ALL_VERIFICATION_ALGS,
                &self.trust_anchors,
                &intermediate_certs,
                time,
                KeyUsage::server_auth(),
                None,
                None,
            )
            .map_err(|e| {
                warn!("backend certificate chain verification failed: {e:?}");
                rustls::Error::InvalidCertificate(rustls::CertificateError::BadSignature)
            })?;

        Ok(())
    }

    fn verify_peer_identity(&self, cert_der: &[u8]) -> Result<(), rustls::Error> {
        let uri = cert::identity_uri_san(cert_der)
            .map_err(|e| rustls::Error::General(format!("backend identity unreadable: {e}")))?
            .ok_or_else(|| {
                rustls::Error::General("backend certificate has no identity URI".to_string())
            })?;

        let domain_id = self.trust_domain.id_string();
        if uri == domain_id || uri.starts_with(&format!("{domain_id}/")) {
            Ok(())
        } else {
            Err(rustls::Error::General(format!(
                "backend identity {uri} is outside trust domain {}",
                self.trust_domain
            )))
        }
    }
}

impl std::fmt::Debug for TrustDomainServerVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustDomainServerVerifier")
            .field("trust_domain", &self.trust_domain)
            .field("trust_anchors_count", &self.trust_anchors.len())
            .finish()
    }
}

impl ServerCertVerifier for TrustDomainServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        self.verify_chain(end_entity, intermediates, now)?;
        self.verify_peer_identity(end_entity.as_ref())?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.crypto_provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.crypto_provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.crypto_provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Converts a concatenated DER CA bundle into owned trust anchors.
pub(crate) fn build_trust_anchors(bundle: &Bytes) -> Result<Vec<TrustAnchor<'static>>, ProxyError> {
    let certs = cert::split_der_certificates(bundle)
        .map_err(|e| ProxyError::Internal(format!("malformed trust bundle: {e}")))?;

    let mut anchors = Vec::with_capacity(certs.len());
    for der in &certs {
        let cert_der = CertificateDer::from(der.as_ref());
        let anchor = anchor_from_trusted_cert(&cert_der)
            .map_err(|e| ProxyError::Internal(format!("invalid trust anchor: {e:?}")))?;
        anchors.push(anchor.to_owned());
    }
    Ok(anchors)
}

/// Builds a rustls client config presenting the workload identity and
/// trusting the given CA bundle for the trust domain. ALPN is pinned to
/// HTTP/2 as required for gRPC.
pub(crate) fn client_config(
    identity: &WorkloadIdentity,
    bundle: &Bytes,
    trust_domain: &TrustDomain,
) -> Result<ClientConfig, ProxyError> {
    ensure_crypto_provider_installed();

    let anchors = build_trust_anchors(bundle)?;
    let verifier = TrustDomainServerVerifier::new(anchors, trust_domain.clone())?;

    let cert_chain: Vec<CertificateDer<'static>> = identity
        .cert_chain()
        .iter()
        .map(|der| CertificateDer::from(der.to_vec()))
        .collect();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(identity.private_key().to_vec()));

    let mut config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_client_auth_cert(cert_chain, key)
        .map_err(|e| ProxyError::Internal(format!("invalid client identity material: {e}")))?;
    config.alpn_protocols = vec![b"h2".to_vec()];
    Ok(config)
}

/// Dials the backend over mutual TLS, returning a multiplexed channel.
pub(crate) async fn dial_backend(
    backend: &Uri,
    config: ClientConfig,
) -> Result<Channel, ProxyError> {
    let endpoint = Endpoint::from(backend.clone())
        .connect_timeout(DIAL_TIMEOUT)
        .tls_config(config)
        .map_err(|e| ProxyError::Dial {
            backend: backend.to_string(),
            reason: e.to_string(),
        })?;

    endpoint.connect().await.map_err(|e| ProxyError::Dial {
        backend: backend.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ca_bundle() -> Bytes {
        let mut params = rcgen::CertificateParams::default();
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        Bytes::copy_from_slice(cert.der())
    }

    #[test]
    fn test_trust_anchors_from_bundle() {
        let bundle = ca_bundle();
        let anchors = build_trust_anchors(&bundle).unwrap();
        assert_eq!(anchors.len(), 1);
    }

    #[test]
    fn test_malformed_bundle_rejected() {
        let bundle = Bytes::from_static(b"not a certificate");
        assert!(matches!(
            build_trust_anchors(&bundle),
            Err(ProxyError::Internal(_))
        ));
    }

    #[test]
    fn test_peer_identity_checked_against_trust_domain() {
        ensure_crypto_provider_installed();
        let verifier = TrustDomainServerVerifier::new(
            Vec::new(),
            TrustDomain::new("example.org").unwrap(),
        )
        .unwrap();

        let in_domain = leaf_with_uri("spiffe://example.org/backend");
        assert!(verifier.verify_peer_identity(&in_domain).is_ok());

        let other_domain = leaf_with_uri("spiffe://other.org/backend");
        assert!(verifier.verify_peer_identity(&other_domain).is_err());
    }

    fn leaf_with_uri(uri: &str) -> Vec<u8> {
        let mut params = rcgen::CertificateParams::default();
        params.subject_alt_names = vec![rcgen::SanType::URI(
            rcgen::Ia5String::try_from(uri.to_string()).unwrap(),
        )];
        let key = rcgen::KeyPair::generate().unwrap();
        params.self_signed(&key).unwrap().der().to_vec()
    }
}
