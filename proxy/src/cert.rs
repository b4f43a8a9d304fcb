//! DER certificate parsing helpers.

use bytes::Bytes;
use thiserror::Error;
use time::OffsetDateTime;
use x509_parser::certificate::X509Certificate;
use x509_parser::error::X509Error;
use x509_parser::extensions::ParsedExtension;
use x509_parser::nom::Err;
use x509_parser::oid_registry;
use x509_parser::prelude::GeneralName;

const MAX_URI_SAN_ENTRIES: usize = 32;
const MAX_URI_LENGTH: usize = 2048;

const ID_SCHEME_PREFIX: &str = "spiffe://";

/// Errors raised parsing DER certificate material.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CertError {
    /// The bytes are not a parseable DER-encoded X.509 certificate.
    #[error("failed to parse X.509 certificate: {0}")]
    ParseX509Certificate(#[from] X509Error),

    /// The certificate carries no subject alternative name extension.
    #[error("certificate has no subject alternative name extension")]
    MissingSubjectAltName,

    /// A certificate URI SAN list is larger than allowed.
    #[error("too many URI SAN entries in certificate (max {max})")]
    TooManyUriSanEntries {
        /// The enforced maximum.
        max: usize,
    },
}

/// Takes a concatenated list of DER-encoded certificates and splits it into
/// the individual certificates' original DER bytes.
///
/// Intended for trust bundles, which may legitimately contain many trust
/// anchors; no length limit is enforced.
pub(crate) fn split_der_certificates(cert_list_der: &[u8]) -> Result<Vec<Bytes>, CertError> {
    let mut rest = cert_list_der;
    let mut certs = Vec::new();

    while !rest.is_empty() {
        let (new_rest, _cert) = x509_parser::parse_x509_certificate(rest).map_err(map_nom_err)?;

        // Extract the certificate bytes from the original input by calculating
        // the length of the certificate that was just parsed.
        let cert_len = rest.len() - new_rest.len();
        certs.push(Bytes::copy_from_slice(&rest[..cert_len]));

        rest = new_rest;
    }

    Ok(certs)
}

/// Parses the given DER-encoded bytes as an X.509 certificate.
pub(crate) fn parse_der_encoded_bytes_as_x509_certificate(
    der_bytes: &[u8],
) -> Result<X509Certificate<'_>, CertError> {
    match x509_parser::parse_x509_certificate(der_bytes) {
        Ok((_, cert)) => Ok(cert),
        Err(e) => Err(map_nom_err(e)),
    }
}

/// Returns the expiration instant (`NotAfter`) of a DER-encoded certificate.
pub(crate) fn not_after(der_bytes: &[u8]) -> Result<OffsetDateTime, CertError> {
    let cert = parse_der_encoded_bytes_as_x509_certificate(der_bytes)?;
    Ok(cert.validity().not_after.to_datetime())
}

/// Returns the first `spiffe://` URI subject alternative name of a
/// DER-encoded certificate, if any.
pub(crate) fn identity_uri_san(der_bytes: &[u8]) -> Result<Option<String>, CertError> {
    let cert = parse_der_encoded_bytes_as_x509_certificate(der_bytes)?;

    let ext = cert
        .tbs_certificate
        .get_extension_unique(&oid_registry::OID_X509_EXT_SUBJECT_ALT_NAME)?
        .ok_or(CertError::MissingSubjectAltName)?;

    let san = match ext.parsed_extension() {
        ParsedExtension::SubjectAlternativeName(s) => s,
        _ => return Err(CertError::MissingSubjectAltName),
    };

    let mut uri_count = 0usize;
    for name in &san.general_names {
        let uri = match name {
            GeneralName::URI(u) => *u,
            _ => continue,
        };

        uri_count += 1;
        if uri_count > MAX_URI_SAN_ENTRIES {
            return Err(CertError::TooManyUriSanEntries {
                max: MAX_URI_SAN_ENTRIES,
            });
        }

        // Skip large junk without allocating.
        if uri.len() > MAX_URI_LENGTH {
            continue;
        }

        if uri.starts_with(ID_SCHEME_PREFIX) {
            return Ok(Some(uri.to_string()));
        }
    }

    Ok(None)
}

fn map_nom_err(e: Err<X509Error>) -> CertError {
    match e {
        Err::Incomplete(_) => CertError::ParseX509Certificate(X509Error::InvalidCertificate),
        Err::Error(err) | Err::Failure(err) => CertError::ParseX509Certificate(err),
    }
}
