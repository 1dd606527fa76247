//! TLS certificate fingerprints and handshake observation
//!
//! Fingerprints use the format OpenSSL prints for `x509 -fingerprint`: the
//! SHA-1 digest of the full certificate DER, as upper-case hex pairs joined
//! by colons (`AB:CD:...`).

use std::error::Error as StdError;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use sha1::{Digest, Sha1};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Install aws-lc-rs as the process crypto provider unless one is already set
pub(crate) fn ensure_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

/// Compute the SHA-1 fingerprint of a DER-encoded certificate
pub fn cert_fingerprint(cert_der: &[u8]) -> Result<String> {
    use der::Decode;
    use x509_cert::Certificate;

    // Only hash things that actually are certificates
    Certificate::from_der(cert_der)
        .map_err(|e| Error::Tls(format!("Failed to parse certificate: {}", e)))?;

    Ok(format_fingerprint(&Sha1::digest(cert_der)))
}

/// `[0xab, 0x01]` → `AB:01`
pub fn format_fingerprint(digest: &[u8]) -> String {
    digest
        .iter()
        .map(|b| hex::encode_upper([*b]))
        .collect::<Vec<_>>()
        .join(":")
}

/// Certificate verifier that delegates chain validation to webpki and logs
/// the verdict
///
/// Pinning itself is not decided here. A refused chain ends the handshake
/// with `rustls::Error::InvalidCertificate`, which the client reads back
/// from the failed request (see [`is_untrusted_certificate`]) as the
/// handshake-authorization signal. The fingerprint comparison happens once
/// the response reveals the final host.
#[derive(Debug)]
pub struct ObservingVerifier {
    /// Standard certificate verifier for chain validation
    inner: Arc<rustls::client::WebPkiServerVerifier>,
}

impl ObservingVerifier {
    /// Trust the bundled webpki roots plus `extra_anchors`
    pub fn new(extra_anchors: &[CertificateDer<'static>]) -> Result<Self> {
        ensure_crypto_provider();

        let mut root_store = rustls::RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        for anchor in extra_anchors {
            root_store
                .add(anchor.clone())
                .map_err(|e| Error::Tls(format!("Invalid trust anchor: {}", e)))?;
        }

        let inner = rustls::client::WebPkiServerVerifier::builder(Arc::new(root_store))
            .build()
            .map_err(|e| Error::Tls(format!("Failed to build verifier: {}", e)))?;

        Ok(Self { inner })
    }
}

impl rustls::client::danger::ServerCertVerifier for ObservingVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        let verdict = self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        );

        let name = server_name.to_str();
        match &verdict {
            Ok(_) => debug!(server = %name, "certificate chain authorized"),
            Err(e) => warn!(server = %name, error = %e, "certificate chain not authorized"),
        }
        verdict
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Whether a failed request was refused because its certificate chain was
/// not trusted
///
/// rustls reports the failure through an `io::Error` wrapper, whose
/// `source()` skips the wrapped error, so each `io::Error` in the chain is
/// unwrapped explicitly.
pub fn is_untrusted_certificate(err: &reqwest::Error) -> bool {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        if is_certificate_rejection(e) {
            return true;
        }
        if let Some(inner) = e
            .downcast_ref::<std::io::Error>()
            .and_then(|io| io.get_ref())
        {
            if is_certificate_rejection(inner) {
                return true;
            }
        }
        current = e.source();
    }
    false
}

fn is_certificate_rejection(e: &(dyn StdError + 'static)) -> bool {
    matches!(
        e.downcast_ref::<rustls::Error>(),
        Some(rustls::Error::InvalidCertificate(_) | rustls::Error::NoCertificatesPresented)
    )
}

/// Fingerprint of the leaf certificate a response's connection presented
///
/// Requires a client built with `tls_info(true)`.
pub fn peer_fingerprint(response: &reqwest::Response) -> Option<String> {
    let info = response.extensions().get::<reqwest::tls::TlsInfo>()?;
    let der = info.peer_certificate()?;
    match cert_fingerprint(der) {
        Ok(fp) => Some(fp),
        Err(e) => {
            warn!(url = %response.url(), error = %e, "could not fingerprint peer certificate");
            None
        }
    }
}
