//! Configuration for the pinned client.

use std::time::Duration;

use rustls::pki_types::CertificateDer;

use crate::error::{Error, Result};

/// Default secure protocol: negotiate any version rustls supports
pub const DEFAULT_SECURE_PROTOCOL: &str = "TLS_method";

/// Configuration for [`PinnedClient`](crate::PinnedClient).
#[derive(Debug, Clone)]
pub struct PinningConfig {
    /// Secure protocol name threaded into every exchange's TLS settings.
    pub secure_protocol: String,
    /// Redirect hops followed before giving up.
    pub max_redirects: usize,
    /// Total request timeout, enforced by the transport.
    pub timeout: Duration,
    /// User-Agent header.
    pub user_agent: String,
    /// Roots trusted in addition to the bundled webpki roots, e.g. a
    /// private CA or a self-signed server certificate.
    pub trust_anchors: Vec<CertificateDer<'static>>,
}

impl Default for PinningConfig {
    fn default() -> Self {
        Self {
            secure_protocol: DEFAULT_SECURE_PROTOCOL.into(),
            max_redirects: 10,
            timeout: Duration::from_secs(30),
            user_agent: format!("certpin/{}", env!("CARGO_PKG_VERSION")),
            trust_anchors: Vec::new(),
        }
    }
}

static ANY_VERSION: &[&rustls::SupportedProtocolVersion] =
    &[&rustls::version::TLS13, &rustls::version::TLS12];
static TLS12_ONLY: &[&rustls::SupportedProtocolVersion] = &[&rustls::version::TLS12];
static TLS13_ONLY: &[&rustls::SupportedProtocolVersion] = &[&rustls::version::TLS13];

/// Map an OpenSSL-style protocol name onto rustls protocol versions
///
/// Accepts the method names OpenSSL uses (`TLSv1_2_method`) as well as the
/// dotted forms (`TLSv1.2`).
pub fn protocol_versions(name: &str) -> Result<&'static [&'static rustls::SupportedProtocolVersion]> {
    match name.trim() {
        "TLS_method" | "SSLv23_method" | "TLS" => Ok(ANY_VERSION),
        "TLSv1_2_method" | "TLSv1.2" => Ok(TLS12_ONLY),
        "TLSv1_3_method" | "TLSv1.3" => Ok(TLS13_ONLY),
        other => Err(Error::Tls(format!("Unsupported secure protocol: {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_protocol_is_supported() {
        let config = PinningConfig::default();
        assert_eq!(protocol_versions(&config.secure_protocol).unwrap().len(), 2);
        assert!(config.user_agent.starts_with("certpin/"));
        assert!(config.trust_anchors.is_empty());
    }

    #[test]
    fn test_protocol_names() {
        assert_eq!(protocol_versions("TLSv1_2_method").unwrap().len(), 1);
        assert_eq!(protocol_versions("TLSv1.3").unwrap().len(), 1);
        assert_eq!(protocol_versions("SSLv23_method").unwrap().len(), 2);
        assert!(matches!(protocol_versions("SSLv3_method"), Err(Error::Tls(_))));
    }
}
