//! # certpin
//!
//! HTTPS client with per-domain certificate fingerprint pinning.
//!
//! A normal TLS client trusts any certificate that chains to a root in its
//! trust store. This crate additionally requires the certificate presented
//! for a host to match a fingerprint registered for that host, so a
//! mis-issued certificate or a compromised CA cannot be used to intercept
//! traffic.
//!
//! ## Decision Order
//!
//! For every exchange:
//! 1. The TLS handshake must be authorized by the trust store
//!    (`domain-not-authorized` otherwise)
//! 2. A fingerprint must be registered for the final host, exactly or via a
//!    single-level wildcard (`domain-invalid` otherwise)
//! 3. The peer certificate's fingerprint must equal the registered one
//!    (`domain-fingerprint-mismatch` otherwise)
//!
//! Redirects are followed by the client itself and every hop is checked
//! again. A rejected exchange is aborted before its body is read and
//! produces exactly one error.
//!
//! ## Fingerprints
//!
//! Fingerprints are SHA-1 digests of the certificate DER in OpenSSL's
//! format, so the output of
//! `openssl x509 -noout -fingerprint -sha1 -in cert.pem` can be registered
//! directly (the `SHA1 Fingerprint=` label is stripped).
//!
//! ## Example
//!
//! ```rust,ignore
//! use certpin::{FingerprintRegistry, PinnedClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), certpin::Error> {
//!     let registry = FingerprintRegistry::new();
//!     registry.register("example.com", "SHA1 Fingerprint=AB:CD:...")?;
//!     certpin::loader::load_dir(&registry, "/etc/certpin/fingerprints")?;
//!
//!     let client = PinnedClient::new(registry)?;
//!     let response = client.get("https://example.com/").await?;
//!     println!("{}", response.status());
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod gate;
pub mod interceptor;
pub mod loader;
pub mod registry;
pub mod tls;

pub use client::PinnedClient;
pub use config::PinningConfig;
pub use error::{Error, PinningError, PinningErrorKind, Result};
pub use gate::{Outcome, PinningDecision, PinningGate};
pub use interceptor::{AbortFlag, AbortHandle, Completion, Exchange, ExchangeEvent, Phase};
pub use registry::FingerprintRegistry;
