//! Error types for the pinning client
//!
//! [`PinningError`] is the caller-facing pinning taxonomy. Each variant
//! carries the host it was evaluated against and exposes a stable
//! [`PinningErrorKind`] identifier so callers can branch without matching
//! on message text.

use std::fmt;

use thiserror::Error;

/// Machine-checkable identifier of a pinning failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PinningErrorKind {
    /// No fingerprint is registered for the host
    DomainInvalid,
    /// The TLS stack refused the certificate chain
    DomainNotAuthorized,
    /// A fingerprint is registered but the peer presented a different one
    FingerprintMismatch,
}

impl PinningErrorKind {
    /// Stable identifier string, e.g. `domain-fingerprint-mismatch`
    pub fn as_str(&self) -> &'static str {
        match self {
            PinningErrorKind::DomainInvalid => "domain-invalid",
            PinningErrorKind::DomainNotAuthorized => "domain-not-authorized",
            PinningErrorKind::FingerprintMismatch => "domain-fingerprint-mismatch",
        }
    }
}

impl fmt::Display for PinningErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rejected exchange
///
/// Pinning failures are a hard stop: an exchange that produced one is
/// aborted and must not be retried as-is.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PinningError {
    #[error("No certificate fingerprint registered for domain {host}")]
    DomainInvalid { host: String },

    #[error("TLS handshake for domain {host} was not authorized")]
    DomainNotAuthorized { host: String },

    #[error("Certificate fingerprint for domain {host} does not match the registered fingerprint")]
    FingerprintMismatch { host: String },
}

impl PinningError {
    /// Build the error of the given kind for `host`
    pub fn new(kind: PinningErrorKind, host: impl Into<String>) -> Self {
        let host = host.into();
        match kind {
            PinningErrorKind::DomainInvalid => PinningError::DomainInvalid { host },
            PinningErrorKind::DomainNotAuthorized => PinningError::DomainNotAuthorized { host },
            PinningErrorKind::FingerprintMismatch => PinningError::FingerprintMismatch { host },
        }
    }

    pub fn kind(&self) -> PinningErrorKind {
        match self {
            PinningError::DomainInvalid { .. } => PinningErrorKind::DomainInvalid,
            PinningError::DomainNotAuthorized { .. } => PinningErrorKind::DomainNotAuthorized,
            PinningError::FingerprintMismatch { .. } => PinningErrorKind::FingerprintMismatch,
        }
    }

    pub fn host(&self) -> &str {
        match self {
            PinningError::DomainInvalid { host }
            | PinningError::DomainNotAuthorized { host }
            | PinningError::FingerprintMismatch { host } => host,
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Pinning(#[from] PinningError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Redirect limit of {0} exceeded")]
    TooManyRedirects(usize),

    #[error("Refusing to follow redirect to non-https URL {0}")]
    InsecureRedirect(String),

    #[error("Exchange ended without a result")]
    Aborted,
}

impl Error {
    /// The pinning kind, if this error is a pinning rejection
    pub fn pinning_kind(&self) -> Option<PinningErrorKind> {
        match self {
            Error::Pinning(e) => Some(e.kind()),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
