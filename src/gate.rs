//! Pinning decision logic
//!
//! [`PinningGate::decide`] performs no I/O. The checks run in a fixed order:
//! handshake authorization first, then registry lookup, then comparison.
//! An unauthorized certificate is never trusted, even when its fingerprint
//! happens to match.

use tracing::debug;

use crate::error::{PinningError, PinningErrorKind};
use crate::registry::FingerprintRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Allow,
    RejectNoFingerprint,
    RejectMismatch,
    RejectUnauthorized,
}

impl Outcome {
    /// The error kind a rejecting outcome maps to
    pub fn error_kind(&self) -> Option<PinningErrorKind> {
        match self {
            Outcome::Allow => None,
            Outcome::RejectNoFingerprint => Some(PinningErrorKind::DomainInvalid),
            Outcome::RejectMismatch => Some(PinningErrorKind::FingerprintMismatch),
            Outcome::RejectUnauthorized => Some(PinningErrorKind::DomainNotAuthorized),
        }
    }
}

/// Result of evaluating one host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinningDecision {
    outcome: Outcome,
    host: String,
}

impl PinningDecision {
    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn is_allowed(&self) -> bool {
        self.outcome == Outcome::Allow
    }

    /// `Ok(())` for `Allow`, otherwise the matching pinning error
    pub fn into_result(self) -> Result<(), PinningError> {
        match self.outcome.error_kind() {
            None => Ok(()),
            Some(kind) => Err(PinningError::new(kind, self.host)),
        }
    }
}

/// Compares observed certificates against a [`FingerprintRegistry`]
#[derive(Debug, Clone)]
pub struct PinningGate {
    registry: FingerprintRegistry,
}

impl PinningGate {
    pub fn new(registry: FingerprintRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &FingerprintRegistry {
        &self.registry
    }

    /// Decide whether an exchange with `host` may proceed
    ///
    /// A missing `observed` fingerprint never equals a registered one.
    pub fn decide(
        &self,
        host: &str,
        handshake_authorized: bool,
        observed: Option<&str>,
    ) -> PinningDecision {
        let outcome = if !handshake_authorized {
            Outcome::RejectUnauthorized
        } else {
            match self.registry.lookup(host) {
                None => Outcome::RejectNoFingerprint,
                Some(expected) if observed != Some(expected.as_str()) => Outcome::RejectMismatch,
                Some(_) => Outcome::Allow,
            }
        };

        debug!(host = %host, outcome = ?outcome, "pinning decision");

        PinningDecision {
            outcome,
            host: host.to_string(),
        }
    }
}
