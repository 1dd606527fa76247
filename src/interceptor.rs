//! Handshake interception and the single-fire completion latch
//!
//! An [`Exchange`] tracks one in-flight request. The transport feeds it two
//! kinds of signal:
//!
//! - [`Exchange::on_handshake`] once per TLS session, before any data is
//!   readable. An unauthorized session rejects immediately.
//! - [`Exchange::on_response`] once per HTTP response, including every
//!   redirect hop. The final host of the hop is checked against the
//!   registry. `Allow` on a hop is not terminal; the next hop is checked
//!   again.
//!
//! The exchange moves `Pending → {Allowed | Failed | Rejected}` and never
//! leaves a terminal phase. Whatever order or number of signals arrive, the
//! caller's completion handler runs at most once. When no handler was
//! supplied, the outcome is published as an [`ExchangeEvent`] instead.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use reqwest::Url;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{Error, PinningError, PinningErrorKind, Result};
use crate::gate::PinningGate;
use crate::registry::normalize_host;

/// Caller-supplied completion handler
pub type Completion<T> = Box<dyn FnOnce(Result<T>) + Send>;

/// Cancels the transport side of an exchange
///
/// Implementations must tolerate being called more than once.
pub trait AbortHandle: Send + Sync {
    fn abort(&self);
}

/// [`AbortHandle`] backed by a shared flag the transport polls
#[derive(Debug, Clone, Default)]
pub struct AbortFlag(Arc<AtomicBool>);

impl AbortFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

impl AbortHandle for AbortFlag {
    fn abort(&self) {
        if !self.0.swap(true, Ordering::AcqRel) {
            debug!("exchange aborted");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Pending,
    /// The transport delivered a response
    Allowed,
    /// The transport failed for a reason unrelated to pinning
    Failed,
    Rejected(PinningErrorKind),
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Phase::Pending)
    }
}

/// Published on the exchange's event channel when no completion handler exists
///
/// Exactly one event is sent per exchange. The delivered value itself is
/// not carried: without a handler there is nobody to hand it to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeEvent {
    /// The transport delivered a result and every hop passed
    Completed,
    /// The exchange ended on an error unrelated to pinning
    Failed(String),
    Rejected(PinningError),
}

#[derive(Debug, Clone)]
pub struct ExchangeState {
    requested_url: Url,
    resolved_host: Option<String>,
    completion_fired: bool,
    phase: Phase,
}

impl ExchangeState {
    pub fn requested_url(&self) -> &Url {
        &self.requested_url
    }

    /// Host of the most recent response; the last hop is authoritative
    pub fn resolved_host(&self) -> Option<&str> {
        self.resolved_host.as_deref()
    }

    pub fn completion_fired(&self) -> bool {
        self.completion_fired
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }
}

/// One pinned request, from first handshake to completion
pub struct Exchange<T> {
    state: ExchangeState,
    gate: PinningGate,
    abort: Arc<dyn AbortHandle>,
    completion: Option<Completion<T>>,
    events: mpsc::UnboundedSender<ExchangeEvent>,
    rejection: Option<PinningError>,
}

impl<T> Exchange<T> {
    /// Start tracking a request for `requested_url`
    ///
    /// Returns the exchange and the receiving end of its event channel.
    pub fn new(
        requested_url: Url,
        gate: PinningGate,
        abort: Arc<dyn AbortHandle>,
        completion: Option<Completion<T>>,
    ) -> (Self, mpsc::UnboundedReceiver<ExchangeEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let exchange = Self {
            state: ExchangeState {
                requested_url,
                resolved_host: None,
                completion_fired: false,
                phase: Phase::Pending,
            },
            gate,
            abort,
            completion,
            events,
            rejection: None,
        };
        (exchange, receiver)
    }

    pub fn state(&self) -> &ExchangeState {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        self.state.phase
    }

    /// The error that rejected this exchange, if any
    pub fn rejection(&self) -> Option<&PinningError> {
        self.rejection.as_ref()
    }

    /// Handshake-authorization signal for a TLS session with `host`
    pub fn on_handshake(&mut self, host: &str, authorized: bool) -> Phase {
        if self.state.phase.is_terminal() {
            return self.state.phase;
        }

        if !authorized {
            let host = normalize_host(host).unwrap_or_else(|| host.to_string());
            self.reject(PinningError::DomainNotAuthorized { host });
        }
        self.state.phase
    }

    /// Response signal for one hop, with the hop's final URL and the
    /// fingerprint of the certificate its connection presented
    pub fn on_response(&mut self, final_url: &Url, peer_fingerprint: Option<&str>) -> Phase {
        if self.state.phase.is_terminal() {
            return self.state.phase;
        }

        let host = normalize_host(final_url.as_str()).unwrap_or_default();
        self.state.resolved_host = Some(host.clone());

        let decision = self.gate.decide(&host, true, peer_fingerprint);
        if let Err(error) = decision.into_result() {
            self.reject(error);
        }
        self.state.phase
    }

    /// Normal completion from the transport
    ///
    /// Ignored once the exchange is terminal, so a transport result that
    /// races a rejection never reaches the caller. Returns whether the
    /// result was delivered.
    pub fn complete(&mut self, result: Result<T>) -> bool {
        if self.state.phase.is_terminal() {
            return false;
        }

        self.state.phase = match &result {
            Ok(_) => Phase::Allowed,
            Err(Error::Pinning(e)) => Phase::Rejected(e.kind()),
            Err(_) => Phase::Failed,
        };
        self.fire(result)
    }

    fn reject(&mut self, error: PinningError) {
        warn!(host = %error.host(), kind = %error.kind(), "pinning rejected exchange");

        self.state.phase = Phase::Rejected(error.kind());
        self.abort.abort();
        self.rejection = Some(error.clone());
        self.fire(Err(Error::Pinning(error)));
    }

    fn fire(&mut self, result: Result<T>) -> bool {
        if self.state.completion_fired {
            return false;
        }
        self.state.completion_fired = true;

        match self.completion.take() {
            Some(handler) => handler(result),
            None => {
                let event = match result {
                    Ok(_) => ExchangeEvent::Completed,
                    Err(Error::Pinning(error)) => ExchangeEvent::Rejected(error),
                    Err(e) => ExchangeEvent::Failed(e.to_string()),
                };
                // Nobody may be listening; a rejection stays readable via `rejection()`
                let _ = self.events.send(event);
            }
        }
        true
    }
}

impl<T> fmt::Debug for Exchange<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exchange")
            .field("state", &self.state)
            .field("has_completion", &self.completion.is_some())
            .field("rejection", &self.rejection)
            .finish()
    }
}
