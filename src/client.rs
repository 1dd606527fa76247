//! Pinned HTTPS client
//!
//! [`PinnedClient`] is the transport side of an [`Exchange`]: it issues
//! requests through reqwest with an [`ObservingVerifier`], reports each
//! handshake verdict and each response hop to the exchange, and follows
//! redirects itself so that every hop's host is checked against the
//! registry before anything is handed to the caller.

use std::sync::{Arc, Mutex, PoisonError};

use reqwest::header::{
    AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, LOCATION, PROXY_AUTHORIZATION,
};
use reqwest::{Method, Request, Response, StatusCode, Url};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::{protocol_versions, PinningConfig};
use crate::error::{Error, Result};
use crate::gate::PinningGate;
use crate::interceptor::{AbortFlag, Completion, Exchange, ExchangeEvent};
use crate::registry::{normalize_host, FingerprintRegistry};
use crate::tls::{self, ObservingVerifier};

/// HTTPS client that only delivers responses whose certificates match the
/// fingerprints registered for their hosts
///
/// Every hop of a redirect chain is checked. A rejected exchange is aborted
/// before its body is read and yields exactly one
/// [`Error::Pinning`](crate::Error::Pinning).
pub struct PinnedClient {
    registry: FingerprintRegistry,
    config: PinningConfig,

    /// Transport for `config`, or why it could not be built
    http: std::result::Result<reqwest::Client, String>,

    /// Host of the most recent HTTPS attempt, kept for tests
    last_attempted_host: Mutex<Option<String>>,
}

impl PinnedClient {
    /// Create a client with default configuration
    pub fn new(registry: FingerprintRegistry) -> Result<Self> {
        Self::with_config(registry, PinningConfig::default())
    }

    /// Create a client; fails if `config` cannot produce a transport
    pub fn with_config(registry: FingerprintRegistry, config: PinningConfig) -> Result<Self> {
        let http = build_http_client(&config)?;

        Ok(Self {
            registry,
            config,
            http: Ok(http),
            last_attempted_host: Mutex::new(None),
        })
    }

    pub fn registry(&self) -> &FingerprintRegistry {
        &self.registry
    }

    pub fn config(&self) -> &PinningConfig {
        &self.config
    }

    pub fn register_fingerprint(&self, domain_or_url: &str, fingerprint_text: &str) -> Result<()> {
        self.registry.register(domain_or_url, fingerprint_text)
    }

    pub fn unregister_fingerprint(&self, domain_or_url: &str) {
        self.registry.unregister(domain_or_url)
    }

    pub fn clear_all_fingerprints(&self) {
        self.registry.clear_all()
    }

    pub fn lookup_fingerprint(&self, domain_or_url: &str) -> Option<String> {
        self.registry.lookup(domain_or_url)
    }

    /// Set the secure protocol used by every subsequent exchange
    ///
    /// Any non-empty name is stored. A name rustls cannot express is not
    /// rejected here; every request made under it fails with
    /// [`Error::Tls`] until a supported name is set. Pooled connections
    /// negotiated under the previous setting are not reused.
    pub fn set_default_secure_protocol(&mut self, protocol: &str) -> Result<()> {
        let protocol = protocol.trim();
        if protocol.is_empty() {
            return Err(Error::InvalidArgument("secure protocol must not be empty".into()));
        }

        self.config.secure_protocol = protocol.to_string();
        self.http = build_http_client(&self.config).map_err(|e| {
            warn!(protocol = %protocol, error = %e, "secure protocol cannot be used for requests");
            match e {
                Error::Tls(message) => message,
                other => other.to_string(),
            }
        });

        info!(protocol = %protocol, "default secure protocol updated");
        Ok(())
    }

    pub fn last_attempted_host(&self) -> Option<String> {
        self.last_host().clone()
    }

    pub fn reset_last_attempted_host(&self) {
        *self.last_host() = None;
    }

    /// Start building a request; send it with [`execute`](Self::execute)
    pub fn request(&self, method: Method, url: &str) -> Result<reqwest::RequestBuilder> {
        Ok(self.transport()?.request(method, url))
    }

    pub async fn get(&self, url: &str) -> Result<Response> {
        let request = self.request(Method::GET, url)?.build()?;
        self.execute(request).await
    }

    pub async fn post(&self, url: &str, body: impl Into<reqwest::Body>) -> Result<Response> {
        let request = self.request(Method::POST, url)?.body(body).build()?;
        self.execute(request).await
    }

    /// Send a request and wait for its single outcome
    pub async fn execute(&self, request: Request) -> Result<Response> {
        let (tx, rx) = oneshot::channel();
        let completion: Completion<Response> = Box::new(move |result| {
            let _ = tx.send(result);
        });

        self.execute_with(request, Some(completion)).await?;
        rx.await.map_err(|_| Error::Aborted)?
    }

    /// Send a request, delivering its outcome to `completion`
    ///
    /// `completion` runs at most once. When it is `None`, the outcome is
    /// published on the returned event channel instead, as a single
    /// [`ExchangeEvent`]; a delivered response is then dropped.
    ///
    /// Only `https` URLs are accepted, and the transport must be usable
    /// (see [`set_default_secure_protocol`](Self::set_default_secure_protocol)).
    /// Either failure is returned before the exchange starts and never
    /// reaches `completion`.
    pub async fn execute_with(
        &self,
        request: Request,
        completion: Option<Completion<Response>>,
    ) -> Result<mpsc::UnboundedReceiver<ExchangeEvent>> {
        if request.url().scheme() != "https" {
            return Err(Error::InvalidArgument(format!(
                "only https URLs can be pinned: {}",
                request.url()
            )));
        }
        let http = self.transport()?;

        let abort = AbortFlag::new();
        let (mut exchange, events) = Exchange::new(
            request.url().clone(),
            PinningGate::new(self.registry.clone()),
            Arc::new(abort.clone()),
            completion,
        );

        self.drive(http, &mut exchange, &abort, request).await;
        Ok(events)
    }

    /// Run the redirect loop for one exchange until it reaches a terminal phase
    async fn drive(
        &self,
        http: &reqwest::Client,
        exchange: &mut Exchange<Response>,
        abort: &AbortFlag,
        mut request: Request,
    ) {
        let mut redirects = 0;

        loop {
            let server = server_name(request.url());
            self.note_attempt(request.url());
            let replay = request.try_clone();

            let response = match http.execute(request).await {
                Ok(response) => response,
                Err(err) if tls::is_untrusted_certificate(&err) => {
                    exchange.on_handshake(&server, false);
                    return;
                }
                Err(err) => {
                    exchange.complete(Err(err.into()));
                    return;
                }
            };

            // A response only arrives over a connection whose chain was
            // verified, either now or when the pooled connection was opened
            exchange.on_handshake(&server, true);

            let fingerprint = tls::peer_fingerprint(&response);
            exchange.on_response(response.url(), fingerprint.as_deref());

            if exchange.phase().is_terminal() || abort.is_aborted() {
                // Dropped unread: nothing from a rejected hop reaches the caller
                return;
            }

            let next = match replay {
                Some(previous) => {
                    let location = response
                        .headers()
                        .get(LOCATION)
                        .and_then(|v| v.to_str().ok());
                    redirect_request(response.status(), response.url(), location, previous)
                }
                None => Ok(None),
            };

            match next {
                Err(e) => {
                    exchange.complete(Err(e));
                    return;
                }
                Ok(None) => {
                    exchange.complete(Ok(response));
                    return;
                }
                Ok(Some(_)) if redirects >= self.config.max_redirects => {
                    exchange.complete(Err(Error::TooManyRedirects(self.config.max_redirects)));
                    return;
                }
                Ok(Some(next)) => {
                    redirects += 1;
                    debug!(from = %response.url(), to = %next.url(), hop = redirects, "following redirect");
                    request = next;
                }
            }
        }
    }

    fn transport(&self) -> Result<&reqwest::Client> {
        self.http.as_ref().map_err(|e| Error::Tls(e.clone()))
    }

    fn note_attempt(&self, url: &Url) {
        *self.last_host() = normalize_host(url.as_str());
    }

    fn last_host(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.last_attempted_host
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Build the reqwest transport: observing verifier, TLS info on responses,
/// and no automatic redirects
fn build_http_client(config: &PinningConfig) -> Result<reqwest::Client> {
    let versions = protocol_versions(&config.secure_protocol)?;
    let verifier = ObservingVerifier::new(&config.trust_anchors)?;

    let tls_config = rustls::ClientConfig::builder_with_protocol_versions(versions)
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();

    reqwest::Client::builder()
        .use_preconfigured_tls(tls_config)
        .tls_info(true)
        .redirect(reqwest::redirect::Policy::none())
        .timeout(config.timeout)
        .user_agent(config.user_agent.clone())
        .build()
        .map_err(|e| Error::Tls(format!("Failed to build HTTP client: {}", e)))
}

/// Name the verifier sees for `url`: the host without IPv6 brackets
fn server_name(url: &Url) -> String {
    url.host_str()
        .unwrap_or_default()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_ascii_lowercase()
}

/// Turn a redirect response into the next hop's request
///
/// Returns `None` when the response is not a followable redirect; the
/// response is then delivered to the caller as-is. A redirect off `https`
/// fails with [`Error::InsecureRedirect`], since the next hop could not be
/// pinned.
fn redirect_request(
    status: StatusCode,
    current: &Url,
    location: Option<&str>,
    mut previous: Request,
) -> Result<Option<Request>> {
    let rewrite_to_get = match status {
        StatusCode::TEMPORARY_REDIRECT | StatusCode::PERMANENT_REDIRECT => false,
        StatusCode::SEE_OTHER => true,
        StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND => previous.method() == Method::POST,
        _ => return Ok(None),
    };

    let Some(target) = location.and_then(|l| current.join(l).ok()) else {
        return Ok(None);
    };
    if target.scheme() != "https" {
        return Err(Error::InsecureRedirect(target.to_string()));
    }

    if rewrite_to_get {
        *previous.method_mut() = Method::GET;
        *previous.body_mut() = None;
        previous.headers_mut().remove(CONTENT_TYPE);
        previous.headers_mut().remove(CONTENT_LENGTH);
    }

    let same_origin = target.scheme() == current.scheme()
        && target.host_str() == current.host_str()
        && target.port_or_known_default() == current.port_or_known_default();
    if !same_origin {
        for name in [AUTHORIZATION, COOKIE, PROXY_AUTHORIZATION] {
            previous.headers_mut().remove(name);
        }
    }

    *previous.url_mut() = target;
    Ok(Some(previous))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn client() -> PinnedClient {
        PinnedClient::new(FingerprintRegistry::new()).unwrap()
    }

    #[test]
    fn test_client_delegates_to_registry() {
        let client = client();
        client.register_fingerprint("https://example.com/", "SHA1 Fingerprint=AA11").unwrap();
        assert_eq!(client.lookup_fingerprint("example.com").as_deref(), Some("AA11"));
        assert_eq!(client.registry().lookup("example.com").as_deref(), Some("AA11"));

        client.unregister_fingerprint("example.com");
        assert_eq!(client.lookup_fingerprint("example.com"), None);

        client.register_fingerprint("a.com", "1").unwrap();
        client.clear_all_fingerprints();
        assert!(client.registry().is_empty());
    }

    #[test]
    fn test_set_default_secure_protocol() {
        let mut client = client();
        assert!(matches!(
            client.set_default_secure_protocol("  "),
            Err(Error::InvalidArgument(_))
        ));

        client.set_default_secure_protocol("TLSv1_2_method").unwrap();
        assert_eq!(client.config().secure_protocol, "TLSv1_2_method");
        assert!(client.request(Method::GET, "https://example.com/").is_ok());
    }

    #[tokio::test]
    async fn test_unknown_secure_protocol_fails_at_request_time() {
        let mut client = client();
        client.set_default_secure_protocol("SSLv2_method").unwrap();
        assert_eq!(client.config().secure_protocol, "SSLv2_method");

        let err = client.get("https://example.com/").await.unwrap_err();
        assert!(matches!(err, Error::Tls(_)));
        assert_eq!(client.last_attempted_host(), None);

        let request = Request::new(Method::GET, url("https://example.com/"));
        assert!(matches!(client.execute(request).await, Err(Error::Tls(_))));

        client.set_default_secure_protocol("TLSv1.3").unwrap();
        assert!(client.request(Method::GET, "https://example.com/").is_ok());
    }

    #[test]
    fn test_with_config_rejects_unknown_protocol() {
        let config = PinningConfig {
            secure_protocol: "SSLv2_method".into(),
            ..PinningConfig::default()
        };
        assert!(matches!(
            PinnedClient::with_config(FingerprintRegistry::new(), config),
            Err(Error::Tls(_))
        ));
    }

    #[tokio::test]
    async fn test_plain_http_is_refused() {
        let client = client();
        let err = client.get("http://example.com/").await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert_eq!(client.last_attempted_host(), None);
    }

    #[tokio::test]
    async fn test_last_attempted_host_tracks_and_resets() {
        let client = client();
        // Nothing listens on port 1; the connection is refused locally
        let err = client.get("https://127.0.0.1:1/").await.unwrap_err();
        assert!(matches!(err, Error::Http(_)));
        assert_eq!(client.last_attempted_host().as_deref(), Some("127.0.0.1"));

        client.reset_last_attempted_host();
        assert_eq!(client.last_attempted_host(), None);
    }

    #[test]
    fn test_server_name_strips_ipv6_brackets() {
        assert_eq!(server_name(&url("https://[::1]:8443/")), "::1");
        assert_eq!(server_name(&url("https://Example.com/")), "example.com");
    }

    #[test]
    fn test_redirect_see_other_becomes_get() {
        let mut previous = Request::new(Method::POST, url("https://example.com/form"));
        previous
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));

        let next = redirect_request(
            StatusCode::SEE_OTHER,
            &url("https://example.com/form"),
            Some("/done"),
            previous,
        )
        .unwrap()
        .unwrap();

        assert_eq!(next.method(), Method::GET);
        assert_eq!(next.url().as_str(), "https://example.com/done");
        assert!(next.headers().get(CONTENT_TYPE).is_none());
    }

    #[test]
    fn test_redirect_preserves_method_on_307() {
        let previous = Request::new(Method::PUT, url("https://example.com/a"));
        let next = redirect_request(
            StatusCode::TEMPORARY_REDIRECT,
            &url("https://example.com/a"),
            Some("https://example.com/b"),
            previous,
        )
        .unwrap()
        .unwrap();
        assert_eq!(next.method(), Method::PUT);
    }

    #[test]
    fn test_cross_origin_redirect_drops_credentials() {
        let mut previous = Request::new(Method::GET, url("https://example.com/"));
        previous
            .headers_mut()
            .insert(AUTHORIZATION, HeaderValue::from_static("Bearer secret"));

        let next = redirect_request(
            StatusCode::FOUND,
            &url("https://example.com/"),
            Some("https://cdn.example.net/x"),
            previous,
        )
        .unwrap()
        .unwrap();

        assert_eq!(next.method(), Method::GET);
        assert!(next.headers().get(AUTHORIZATION).is_none());
    }

    #[test]
    fn test_non_redirects_are_not_followed() {
        let previous = Request::new(Method::GET, url("https://example.com/"));
        assert!(redirect_request(StatusCode::OK, &url("https://example.com/"), None, previous)
            .unwrap()
            .is_none());

        let previous = Request::new(Method::GET, url("https://example.com/"));
        assert!(redirect_request(StatusCode::FOUND, &url("https://example.com/"), None, previous)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_redirect_off_https_is_refused() {
        for location in ["http://example.com/plain", "ftp://example.com/file"] {
            let previous = Request::new(Method::GET, url("https://example.com/"));
            let err = redirect_request(
                StatusCode::MOVED_PERMANENTLY,
                &url("https://example.com/"),
                Some(location),
                previous,
            )
            .unwrap_err();
            assert!(matches!(err, Error::InsecureRedirect(ref target) if target == location));
        }
    }
}
