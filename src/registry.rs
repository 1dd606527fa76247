//! In-memory fingerprint registry
//!
//! Maps a normalized domain pattern to the fingerprint its certificate must
//! present. Patterns are either exact hosts (`api.example.com`) or
//! single-level wildcards (`*.example.com`). A wildcard covers direct
//! subdomains only, never the bare parent domain.
//!
//! The registry is a cheap, clonable handle: every clone observes the same
//! entries. It is written at startup or configuration time and read by every
//! exchange.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use reqwest::Url;
use tracing::debug;

use crate::error::{Error, Result};

/// Label that `openssl x509 -fingerprint` prefixes its output with
const FINGERPRINT_LABEL: &str = "SHA1 Fingerprint=";

/// Shared domain → fingerprint map
#[derive(Debug, Clone, Default)]
pub struct FingerprintRegistry {
    entries: Arc<RwLock<HashMap<String, String>>>,
}

impl FingerprintRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or overwrite) the fingerprint for a domain
    ///
    /// `domain_or_url` may be a bare host, a wildcard pattern, or a full URL;
    /// only its host is kept. `fingerprint_text` may carry the
    /// `SHA1 Fingerprint=` label printed by OpenSSL.
    pub fn register(&self, domain_or_url: &str, fingerprint_text: &str) -> Result<()> {
        if domain_or_url.trim().is_empty() {
            return Err(Error::InvalidArgument("domain must not be empty".into()));
        }
        if fingerprint_text.trim().is_empty() {
            return Err(Error::InvalidArgument("fingerprint must not be empty".into()));
        }

        let host = normalize_host(domain_or_url).ok_or_else(|| {
            Error::InvalidArgument(format!("cannot derive a host from {:?}", domain_or_url))
        })?;
        let fingerprint = strip_fingerprint_label(fingerprint_text);
        if fingerprint.is_empty() {
            return Err(Error::InvalidArgument("fingerprint must not be empty".into()));
        }

        debug!(host = %host, fingerprint = %fingerprint, "registered fingerprint");
        self.write().insert(host, fingerprint.to_string());
        Ok(())
    }

    /// Remove the entry for a domain, if any
    pub fn unregister(&self, domain_or_url: &str) {
        if let Some(host) = normalize_host(domain_or_url) {
            if self.write().remove(&host).is_some() {
                debug!(host = %host, "unregistered fingerprint");
            }
        }
    }

    pub fn clear_all(&self) {
        self.write().clear();
    }

    /// Look up the expected fingerprint for a host
    ///
    /// Tries the exact host first, then the wildcard formed by replacing its
    /// leftmost label with `*`. Note that a two-label host such as
    /// `example.com` therefore consults `*.com`.
    pub fn lookup(&self, domain_or_url: &str) -> Option<String> {
        let host = normalize_host(domain_or_url)?;
        let entries = self.read();

        if let Some(fingerprint) = entries.get(&host) {
            return Some(fingerprint.clone());
        }

        let pattern = wildcard_pattern(&host)?;
        entries.get(&pattern).cloned()
    }

    pub fn contains(&self, domain_or_url: &str) -> bool {
        normalize_host(domain_or_url).is_some_and(|host| self.read().contains_key(&host))
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    // Writers never leave the map half-updated, so a poisoned lock still
    // guards consistent data.
    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, String>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, String>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Reduce a domain or URL to a lower-case bare host
///
/// Accepts `https://user@Host:8443/path?q`, `host:443/path`, `[::1]:443`
/// and plain hosts or wildcard patterns.
pub(crate) fn normalize_host(input: &str) -> Option<String> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }

    if input.contains("://") {
        let url = Url::parse(input).ok()?;
        return url
            .host_str()
            .filter(|h| !h.is_empty())
            .map(|h| h.trim_end_matches('.').to_ascii_lowercase());
    }

    let authority = input.split(['/', '?', '#']).next().unwrap_or(input);
    let authority = authority.rsplit_once('@').map_or(authority, |(_, host)| host);

    let host = if authority.starts_with('[') {
        // IPv6 literal keeps its brackets, matching `Url::host_str`
        match authority.find(']') {
            Some(end) => &authority[..=end],
            None => return None,
        }
    } else {
        authority.split_once(':').map_or(authority, |(host, _)| host)
    };

    let host = host.trim_end_matches('.');
    if host.is_empty() {
        None
    } else {
        Some(host.to_ascii_lowercase())
    }
}

/// `a.b.example.com` → `*.b.example.com`; single-label hosts have none
fn wildcard_pattern(host: &str) -> Option<String> {
    let (_, parent) = host.split_once('.')?;
    if parent.is_empty() {
        return None;
    }
    Some(format!("*.{}", parent))
}

fn strip_fingerprint_label(text: &str) -> &str {
    let text = text.trim();
    text.strip_prefix(FINGERPRINT_LABEL).unwrap_or(text).trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_lookup() {
        let registry = FingerprintRegistry::new();
        registry.register("api.example.com", "AA:BB").unwrap();
        assert_eq!(registry.lookup("api.example.com").as_deref(), Some("AA:BB"));
        assert_eq!(registry.lookup("other.example.com"), None);
    }

    #[test]
    fn test_wildcard_covers_subdomains_only() {
        let registry = FingerprintRegistry::new();
        registry.register("*.example.com", "CC:DD").unwrap();

        assert_eq!(registry.lookup("a.example.com").as_deref(), Some("CC:DD"));
        assert_eq!(registry.lookup("example.com"), None);
        // Single level: a.b.example.com consults *.b.example.com
        assert_eq!(registry.lookup("a.b.example.com"), None);
    }

    #[test]
    fn test_exact_entry_wins_over_wildcard() {
        let registry = FingerprintRegistry::new();
        registry.register("*.example.com", "WILD").unwrap();
        registry.register("api.example.com", "EXACT").unwrap();
        assert_eq!(registry.lookup("api.example.com").as_deref(), Some("EXACT"));
        assert_eq!(registry.lookup("www.example.com").as_deref(), Some("WILD"));
    }

    #[test]
    fn test_two_label_host_consults_tld_wildcard() {
        let registry = FingerprintRegistry::new();
        registry.register("*.com", "TLD").unwrap();
        assert_eq!(registry.lookup("example.com").as_deref(), Some("TLD"));
        assert_eq!(registry.lookup("localhost"), None);
    }

    #[test]
    fn test_reregistration_keeps_latest() {
        let registry = FingerprintRegistry::new();
        registry.register("example.com", "OLD").unwrap();
        registry.register("example.com", "NEW").unwrap();
        assert_eq!(registry.lookup("example.com").as_deref(), Some("NEW"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_strips_openssl_label() {
        let registry = FingerprintRegistry::new();
        registry.register("example.com", "SHA1 Fingerprint=AA:BB:CC").unwrap();
        assert_eq!(registry.lookup("example.com").as_deref(), Some("AA:BB:CC"));
    }

    #[test]
    fn test_rejects_empty_arguments() {
        let registry = FingerprintRegistry::new();
        assert!(matches!(
            registry.register("", "AA"),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            registry.register("example.com", ""),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            registry.register("example.com", "SHA1 Fingerprint="),
            Err(Error::InvalidArgument(_))
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_url_is_normalized_to_host() {
        let registry = FingerprintRegistry::new();
        registry
            .register("https://API.Example.com:8443/v1/items?x=1", "AA")
            .unwrap();
        assert!(registry.contains("api.example.com"));
        assert_eq!(registry.lookup("https://api.example.com/other").as_deref(), Some("AA"));
        assert_eq!(registry.lookup("api.example.com:443").as_deref(), Some("AA"));
    }

    #[test]
    fn test_normalize_host_forms() {
        assert_eq!(normalize_host("example.com").as_deref(), Some("example.com"));
        assert_eq!(normalize_host("Example.COM.").as_deref(), Some("example.com"));
        assert_eq!(normalize_host("example.com:443/x").as_deref(), Some("example.com"));
        assert_eq!(normalize_host("user@example.com").as_deref(), Some("example.com"));
        assert_eq!(normalize_host("[::1]:8443").as_deref(), Some("[::1]"));
        assert_eq!(normalize_host("http://[::1]:80/").as_deref(), Some("[::1]"));
        assert_eq!(normalize_host("*.example.com").as_deref(), Some("*.example.com"));
        assert_eq!(normalize_host("   "), None);
        assert_eq!(normalize_host(":443"), None);
    }

    #[test]
    fn test_unregister_and_clear() {
        let registry = FingerprintRegistry::new();
        registry.register("a.com", "1").unwrap();
        registry.register("b.com", "2").unwrap();

        registry.unregister("https://a.com/");
        registry.unregister("missing.com");
        assert_eq!(registry.lookup("a.com"), None);
        assert_eq!(registry.lookup("b.com").as_deref(), Some("2"));

        registry.clear_all();
        assert_eq!(registry.lookup("b.com"), None);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_clones_share_entries() {
        let registry = FingerprintRegistry::new();
        let handle = registry.clone();
        registry.register("example.com", "AA").unwrap();
        assert_eq!(handle.lookup("example.com").as_deref(), Some("AA"));
    }
}
