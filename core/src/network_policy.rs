//! Outbound URL hardening and fixed-window rate limiting.
//!
//! Every upstream URL passes through [`NetworkPolicy::validate_url`] before a
//! connector dials it: literal private/loopback/link-local forms are refused
//! outright, hostnames are resolved and every resolved address is re-checked
//! (DNS failure is itself a rejection), and the first safe address is handed
//! back so the caller can pin it against rebinding.

use std::collections::HashMap;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;
use std::net::SocketAddr;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use std::time::Instant;

use tokio::net::lookup_host;
use url::Url;

pub const DEFAULT_RATE_LIMIT_MAX_REQUESTS: u32 = 30;
pub const DEFAULT_RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq)]
pub struct UrlValidation {
    pub valid: bool,
    pub message: Option<String>,
    pub resolved_ip: Option<IpAddr>,
}

impl UrlValidation {
    fn rejected(message: impl Into<String>) -> Self {
        Self {
            valid: false,
            message: Some(message.into()),
            resolved_ip: None,
        }
    }
}

#[derive(Debug)]
struct Window {
    count: u32,
    reset_at: Instant,
}

#[derive(Debug)]
pub struct NetworkPolicy {
    max_requests: u32,
    window: Duration,
    windows: StdMutex<HashMap<String, Window>>,
    /// Escape hatch for local development and tests; private-range targets
    /// are refused unless this is set.
    allow_private_network: bool,
}

impl Default for NetworkPolicy {
    fn default() -> Self {
        Self::new(
            DEFAULT_RATE_LIMIT_MAX_REQUESTS,
            DEFAULT_RATE_LIMIT_WINDOW,
            false,
        )
    }
}

impl NetworkPolicy {
    pub fn new(max_requests: u32, window: Duration, allow_private_network: bool) -> Self {
        Self {
            max_requests,
            window,
            windows: StdMutex::new(HashMap::new()),
            allow_private_network,
        }
    }

    /// Parse + blocklist + resolve. On success `resolved_ip` carries the
    /// first non-blocked address for the caller to pin.
    pub async fn validate_url(&self, url: &str) -> UrlValidation {
        let parsed = match Url::parse(url) {
            Ok(parsed) => parsed,
            Err(e) => return UrlValidation::rejected(format!("invalid URL: {e}")),
        };

        let host = match parsed.host_str() {
            Some(host) => host.to_string(),
            None => return UrlValidation::rejected("URL has no host"),
        };

        if self.allow_private_network {
            return UrlValidation {
                valid: true,
                message: None,
                resolved_ip: None,
            };
        }

        if host.eq_ignore_ascii_case("localhost") {
            return UrlValidation::rejected(format!(
                "URL '{url}' resolves to a private network address"
            ));
        }

        // Literal IP forms are checked without touching the resolver.
        if let Ok(ip) = host.trim_matches(['[', ']']).parse::<IpAddr>() {
            if is_blocked_ip(&ip) {
                return UrlValidation::rejected(format!(
                    "URL '{url}' resolves to a private network address"
                ));
            }
            return UrlValidation {
                valid: true,
                message: None,
                resolved_ip: Some(ip),
            };
        }

        let port = parsed.port_or_known_default().unwrap_or(443);
        let addrs: Vec<SocketAddr> = match lookup_host((host.as_str(), port)).await {
            Ok(addrs) => addrs.collect(),
            // DNS failure means we cannot prove the target safe.
            Err(e) => return UrlValidation::rejected(format!("DNS resolution failed: {e}")),
        };
        if addrs.is_empty() {
            return UrlValidation::rejected("DNS resolution returned no addresses".to_string());
        }

        // A single blocked record poisons the whole name; a mixed answer is
        // exactly what a rebinding attack looks like.
        if addrs.iter().any(|addr| is_blocked_ip(&addr.ip())) {
            return UrlValidation::rejected(format!(
                "URL '{url}' resolves to a private network address"
            ));
        }

        UrlValidation {
            valid: true,
            message: None,
            resolved_ip: addrs.first().map(SocketAddr::ip),
        }
    }

    /// Fixed-window counter, default 30 requests per 60 s per key. Keys are
    /// opaque: callers pass the bearer token when present, otherwise the
    /// remote peer identifier.
    pub fn check_rate_limit(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut windows = self
            .windows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let window = windows.entry(key.to_string()).or_insert(Window {
            count: 0,
            reset_at: now + self.window,
        });
        if now >= window.reset_at {
            window.count = 0;
            window.reset_at = now + self.window;
        }
        window.count += 1;
        window.count <= self.max_requests
    }
}

fn is_blocked_ipv4(ip: &Ipv4Addr) -> bool {
    ip.is_loopback()          // 127/8
        || ip.is_private()    // 10/8, 172.16/12, 192.168/16
        || ip.is_link_local() // 169.254/16
        || ip.is_unspecified() // 0.0.0.0
}

fn is_blocked_ipv6(ip: &Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_blocked_ipv4(&v4);
    }
    let segments = ip.segments();
    ip.is_loopback()                        // ::1
        || ip.is_unspecified()
        || (segments[0] & 0xfe00) == 0xfc00 // fc00::/7 unique local
        || (segments[0] & 0xffc0) == 0xfe80 // fe80::/10 link local
}

pub fn is_blocked_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_blocked_ipv4(v4),
        IpAddr::V6(v6) => is_blocked_ipv6(v6),
    }
}
