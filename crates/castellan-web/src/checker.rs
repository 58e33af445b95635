//! SSRF validation for outbound URLs. Every URL the agent touches goes
//! through [`UrlPolicy::allows`], including each redirect hop.

use reqwest::Url;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, ToSocketAddrs};

/// Seam for URL admission. The production implementation is
/// [`SafeUrlChecker`]; tests substitute policies that admit loopback
/// fixtures.
pub trait UrlPolicy: Send + Sync {
    fn allows(&self, url: &Url) -> bool;
}

const BLOCKED_HOSTS: &[&str] = &[
    "localhost",
    "127.0.0.1",
    "::1",
    "0.0.0.0",
    "169.254.169.254",
    "metadata.google.internal",
];

/// Validates scheme, hostname, IP literals, and DNS resolution results.
///
/// A URL that fails to parse is unsafe. A hostname whose DNS lookup fails is
/// allowed: every literal and resolvable private address is already caught,
/// and an unresolvable name cannot be connected to either.
#[derive(Debug, Clone, Copy, Default)]
pub struct SafeUrlChecker;

impl SafeUrlChecker {
    pub fn new() -> Self {
        Self
    }

    /// String-level entry point. Fails closed on parse errors.
    #[must_use]
    pub fn is_safe(&self, url: &str) -> bool {
        match Url::parse(url) {
            Ok(parsed) => self.allows(&parsed),
            Err(_) => false,
        }
    }
}

impl UrlPolicy for SafeUrlChecker {
    fn allows(&self, url: &Url) -> bool {
        if !matches!(url.scheme(), "http" | "https") {
            return false;
        }
        if is_blocked_host(url) {
            return false;
        }
        // IP literals were fully classified above; only hostnames need DNS.
        let Some(host) = url.host_str() else {
            return false;
        };
        if ip_literal(host).is_some() {
            return true;
        }
        let port = url.port_or_known_default().unwrap_or(443);
        match (host, port).to_socket_addrs() {
            Ok(addrs) => {
                for addr in addrs {
                    if is_private_or_local_ip(addr.ip()) {
                        return false;
                    }
                }
                true
            }
            Err(_) => true,
        }
    }
}

fn is_blocked_host(url: &Url) -> bool {
    let Some(host_str) = url.host_str() else {
        return true;
    };
    let host = host_str.to_ascii_lowercase();
    if BLOCKED_HOSTS.contains(&host.as_str()) || host.ends_with(".local") {
        return true;
    }
    if let Some(ip) = ip_literal(&host) {
        return is_private_or_local_ip(ip);
    }
    false
}

/// `Url::host_str` keeps IPv6 brackets ("[::1]"), which `IpAddr` parsing
/// does not accept.
fn ip_literal(host: &str) -> Option<IpAddr> {
    let stripped = host
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or(host);
    stripped.parse::<IpAddr>().ok()
}

fn is_private_or_local_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(addr) => is_private_or_local_ipv4(addr),
        IpAddr::V6(addr) => is_private_or_local_ipv6(addr),
    }
}

fn is_private_or_local_ipv4(addr: Ipv4Addr) -> bool {
    addr.is_private()
        || addr.is_loopback()
        || addr.is_link_local()
        || addr.is_broadcast()
        || addr.is_documentation()
        || addr.is_unspecified()
        || addr.octets()[0] == 0
}

fn is_private_or_local_ipv6(addr: Ipv6Addr) -> bool {
    // "::ffff:a.b.c.d" connects over IPv4; classify the embedded address.
    if let Some(v4) = addr.to_ipv4_mapped() {
        return is_private_or_local_ipv4(v4);
    }
    let first = addr.segments()[0];
    addr.is_loopback()
        || addr.is_unspecified()
        || (first & 0xfe00) == 0xfc00
        || (first & 0xffc0) == 0xfe80
        || (first & 0xff00) == 0xff00
}
