//! URL normalization and peer-host filtering.
//!
//! Peer listings advertise addresses in several shapes
//! (`tcp://0.0.0.0:26656`, `https://rpc.example.com:443`, bare
//! `1.2.3.4:26657`). Everything is normalized to `host[:port]` and run
//! through the routable-host filter before probing.

use ipnetwork::Ipv4Network;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;
use std::net::{Ipv4Addr, Ipv6Addr};
use url::Url;

static PRIVATE_NETS: Lazy<Vec<Ipv4Network>> = Lazy::new(|| {
    ["10.0.0.0/8", "172.16.0.0/12", "192.168.0.0/16"]
        .iter()
        .map(|cidr| cidr.parse().unwrap())
        .collect()
});

// Permissive on purpose: octets with leading zeros (001.002.003.004)
// appear in the wild and are accepted.
static IPV4_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{1,3}(\.\d{1,3}){3}$").unwrap());

/// Normalize a base URL: http/https only, lowercase host, explicit
/// non-default port kept, trailing slash and path dropped.
pub fn normalize_url(raw: &str) -> Option<String> {
    let url = Url::parse(raw.trim()).ok()?;
    let scheme = match url.scheme() {
        "http" | "https" => url.scheme(),
        _ => return None,
    };
    let host = url.host_str()?.to_ascii_lowercase();
    Some(match url.port() {
        Some(port) => format!("{scheme}://{host}:{port}"),
        None => format!("{scheme}://{host}"),
    })
}

/// Lowercased host portion of a base URL.
pub fn host_of(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
}

/// Host and explicit port of a base URL, with scheme defaults applied.
pub fn host_port_of(url: &str) -> Option<(String, u16)> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let port = parsed.port_or_known_default()?;
    Some((host, port))
}

/// Parse an advertised peer address into `(host, explicit port)`.
/// Accepts `scheme://host:port`, `host:port`, and bare hosts; IPv6
/// literals come back bracket-stripped (and fail the routable filter).
pub fn parse_host_port(addr: &str) -> Option<(String, Option<u16>)> {
    let addr = addr.trim();
    if addr.is_empty() {
        return None;
    }
    let rest = match addr.find("://") {
        Some(idx) => &addr[idx + 3..],
        None => addr,
    };
    let rest = rest.split(['/', '?']).next().unwrap_or(rest);

    if let Some(stripped) = rest.strip_prefix('[') {
        let end = stripped.find(']')?;
        let host = stripped[..end].to_ascii_lowercase();
        let port = stripped[end + 1..]
            .strip_prefix(':')
            .and_then(|p| p.parse().ok());
        return Some((host, port));
    }

    match rest.rsplit_once(':') {
        // More than one colon means an unbracketed IPv6 literal.
        Some((host, port_str)) if !host.contains(':') => {
            let port = port_str.parse().ok()?;
            Some((host.to_ascii_lowercase(), Some(port)))
        },
        Some(_) => Some((rest.to_ascii_lowercase(), None)),
        None => Some((rest.to_ascii_lowercase(), None)),
    }
}

/// Permissive IPv4 parse tolerating leading zeros.
pub fn parse_ipv4_permissive(host: &str) -> Option<Ipv4Addr> {
    if !IPV4_RE.is_match(host) {
        return None;
    }
    let mut octets = [0u8; 4];
    for (i, part) in host.split('.').enumerate() {
        let value: u32 = part.parse().ok()?;
        octets[i] = u8::try_from(value).ok()?;
    }
    Some(Ipv4Addr::from(octets))
}

/// Peer-filter gate: loopback, unspecified, private IPv4 ranges, and
/// IPv6 literals are not crawl candidates.
pub fn is_routable_host(host: &str) -> bool {
    let host = host.to_ascii_lowercase();
    if host.is_empty() || host == "localhost" || host == "0.0.0.0" || host == "127.0.0.1" {
        return false;
    }
    if host.contains(':') || host.parse::<Ipv6Addr>().is_ok() {
        return false;
    }
    if let Some(ip) = parse_ipv4_permissive(&host) {
        if ip.is_loopback() || ip.is_unspecified() {
            return false;
        }
        if PRIVATE_NETS.iter().any(|net| net.contains(ip)) {
            return false;
        }
    }
    true
}

/// Candidate probe URLs for a host: the well-known https pair first,
/// plain http on the RPC port, then the remaining discovered ports
/// (http for bare IPs, https for names). Normalized and deduplicated,
/// order preserved.
pub fn probe_urls(host: &str, ports: &BTreeSet<u16>) -> Vec<String> {
    let bare_ip = parse_ipv4_permissive(host).is_some();
    let mut raw = vec![
        format!("https://{host}:443"),
        format!("https://{host}:26657"),
        format!("http://{host}:26657"),
    ];
    for port in ports {
        if *port == 443 || *port == 26657 {
            continue;
        }
        if bare_ip {
            raw.push(format!("http://{host}:{port}"));
        } else {
            raw.push(format!("https://{host}:{port}"));
        }
    }

    let mut seen = std::collections::HashSet::new();
    raw.iter()
        .filter_map(|u| normalize_url(u))
        .filter(|u| seen.insert(u.clone()))
        .collect()
}
