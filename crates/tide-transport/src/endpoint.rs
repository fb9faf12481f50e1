use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};

use crate::TideTransportError;

/// Identity of a network peer: normalized host plus port.
///
/// Used as the key of every per-peer table in the transports, so two
/// endpoints are equal iff host and port are equal. Immutable once built.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn new(host: impl AsRef<str>, port: u16) -> Self {
        Self {
            host: normalize_host(host.as_ref()),
            port,
        }
    }

    /// Lenient parse of `host:port`, `[v6]:port`, a bare host or a bare IPv6
    /// address. A missing or malformed port becomes 0; this never fails.
    pub fn parse(text: &str) -> Self {
        let text = strip_family_prefix(text.trim());

        if let Some(rest) = text.strip_prefix('[') {
            return match rest.split_once(']') {
                Some((host, tail)) => {
                    let port = tail.strip_prefix(':').map(parse_port).unwrap_or(0);
                    Self::new(host, port)
                }
                None => Self::new(rest, 0),
            };
        }

        match text.matches(':').count() {
            1 => {
                let (host, port) = text.split_once(':').unwrap_or((text, ""));
                Self::new(host, parse_port(port))
            }
            _ => Self::new(text, 0),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The host as an IP literal, if it is one.
    pub fn ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }

    /// Resolve to a socket address, going through DNS for host names.
    /// IPv4 answers are preferred; both transports bind IPv4 sockets.
    pub async fn resolve(&self) -> Result<SocketAddr, TideTransportError> {
        if let Some(ip) = self.ip() {
            return Ok(SocketAddr::new(ip, self.port));
        }
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .map(|addrs| addrs.collect())
            .unwrap_or_default();
        addrs
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| addrs.first())
            .copied()
            .ok_or_else(|| TideTransportError::Resolve {
                endpoint: self.clone(),
            })
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self {
            host: addr.ip().to_canonical().to_string(),
            port: addr.port(),
        }
    }
}

impl FromStr for Endpoint {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Endpoint({self})")
    }
}

impl serde::Serialize for Endpoint {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Endpoint {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::parse(&s))
    }
}

/// Host names a transport has already resolved, so repeated sends to the
/// same peer stay off DNS. IP literals bypass it. Failed lookups are not
/// remembered.
#[derive(Debug, Default)]
pub(crate) struct AddressCache {
    solved: Mutex<HashMap<Endpoint, SocketAddr>>,
}

impl AddressCache {
    const CAPACITY: usize = 256;

    pub fn new() -> Self {
        Self::default()
    }

    pub async fn resolve(&self, endpoint: &Endpoint) -> Result<SocketAddr, TideTransportError> {
        if let Some(ip) = endpoint.ip() {
            return Ok(SocketAddr::new(ip, endpoint.port()));
        }
        if let Some(addr) = self.lock().get(endpoint) {
            return Ok(*addr);
        }
        let addr = endpoint.resolve().await?;
        let mut solved = self.lock();
        if solved.len() >= Self::CAPACITY {
            solved.clear();
        }
        solved.insert(endpoint.clone(), addr);
        Ok(addr)
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Endpoint, SocketAddr>> {
        self.solved.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn parse_port(text: &str) -> u16 {
    text.trim().parse().unwrap_or(0)
}

fn normalize_host(host: &str) -> String {
    strip_family_prefix(host.trim()).to_string()
}

/// Drop a leading `name/` or `/` in front of the address, the shape
/// socket libraries print for a resolved host ("vehicle-1/10.0.2.1").
fn strip_family_prefix(text: &str) -> &str {
    match text.split_once('/') {
        Some((prefix, rest))
            if prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')) =>
        {
            rest
        }
        _ => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn display_is_host_colon_port() {
        assert_eq!(Endpoint::new("10.0.0.1", 6001).to_string(), "10.0.0.1:6001");
    }

    #[test]
    fn strips_resolved_name_prefix() {
        let ep = Endpoint::new("lauv-xplore-1/10.0.10.32", 6002);
        assert_eq!(ep.host(), "10.0.10.32");
        assert_eq!(Endpoint::new("/127.0.0.1", 1), Endpoint::new("127.0.0.1", 1));
    }

    #[test]
    fn parse_host_and_port() {
        let ep = Endpoint::parse("192.168.1.20:7011");
        assert_eq!(ep.host(), "192.168.1.20");
        assert_eq!(ep.port(), 7011);
    }

    #[test]
    fn parse_tolerates_missing_or_bad_port() {
        assert_eq!(Endpoint::parse("ccu-station").port(), 0);
        assert_eq!(Endpoint::parse("ccu-station:").port(), 0);
        assert_eq!(Endpoint::parse("ccu-station:http").port(), 0);
        assert_eq!(Endpoint::parse("ccu-station:99999").port(), 0);
        assert_eq!(Endpoint::parse("ccu-station:http").host(), "ccu-station");
    }

    #[test]
    fn parse_prefixed_socket_address() {
        let ep = Endpoint::parse("/10.0.2.1:6001");
        assert_eq!(ep, Endpoint::new("10.0.2.1", 6001));
    }

    #[test]
    fn parse_ipv6_forms() {
        let ep = Endpoint::parse("[::1]:6001");
        assert_eq!(ep.host(), "::1");
        assert_eq!(ep.port(), 6001);
        assert_eq!(ep.to_string(), "[::1]:6001");

        let bare = Endpoint::parse("fe80::1");
        assert_eq!(bare.host(), "fe80::1");
        assert_eq!(bare.port(), 0);
    }

    #[test]
    fn from_socket_addr_unmaps_ipv4() {
        let addr: SocketAddr = "[::ffff:10.0.0.5]:6002".parse().unwrap();
        assert_eq!(Endpoint::from(addr), Endpoint::new("10.0.0.5", 6002));
    }

    #[test]
    fn usable_as_map_key() {
        let mut map = HashMap::new();
        map.insert(Endpoint::new("10.0.0.1", 6001), "a");
        map.insert(Endpoint::parse("10.0.0.1:6001"), "b");
        map.insert(Endpoint::new("10.0.0.1", 6002), "c");
        assert_eq!(map.len(), 2);
        assert_eq!(map[&Endpoint::new("10.0.0.1", 6001)], "b");
    }

    #[test]
    fn serde_as_string() {
        let ep = Endpoint::new("10.0.0.1", 6001);
        let json = serde_json::to_string(&ep).unwrap();
        assert_eq!(json, "\"10.0.0.1:6001\"");
        let back: Endpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ep);
    }

    #[tokio::test]
    async fn resolve_ip_literal_without_dns() {
        let addr = Endpoint::new("127.0.0.1", 4000).resolve().await.unwrap();
        assert_eq!(addr, "127.0.0.1:4000".parse::<SocketAddr>().unwrap());
    }

    #[tokio::test]
    async fn cache_keeps_host_names_only() {
        let cache = AddressCache::new();
        cache.resolve(&Endpoint::new("127.0.0.1", 4000)).await.unwrap();
        assert_eq!(cache.len(), 0);

        let first = cache.resolve(&Endpoint::new("localhost", 4000)).await.unwrap();
        assert_eq!(cache.len(), 1);
        let again = cache.resolve(&Endpoint::new("localhost", 4000)).await.unwrap();
        assert_eq!(first, again);

        cache.clear();
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test]
    async fn failed_lookup_is_not_cached() {
        let cache = AddressCache::new();
        let err = cache
            .resolve(&Endpoint::new("no-such-host.invalid", 4000))
            .await
            .unwrap_err();
        assert!(matches!(err, TideTransportError::Resolve { .. }));
        assert_eq!(cache.len(), 0);
    }
}
