use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};

use crate::task::{FailureKind, Handoff, TaskFailure};

/// Address/service pair waiting to be turned into socket addresses.
///
/// `service == None` means any port: candidates come back with port 0.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolveRequest {
    pub address: String,
    pub service: Option<String>,
}

impl ResolveRequest {
    pub fn new(address: impl Into<String>, service: impl Into<String>) -> Self {
        Self { address: address.into(), service: Some(service.into()) }
    }

    pub fn any_port(address: impl Into<String>) -> Self {
        Self { address: address.into(), service: None }
    }

    pub fn port(&self) -> Result<u16, TaskFailure> {
        match &self.service {
            None => Ok(0),
            Some(s) => s.trim().parse::<u16>().map_err(|_| {
                TaskFailure::new(FailureKind::Resolve, "getaddrinfo", format!("unknown service: {}", s))
            }),
        }
    }

    /// Run the lookup on a background thread.
    pub fn spawn(&self) -> Handoff<Vec<SocketAddr>> {
        let req = self.clone();
        Handoff::spawn("sd-resolve", move || lookup(&req))
    }
}

impl fmt::Display for ResolveRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.service {
            Some(s) => write!(f, "{} service {}", self.address, s),
            None => write!(f, "{} (any port)", self.address),
        }
    }
}

/// Blocking lookup. An empty address stands for the wildcard addresses.
pub fn lookup(req: &ResolveRequest) -> Result<Vec<SocketAddr>, TaskFailure> {
    let port = req.port()?;
    let host = req.address.trim();
    if host.is_empty() {
        return Ok(vec![
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port),
        ]);
    }
    // Bracketed IPv6 literals are accepted as typed by users
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| TaskFailure::io(FailureKind::Resolve, "getaddrinfo", &e))?
        .collect();
    if addrs.is_empty() {
        return Err(TaskFailure::new(
            FailureKind::Resolve,
            "getaddrinfo",
            format!("no addresses for {}", req.address),
        ));
    }
    Ok(addrs)
}

/// `1.2.3.4:80 [IPv4]` style rendering used in notices.
pub fn describe(addr: &SocketAddr) -> String {
    let family = if addr.is_ipv4() { "IPv4" } else { "IPv6" };
    format!("{} [{}]", addr, family)
}

/// Address comparison used by data-server allow-lists.
pub fn same_endpoint(a: &SocketAddr, b: &SocketAddr, any_port: bool) -> bool {
    let ip_a = a.ip().to_canonical();
    let ip_b = b.ip().to_canonical();
    ip_a == ip_b && (any_port || a.port() == b.port())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_lookup() {
        let addrs = lookup(&ResolveRequest::new("127.0.0.1", "4000")).unwrap();
        assert_eq!(addrs, vec!["127.0.0.1:4000".parse().unwrap()]);
        let addrs = lookup(&ResolveRequest::any_port("::1")).unwrap();
        assert_eq!(addrs[0].port(), 0);
        assert!(addrs[0].is_ipv6());
    }

    #[test]
    fn empty_address_is_wildcard() {
        let addrs = lookup(&ResolveRequest::new("", "10")).unwrap();
        assert_eq!(addrs.len(), 2);
        assert!(addrs.iter().all(|a| a.ip().is_unspecified() && a.port() == 10));
    }

    #[test]
    fn bad_service_fails() {
        let err = lookup(&ResolveRequest::new("127.0.0.1", "http-ish")).unwrap_err();
        assert_eq!(err.kind, FailureKind::Resolve);
        assert!(err.message.contains("http-ish"));
    }

    #[test]
    fn endpoint_matching() {
        let a: SocketAddr = "10.0.0.5:1500".parse().unwrap();
        let b: SocketAddr = "10.0.0.5:1501".parse().unwrap();
        let mapped: SocketAddr = "[::ffff:10.0.0.5]:1500".parse().unwrap();
        assert!(same_endpoint(&a, &a, false));
        assert!(!same_endpoint(&a, &b, false));
        assert!(same_endpoint(&a, &b, true));
        assert!(same_endpoint(&mapped, &a, false));
    }

    #[test]
    fn describe_tags_family() {
        assert_eq!(describe(&"127.0.0.1:9".parse().unwrap()), "127.0.0.1:9 [IPv4]");
        assert_eq!(describe(&"[::1]:9".parse().unwrap()), "[::1]:9 [IPv6]");
    }
}
