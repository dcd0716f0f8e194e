//! Endpoint parsing and blocking name resolution.
//!
//! Addresses take the form `[proto://]host:port` with `proto` one of `tcp`
//! (the default) or `udp`. The host may be a numeric IPv4 address, a
//! bracketed IPv6 address, or a name that is resolved synchronously. The
//! host may be omitted for listeners (bind-all), and port `0` asks the OS
//! to pick one.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};

use crate::error::Error;

/// Transport protocol selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    Tcp,
    Udp,
}

/// A parsed endpoint: protocol, resolved socket address, and the original
/// host string when one was given (kept for TLS server-name indication).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub proto: Proto,
    pub addr: SocketAddr,
    pub host: Option<String>,
}

impl Endpoint {
    /// Parse an endpoint string, resolving names with a blocking DNS lookup.
    ///
    /// With `require_host` (the connect path) a missing host is an error;
    /// without it (the bind path) a missing host means bind-all.
    pub fn parse(input: &str, require_host: bool) -> Result<Self, Error> {
        let (proto, rest) = if let Some(rest) = input.strip_prefix("tcp://") {
            (Proto::Tcp, rest)
        } else if let Some(rest) = input.strip_prefix("udp://") {
            (Proto::Udp, rest)
        } else {
            (Proto::Tcp, input)
        };

        let (host, port) = split_host_port(rest).ok_or_else(|| Error::Endpoint(input.into()))?;
        let port: u16 = port.parse().map_err(|_| Error::Endpoint(input.into()))?;

        if host.is_empty() {
            if require_host {
                return Err(Error::Endpoint(input.into()));
            }
            return Ok(Endpoint {
                proto,
                addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
                host: None,
            });
        }

        // Numeric literals short-circuit the resolver.
        let addr = if let Ok(v4) = host.parse::<Ipv4Addr>() {
            SocketAddr::new(IpAddr::V4(v4), port)
        } else if let Ok(v6) = host.parse::<Ipv6Addr>() {
            SocketAddr::new(IpAddr::V6(v6), port)
        } else {
            resolve(host, port)?
        };

        Ok(Endpoint {
            proto,
            addr,
            host: Some(host.to_string()),
        })
    }
}

/// Split `host:port`, handling bracketed IPv6 hosts and a bare port (empty
/// host). Returns `None` for malformed input.
fn split_host_port(s: &str) -> Option<(&str, &str)> {
    if let Some(rest) = s.strip_prefix('[') {
        // [v6-host]:port
        let close = rest.find(']')?;
        let host = &rest[..close];
        let port = rest[close + 1..].strip_prefix(':')?;
        return Some((host, port));
    }
    match s.rsplit_once(':') {
        Some((host, port)) => {
            // A second colon without brackets is an unbracketed IPv6 address;
            // the format requires brackets for those.
            if host.contains(':') {
                return None;
            }
            Some((host, port))
        }
        // A bare port binds to all interfaces.
        None => Some(("", s)),
    }
}

/// Blocking name resolution; returns the first resolved address.
fn resolve(host: &str, port: u16) -> Result<SocketAddr, Error> {
    let mut addrs = (host, port).to_socket_addrs().map_err(|_| Error::Resolve)?;
    addrs.next().ok_or(Error::Resolve)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ipv4() {
        let ep = Endpoint::parse("127.0.0.1:8080", true).unwrap();
        assert_eq!(ep.proto, Proto::Tcp);
        assert_eq!(ep.addr, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(ep.host.as_deref(), Some("127.0.0.1"));
    }

    #[test]
    fn parse_with_scheme() {
        let ep = Endpoint::parse("udp://127.0.0.1:53", true).unwrap();
        assert_eq!(ep.proto, Proto::Udp);
        assert_eq!(ep.addr.port(), 53);

        let ep = Endpoint::parse("tcp://10.0.0.1:1", true).unwrap();
        assert_eq!(ep.proto, Proto::Tcp);
    }

    #[test]
    fn parse_ipv6_brackets() {
        let ep = Endpoint::parse("[::1]:9000", true).unwrap();
        assert_eq!(ep.addr, "[::1]:9000".parse().unwrap());
    }

    #[test]
    fn parse_bind_all() {
        let ep = Endpoint::parse(":8080", false).unwrap();
        assert_eq!(ep.addr, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(ep.host, None);

        let ep = Endpoint::parse("8080", false).unwrap();
        assert_eq!(ep.addr.port(), 8080);
    }

    #[test]
    fn parse_port_zero() {
        let ep = Endpoint::parse("127.0.0.1:0", false).unwrap();
        assert_eq!(ep.addr.port(), 0);
    }

    #[test]
    fn connect_requires_host() {
        assert!(matches!(
            Endpoint::parse(":8080", true),
            Err(Error::Endpoint(_))
        ));
    }

    #[test]
    fn reject_malformed() {
        assert!(Endpoint::parse("tcp://", true).is_err());
        assert!(Endpoint::parse("127.0.0.1:notaport", true).is_err());
        assert!(Endpoint::parse("::1:8080", true).is_err());
        assert!(Endpoint::parse("[::1]8080", true).is_err());
    }

    #[test]
    fn resolve_localhost() {
        let ep = Endpoint::parse("localhost:80", true).unwrap();
        assert!(ep.addr.ip().is_loopback());
        assert_eq!(ep.host.as_deref(), Some("localhost"));
    }
}
