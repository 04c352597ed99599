//! Listener address parsing.
//!
//! Accepts addresses of the form `[network/]host:port[-port]`. The default
//! network is `tcp`. Unix-domain networks (`unix`, `unixgram`, `unixpacket`)
//! carry the socket path in the host field and have no port. Port ranges
//! are inclusive.
//!
//! Network addresses are distinct from URLs and do not use URL syntax.

use crate::error::GatewayError;

/// The individual components of a parsed listener address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkAddress {
    pub network: String,
    pub host: String,
    pub start_port: u16,
    pub end_port: u16,
}

impl NetworkAddress {
    /// Returns true for unix, unixgram, and unixpacket networks.
    pub fn is_unix(&self) -> bool {
        is_unix_network(&self.network)
    }

    /// Joins host and `start_port + offset` into a bindable `host:port`
    /// string. A unix address is just the socket path; an empty host binds
    /// the wildcard interface.
    pub fn join_host_port(&self, offset: u16) -> String {
        if self.is_unix() {
            return self.host.clone();
        }
        let host = if self.host.is_empty() {
            "0.0.0.0"
        } else {
            &self.host
        };
        if host.contains(':') {
            format!("[{}]:{}", host, self.start_port + offset)
        } else {
            format!("{}:{}", host, self.start_port + offset)
        }
    }

    /// How many ports are in the range, inclusive.
    pub fn port_range_size(&self) -> u32 {
        u32::from(self.end_port - self.start_port) + 1
    }

    /// The first address of the range, the one the gateway binds.
    pub fn bind_addr(&self) -> String {
        self.join_host_port(0)
    }
}

fn is_unix_network(network: &str) -> bool {
    matches!(network, "unix" | "unixgram" | "unixpacket")
}

/// Splits `a` into network, host, and port components. The port may be a
/// range (`x-y`) and is absent for unix sockets.
fn split_network_address(a: &str) -> Result<(String, String, String), GatewayError> {
    let (network, rest) = match a.find('/') {
        Some(idx) => (a[..idx].trim().to_ascii_lowercase(), &a[idx + 1..]),
        None => (String::new(), a),
    };
    if is_unix_network(&network) {
        return Ok((network, rest.to_string(), String::new()));
    }
    let rest = if rest.contains(':') {
        rest.to_string()
    } else {
        // A bare port binds the wildcard interface.
        format!(":{rest}")
    };
    if let Some(bracketed) = rest.strip_prefix('[') {
        let end = bracketed
            .find(']')
            .ok_or_else(|| GatewayError::Config(format!("unclosed bracket in address {a:?}")))?;
        let host = &bracketed[..end];
        let port = bracketed[end + 1..]
            .strip_prefix(':')
            .ok_or_else(|| GatewayError::Config(format!("missing port in address {a:?}")))?;
        return Ok((network, host.to_string(), port.to_string()));
    }
    let (host, port) = rest
        .rsplit_once(':')
        .ok_or_else(|| GatewayError::Config(format!("missing port in address {a:?}")))?;
    Ok((network, host.to_string(), port.to_string()))
}

/// Parses `addr` into its components. Any part is optional; the default
/// network is `tcp`, and a bare port string means "that TCP port on the
/// wildcard interface".
pub fn parse_network_address(addr: &str) -> Result<NetworkAddress, GatewayError> {
    let (mut network, host, port) = split_network_address(addr)?;
    if network.is_empty() {
        network = "tcp".to_string();
    }
    if is_unix_network(&network) {
        return Ok(NetworkAddress {
            network,
            host,
            start_port: 0,
            end_port: 0,
        });
    }
    let (start_str, end_str) = match port.split_once('-') {
        Some((s, e)) => (s, e),
        None => (port.as_str(), port.as_str()),
    };
    let start: u16 = start_str
        .parse()
        .map_err(|err| GatewayError::Config(format!("invalid start port: {err}")))?;
    let end: u16 = end_str
        .parse()
        .map_err(|err| GatewayError::Config(format!("invalid end port: {err}")))?;
    if end < start {
        return Err(GatewayError::Config(
            "end port must not be less than start port".to_string(),
        ));
    }
    Ok(NetworkAddress {
        network,
        host,
        start_port: start,
        end_port: end,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_port() {
        let addr = parse_network_address("8080").unwrap();
        assert_eq!(addr.network, "tcp");
        assert_eq!(addr.host, "");
        assert_eq!(addr.start_port, 8080);
        assert_eq!(addr.end_port, 8080);
        assert_eq!(addr.bind_addr(), "0.0.0.0:8080");
    }

    #[test]
    fn test_parse_host_and_port() {
        let addr = parse_network_address("127.0.0.1:9000").unwrap();
        assert_eq!(addr.network, "tcp");
        assert_eq!(addr.host, "127.0.0.1");
        assert_eq!(addr.start_port, 9000);
        assert_eq!(addr.bind_addr(), "127.0.0.1:9000");
    }

    #[test]
    fn test_parse_explicit_network() {
        let addr = parse_network_address("tcp4/localhost:8080").unwrap();
        assert_eq!(addr.network, "tcp4");
        assert_eq!(addr.host, "localhost");
        assert_eq!(addr.start_port, 8080);
    }

    #[test]
    fn test_parse_port_range() {
        let addr = parse_network_address("localhost:8080-8085").unwrap();
        assert_eq!(addr.start_port, 8080);
        assert_eq!(addr.end_port, 8085);
        assert_eq!(addr.port_range_size(), 6);
        assert_eq!(addr.join_host_port(2), "localhost:8082");
        // The gateway binds the first port of the range.
        assert_eq!(addr.bind_addr(), "localhost:8080");
    }

    #[test]
    fn test_parse_ipv6() {
        let addr = parse_network_address("[::1]:8080").unwrap();
        assert_eq!(addr.host, "::1");
        assert_eq!(addr.start_port, 8080);
        assert_eq!(addr.bind_addr(), "[::1]:8080");
    }

    #[test]
    fn test_parse_unix_socket() {
        let addr = parse_network_address("unix//var/run/mgw.sock").unwrap();
        assert!(addr.is_unix());
        assert_eq!(addr.host, "/var/run/mgw.sock");
        assert_eq!(addr.bind_addr(), "/var/run/mgw.sock");
    }

    #[test]
    fn test_parse_unixgram_and_unixpacket() {
        assert!(parse_network_address("unixgram//tmp/a.sock").unwrap().is_unix());
        assert!(parse_network_address("unixpacket//tmp/b.sock").unwrap().is_unix());
    }

    #[test]
    fn test_reversed_range_rejected() {
        let err = parse_network_address("localhost:9000-8000").unwrap_err();
        assert!(err.to_string().contains("end port"));
    }

    #[test]
    fn test_port_out_of_u16_rejected() {
        assert!(parse_network_address("localhost:70000").is_err());
        assert!(parse_network_address("localhost:abc").is_err());
    }

    #[test]
    fn test_full_u16_range_is_accepted() {
        // Ports parse as u16, so the maximum range size of 65536 entries is
        // capped by construction.
        let addr = parse_network_address("0-65535").unwrap();
        assert_eq!(addr.port_range_size(), 65536);
    }
}
