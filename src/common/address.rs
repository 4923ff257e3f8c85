//! Address type for multiplexed destinations

use std::net::{IpAddr, SocketAddr};

/// Network address of a session target
///
/// IP addresses carry their port inside the `SocketAddr`; domains are kept
/// unresolved, the peer resolves them when it dispatches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// IP socket address (IP + port)
    Socket(SocketAddr),
    /// Domain name with port
    Domain(String, u16),
}

impl Address {
    /// Create from domain and port
    pub fn domain(domain: impl Into<String>, port: u16) -> Self {
        Address::Domain(domain.into(), port)
    }

    /// Create from IP and port
    pub fn ip_port(ip: IpAddr, port: u16) -> Self {
        Address::Socket(SocketAddr::new(ip, port))
    }

    /// Get the port
    pub fn port(&self) -> u16 {
        match self {
            Address::Socket(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Socket(addr) => write!(f, "{}", addr),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::Socket(addr)
    }
}
