//! Destination - network kind plus address of a session target

use super::Address;

/// Network type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Network {
    #[default]
    Tcp,
    Udp,
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Network::Tcp => write!(f, "tcp"),
            Network::Udp => write!(f, "udp"),
        }
    }
}

/// Where a logical connection wants to go.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub network: Network,
    pub address: Address,
}

impl Destination {
    pub fn new(network: Network, address: Address) -> Self {
        Self { network, address }
    }

    pub fn tcp(address: impl Into<Address>) -> Self {
        Self::new(Network::Tcp, address.into())
    }

    pub fn udp(address: impl Into<Address>) -> Self {
        Self::new(Network::Udp, address.into())
    }

    pub fn port(&self) -> u16 {
        self.address.port()
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.network, self.address)
    }
}
