//! Transport Layer
//!
//! Responsibilities:
//! - Establish the physical connections mux workers run over
//! - Connect sessions to their real destinations (TCP, UDP)
//! - NO framing, NO encryption
//!
//! This layer ONLY deals with raw byte transport.

mod direct;
mod tcp;
mod udp;

pub use direct::DirectDispatcher;
pub use tcp::{connect_tcp, TcpDialer};
pub use udp::{connect_udp, relay_datagrams};

use async_trait::async_trait;

use crate::common::{Destination, Result, Stream};

/// Dialer trait for establishing physical connections
///
/// A client multiplexer asks its dialer for a connection to the mux.cool
/// destination; how that request reaches a mux server is up to the
/// implementation.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, destination: &Destination) -> Result<Stream>;
}
