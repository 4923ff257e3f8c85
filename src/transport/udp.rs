//! UDP transport
//!
//! A UDP session is a connected socket: every chunk written to the session
//! is sent as one datagram and every datagram received becomes one chunk.

use bytes::{Bytes, BytesMut};
use tokio::net::UdpSocket;
use tracing::trace;

use crate::common::{Address, Link, Result};

/// Largest datagram payload we expect to receive
const MAX_DATAGRAM_SIZE: usize = 65535;

/// Bind an ephemeral socket and connect it to `addr`
pub async fn connect_udp(addr: &Address) -> Result<UdpSocket> {
    let bind_addr = match addr {
        Address::Socket(socket_addr) if socket_addr.is_ipv6() => "[::]:0",
        _ => "0.0.0.0:0",
    };
    let socket = UdpSocket::bind(bind_addr).await?;

    match addr {
        Address::Socket(socket_addr) => socket.connect(socket_addr).await?,
        Address::Domain(domain, port) => socket.connect((domain.as_str(), *port)).await?,
    }

    Ok(socket)
}

/// Move datagrams between a connected socket and a link until either side
/// ends. Returns (datagrams received, datagrams sent).
pub async fn relay_datagrams(socket: UdpSocket, link: Link) -> (u64, u64) {
    let Link { reader, writer } = link;

    let inbound = async {
        let mut count = 0u64;
        let mut buf = BytesMut::zeroed(MAX_DATAGRAM_SIZE);
        loop {
            let n = match socket.recv(&mut buf[..]).await {
                Ok(n) => n,
                Err(e) => {
                    trace!("[udp] recv error: {}", e);
                    writer.interrupt();
                    break;
                }
            };
            if writer.write(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                break;
            }
            count += 1;
        }
        count
    };

    let outbound = async {
        let mut count = 0u64;
        loop {
            let mb = match reader.read().await {
                Ok(Some(mb)) => mb,
                Ok(None) | Err(_) => break,
            };
            for datagram in mb {
                if let Err(e) = socket.send(&datagram).await {
                    trace!("[udp] send error: {}", e);
                    reader.interrupt();
                    return count;
                }
                count += 1;
            }
        }
        count
    };

    // A UDP "connection" ends when the local side stops sending
    tokio::select! {
        received = inbound => (received, 0),
        sent = outbound => (0, sent),
    }
}
