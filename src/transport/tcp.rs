//! TCP transport

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

use crate::common::{Address, Destination, Result, Stream};

use super::Dialer;

/// Connect to `addr`, resolving domains, with Nagle disabled
pub async fn connect_tcp(addr: &Address) -> Result<TcpStream> {
    let stream = match addr {
        Address::Socket(socket_addr) => TcpStream::connect(socket_addr).await?,
        Address::Domain(domain, port) => TcpStream::connect((domain.as_str(), *port)).await?,
    };

    // Disable Nagle's algorithm for lower latency
    stream.set_nodelay(true)?;

    Ok(stream)
}

/// Dials a fixed mux server over plain TCP.
///
/// The requested destination only names the virtual mux endpoint, so every
/// dial goes to `server`.
pub struct TcpDialer {
    server: Address,
}

impl TcpDialer {
    pub fn new(server: impl Into<Address>) -> Self {
        Self {
            server: server.into(),
        }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, destination: &Destination) -> Result<Stream> {
        let stream = connect_tcp(&self.server).await?;
        debug!("[tcp] dialed {} for {}", self.server, destination);
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use crate::mux::mux_cool_destination;

    #[tokio::test]
    async fn test_dialer_connects_to_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await.unwrap();
            buf
        });

        let dialer = TcpDialer::new(addr);
        let mut stream = dialer.dial(&mux_cool_destination()).await.unwrap();
        stream.write_all(b"mux!").await.unwrap();

        assert_eq!(&accept.await.unwrap(), b"mux!");
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nobody listens on
        let addr = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
        assert!(connect_tcp(&Address::from(addr)).await.is_err());
    }
}
