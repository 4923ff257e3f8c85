//! Direct dispatcher - connects sessions straight to their destination

use async_trait::async_trait;
use tracing::debug;

use crate::common::{relay, BufferPool, Destination, Link, Network, PipeOptions, Result};
use crate::mux::Dispatcher;

use super::{connect_tcp, connect_udp, relay_datagrams};

/// Dispatcher with no routing: every session goes where it asked to.
///
/// The link is returned right away and the connection is made in the
/// background, so a slow destination never stalls a demux loop. A failed
/// connect interrupts the link.
#[derive(Debug, Clone, Default)]
pub struct DirectDispatcher {
    options: PipeOptions,
    pool: BufferPool,
}

impl DirectDispatcher {
    pub fn new(options: PipeOptions, pool: BufferPool) -> Self {
        Self { options, pool }
    }
}

#[async_trait]
impl Dispatcher for DirectDispatcher {
    async fn dispatch(&self, destination: &Destination) -> Result<Link> {
        let (inner, outer) = Link::pair(&self.options);
        let destination = destination.clone();
        let pool = self.pool.clone();

        tokio::spawn(async move {
            match destination.network {
                Network::Tcp => match connect_tcp(&destination.address).await {
                    Ok(stream) => {
                        let (received, sent) = relay(Box::new(stream), inner, pool).await;
                        debug!("[direct] {} done: sent={}, received={}", destination, sent, received);
                    }
                    Err(e) => {
                        debug!("[direct] connect to {} failed: {}", destination, e);
                        inner.interrupt();
                    }
                },
                Network::Udp => match connect_udp(&destination.address).await {
                    Ok(socket) => {
                        relay_datagrams(socket, inner).await;
                    }
                    Err(e) => {
                        debug!("[direct] udp connect to {} failed: {}", destination, e);
                        inner.interrupt();
                    }
                },
            }
        });

        Ok(outer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use bytes::Bytes;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use crate::common::{Address, Error};
    use crate::mux::{
        ClientManager, ClientStrategy, DialingWorkerFactory, MuxServer, ServerWorker, WorkerFactory,
        WorkerOptions,
    };
    use crate::transport::TcpDialer;

    async fn echo_server() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = socket.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    async fn read_all(link: &Link) -> Vec<u8> {
        let mut out = Vec::new();
        while let Ok(Some(mb)) = link.reader.read().await {
            for chunk in mb {
                out.extend_from_slice(&chunk);
            }
        }
        out
    }

    #[tokio::test]
    async fn test_direct_tcp_echo() {
        let addr = echo_server().await;
        let dispatcher = DirectDispatcher::default();

        let link = dispatcher.dispatch(&Destination::tcp(addr)).await.unwrap();
        link.writer.write(Bytes::from_static(b"direct")).await.unwrap();
        link.writer.close();

        assert_eq!(read_all(&link).await, b"direct");
    }

    #[tokio::test]
    async fn test_direct_connect_failure_interrupts_link() {
        let addr = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
        let dispatcher = DirectDispatcher::default();

        let link = dispatcher.dispatch(&Destination::tcp(addr)).await.unwrap();
        assert!(matches!(link.reader.read().await, Err(Error::ClosedPipe)));
    }

    #[tokio::test]
    async fn test_mux_over_tcp_end_to_end() {
        crate::init_test_logging();
        let echo_addr = echo_server().await;

        // Mux server: each accepted socket becomes a server worker
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                ServerWorker::from_stream(
                    Arc::new(DirectDispatcher::default()),
                    Box::new(socket),
                    WorkerOptions::default(),
                );
            }
        });

        let factory = DialingWorkerFactory::new(
            Arc::new(TcpDialer::new(server_addr)),
            ClientStrategy::default(),
            WorkerOptions::default(),
        );
        let manager = ClientManager::new(Arc::new(factory) as Arc<dyn WorkerFactory>);

        let mut apps = Vec::new();
        for i in 0..3 {
            let (app, mux_side) = Link::pair(&PipeOptions::default());
            manager.dispatch(Destination::tcp(echo_addr), mux_side).unwrap();
            app.writer.write(Bytes::from(format!("hello {}", i))).await.unwrap();
            app.writer.close();
            apps.push(app);
        }

        for (i, app) in apps.iter().enumerate() {
            assert_eq!(read_all(app).await, format!("hello {}", i).into_bytes());
        }
        assert_eq!(manager.worker_count(), 1);
    }

    #[tokio::test]
    async fn test_mux_server_over_raw_socket() {
        let echo_addr = echo_server().await;
        let mux = MuxServer::new(Arc::new(DirectDispatcher::default()), WorkerOptions::default());

        // A plain destination goes straight through
        let link = mux.dispatch(&Destination::tcp(Address::from(echo_addr))).await.unwrap();
        link.writer.write(Bytes::from_static(b"plain")).await.unwrap();
        link.writer.close();
        assert_eq!(read_all(&link).await, b"plain");

        // Raw socket pair proves the server side also speaks over real streams
        let (mut client, server) = tokio::io::duplex(1024);
        ServerWorker::from_stream(
            Arc::new(DirectDispatcher::default()),
            Box::new(server),
            WorkerOptions::default(),
        );
        client.write_all(&[0x00, 0x04, 0x00, 0x01, 0x04, 0x00]).await.unwrap();
        client.shutdown().await.unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}
