//! Stream abstraction
//!
//! Physical connections (and anything a `Dialer` returns) are handed around
//! as this boxed type so the multiplexer never depends on a concrete socket.

use tokio::io::{AsyncRead, AsyncWrite};

/// Boxed byte stream a mux worker runs over
pub type Stream = Box<dyn AsyncReadWrite + Unpin + Send>;

/// Anything that reads and writes bytes: sockets, duplex pipes
pub trait AsyncReadWrite: AsyncRead + AsyncWrite {}

impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}
