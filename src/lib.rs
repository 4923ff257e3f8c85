//! netmux - connection multiplexing for proxy transports
//!
//! # Architecture
//!
//! ```text
//! app stream ─┐                                      ┌─> Dispatcher ─> destination
//! app stream ─┼─> ClientManager ─> ClientWorker ═════╪═> ServerWorker
//! app stream ─┘        (pool)      (one physical     └─> Dispatcher ─> destination
//!                                   connection)
//! ```
//!
//! ## Core Principles
//!
//! - Every logical direction is a bounded [`Pipe`](common::pipe), so
//!   backpressure and errors propagate the same way everywhere
//! - One demux task per physical connection; frame order is session order
//! - Collaborators plug in through traits ([`Dialer`], [`Dispatcher`])
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── common/          # Core types: Address, Destination, Pipe, Link, BufferPool
//! ├── mux/             # Frame codec, sessions, client and server workers
//! ├── transport/       # Dialers and the direct dispatcher: TCP, UDP
//! ├── config.rs        # JSON configuration
//! └── metrics.rs       # Prometheus metrics
//! ```

// Core types
pub mod common;
pub mod error;

// Multiplexer
pub mod mux;
pub mod transport;

// Supporting modules
pub mod config;
pub mod metrics;

// Re-exports for convenience
pub use common::{Address, BufferPool, Destination, Link, Network, PipeOptions, Stream};
pub use config::MuxConfig;
pub use error::{Error, Result};

pub use mux::{ClientManager, ClientWorker, Dispatcher, MuxServer, ServerWorker, WorkerOptions};
pub use transport::{Dialer, DirectDispatcher, TcpDialer};

/// Route `tracing` output through the test harness
#[cfg(test)]
pub(crate) fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
