//! Connection multiplexing
//!
//! Many logical streams ("sessions") share one physical connection. Each
//! frame carries a session id and a status:
//!
//! - **New**: opens a session (carries the target destination)
//! - **Keep**: payload for an open session
//! - **End**: one side is done (optionally with the Error bit)
//! - **KeepAlive**: liveness only
//!
//! Every physical connection has exactly one demux task reading frames in
//! arrival order; that single reader is what guarantees per-session
//! ordering. Each session has its own task framing its outbound bytes.
//!
//! The client side ([`ClientManager`], [`ClientWorker`]) packs logical
//! connections onto a pool of physical ones. The server side
//! ([`ServerWorker`], [`MuxServer`]) unpacks them and dispatches each
//! session to its real destination.

use std::time::Duration;

use crate::common::{BufferPool, PipeOptions};

mod client;
mod forward;
mod frame;
mod reader;
mod server;
mod session;
mod writer;

pub use client::{
    ClientManager, ClientStrategy, ClientWorker, DialingWorkerFactory, WorkerFactory, WorkerState,
};
pub use frame::{
    check_metadata_len, mux_cool_destination, FrameMetadata, FrameOption, SessionStatus,
    TransferType, MAX_CHUNK_SIZE, MAX_METADATA_LEN, MUX_COOL_DOMAIN, MUX_COOL_PORT,
};
pub use reader::FrameReader;
pub use server::{Dispatcher, MuxServer, ServerWorker};
pub use session::{Session, SessionManager};
pub use writer::FrameWriter;

/// Default idle interval before an empty client connection is closed
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(16);

/// Default wait for payload to piggyback on a New frame
pub const DEFAULT_FIRST_PAYLOAD_TIMEOUT: Duration = Duration::from_millis(100);

/// Which end of the multiplexed connection a component serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Server => "server",
        }
    }
}

/// Settings shared by client and server workers
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub idle_timeout: Duration,
    pub first_payload_timeout: Duration,
    /// Options for every pipe a worker creates
    pub pipe: PipeOptions,
    pub pool: BufferPool,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            first_payload_timeout: DEFAULT_FIRST_PAYLOAD_TIMEOUT,
            pipe: PipeOptions::default(),
            pool: BufferPool::default(),
        }
    }
}
