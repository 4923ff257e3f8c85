//! Client-side multiplexer
//!
//! A [`ClientWorker`] owns one physical connection and every session on it.
//! The [`ClientManager`] keeps a pool of workers and hands each new logical
//! connection to the first one with spare capacity, creating a new worker
//! through its [`WorkerFactory`] when all are full.
//!
//! Worker lifecycle:
//!
//! ```text
//! Active ──(lifetime cap reached)──> Draining ──(last session ends / conn lost)──> Closed
//!   └──────────(connection lost or idle)───────────────────────────────────────────┘
//! ```

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::common::{relay, Destination, Done, Link, PipeReader, PipeWriter};
use crate::error::{Error, Result};
use crate::metrics::{ConnectionMetrics, MUX_BYTES_SENT, MUX_FRAMES_RECEIVED};
use crate::transport::Dialer;

use super::forward::{
    copy_to_frames, drain_data, finish_uplink, handle_end, handle_keep, log_read_error, CopyError,
};
use super::frame::{mux_cool_destination, FrameMetadata, SessionStatus, TransferType};
use super::reader::FrameReader;
use super::session::{Session, SessionManager};
use super::writer::FrameWriter;
use super::{Role, WorkerOptions};

/// Picks before `ClientManager::dispatch` gives up
const MAX_PICK_ATTEMPTS: usize = 16;

static NEXT_WORKER_ID: AtomicU32 = AtomicU32::new(1);

/// Per-connection session caps. Zero means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientStrategy {
    /// Sessions open at the same time
    pub max_concurrency: u32,
    /// Sessions ever assigned
    pub max_connections: u32,
}

impl Default for ClientStrategy {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            max_connections: 128,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Accepting new sessions
    Active,
    /// Lifetime cap reached; existing sessions run to completion
    Draining,
    Closed,
}

// ============================================================================
// ClientWorker
// ============================================================================

pub struct ClientWorker {
    tag: String,
    sessions: SessionManager,
    conn_reader: Arc<PipeReader>,
    conn_writer: Arc<PipeWriter>,
    strategy: ClientStrategy,
    options: WorkerOptions,
    done: Done,
    metrics: Mutex<Option<ConnectionMetrics>>,
}

impl ClientWorker {
    /// Start a worker over `link`, the local end of a physical connection.
    /// Spawns the demux loop and the idle monitor.
    pub fn new(link: Link, strategy: ClientStrategy, options: WorkerOptions) -> Arc<Self> {
        let id = NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed);
        let worker = Arc::new(Self {
            tag: format!("mux-client#{}", id),
            sessions: SessionManager::new(Role::Client),
            conn_reader: Arc::new(link.reader),
            conn_writer: Arc::new(link.writer),
            strategy,
            options,
            done: Done::new(),
            metrics: Mutex::new(Some(ConnectionMetrics::new(Role::Client.as_str()))),
        });

        debug!("[{}] started", worker.tag);
        tokio::spawn(Arc::clone(&worker).fetch_output());
        tokio::spawn(Arc::clone(&worker).monitor());
        worker
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Multiplex `link` onto this connection. Hands the link back if the
    /// worker cannot take another session.
    pub fn dispatch(
        self: &Arc<Self>,
        destination: Destination,
        link: Link,
    ) -> std::result::Result<(), Link> {
        if self.is_full() {
            return Err(link);
        }

        let transfer = TransferType::from(destination.network);
        let session = self.sessions.allocate(link, transfer, &self.strategy)?;
        trace!("[{}] session {} -> {}", self.tag, session.id(), destination);

        let worker = Arc::clone(self);
        tokio::spawn(async move { worker.fetch_input(session, destination).await });
        Ok(())
    }

    pub fn state(&self) -> WorkerState {
        if self.done.is_closed() {
            WorkerState::Closed
        } else if self.is_closing() {
            WorkerState::Draining
        } else {
            WorkerState::Active
        }
    }

    /// Lifetime cap reached: no more sessions, ever
    pub fn is_closing(&self) -> bool {
        self.strategy.max_connections > 0
            && u32::from(self.sessions.count()) >= self.strategy.max_connections
    }

    pub fn is_full(&self) -> bool {
        if self.is_closing() || self.is_closed() {
            return true;
        }
        self.strategy.max_concurrency > 0
            && self.sessions.size() >= self.strategy.max_concurrency as usize
    }

    pub fn is_closed(&self) -> bool {
        self.done.is_closed()
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.size()
    }

    pub fn total_sessions(&self) -> u16 {
        self.sessions.count()
    }

    /// Resolves once the worker has closed
    pub async fn wait_closed(&self) {
        self.done.wait().await
    }

    /// Tear down the connection and abort every session on it
    pub fn close(&self) {
        if !self.done.close() {
            return;
        }

        debug!(
            "[{}] closing after {} sessions",
            self.tag,
            self.sessions.count()
        );
        self.sessions.close_all();
        self.conn_writer.close();
        self.conn_reader.interrupt();

        if let Some(metrics) = self.metrics.lock().take() {
            metrics.record_sessions(self.sessions.count());
        }
    }

    // ------------------------------------------------------------------------
    // Uplink: one task per session
    // ------------------------------------------------------------------------

    async fn fetch_input(self: Arc<Self>, session: Arc<Session>, destination: Destination) {
        let mut writer = FrameWriter::new(
            session.id(),
            destination,
            Arc::clone(&self.conn_writer),
            self.options.pool.clone(),
        );

        let result = match self.send_first_payload(&session, &mut writer).await {
            Ok(()) => copy_to_frames(session.input(), &mut writer, Role::Client).await,
            Err(e) => Err(e),
        };
        if let Err(e) = finish_uplink(&self.tag, &self.sessions, &session, &mut writer, result).await {
            debug!("[{}] connection write failed: {}", self.tag, e);
            self.close();
        }
    }

    /// Send New, carrying whatever payload shows up within the grace window
    async fn send_first_payload(
        &self,
        session: &Session,
        writer: &mut FrameWriter,
    ) -> std::result::Result<(), CopyError> {
        let first = match session
            .input()
            .read_timeout(self.options.first_payload_timeout)
            .await
        {
            Ok(Some(mb)) => mb,
            Ok(None) | Err(Error::ReadTimeout) => Vec::new(),
            Err(e) => return Err(CopyError::Local(e)),
        };

        let size: usize = first.iter().map(Bytes::len).sum();
        writer.write_multi(first).await.map_err(CopyError::from_write)?;
        MUX_BYTES_SENT
            .with_label_values(&[Role::Client.as_str()])
            .inc_by(size as u64);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Downlink: the single demux loop
    // ------------------------------------------------------------------------

    async fn fetch_output(self: Arc<Self>) {
        let mut reader = FrameReader::new(Arc::clone(&self.conn_reader), self.options.pool.clone());

        loop {
            let meta = match reader.read_metadata().await {
                Ok(Some(meta)) => meta,
                Ok(None) => {
                    debug!("[{}] connection closed by server", self.tag);
                    break;
                }
                Err(e) => {
                    log_read_error(&self.tag, Role::Client, &e);
                    break;
                }
            };

            MUX_FRAMES_RECEIVED
                .with_label_values(&[Role::Client.as_str(), meta.status.as_str()])
                .inc();
            trace!("[{}] <- {}", self.tag, meta);

            if let Err(e) = self.handle_frame(&meta, &mut reader).await {
                log_read_error(&self.tag, Role::Client, &e);
                break;
            }
        }

        self.close();
    }

    async fn handle_frame(&self, meta: &FrameMetadata, reader: &mut FrameReader) -> Result<()> {
        match meta.status {
            // The server never opens sessions; New is only drained
            SessionStatus::New | SessionStatus::KeepAlive => drain_data(meta, reader).await,
            SessionStatus::Keep => {
                handle_keep(
                    &self.tag,
                    Role::Client,
                    &self.sessions,
                    meta,
                    reader,
                    &self.conn_writer,
                    &self.options.pool,
                )
                .await
            }
            SessionStatus::End => {
                handle_end(&self.tag, Role::Client, &self.sessions, meta, reader).await
            }
        }
    }

    /// Close the worker once a whole tick passes with no sessions
    async fn monitor(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.options.idle_timeout);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.done.wait() => return,
                _ = ticker.tick() => {
                    if self.sessions.size() == 0 && self.sessions.close_if_empty() {
                        debug!("[{}] idle, closing", self.tag);
                        self.close();
                        return;
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for ClientWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientWorker")
            .field("tag", &self.tag)
            .field("state", &self.state())
            .field("sessions", &self.sessions)
            .finish()
    }
}

// ============================================================================
// Worker factories
// ============================================================================

/// Creates client workers, each over a new physical connection
pub trait WorkerFactory: Send + Sync {
    fn create(&self) -> Result<Arc<ClientWorker>>;
}

/// Dials a physical connection for every worker.
///
/// The worker is usable immediately; frames queue in its pipes while the
/// dial is in flight. A failed dial closes the worker.
pub struct DialingWorkerFactory {
    dialer: Arc<dyn Dialer>,
    strategy: ClientStrategy,
    options: WorkerOptions,
}

impl DialingWorkerFactory {
    pub fn new(dialer: Arc<dyn Dialer>, strategy: ClientStrategy, options: WorkerOptions) -> Self {
        Self {
            dialer,
            strategy,
            options,
        }
    }
}

impl WorkerFactory for DialingWorkerFactory {
    fn create(&self) -> Result<Arc<ClientWorker>> {
        let (inner, outer) = Link::pair(&self.options.pipe);
        let worker = ClientWorker::new(outer, self.strategy, self.options.clone());

        let dialer = Arc::clone(&self.dialer);
        let pool = self.options.pool.clone();
        let tag = worker.tag().to_string();
        tokio::spawn(async move {
            match dialer.dial(&mux_cool_destination()).await {
                Ok(stream) => {
                    let (received, sent) = relay(stream, inner, pool).await;
                    debug!("[{}] connection done: sent={}, received={}", tag, sent, received);
                }
                Err(e) => {
                    warn!("[{}] failed to dial mux connection: {}", tag, e);
                    inner.interrupt();
                }
            }
        });

        Ok(worker)
    }
}

// ============================================================================
// ClientManager
// ============================================================================

/// Pool of client workers
pub struct ClientManager {
    factory: Arc<dyn WorkerFactory>,
    workers: Mutex<Vec<Arc<ClientWorker>>>,
}

impl ClientManager {
    pub fn new(factory: Arc<dyn WorkerFactory>) -> Self {
        Self {
            factory,
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Multiplex one logical connection. On failure the link is interrupted
    /// so both of its ends observe the error.
    pub fn dispatch(&self, destination: Destination, link: Link) -> Result<()> {
        let mut link = link;

        for _ in 0..MAX_PICK_ATTEMPTS {
            let worker = match self.pick_worker() {
                Ok(worker) => worker,
                Err(e) => {
                    link.interrupt();
                    return Err(e);
                }
            };

            match worker.dispatch(destination.clone(), link) {
                Ok(()) => return Ok(()),
                Err(returned) => link = returned,
            }
        }

        warn!("[mux-client] no available worker for {}", destination);
        link.interrupt();
        Err(Error::NoAvailableWorker)
    }

    /// Workers not yet closed
    pub fn worker_count(&self) -> usize {
        self.workers.lock().iter().filter(|w| !w.is_closed()).count()
    }

    /// Close every pooled worker
    pub fn close(&self) {
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            worker.close();
        }
    }

    fn pick_worker(&self) -> Result<Arc<ClientWorker>> {
        let mut workers = self.workers.lock();
        workers.retain(|w| !w.is_closed());

        if let Some(worker) = workers.iter().find(|w| !w.is_full()) {
            return Ok(Arc::clone(worker));
        }

        let worker = self.factory.create()?;
        debug!("[mux-client] pool grew to {} workers", workers.len() + 1);
        workers.push(Arc::clone(&worker));
        Ok(worker)
    }
}
