//! Server-side worker
//!
//! A [`ServerWorker`] demultiplexes one inbound physical connection. New
//! frames are handed to the injected [`Dispatcher`] under the id the client
//! chose; responses flow back framed as Keep/End.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, trace};

use crate::common::{Address, Destination, Done, Link, PipeReader, PipeWriter, Stream};
use crate::error::Result;
use crate::metrics::{ConnectionMetrics, MUX_FRAMES_RECEIVED};

use super::forward::{
    copy_to_frames, deliver, drain_data, finish_uplink, handle_end, handle_keep, log_read_error,
};
use super::frame::{FrameMetadata, SessionStatus, TransferType, MUX_COOL_DOMAIN};
use super::reader::FrameReader;
use super::session::{Session, SessionManager};
use super::writer::FrameWriter;
use super::{Role, WorkerOptions};

static NEXT_WORKER_ID: AtomicU32 = AtomicU32::new(1);

/// Hands a newly announced session to the real destination.
///
/// The returned link is the session's local end: its reader yields the
/// destination's response, its writer feeds the destination.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, destination: &Destination) -> Result<Link>;
}

// ============================================================================
// ServerWorker
// ============================================================================

pub struct ServerWorker {
    tag: String,
    dispatcher: Arc<dyn Dispatcher>,
    sessions: SessionManager,
    conn_reader: Arc<PipeReader>,
    conn_writer: Arc<PipeWriter>,
    options: WorkerOptions,
    done: Done,
    metrics: Mutex<Option<ConnectionMetrics>>,
}

impl ServerWorker {
    /// Start demultiplexing `link`, the local end of an inbound physical
    /// connection.
    pub fn new(dispatcher: Arc<dyn Dispatcher>, link: Link, options: WorkerOptions) -> Arc<Self> {
        let id = NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed);
        let worker = Arc::new(Self {
            tag: format!("mux-server#{}", id),
            dispatcher,
            sessions: SessionManager::new(Role::Server),
            conn_reader: Arc::new(link.reader),
            conn_writer: Arc::new(link.writer),
            options,
            done: Done::new(),
            metrics: Mutex::new(Some(ConnectionMetrics::new(Role::Server.as_str()))),
        });

        debug!("[{}] started", worker.tag);
        tokio::spawn(Arc::clone(&worker).run());
        worker
    }

    /// Start demultiplexing a raw byte stream (e.g. an accepted socket)
    pub fn from_stream(dispatcher: Arc<dyn Dispatcher>, stream: Stream, options: WorkerOptions) -> Arc<Self> {
        let link = Link::from_stream(stream, &options.pipe, options.pool.clone());
        Self::new(dispatcher, link, options)
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.size()
    }

    pub fn total_sessions(&self) -> u16 {
        self.sessions.count()
    }

    pub fn is_closed(&self) -> bool {
        self.done.is_closed()
    }

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

    /// The demux loop. Frames are handled strictly in arrival order; it
    /// stops on the first malformed frame or when the connection ends.
    async fn run(self: Arc<Self>) {
        let mut reader = FrameReader::new(Arc::clone(&self.conn_reader), self.options.pool.clone());

        loop {
            let meta = match reader.read_metadata().await {
                Ok(Some(meta)) => meta,
                Ok(None) => {
                    debug!("[{}] connection closed by client", self.tag);
                    break;
                }
                Err(e) => {
                    log_read_error(&self.tag, Role::Server, &e);
                    break;
                }
            };

            MUX_FRAMES_RECEIVED
                .with_label_values(&[Role::Server.as_str(), meta.status.as_str()])
                .inc();
            trace!("[{}] <- {}", self.tag, meta);

            if let Err(e) = self.handle_frame(&meta, &mut reader).await {
                log_read_error(&self.tag, Role::Server, &e);
                break;
            }
        }

        self.close();
    }

    async fn handle_frame(self: &Arc<Self>, meta: &FrameMetadata, reader: &mut FrameReader) -> Result<()> {
        match meta.status {
            SessionStatus::New => self.handle_new(meta, reader).await,
            SessionStatus::Keep => {
                handle_keep(
                    &self.tag,
                    Role::Server,
                    &self.sessions,
                    meta,
                    reader,
                    &self.conn_writer,
                    &self.options.pool,
                )
                .await
            }
            SessionStatus::End => {
                handle_end(&self.tag, Role::Server, &self.sessions, meta, reader).await
            }
            SessionStatus::KeepAlive => drain_data(meta, reader).await,
        }
    }

    async fn handle_new(self: &Arc<Self>, meta: &FrameMetadata, reader: &mut FrameReader) -> Result<()> {
        let id = meta.session_id;
        let Some(target) = meta.target.clone() else {
            return drain_data(meta, reader).await;
        };
        let transfer = TransferType::from(target.network);

        let link = match self.dispatcher.dispatch(&target).await {
            Ok(link) => link,
            Err(e) => {
                info!("[{}] session {} dispatch to {} failed: {}", self.tag, id, target, e);
                drain_data(meta, reader).await?;
                let mut closing = FrameWriter::response(
                    id,
                    Arc::clone(&self.conn_writer),
                    transfer,
                    self.options.pool.clone(),
                );
                closing.mark_error();
                return closing.close().await;
            }
        };

        let session = match self.sessions.add(Session::from_link(id, link, transfer)) {
            Ok(session) => session,
            Err(e) => {
                debug!("[{}] {}", self.tag, e);
                return drain_data(meta, reader).await;
            }
        };
        debug!("[{}] session {} -> {}", self.tag, id, target);

        tokio::spawn(Arc::clone(self).forward_response(Arc::clone(&session)));

        if meta.option.has_data() {
            let chunk = reader.read_chunk().await?;
            deliver(&self.tag, &session, chunk, Role::Server).await;
        }
        Ok(())
    }

    /// Frame the destination's response back to the client
    async fn forward_response(self: Arc<Self>, session: Arc<Session>) {
        let mut writer = FrameWriter::response(
            session.id(),
            Arc::clone(&self.conn_writer),
            session.transfer_type(),
            self.options.pool.clone(),
        );
        let result = copy_to_frames(session.input(), &mut writer, Role::Server).await;
        if let Err(e) = finish_uplink(&self.tag, &self.sessions, &session, &mut writer, result).await {
            debug!("[{}] connection write failed: {}", self.tag, e);
            self.close();
        }
    }
}

impl std::fmt::Debug for ServerWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerWorker")
            .field("tag", &self.tag)
            .field("closed", &self.is_closed())
            .field("sessions", &self.sessions)
            .finish()
    }
}

// ============================================================================
// MuxServer
// ============================================================================

/// Dispatcher decorator: the mux.cool destination becomes a fresh
/// [`ServerWorker`]; everything else goes to the wrapped dispatcher.
pub struct MuxServer {
    dispatcher: Arc<dyn Dispatcher>,
    options: WorkerOptions,
}

impl MuxServer {
    pub fn new(dispatcher: Arc<dyn Dispatcher>, options: WorkerOptions) -> Self {
        Self {
            dispatcher,
            options,
        }
    }
}

fn is_mux_cool(destination: &Destination) -> bool {
    matches!(&destination.address, Address::Domain(domain, _) if domain == MUX_COOL_DOMAIN)
}

#[async_trait]
impl Dispatcher for MuxServer {
    async fn dispatch(&self, destination: &Destination) -> Result<Link> {
        if !is_mux_cool(destination) {
            return self.dispatcher.dispatch(destination).await;
        }

        let (inner, outer) = Link::pair(&self.options.pipe);
        let worker = ServerWorker::new(Arc::clone(&self.dispatcher), inner, self.options.clone());
        trace!("[{}] accepted mux connection", worker.tag());
        Ok(outer)
    }
}
