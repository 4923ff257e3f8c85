//! Pipe - bounded single-producer/single-consumer byte channel
//!
//! Every logical direction in the multiplexer is a Pipe: the writer queues
//! chunks, the reader takes everything queued in one go. A pipe is in one
//! of three states:
//!
//! - **open**: writes queue data, reads wait for data
//! - **closed**: writes fail, reads drain what is left and then see EOF
//! - **errored**: writes and reads fail immediately, queued data is dropped
//!
//! Two single-slot signals coordinate the ends. A successful write signals
//! the reader, every read signals the writer (which may be parked on
//! backpressure). State changes wake both.
//!
//! Two pipes make a [`Link`], one end of a bidirectional connection.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Notify;
use tracing::trace;

use super::buffer::BufferPool;
use super::stream::Stream;
use crate::error::{Error, Result};

/// Default soft limit on queued bytes (64KB)
pub const DEFAULT_PIPE_LIMIT: usize = 64 * 1024;

/// An ordered batch of chunks. Chunk boundaries are preserved end to end,
/// which is what keeps datagrams intact.
pub type MultiBuffer = Vec<Bytes>;

// ============================================================================
// Options
// ============================================================================

/// Bound on queued bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeLimit {
    Bounded(usize),
    /// No backpressure at all. Must be asked for explicitly.
    Unbounded,
}

impl Default for PipeLimit {
    fn default() -> Self {
        PipeLimit::Bounded(DEFAULT_PIPE_LIMIT)
    }
}

/// Pipe construction options
#[derive(Debug, Clone, Default)]
pub struct PipeOptions {
    pub limit: PipeLimit,
    /// Drop writes that would block instead of waiting
    pub discard_overflow: bool,
    /// Give up on a write blocked by backpressure after this long
    pub write_timeout: Option<Duration>,
}

impl PipeOptions {
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = PipeLimit::Bounded(limit);
        self
    }

    pub fn unbounded(mut self) -> Self {
        self.limit = PipeLimit::Unbounded;
        self
    }

    pub fn discard_overflow(mut self) -> Self {
        self.discard_overflow = true;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }
}

// ============================================================================
// Shared state
// ============================================================================

/// Lifecycle state of a pipe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeState {
    Open,
    Closed,
    Errored,
}

struct Buffer {
    data: VecDeque<Bytes>,
    len: usize,
    state: PipeState,
}

enum WriteAttempt {
    Written,
    Full,
}

struct Shared {
    buffer: Mutex<Buffer>,
    read_signal: Notify,
    write_signal: Notify,
    options: PipeOptions,
}

impl Shared {
    fn try_write(&self, mb: &mut MultiBuffer, size: usize) -> Result<WriteAttempt> {
        let mut buffer = self.buffer.lock();
        if buffer.state != PipeState::Open {
            return Err(Error::ClosedPipe);
        }

        // Soft limit: an empty pipe always accepts, so oversized chunks can't deadlock
        if let PipeLimit::Bounded(limit) = self.options.limit {
            if buffer.len > 0 && buffer.len + size > limit {
                return Ok(WriteAttempt::Full);
            }
        }

        buffer.data.extend(mb.drain(..));
        buffer.len += size;
        Ok(WriteAttempt::Written)
    }

    /// `None` while open with nothing queued.
    fn try_read(&self) -> Option<Result<Option<MultiBuffer>>> {
        let mut buffer = self.buffer.lock();
        match buffer.state {
            PipeState::Errored => Some(Err(Error::ClosedPipe)),
            _ if !buffer.data.is_empty() => {
                buffer.len = 0;
                Some(Ok(Some(buffer.data.drain(..).collect())))
            }
            PipeState::Closed => Some(Ok(None)),
            PipeState::Open => None,
        }
    }

    fn close(&self) {
        {
            let mut buffer = self.buffer.lock();
            if buffer.state != PipeState::Open {
                return;
            }
            buffer.state = PipeState::Closed;
        }
        self.wake_all();
    }

    fn interrupt(&self) {
        {
            let mut buffer = self.buffer.lock();
            if buffer.state == PipeState::Errored {
                return;
            }
            buffer.state = PipeState::Errored;
            buffer.data.clear();
            buffer.len = 0;
        }
        self.wake_all();
    }

    fn wake_all(&self) {
        self.read_signal.notify_waiters();
        self.write_signal.notify_waiters();
    }

    fn state(&self) -> PipeState {
        self.buffer.lock().state
    }

    fn len(&self) -> usize {
        self.buffer.lock().len
    }
}

/// Create a pipe, returning its two ends.
pub fn pipe(options: PipeOptions) -> (PipeReader, PipeWriter) {
    let shared = Arc::new(Shared {
        buffer: Mutex::new(Buffer {
            data: VecDeque::new(),
            len: 0,
            state: PipeState::Open,
        }),
        read_signal: Notify::new(),
        write_signal: Notify::new(),
        options,
    });

    (
        PipeReader {
            shared: Arc::clone(&shared),
        },
        PipeWriter { shared },
    )
}

// ============================================================================
// Reader
// ============================================================================

/// Consuming end of a pipe. Dropping it interrupts the pipe so a writer
/// parked on backpressure is released.
pub struct PipeReader {
    shared: Arc<Shared>,
}

impl PipeReader {
    /// Wait for data. Returns everything queued, or `None` once the pipe is
    /// closed and drained. Fails immediately once the pipe is errored.
    ///
    /// Cancel safe: data is only taken when the call completes.
    pub async fn read(&self) -> Result<Option<MultiBuffer>> {
        loop {
            let notified = self.shared.read_signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(result) = self.shared.try_read() {
                self.shared.write_signal.notify_one();
                return result;
            }

            notified.await;
        }
    }

    /// Like [`read`](Self::read), failing with `Error::ReadTimeout` if
    /// nothing arrives within `timeout`.
    pub async fn read_timeout(&self, timeout: Duration) -> Result<Option<MultiBuffer>> {
        match tokio::time::timeout(timeout, self.read()).await {
            Ok(result) => result,
            Err(_) => Err(Error::ReadTimeout),
        }
    }

    /// Mark the pipe errored and drop anything queued
    pub fn interrupt(&self) {
        self.shared.interrupt();
    }

    pub fn state(&self) -> PipeState {
        self.shared.state()
    }

    /// Bytes currently queued
    pub fn len(&self) -> usize {
        self.shared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        self.shared.interrupt();
    }
}

impl std::fmt::Debug for PipeReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeReader")
            .field("state", &self.state())
            .field("len", &self.len())
            .finish()
    }
}

// ============================================================================
// Writer
// ============================================================================

/// Producing end of a pipe. Dropping it closes the pipe (reader sees EOF
/// after draining).
pub struct PipeWriter {
    shared: Arc<Shared>,
}

impl PipeWriter {
    /// Queue one chunk
    pub async fn write(&self, chunk: Bytes) -> Result<()> {
        self.write_multi(vec![chunk]).await
    }

    /// Queue a batch of chunks. The whole batch lands in the pipe at once,
    /// so concurrent callers never interleave inside a batch.
    pub async fn write_multi(&self, mb: MultiBuffer) -> Result<()> {
        match self.shared.options.write_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, self.write_inner(mb)).await {
                Ok(result) => result,
                Err(_) => Err(Error::WriteTimeout),
            },
            None => self.write_inner(mb).await,
        }
    }

    async fn write_inner(&self, mut mb: MultiBuffer) -> Result<()> {
        let size: usize = mb.iter().map(Bytes::len).sum();
        if size == 0 {
            return Ok(());
        }

        loop {
            let notified = self.shared.write_signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.shared.try_write(&mut mb, size)? {
                WriteAttempt::Written => {
                    self.shared.read_signal.notify_one();
                    return Ok(());
                }
                WriteAttempt::Full if self.shared.options.discard_overflow => {
                    trace!("pipe full, discarding {} bytes", size);
                    return Ok(());
                }
                WriteAttempt::Full => notified.await,
            }
        }
    }

    /// Close the pipe. Idempotent; queued data is still delivered.
    pub fn close(&self) {
        self.shared.close();
    }

    /// Mark the pipe errored and drop anything queued. Idempotent.
    pub fn interrupt(&self) {
        self.shared.interrupt();
    }

    pub fn state(&self) -> PipeState {
        self.shared.state()
    }

    pub fn is_closed(&self) -> bool {
        self.state() != PipeState::Open
    }

    /// Bytes currently queued
    pub fn len(&self) -> usize {
        self.shared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.shared.close();
    }
}

impl std::fmt::Debug for PipeWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeWriter")
            .field("state", &self.state())
            .field("len", &self.len())
            .finish()
    }
}

// ============================================================================
// Link
// ============================================================================

/// One end of a bidirectional connection: read what the peer sends,
/// write what the peer should receive.
#[derive(Debug)]
pub struct Link {
    pub reader: PipeReader,
    pub writer: PipeWriter,
}

impl Link {
    /// Create two facing ends: whatever one writes, the other reads.
    pub fn pair(options: &PipeOptions) -> (Link, Link) {
        let (up_reader, up_writer) = pipe(options.clone());
        let (down_reader, down_writer) = pipe(options.clone());

        (
            Link {
                reader: up_reader,
                writer: down_writer,
            },
            Link {
                reader: down_reader,
                writer: up_writer,
            },
        )
    }

    /// Error both directions
    pub fn interrupt(&self) {
        self.reader.interrupt();
        self.writer.interrupt();
    }

    /// Attach a byte stream: spawns a [`relay`] between the stream and a
    /// fresh pipe pair, and returns the facing end.
    pub fn from_stream(stream: Stream, options: &PipeOptions, pool: BufferPool) -> Link {
        let (inner, outer) = Link::pair(options);
        tokio::spawn(relay(stream, inner, pool));
        outer
    }
}

// ============================================================================
// Stream relay
// ============================================================================

/// Copy between a byte stream and a link until both directions finish.
///
/// Stream EOF closes `link.writer`, a stream read error interrupts it.
/// Link EOF shuts the stream down, a stream write error interrupts
/// `link.reader`. Returns (bytes read from stream, bytes written to stream).
pub async fn relay(stream: Stream, link: Link, pool: BufferPool) -> (u64, u64) {
    let Link { reader, writer } = link;
    let (mut stream_read, mut stream_write) = tokio::io::split(stream);

    let inbound = async {
        let mut total = 0u64;
        let mut buf = pool.acquire();
        buf.resize(pool.buffer_size(), 0);

        loop {
            let n = match stream_read.read(&mut buf[..]).await {
                Ok(0) => {
                    writer.close();
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    trace!("relay read error: {}", e);
                    writer.interrupt();
                    break;
                }
            };

            if writer.write(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                break;
            }
            total += n as u64;
        }

        total
    };

    let outbound = async {
        let mut total = 0u64;

        loop {
            let mb = match reader.read().await {
                Ok(Some(mb)) => mb,
                Ok(None) => {
                    let _ = stream_write.shutdown().await;
                    break;
                }
                Err(_) => break,
            };

            let mut failed = false;
            for chunk in &mb {
                if let Err(e) = stream_write.write_all(chunk).await {
                    trace!("relay write error: {}", e);
                    failed = true;
                    break;
                }
                total += chunk.len() as u64;
            }
            if failed || stream_write.flush().await.is_err() {
                reader.interrupt();
                break;
            }
        }

        total
    };

    tokio::join!(inbound, outbound)
}
