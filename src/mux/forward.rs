//! Per-session plumbing shared by the client and server workers

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::common::{BufferPool, PipeReader, PipeWriter};
use crate::error::{Error, Result};
use crate::metrics::{MUX_BYTES_RECEIVED, MUX_BYTES_SENT, MUX_FRAME_ERRORS};

use super::frame::{FrameMetadata, TransferType};
use super::reader::FrameReader;
use super::session::{Session, SessionManager};
use super::writer::FrameWriter;
use super::Role;

/// Which side of a copy failed
pub(crate) enum CopyError {
    /// The session itself failed: its input broke or a payload could not be
    /// framed. Only this session is affected.
    Local(Error),
    /// The shared physical connection failed
    Write(Error),
}

impl CopyError {
    /// Classify a failed framed write. Framing errors stay with the session;
    /// anything else means the connection is gone.
    pub(crate) fn from_write(err: Error) -> Self {
        match err {
            Error::Frame(_) => CopyError::Local(err),
            err => CopyError::Write(err),
        }
    }
}

/// Frame everything from `input` until it reports EOF.
pub(crate) async fn copy_to_frames(
    input: &PipeReader,
    writer: &mut FrameWriter,
    role: Role,
) -> std::result::Result<(), CopyError> {
    loop {
        let mb = match input.read().await {
            Ok(Some(mb)) => mb,
            Ok(None) => return Ok(()),
            Err(e) => return Err(CopyError::Local(e)),
        };

        let size: usize = mb.iter().map(Bytes::len).sum();
        writer.write_multi(mb).await.map_err(CopyError::from_write)?;
        MUX_BYTES_SENT
            .with_label_values(&[role.as_str()])
            .inc_by(size as u64);
    }
}

/// Settle a session's uplink once its copy loop has stopped: send End
/// (with the Error bit on a local failure) and drop the session from the
/// table when nothing is left to do.
///
/// Returns an error when the shared connection can no longer be written;
/// the caller must then close the whole worker.
pub(crate) async fn finish_uplink(
    tag: &str,
    sessions: &SessionManager,
    session: &Arc<Session>,
    writer: &mut FrameWriter,
    result: std::result::Result<(), CopyError>,
) -> Result<()> {
    let id = session.id();
    match result {
        Ok(()) => {
            let sent = writer.close().await;
            if session.mark_uplink_closed() {
                sessions.release(session);
            }
            sent
        }
        Err(CopyError::Local(e)) => {
            debug!("[{}] session {} failed: {}", tag, id, e.in_session(id));
            writer.mark_error();
            let sent = writer.close().await;
            session.close_with_error();
            sessions.release(session);
            sent
        }
        Err(CopyError::Write(e)) => {
            debug!("[{}] session {} lost its connection: {}", tag, id, e);
            session.close_with_error();
            sessions.release(session);
            Err(e)
        }
    }
}

/// Hand one received chunk to the session's output. A failed delivery
/// aborts the session; its uplink task then reports the error to the peer.
pub(crate) async fn deliver(tag: &str, session: &Session, chunk: Bytes, role: Role) {
    let size = chunk.len();
    if let Err(e) = session.output().write(chunk).await {
        debug!("[{}] session {} output failed: {}", tag, session.id(), e);
        session.close_with_error();
        return;
    }
    MUX_BYTES_RECEIVED
        .with_label_values(&[role.as_str()])
        .inc_by(size as u64);
}

/// Skip the chunk of a frame nobody will consume
pub(crate) async fn drain_data(meta: &FrameMetadata, reader: &mut FrameReader) -> Result<()> {
    if meta.option.has_data() {
        reader.discard_chunk().await?;
    }
    Ok(())
}

/// Keep: route the chunk to its session. Unknown ids get the chunk skipped
/// and an End so the peer stops sending.
pub(crate) async fn handle_keep(
    tag: &str,
    role: Role,
    sessions: &SessionManager,
    meta: &FrameMetadata,
    reader: &mut FrameReader,
    conn_writer: &Arc<PipeWriter>,
    pool: &BufferPool,
) -> Result<()> {
    if !meta.option.has_data() {
        return Ok(());
    }

    match sessions.get(meta.session_id) {
        Some(session) => {
            let chunk = reader.read_chunk().await?;
            deliver(tag, &session, chunk, role).await;
            Ok(())
        }
        None => {
            reader.discard_chunk().await?;
            trace!("[{}] keep for unknown session {}, ending it", tag, meta.session_id);
            let mut closing = FrameWriter::response(
                meta.session_id,
                Arc::clone(conn_writer),
                TransferType::Stream,
                pool.clone(),
            );
            closing.close().await
        }
    }
}

/// End: deliver any trailing chunk, then half-close the session (or abort
/// it when the Error bit is set).
pub(crate) async fn handle_end(
    tag: &str,
    role: Role,
    sessions: &SessionManager,
    meta: &FrameMetadata,
    reader: &mut FrameReader,
) -> Result<()> {
    let Some(session) = sessions.get(meta.session_id) else {
        return drain_data(meta, reader).await;
    };

    if meta.option.has_data() {
        let chunk = reader.read_chunk().await?;
        deliver(tag, &session, chunk, role).await;
    }

    if meta.option.has_error() {
        debug!("[{}] session {} ended with error by peer", tag, session.id());
        session.close_with_error();
        sessions.release(&session);
    } else {
        session.close();
        if session.mark_downlink_closed() {
            sessions.release(&session);
        }
    }
    Ok(())
}

/// Log why a demux loop stopped. EOF is never an error.
pub(crate) fn log_read_error(tag: &str, role: Role, err: &Error) {
    match err {
        Error::Frame(_) => {
            MUX_FRAME_ERRORS.with_label_values(&[role.as_str()]).inc();
            warn!("[{}] malformed frame, dropping connection: {}", tag, err);
        }
        Error::ClosedPipe => trace!("[{}] connection closed", tag),
        e if e.is_eof() => debug!("[{}] connection ended mid-frame", tag),
        e => debug!("[{}] connection read failed: {}", tag, e),
    }
}
