//! FrameReader - pulls frames off a physical connection's pipe
//!
//! Pipe reads hand back whatever chunks happen to be queued, which rarely
//! line up with frame boundaries. The reader keeps the leftovers and serves
//! exact-length reads out of them.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::common::{BufferPool, PipeReader};
use crate::error::{Error, Result};

use super::frame::{check_metadata_len, FrameMetadata};

pub struct FrameReader {
    source: Arc<PipeReader>,
    pending: VecDeque<Bytes>,
    pending_len: usize,
    pool: BufferPool,
}

impl FrameReader {
    pub fn new(source: Arc<PipeReader>, pool: BufferPool) -> Self {
        Self {
            source,
            pending: VecDeque::new(),
            pending_len: 0,
            pool,
        }
    }

    /// Read the next frame header. `None` means the connection ended
    /// cleanly between frames.
    pub async fn read_metadata(&mut self) -> Result<Option<FrameMetadata>> {
        if !self.fill(2).await? {
            if self.pending_len == 0 {
                return Ok(None);
            }
            return Err(truncated());
        }

        let len = check_metadata_len(self.take_u16())?;
        if !self.fill(len).await? {
            return Err(truncated());
        }

        // Metadata is bounded, so it always fits one pooled buffer
        let mut scratch = self.pool.acquire();
        self.copy_into(len, &mut scratch);
        FrameMetadata::decode_body(&scratch).map(Some)
    }

    /// Read the length-prefixed data chunk that follows a DATA frame.
    pub async fn read_chunk(&mut self) -> Result<Bytes> {
        if !self.fill(2).await? {
            return Err(truncated());
        }
        let len = self.take_u16() as usize;
        if !self.fill(len).await? {
            return Err(truncated());
        }
        Ok(self.take(len))
    }

    /// Skip the data chunk that follows a DATA frame.
    pub async fn discard_chunk(&mut self) -> Result<()> {
        self.read_chunk().await.map(drop)
    }

    /// Make sure `n` bytes are pending. False if the source ended first.
    async fn fill(&mut self, n: usize) -> Result<bool> {
        while self.pending_len < n {
            match self.source.read().await? {
                Some(mb) => {
                    for chunk in mb {
                        if !chunk.is_empty() {
                            self.pending_len += chunk.len();
                            self.pending.push_back(chunk);
                        }
                    }
                }
                None => return Ok(false),
            }
        }
        Ok(true)
    }

    fn take_u16(&mut self) -> u16 {
        let mut raw = [0u8; 2];
        for byte in raw.iter_mut() {
            *byte = self.take_byte();
        }
        u16::from_be_bytes(raw)
    }

    fn take_byte(&mut self) -> u8 {
        let mut front = self.pending.pop_front().unwrap_or_default();
        let byte = front.get_u8();
        if !front.is_empty() {
            self.pending.push_front(front);
        }
        self.pending_len -= 1;
        byte
    }

    /// Take `n` pending bytes, zero-copy when they sit in one chunk.
    fn take(&mut self, n: usize) -> Bytes {
        if n == 0 {
            return Bytes::new();
        }
        if let Some(front) = self.pending.front_mut() {
            if front.len() >= n {
                let out = front.split_to(n);
                if front.is_empty() {
                    self.pending.pop_front();
                }
                self.pending_len -= n;
                return out;
            }
        }

        let mut out = BytesMut::with_capacity(n);
        self.copy_into(n, &mut out);
        out.freeze()
    }

    fn copy_into(&mut self, mut n: usize, dst: &mut BytesMut) {
        self.pending_len -= n;
        while n > 0 {
            let Some(mut front) = self.pending.pop_front() else {
                break;
            };
            if front.len() > n {
                dst.put_slice(&front.split_to(n));
                self.pending.push_front(front);
                break;
            }
            n -= front.len();
            dst.put_slice(&front);
        }
    }
}

fn truncated() -> Error {
    Error::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "frame truncated"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{pipe, PipeOptions, PipeWriter};
    use crate::mux::frame::{FrameOption, SessionStatus};

    fn reader_pair() -> (FrameReader, PipeWriter) {
        let (reader, writer) = pipe(PipeOptions::default().unbounded());
        (FrameReader::new(Arc::new(reader), BufferPool::default()), writer)
    }

    #[tokio::test]
    async fn test_frame_split_across_chunks() {
        let (mut reader, writer) = reader_pair();

        let mut wire = BytesMut::new();
        FrameMetadata::keep(4)
            .with_option(FrameOption::new().with_data())
            .encode_into(&mut wire)
            .unwrap();
        wire.put_u16(5);
        wire.put_slice(b"hello");

        // Dribble the frame in one byte at a time
        for byte in wire.iter() {
            writer.write(Bytes::copy_from_slice(&[*byte])).await.unwrap();
        }
        writer.close();

        let meta = reader.read_metadata().await.unwrap().unwrap();
        assert_eq!(meta.status, SessionStatus::Keep);
        assert_eq!(meta.session_id, 4);
        assert_eq!(&reader.read_chunk().await.unwrap()[..], b"hello");
        assert!(reader.read_metadata().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_several_frames_in_one_chunk() {
        let (mut reader, writer) = reader_pair();

        let mut wire = BytesMut::new();
        FrameMetadata::end(1).encode_into(&mut wire).unwrap();
        FrameMetadata::keep_alive(0).encode_into(&mut wire).unwrap();
        writer.write(wire.freeze()).await.unwrap();
        writer.close();

        assert_eq!(reader.read_metadata().await.unwrap().unwrap(), FrameMetadata::end(1));
        assert_eq!(reader.read_metadata().await.unwrap().unwrap(), FrameMetadata::keep_alive(0));
        assert!(reader.read_metadata().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_frame_is_error() {
        let (mut reader, writer) = reader_pair();
        writer.write(Bytes::from_static(&[0x00, 0x04, 0x00])).await.unwrap();
        writer.close();

        let err = reader.read_metadata().await.unwrap_err();
        assert!(err.is_eof());
    }

    #[tokio::test]
    async fn test_oversized_metadata_rejected() {
        let (mut reader, writer) = reader_pair();
        writer.write(Bytes::from_static(&[0xff, 0xff])).await.unwrap();

        let err = reader.read_metadata().await.unwrap_err();
        assert!(matches!(err, Error::Frame(_)));
    }

    #[tokio::test]
    async fn test_interrupted_source() {
        let (mut reader, writer) = reader_pair();
        writer.interrupt();
        assert!(matches!(reader.read_metadata().await, Err(Error::ClosedPipe)));
    }
}
