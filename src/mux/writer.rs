//! FrameWriter - frames one session's payload onto a shared connection
//!
//! Several session tasks write to the same physical pipe. Each frame (header
//! plus its chunk) goes in as one `write_multi` batch, so frames from
//! different sessions never interleave mid-frame.

use std::sync::Arc;

use bytes::{BufMut, Bytes};

use crate::common::{BufferPool, Destination, MultiBuffer, PipeWriter};
use crate::error::{Error, Result};

use super::frame::{FrameMetadata, FrameOption, TransferType, MAX_CHUNK_SIZE};

pub struct FrameWriter {
    id: u16,
    target: Option<Destination>,
    output: Arc<PipeWriter>,
    transfer: TransferType,
    /// Set once the New frame has gone out
    followup: bool,
    has_error: bool,
    pool: BufferPool,
}

impl FrameWriter {
    /// Writer for a session this side opens: the first frame is New.
    pub fn new(id: u16, target: Destination, output: Arc<PipeWriter>, pool: BufferPool) -> Self {
        Self {
            id,
            transfer: TransferType::from(target.network),
            target: Some(target),
            output,
            followup: false,
            has_error: false,
            pool,
        }
    }

    /// Writer for the response half of a session the peer opened.
    pub fn response(id: u16, output: Arc<PipeWriter>, transfer: TransferType, pool: BufferPool) -> Self {
        Self {
            id,
            target: None,
            output,
            transfer,
            followup: true,
            has_error: false,
            pool,
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    /// The End frame sent by [`close`](Self::close) will carry the Error bit.
    pub fn mark_error(&mut self) {
        self.has_error = true;
    }

    pub fn has_error(&self) -> bool {
        self.has_error
    }

    /// Frame and send a batch. An empty batch sends a metadata-only frame,
    /// which is how a New without payload goes out.
    pub async fn write_multi(&mut self, mb: MultiBuffer) -> Result<()> {
        let total: usize = mb.iter().map(Bytes::len).sum();
        if total == 0 {
            let meta = self.next_metadata();
            return self.send(meta, Vec::new(), 0).await;
        }

        match self.transfer {
            TransferType::Stream => self.write_stream(mb).await,
            TransferType::Packet => self.write_packets(mb).await,
        }
    }

    /// Send End for this session
    pub async fn close(&mut self) -> Result<()> {
        let mut option = FrameOption::new();
        if self.has_error {
            option = option.with_error();
        }
        let meta = FrameMetadata::end(self.id).with_option(option);
        self.send(meta, Vec::new(), 0).await
    }

    async fn write_stream(&mut self, mb: MultiBuffer) -> Result<()> {
        let mut pieces = Vec::new();
        let mut size = 0;

        for mut chunk in mb {
            while !chunk.is_empty() {
                let take = chunk.len().min(MAX_CHUNK_SIZE - size);
                pieces.push(chunk.split_to(take));
                size += take;

                if size == MAX_CHUNK_SIZE {
                    self.write_data(std::mem::take(&mut pieces), size).await?;
                    size = 0;
                }
            }
        }

        if size > 0 {
            self.write_data(pieces, size).await?;
        }
        Ok(())
    }

    /// One frame per datagram; boundaries are never merged or split.
    async fn write_packets(&mut self, mb: MultiBuffer) -> Result<()> {
        for datagram in mb {
            if datagram.is_empty() {
                continue;
            }
            if datagram.len() > u16::MAX as usize {
                return Err(Error::Frame(format!("datagram too large: {}", datagram.len())));
            }
            let size = datagram.len();
            self.write_data(vec![datagram], size).await?;
        }
        Ok(())
    }

    async fn write_data(&mut self, pieces: MultiBuffer, size: usize) -> Result<()> {
        let meta = self
            .next_metadata()
            .with_option(FrameOption::new().with_data());
        self.send(meta, pieces, size).await
    }

    fn next_metadata(&mut self) -> FrameMetadata {
        match (self.followup, &self.target) {
            (false, Some(target)) => {
                self.followup = true;
                FrameMetadata::new_session(self.id, target.clone())
            }
            _ => FrameMetadata::keep(self.id),
        }
    }

    async fn send(&self, meta: FrameMetadata, pieces: MultiBuffer, size: usize) -> Result<()> {
        let mut header = self.pool.acquire();
        meta.encode_into(&mut header)?;
        if meta.option.has_data() {
            header.put_u16(size as u16);
        }

        let mut frame = Vec::with_capacity(pieces.len() + 1);
        frame.push(Bytes::copy_from_slice(&header));
        drop(header);
        frame.extend(pieces);
        self.output.write_multi(frame).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{pipe, Address, PipeOptions, PipeReader};
    use crate::mux::frame::SessionStatus;
    use crate::mux::FrameReader;

    fn shared_output() -> (FrameReader, Arc<PipeWriter>, BufferPool) {
        let (reader, writer): (PipeReader, PipeWriter) = pipe(PipeOptions::default().unbounded());
        let pool = BufferPool::default();
        (FrameReader::new(Arc::new(reader), pool.clone()), Arc::new(writer), pool)
    }

    fn data(s: &'static [u8]) -> MultiBuffer {
        vec![Bytes::from_static(s)]
    }

    async fn expect(
        reader: &mut FrameReader,
        id: u16,
        status: SessionStatus,
        target: Option<&Destination>,
        payload: Option<&[u8]>,
    ) {
        let meta = reader.read_metadata().await.unwrap().unwrap();
        assert_eq!(meta.session_id, id);
        assert_eq!(meta.status, status);
        assert_eq!(meta.target.as_ref(), target);
        assert_eq!(meta.option.has_data(), payload.is_some());
        if let Some(payload) = payload {
            assert_eq!(&reader.read_chunk().await.unwrap()[..], payload);
        }
    }

    #[tokio::test]
    async fn test_three_sessions_on_one_connection() {
        let (mut reader, output, pool) = shared_output();

        let dest1 = Destination::tcp(Address::domain("www.example.com", 80));
        let dest2 = Destination::udp(Address::domain("www.example.com", 53));
        let dest3 = Destination::tcp(Address::domain("www.example.com", 443));

        let mut writer1 = FrameWriter::new(1, dest1.clone(), Arc::clone(&output), pool.clone());
        let mut writer2 = FrameWriter::new(2, dest2.clone(), Arc::clone(&output), pool.clone());
        let mut writer3 = FrameWriter::new(3, dest3.clone(), Arc::clone(&output), pool.clone());

        writer1.write_multi(data(b"abcd")).await.unwrap();
        writer2.write_multi(Vec::new()).await.unwrap();
        writer1.write_multi(data(b"efgh")).await.unwrap();
        writer3.write_multi(data(b"x")).await.unwrap();
        writer1.close().await.unwrap();
        writer3.close().await.unwrap();
        writer2.write_multi(data(b"y")).await.unwrap();
        writer2.close().await.unwrap();
        output.close();

        expect(&mut reader, 1, SessionStatus::New, Some(&dest1), Some(b"abcd")).await;
        expect(&mut reader, 2, SessionStatus::New, Some(&dest2), None).await;
        expect(&mut reader, 1, SessionStatus::Keep, None, Some(b"efgh")).await;
        expect(&mut reader, 3, SessionStatus::New, Some(&dest3), Some(b"x")).await;
        expect(&mut reader, 1, SessionStatus::End, None, None).await;
        expect(&mut reader, 3, SessionStatus::End, None, None).await;
        expect(&mut reader, 2, SessionStatus::Keep, None, Some(b"y")).await;
        expect(&mut reader, 2, SessionStatus::End, None, None).await;
        assert!(reader.read_metadata().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stream_split_into_chunks() {
        let (mut reader, output, pool) = shared_output();
        let dest = Destination::tcp(Address::domain("example.com", 80));
        let mut writer = FrameWriter::new(7, dest, Arc::clone(&output), pool);

        let payload: Vec<u8> = (0..20_000u32).map(|i| i as u8).collect();
        let (head, tail) = payload.split_at(5_000);
        writer
            .write_multi(vec![Bytes::copy_from_slice(head), Bytes::copy_from_slice(tail)])
            .await
            .unwrap();
        output.close();

        let mut sizes = Vec::new();
        let mut received = Vec::new();
        while let Some(meta) = reader.read_metadata().await.unwrap() {
            let expected = if sizes.is_empty() { SessionStatus::New } else { SessionStatus::Keep };
            assert_eq!(meta.status, expected);
            let chunk = reader.read_chunk().await.unwrap();
            sizes.push(chunk.len());
            received.extend_from_slice(&chunk);
        }
        assert_eq!(sizes, vec![MAX_CHUNK_SIZE, MAX_CHUNK_SIZE, 20_000 - 2 * MAX_CHUNK_SIZE]);
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn test_packets_keep_boundaries() {
        let (mut reader, output, pool) = shared_output();
        let mut writer = FrameWriter::response(4, Arc::clone(&output), TransferType::Packet, pool);

        writer
            .write_multi(vec![Bytes::from_static(b"one"), Bytes::from_static(b"three")])
            .await
            .unwrap();
        output.close();

        expect(&mut reader, 4, SessionStatus::Keep, None, Some(b"one")).await;
        expect(&mut reader, 4, SessionStatus::Keep, None, Some(b"three")).await;
        assert!(reader.read_metadata().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_datagram_rejected() {
        let (_reader, output, pool) = shared_output();
        let dest = Destination::udp(Address::domain("example.com", 53));
        let mut writer = FrameWriter::new(1, dest, output, pool);

        let result = writer.write_multi(vec![Bytes::from(vec![0u8; 70_000])]).await;
        assert!(matches!(result, Err(Error::Frame(_))));
    }

    #[tokio::test]
    async fn test_close_with_error_bit() {
        let (mut reader, output, pool) = shared_output();
        let mut writer = FrameWriter::response(9, Arc::clone(&output), TransferType::Stream, pool);
        writer.mark_error();
        writer.close().await.unwrap();
        output.close();

        let meta = reader.read_metadata().await.unwrap().unwrap();
        assert_eq!(meta.status, SessionStatus::End);
        assert!(meta.option.has_error());
    }

    #[tokio::test]
    async fn test_write_to_closed_connection_fails() {
        let (_reader, output, pool) = shared_output();
        output.interrupt();
        let mut writer = FrameWriter::response(1, output, TransferType::Stream, pool);
        assert!(matches!(writer.write_multi(Vec::new()).await, Err(Error::ClosedPipe)));
    }
}
