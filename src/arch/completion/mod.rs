//! Completion-driven architecture on the tokio runtime.
//!
//! Every read and write is issued as an asynchronous operation; the code after
//! each `.await` is the completion continuation. Per connection there is at
//! most one read chain and one write chain:
//!
//! - reads are re-armed as soon as an envelope completes,
//! - writes go through a [`WriteQueue`] whose in-flight counter starts a
//!   drain task only on the 0 to 1 transition.

mod client;
mod server;

pub use client::AsyncClient;
pub use server::AsyncServer;

use crate::arch::lifecycle::lock;
use crate::codec::FrameDecoder;
use crate::error::{is_disconnect_kind, Result};
use bytes::Bytes;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::runtime::Handle;
use tracing::{debug, warn};

/// Read one envelope. `Ok(None)` on a clean end of stream.
pub(crate) async fn read_frame<R>(reader: &mut R) -> Result<Option<Bytes>>
where
    R: AsyncRead + Unpin,
{
    let mut decoder = FrameDecoder::new();
    loop {
        let n = reader.read(decoder.unfilled()).await?;
        if n == 0 {
            decoder.finish()?;
            return Ok(None);
        }
        if let Some(frame) = decoder.advance(n)? {
            return Ok(Some(frame));
        }
    }
}

/// Write a whole envelope, reissuing partial writes against the remainder.
pub(crate) async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0;
    while written < frame.len() {
        let n = writer.write(&frame[written..]).await?;
        if n == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
        written += n;
    }
    Ok(())
}

/// FIFO of outbound envelopes drained by at most one task at a time.
pub(crate) struct WriteQueue<W> {
    name: String,
    in_flight: AtomicUsize,
    pending: Mutex<VecDeque<Bytes>>,
    writer: tokio::sync::Mutex<W>,
    broken: AtomicBool,
    handle: Handle,
}

impl<W> WriteQueue<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(name: String, writer: W, handle: Handle) -> Self {
        Self {
            name,
            in_flight: AtomicUsize::new(0),
            pending: Mutex::new(VecDeque::new()),
            writer: tokio::sync::Mutex::new(writer),
            broken: AtomicBool::new(false),
            handle,
        }
    }

    /// Enqueue an envelope; starts the write chain if none is running.
    pub fn push(self: &Arc<Self>, frame: Bytes) {
        lock(&self.pending).push_back(frame);
        if self.in_flight.fetch_add(1, Ordering::AcqRel) == 0 {
            let queue = Arc::clone(self);
            self.handle.spawn(async move { queue.drain().await });
        }
    }

    async fn drain(&self) {
        let mut writer = self.writer.lock().await;
        loop {
            let frame = lock(&self.pending).pop_front();
            if let Some(frame) = frame {
                if !self.broken.load(Ordering::Acquire) {
                    if let Err(e) = write_frame(&mut *writer, &frame).await {
                        self.broken.store(true, Ordering::Release);
                        if is_disconnect_kind(e.kind()) {
                            debug!(conn = %self.name, error = %e, "Peer gone, dropping writes");
                        } else {
                            warn!(conn = %self.name, error = %e, "Write failed");
                        }
                    }
                }
            }
            if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::error::Error;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn test_read_frame_across_fragments() {
        let frame = codec::encode(&"hello".to_string()).unwrap();
        let mut mock = Builder::new()
            .read(&frame[..2])
            .read(&frame[2..5])
            .read(&frame[5..])
            .build();
        let payload = read_frame(&mut mock).await.unwrap().unwrap();
        let decoded: String = codec::decode_payload(&payload).unwrap();
        assert_eq!(decoded, "hello");
        assert!(read_frame(&mut mock).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_frame_truncated() {
        let frame = codec::encode(&7u64).unwrap();
        let mut mock = Builder::new().read(&frame[..6]).build();
        assert!(matches!(
            read_frame(&mut mock).await,
            Err(Error::Framing { .. })
        ));
    }

    #[tokio::test]
    async fn test_write_frame_reissues_remainder() {
        let frame = codec::encode(&vec![1u8, 2, 3, 4]).unwrap();
        // each mock write accepts at most the expected chunk
        let mut mock = Builder::new()
            .write(&frame[..3])
            .write(&frame[3..])
            .build();
        write_frame(&mut mock, &frame).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_write_queue_preserves_order() {
        let (client, mut server) = tokio::io::duplex(64);
        let queue = Arc::new(WriteQueue::new(
            "test".into(),
            client,
            Handle::current(),
        ));

        let reader = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(frame) = read_frame(&mut server).await.unwrap() {
                seen.push(codec::decode_payload::<u32>(&frame).unwrap());
                if seen.len() == 200 {
                    break;
                }
            }
            seen
        });

        for i in 0..200u32 {
            queue.push(codec::encode(&i).unwrap());
            if i % 17 == 0 {
                tokio::task::yield_now().await;
            }
        }

        let seen = reader.await.unwrap();
        assert_eq!(seen, (0..200).collect::<Vec<_>>());
    }
}
