//! Serialized writes on the shared transport.
//!
//! Any number of producers hand fully encoded frames to the sink; a single
//! writer owns the transport's write half and delivers them strictly in
//! enqueue order, so frames from concurrent senders never interleave on the
//! wire. Each producer awaits its own completion and sees only its own
//! write error; a failed write does not stop the drain.
//!
//! The writer is a dedicated task rather than a drainer-elected-among-
//! producers: a producer future can be dropped by its caller at any await
//! point, and a dropped drainer mid-`write_all` would corrupt the stream
//! mid-frame. A producer that stops waiting abandons only its completion
//! notification; its bytes are still written in order.

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

enum Job {
    Write {
        bytes: Bytes,
        done: oneshot::Sender<Result<()>>,
    },
    Shutdown,
}

/// Handle to a connection's single transport writer.
pub(crate) struct FrameSink {
    tx: mpsc::UnboundedSender<Job>,
}

impl FrameSink {
    /// Take ownership of the transport's write half and start the writer.
    pub(crate) fn spawn<W>(io: W) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(drain(io, rx));
        Self { tx }
    }

    /// Enqueue an owned byte view and wait for it to reach the transport.
    pub(crate) async fn send(&self, bytes: Bytes) -> Result<()> {
        let done = self.enqueue(bytes)?;
        match done.await {
            Ok(result) => result,
            Err(_) => Err(closed()),
        }
    }

    /// Like [`send`](Self::send), but stop waiting when `cancel` fires.
    ///
    /// The bytes stay in the queue and are still delivered in order; only
    /// the wait is abandoned.
    pub(crate) async fn send_cancellable(
        &self,
        bytes: Bytes,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let done = self.enqueue(bytes)?;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = done => match result {
                Ok(result) => result,
                Err(_) => Err(closed()),
            },
        }
    }

    /// Ask the writer to finish queued work and shut the transport down.
    pub(crate) fn shutdown(&self) {
        let _ = self.tx.send(Job::Shutdown);
    }

    fn enqueue(&self, bytes: Bytes) -> Result<oneshot::Receiver<Result<()>>> {
        let (done, ready) = oneshot::channel();
        self.tx
            .send(Job::Write { bytes, done })
            .map_err(|_| closed())?;
        Ok(ready)
    }
}

fn closed() -> Error {
    Error::Io("transport write side is closed".into())
}

async fn drain<W>(mut io: W, mut rx: mpsc::UnboundedReceiver<Job>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(job) = rx.recv().await {
        match job {
            Job::Write { bytes, done } => {
                let result = write_one(&mut io, &bytes).await;
                let _ = done.send(result);
            }
            Job::Shutdown => break,
        }
    }
    // Anything that raced in behind the shutdown fails at its producer when
    // the completion sender is dropped.
    rx.close();
    while rx.try_recv().is_ok() {}
    let _ = io.shutdown().await;
}

async fn write_one<W>(io: &mut W, bytes: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    io.write_all(bytes).await?;
    io.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::sync::{Arc, Mutex};
    use std::task::{Context, Poll};

    /// Collects everything written, visible from the test side.
    #[derive(Clone, Default)]
    struct SharedWriter {
        data: Arc<Mutex<Vec<u8>>>,
    }

    impl AsyncWrite for SharedWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            self.data.lock().unwrap().extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_single_producer_in_order() {
        let writer = SharedWriter::default();
        let sink = FrameSink::spawn(writer.clone());

        for i in 0u8..10 {
            sink.send(Bytes::from(vec![i; 3])).await.unwrap();
        }

        let written = writer.data.lock().unwrap().clone();
        let expected: Vec<u8> = (0u8..10).flat_map(|i| vec![i; 3]).collect();
        assert_eq!(written, expected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_producers_fifo_per_producer() {
        const PRODUCERS: usize = 8;
        const FRAMES: usize = 100;
        const RECORD: usize = 4;

        let writer = SharedWriter::default();
        let sink = Arc::new(FrameSink::spawn(writer.clone()));

        let mut set = tokio::task::JoinSet::new();
        for producer in 0..PRODUCERS {
            let sink = sink.clone();
            set.spawn(async move {
                for seq in 0..FRAMES {
                    let record = [
                        producer as u8,
                        (seq >> 8) as u8,
                        (seq & 0xFF) as u8,
                        0xEE,
                    ];
                    sink.send(Bytes::copy_from_slice(&record)).await.unwrap();
                }
            });
        }
        while let Some(result) = set.join_next().await {
            result.unwrap();
        }

        let written = writer.data.lock().unwrap().clone();
        assert_eq!(written.len(), PRODUCERS * FRAMES * RECORD);

        // Each record must be intact and each producer's sequence numbers
        // strictly increasing.
        let mut next_seq = vec![0usize; PRODUCERS];
        for record in written.chunks_exact(RECORD) {
            assert_eq!(record[3], 0xEE, "record interleaved on the wire");
            let producer = record[0] as usize;
            let seq = ((record[1] as usize) << 8) | record[2] as usize;
            assert_eq!(seq, next_seq[producer], "producer {producer} out of order");
            next_seq[producer] += 1;
        }
        assert!(next_seq.iter().all(|&n| n == FRAMES));
    }

    #[tokio::test]
    async fn test_cancelled_wait_still_writes() {
        let writer = SharedWriter::default();
        let sink = FrameSink::spawn(writer.clone());

        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = sink
            .send_cancellable(Bytes::from_static(b"abc"), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, Error::Cancelled);

        // The queued bytes are delivered regardless of the abandoned wait.
        sink.send(Bytes::from_static(b"def")).await.unwrap();
        let written = writer.data.lock().unwrap().clone();
        assert_eq!(written, b"abcdef");
    }

    #[tokio::test]
    async fn test_send_after_shutdown_fails() {
        let writer = SharedWriter::default();
        let sink = FrameSink::spawn(writer.clone());

        sink.send(Bytes::from_static(b"ok")).await.unwrap();
        sink.shutdown();

        // Enqueued behind the shutdown, so the writer drops it unwritten.
        let result = sink.send(Bytes::from_static(b"late")).await;
        assert!(result.is_err());
        let written = writer.data.lock().unwrap().clone();
        assert_eq!(written, b"ok");
    }
}
