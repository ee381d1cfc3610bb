//! Byte stream primitives.
//!
//! A stream is a lazy, finite sequence of [`Bytes`] buffers flowing from a
//! [`ByteSink`] (producer half) to a [`ByteSource`] (consumer half) over a
//! bounded channel, so the slowest consumer paces the producer.
//!
//! End-of-stream is a separate acknowledgement: [`ByteSink::finish`]
//! resolves only once the consumer has durably accepted the last buffer
//! and called [`ByteSource::finish`]. That separation is what the fan-out
//! splitter and fan-in combiner are built on. Dropping either half is
//! cancellation and propagates to the peer.

pub mod merge;
pub mod split;

pub use merge::merge;
pub use split::{split, SplitErrorHook};

use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, oneshot};

use crate::error::{FsError, FsResult};

/// Buffers in flight between producer and consumer
pub const STREAM_CHANNEL_SIZE: usize = 8;

/// Chunk size used when reading files into a stream
pub const DATA_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug)]
enum StreamMsg {
    Data(Bytes),
    End,
    Abort(FsError),
}

/// Producer half of a byte stream.
#[derive(Debug)]
pub struct ByteSink {
    tx: mpsc::Sender<StreamMsg>,
    ack: oneshot::Receiver<FsResult<()>>,
}

/// Consumer half of a byte stream.
#[derive(Debug)]
pub struct ByteSource {
    rx: mpsc::Receiver<StreamMsg>,
    ack: Option<oneshot::Sender<FsResult<()>>>,
    ended: bool,
}

/// Create a bounded byte stream conduit.
pub fn byte_channel(capacity: usize) -> (ByteSink, ByteSource) {
    let (tx, rx) = mpsc::channel(capacity);
    let (ack_tx, ack_rx) = oneshot::channel();
    (
        ByteSink { tx, ack: ack_rx },
        ByteSource {
            rx,
            ack: Some(ack_tx),
            ended: false,
        },
    )
}

impl ByteSink {
    /// Push one buffer. Blocks while the channel is full.
    ///
    /// When the consumer has already failed or vanished, returns the
    /// consumer's terminal result if one was posted, [`FsError::StreamClosed`]
    /// otherwise.
    pub async fn push(&mut self, buf: Bytes) -> FsResult<()> {
        if self.tx.send(StreamMsg::Data(buf)).await.is_err() {
            return Err(self.consumer_outcome().await);
        }
        Ok(())
    }

    /// Signal end-of-stream and wait for the consumer's commit
    /// acknowledgement.
    pub async fn finish(self) -> FsResult<()> {
        let _ = self.tx.send(StreamMsg::End).await;
        match self.ack.await {
            Ok(result) => result,
            Err(_) => Err(FsError::StreamClosed),
        }
    }

    /// Fail the stream, handing the cause to the consumer.
    pub async fn abort(self, err: FsError) {
        let _ = self.tx.send(StreamMsg::Abort(err)).await;
    }

    async fn consumer_outcome(&mut self) -> FsError {
        match (&mut self.ack).await {
            Ok(Err(e)) => e,
            _ => FsError::StreamClosed,
        }
    }
}

impl ByteSource {
    /// Receive the next buffer. `Ok(None)` is a clean end-of-stream;
    /// the caller is expected to follow up with [`ByteSource::finish`].
    pub async fn pull(&mut self) -> FsResult<Option<Bytes>> {
        if self.ended {
            return Ok(None);
        }
        match self.rx.recv().await {
            Some(StreamMsg::Data(buf)) => Ok(Some(buf)),
            Some(StreamMsg::End) => {
                self.ended = true;
                Ok(None)
            }
            Some(StreamMsg::Abort(e)) => Err(e),
            None => Err(FsError::StreamClosed),
        }
    }

    /// Acknowledge end-of-stream (or report the commit failure). Resolves
    /// the producer's [`ByteSink::finish`].
    pub fn finish(mut self, result: FsResult<()>) {
        if let Some(ack) = self.ack.take() {
            let _ = ack.send(result);
        }
    }
}

/// Fixed-size transformer: the wrapped stream must deliver exactly `size`
/// bytes. Overruns fail with `UNEXPECTED_DATA` at push time, underruns
/// with `UNEXPECTED_END_OF_STREAM` at commit time.
pub fn sized(mut inner: ByteSink, size: u64) -> ByteSink {
    let (sink, mut source) = byte_channel(STREAM_CHANNEL_SIZE);
    tokio::spawn(async move {
        let mut seen: u64 = 0;
        loop {
            match source.pull().await {
                Ok(Some(buf)) => {
                    seen += buf.len() as u64;
                    if seen > size {
                        inner.abort(FsError::UnexpectedData).await;
                        source.finish(Err(FsError::UnexpectedData));
                        return;
                    }
                    if let Err(e) = inner.push(buf).await {
                        source.finish(Err(e));
                        return;
                    }
                }
                Ok(None) => {
                    if seen < size {
                        inner.abort(FsError::UnexpectedEndOfStream).await;
                        source.finish(Err(FsError::UnexpectedEndOfStream));
                    } else {
                        let result = inner.finish().await;
                        source.finish(result);
                    }
                    return;
                }
                Err(e) => {
                    inner.abort(e).await;
                    return;
                }
            }
        }
    });
    sink
}

/// Drain `source` into `sink`, propagating end-of-stream and the commit
/// acknowledgement. Returns the number of bytes moved.
pub async fn pump(mut source: ByteSource, mut sink: ByteSink) -> FsResult<u64> {
    let mut moved: u64 = 0;
    loop {
        match source.pull().await {
            Ok(Some(buf)) => {
                moved += buf.len() as u64;
                if let Err(e) = sink.push(buf).await {
                    source.finish(Err(FsError::StreamClosed));
                    return Err(e);
                }
            }
            Ok(None) => {
                let result = sink.finish().await;
                source.finish(if result.is_ok() {
                    Ok(())
                } else {
                    Err(FsError::StreamClosed)
                });
                return result.map(|()| moved);
            }
            Err(e) => {
                sink.abort(FsError::StreamClosed).await;
                return Err(e);
            }
        }
    }
}

/// Push one in-memory buffer through a sink and wait for the commit ack.
pub async fn write_bytes(mut sink: ByteSink, data: Bytes) -> FsResult<()> {
    if !data.is_empty() {
        sink.push(data).await?;
    }
    sink.finish().await
}

/// Collect a whole source into memory, acknowledging end-of-stream.
pub async fn read_bytes(mut source: ByteSource) -> FsResult<Bytes> {
    let mut acc = BytesMut::new();
    loop {
        match source.pull().await {
            Ok(Some(buf)) => acc.extend_from_slice(&buf),
            Ok(None) => {
                source.finish(Ok(()));
                return Ok(acc.freeze());
            }
            Err(e) => return Err(e),
        }
    }
}
