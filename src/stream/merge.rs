//! Fan-in combiner: merges several downloads of the same byte sequence
//! into one stream, failing over between replicas without losing or
//! duplicating a byte.

use bytes::Buf;
use tracing::debug;

use crate::error::FsError;
use crate::stream::{byte_channel, ByteSource, STREAM_CHANNEL_SIZE};

/// Combine `inputs`, which are expected to deliver the *same* byte
/// sequence. Reads from the first input; when it fails before
/// end-of-stream, switches to the next one, discarding bytes equal to the
/// count already emitted downstream. When no input can supply the next
/// required byte the combined stream fails with `TRUNCATED_STREAM`. Once
/// the elected input completes, every unused input is closed.
pub fn merge(inputs: Vec<ByteSource>) -> ByteSource {
    let (mut sink, out) = byte_channel(STREAM_CHANNEL_SIZE);
    tokio::spawn(async move {
        let mut emitted: u64 = 0;
        let mut inputs = inputs.into_iter();
        loop {
            let Some(mut input) = inputs.next() else {
                sink.abort(FsError::TruncatedStream(emitted)).await;
                return;
            };
            let mut to_skip = emitted;
            loop {
                match input.pull().await {
                    Ok(Some(mut buf)) => {
                        if (buf.len() as u64) <= to_skip {
                            to_skip -= buf.len() as u64;
                            continue;
                        }
                        if to_skip > 0 {
                            buf.advance(to_skip as usize);
                            to_skip = 0;
                        }
                        let len = buf.len() as u64;
                        if sink.push(buf).await.is_err() {
                            // Downstream cancelled; dropping the inputs
                            // closes them all.
                            return;
                        }
                        emitted += len;
                    }
                    Ok(None) => {
                        if to_skip > 0 {
                            // This replica holds fewer bytes than we have
                            // already emitted; it cannot continue the
                            // sequence.
                            debug!(skip = to_skip, "replica ended short, trying next");
                            break;
                        }
                        input.finish(Ok(()));
                        let _ = sink.finish().await;
                        return;
                    }
                    Err(e) => {
                        debug!(error = %e, emitted, "replica failed, switching");
                        break;
                    }
                }
            }
        }
    });
    out
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::stream::{byte_channel, read_bytes, ByteSink};

    async fn feed(mut sink: ByteSink, chunks: &[&'static [u8]], fail_after: bool) {
        for chunk in chunks {
            if sink.push(Bytes::from_static(chunk)).await.is_err() {
                return;
            }
        }
        if fail_after {
            sink.abort(FsError::StreamClosed).await;
        } else {
            let _ = sink.finish().await;
        }
    }

    #[tokio::test]
    async fn test_single_input_passthrough() {
        let (sink, source) = byte_channel(4);
        tokio::spawn(feed(sink, &[b"hello"], false));

        let got = read_bytes(merge(vec![source])).await.unwrap();
        assert_eq!(got, Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn test_failover_skips_already_emitted_bytes() {
        // Primary delivers "he" then dies; the secondary replays the whole
        // file and the combiner must drop its first two bytes.
        let (a_sink, a_source) = byte_channel(4);
        let (b_sink, b_source) = byte_channel(4);
        tokio::spawn(feed(a_sink, &[b"he"], true));
        tokio::spawn(feed(b_sink, &[b"hel", b"lo"], false));

        let got = read_bytes(merge(vec![a_source, b_source])).await.unwrap();
        assert_eq!(got, Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn test_failover_mid_buffer_boundary() {
        let (a_sink, a_source) = byte_channel(4);
        let (b_sink, b_source) = byte_channel(4);
        // Secondary chunking does not line up with the primary's.
        tokio::spawn(feed(a_sink, &[b"abc"], true));
        tokio::spawn(feed(b_sink, &[b"ab", b"cd", b"ef"], false));

        let got = read_bytes(merge(vec![a_source, b_source])).await.unwrap();
        assert_eq!(got, Bytes::from_static(b"abcdef"));
    }

    #[tokio::test]
    async fn test_truncated_when_no_replica_can_continue() {
        let (a_sink, a_source) = byte_channel(4);
        let (b_sink, b_source) = byte_channel(4);
        tokio::spawn(feed(a_sink, &[b"abcd"], true));
        // Shorter than what was already emitted: unusable.
        tokio::spawn(feed(b_sink, &[b"ab"], false));

        let err = read_bytes(merge(vec![a_source, b_source])).await.unwrap_err();
        assert!(matches!(err, FsError::TruncatedStream(4)));
    }

    #[tokio::test]
    async fn test_unused_inputs_are_closed_on_completion() {
        let (a_sink, a_source) = byte_channel(4);
        let (mut b_sink, b_source) = byte_channel(4);
        tokio::spawn(feed(a_sink, &[b"done"], false));

        let got = read_bytes(merge(vec![a_source, b_source])).await.unwrap();
        assert_eq!(got, Bytes::from_static(b"done"));

        // The merged stream completed off the primary, so the unused
        // secondary's producer observes cancellation.
        let err = loop {
            match b_sink.push(Bytes::from_static(b"x")).await {
                Ok(()) => continue,
                Err(e) => break e,
            }
        };
        assert!(matches!(err, FsError::StreamClosed));
    }
}
