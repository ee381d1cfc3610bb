//! Fan-out splitter: one inbound byte stream duplicated to K downstream
//! sinks, acknowledging end-of-stream once at least `required_acks` of
//! them have committed.

use futures::future::join_all;

use crate::error::{FsError, FsResult};
use crate::stream::{byte_channel, ByteSink, STREAM_CHANNEL_SIZE};

/// Invoked with the index of a downstream that failed and the cause.
/// Returning an error aborts the whole stream with that error.
pub type SplitErrorHook = Box<dyn FnMut(usize, &FsError) -> FsResult<()> + Send>;

/// Duplicate one stream to `outputs`. Buffers are forwarded as ref-counted
/// [`bytes::Bytes`] clones, not copied. A failing downstream is dropped and
/// reported through `on_error`; the splitter keeps going while at least
/// `required_acks` downstreams survive.
pub fn split(outputs: Vec<ByteSink>, required_acks: usize, mut on_error: SplitErrorHook) -> ByteSink {
    debug_assert!(outputs.len() >= required_acks);

    let (sink, mut source) = byte_channel(STREAM_CHANNEL_SIZE);
    tokio::spawn(async move {
        let mut outs: Vec<Option<ByteSink>> = outputs.into_iter().map(Some).collect();
        let mut live = outs.len();
        loop {
            match source.pull().await {
                Ok(Some(buf)) => {
                    let pushes = outs.iter_mut().enumerate().filter_map(|(i, slot)| {
                        let buf = buf.clone();
                        slot.as_mut().map(|out| async move { (i, out.push(buf).await) })
                    });
                    let mut fatal: Option<FsError> = None;
                    for (i, result) in join_all(pushes).await {
                        if let Err(e) = result {
                            outs[i] = None;
                            live -= 1;
                            if let Err(f) = on_error(i, &e) {
                                fatal.get_or_insert(f);
                            }
                        }
                    }
                    // Losing the last required replica outranks whatever
                    // the hook decided.
                    if live < required_acks {
                        source.finish(Err(FsError::NotEnoughUploadTargets {
                            required: required_acks,
                            got: live,
                        }));
                        return;
                    }
                    if let Some(f) = fatal {
                        source.finish(Err(f));
                        return;
                    }
                }
                Ok(None) => {
                    let commits = outs.iter_mut().enumerate().filter_map(|(i, slot)| {
                        slot.take().map(|out| async move { (i, out.finish().await) })
                    });
                    let mut acked = 0;
                    for (i, result) in join_all(commits).await {
                        match result {
                            Ok(()) => acked += 1,
                            // Commit-stage failures still evict the
                            // partition, but cannot abort a stream that
                            // already has enough acknowledgements.
                            Err(e) => {
                                let _ = on_error(i, &e);
                            }
                        }
                    }
                    source.finish(if acked >= required_acks {
                        Ok(())
                    } else {
                        Err(FsError::NotEnoughUploadTargets {
                            required: required_acks,
                            got: acked,
                        })
                    });
                    return;
                }
                // Upstream aborted or vanished: dropping the downstream
                // sinks propagates the cancellation.
                Err(_) => return,
            }
        }
    });
    sink
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::stream::read_bytes;

    fn no_hook() -> SplitErrorHook {
        Box::new(|_, _| Ok(()))
    }

    #[tokio::test]
    async fn test_duplicates_to_all_downstreams() {
        let (a_sink, a_source) = byte_channel(4);
        let (b_sink, b_source) = byte_channel(4);
        let a = tokio::spawn(read_bytes(a_source));
        let b = tokio::spawn(read_bytes(b_source));

        let mut sink = split(vec![a_sink, b_sink], 2, no_hook());
        sink.push(Bytes::from_static(b"hel")).await.unwrap();
        sink.push(Bytes::from_static(b"lo")).await.unwrap();
        sink.finish().await.unwrap();

        assert_eq!(a.await.unwrap().unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(b.await.unwrap().unwrap(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn test_survives_one_failure_above_min() {
        let (a_sink, a_source) = byte_channel(4);
        let (b_sink, b_source) = byte_channel(4);
        let a = tokio::spawn(read_bytes(a_source));
        drop(b_source); // downstream b fails immediately

        let mut failed = Vec::new();
        let (tx, rx) = std::sync::mpsc::channel();
        let hook: SplitErrorHook = Box::new(move |i, _| {
            tx.send(i).unwrap();
            Ok(())
        });

        let mut sink = split(vec![a_sink, b_sink], 1, hook);
        sink.push(Bytes::from_static(b"hello")).await.unwrap();
        sink.finish().await.unwrap();

        assert_eq!(a.await.unwrap().unwrap(), Bytes::from_static(b"hello"));
        failed.extend(rx.try_iter());
        assert_eq!(failed, vec![1]);
    }

    #[tokio::test]
    async fn test_fails_below_min_acks() {
        let (a_sink, a_source) = byte_channel(4);
        let (b_sink, b_source) = byte_channel(4);
        drop(a_source);
        drop(b_source);

        let mut sink = split(vec![a_sink, b_sink], 2, no_hook());
        let err = match sink.push(Bytes::from_static(b"x")).await {
            Err(e) => e,
            Ok(()) => sink.finish().await.unwrap_err(),
        };
        assert!(matches!(err, FsError::NotEnoughUploadTargets { .. }));
    }

    #[tokio::test]
    async fn test_hook_can_abort_stream() {
        let (a_sink, a_source) = byte_channel(4);
        let (b_sink, b_source) = byte_channel(4);
        let a = tokio::spawn(read_bytes(a_source));
        drop(b_source);

        let hook: SplitErrorHook = Box::new(|_, _| {
            Err(FsError::ClusterDegraded {
                dead: 2,
                threshold: 1,
            })
        });

        let mut sink = split(vec![a_sink, b_sink], 1, hook);
        let err = match sink.push(Bytes::from_static(b"x")).await {
            Err(e) => e,
            Ok(()) => sink.finish().await.unwrap_err(),
        };
        assert!(matches!(err, FsError::ClusterDegraded { .. }));
        drop(a);
    }
}
