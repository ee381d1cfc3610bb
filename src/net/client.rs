//! TCP client: a [`FileSystem`] handle onto one remote partition.
//!
//! Connections are pooled per handle. Unary operations check one out and
//! back in; streaming operations return it to the pool only on clean
//! completion, and a request that fails on a pooled connection is retried
//! once on a fresh one so a stale socket never fails an operation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tracing::trace;

use crate::error::{FsError, FsResult};
use crate::fs::FileSystem;
use crate::metadata::FileMetadata;
use crate::net::protocol::{
    encode_data, encode_end, read_frame, write_frame, Command, MessageType, Response,
};
use crate::stream::{byte_channel, ByteSink, ByteSource, STREAM_CHANNEL_SIZE};

type Conn = BufStream<TcpStream>;

/// Idle connections kept per remote
const POOL_SIZE: usize = 8;

pub struct RemoteFs {
    addr: String,
    pool: Arc<Mutex<Vec<Conn>>>,
}

impl RemoteFs {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            pool: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn connect(&self) -> FsResult<Conn> {
        let stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        Ok(BufStream::new(stream))
    }

    fn checkin(pool: &Mutex<Vec<Conn>>, conn: Conn) {
        let mut pool = pool.lock().unwrap();
        if pool.len() < POOL_SIZE {
            pool.push(conn);
        }
    }

    async fn round_trip(mut conn: Conn, command: &Command) -> FsResult<(Response, Conn)> {
        write_frame(&mut conn, &command.encode()).await?;
        conn.flush().await?;
        let (msg_type, payload) = read_frame(&mut conn).await?;
        Ok((Response::decode(msg_type, payload)?, conn))
    }

    /// Issue one command and read its first response frame, preferring a
    /// pooled connection.
    async fn request(&self, command: &Command) -> FsResult<(Response, Conn)> {
        let pooled = self.pool.lock().unwrap().pop();
        if let Some(conn) = pooled {
            match Self::round_trip(conn, command).await {
                Ok(done) => return Ok(done),
                // The pooled socket had gone stale; a fresh connection
                // gets one more attempt.
                Err(FsError::Io(e)) => {
                    trace!(addr = %self.addr, error = %e, "pooled connection stale")
                }
                Err(e) => return Err(e),
            }
        }
        let conn = self.connect().await?;
        Self::round_trip(conn, command).await
    }

    /// Request expecting a single terminal response.
    async fn unary(&self, command: Command, subject: &str) -> FsResult<Response> {
        let (response, conn) = self.request(&command).await?;
        match response {
            Response::ServerError(code) => {
                Self::checkin(&self.pool, conn);
                Err(FsError::from_code(code, subject))
            }
            response => {
                Self::checkin(&self.pool, conn);
                Ok(response)
            }
        }
    }

    /// Common tail of `upload` and `append`: the handshake is done, ship
    /// data frames and wait for the remote commit.
    fn spawn_upload_driver(&self, mut conn: Conn, subject: String) -> ByteSink {
        let (sink, mut source) = byte_channel(STREAM_CHANNEL_SIZE);
        let pool = Arc::clone(&self.pool);
        tokio::spawn(async move {
            loop {
                match source.pull().await {
                    Ok(Some(buf)) => {
                        if let Err(e) = write_frame(&mut conn, &encode_data(&buf)).await {
                            source.finish(Err(e));
                            return;
                        }
                    }
                    Ok(None) => {
                        let commit = async {
                            write_frame(&mut conn, &encode_end()).await?;
                            conn.flush().await?;
                            let (msg_type, payload) = read_frame(&mut conn).await?;
                            Response::decode(msg_type, payload)
                        }
                        .await;
                        match commit {
                            Ok(Response::Finished) => {
                                source.finish(Ok(()));
                                Self::checkin(&pool, conn);
                            }
                            Ok(Response::ServerError(code)) => {
                                source.finish(Err(FsError::from_code(code, &subject)));
                                Self::checkin(&pool, conn);
                            }
                            Ok(other) => {
                                source.finish(Err(FsError::Protocol(format!(
                                    "unexpected commit response {other:?}"
                                ))));
                            }
                            Err(e) => source.finish(Err(e)),
                        }
                        return;
                    }
                    // Caller cancelled or aborted mid-stream; the remote
                    // sees the connection drop and discards the upload.
                    Err(_) => return,
                }
            }
        });
        sink
    }
}

#[async_trait]
impl FileSystem for RemoteFs {
    async fn upload(&self, name: &str, size: Option<u64>) -> FsResult<ByteSink> {
        let command = Command::Upload {
            name: name.to_string(),
            size,
        };
        let (response, conn) = self.request(&command).await?;
        match response {
            Response::UploadAck => Ok(self.spawn_upload_driver(conn, name.to_string())),
            Response::ServerError(code) => {
                Self::checkin(&self.pool, conn);
                Err(FsError::from_code(code, name))
            }
            other => Err(FsError::Protocol(format!(
                "unexpected upload response {other:?}"
            ))),
        }
    }

    async fn append(&self, name: &str, offset: u64) -> FsResult<ByteSink> {
        let command = Command::Append {
            name: name.to_string(),
            offset,
        };
        let (response, conn) = self.request(&command).await?;
        match response {
            Response::AppendAck => Ok(self.spawn_upload_driver(conn, name.to_string())),
            Response::ServerError(code) => {
                Self::checkin(&self.pool, conn);
                Err(FsError::from_code(code, name))
            }
            other => Err(FsError::Protocol(format!(
                "unexpected append response {other:?}"
            ))),
        }
    }

    async fn download(&self, name: &str, offset: u64, limit: u64) -> FsResult<ByteSource> {
        let command = Command::Download {
            name: name.to_string(),
            offset,
            limit,
        };
        let (response, mut conn) = self.request(&command).await?;
        let expected = match response {
            Response::DownloadSize(size) => size,
            Response::ServerError(code) => {
                Self::checkin(&self.pool, conn);
                return Err(FsError::from_code(code, name));
            }
            other => {
                return Err(FsError::Protocol(format!(
                    "unexpected download response {other:?}"
                )))
            }
        };

        let (mut sink, source) = byte_channel(STREAM_CHANNEL_SIZE);
        let pool = Arc::clone(&self.pool);
        let subject = name.to_string();
        tokio::spawn(async move {
            let mut received: u64 = 0;
            loop {
                let (msg_type, payload) = match read_frame(&mut conn).await {
                    Ok(frame) => frame,
                    Err(e) => {
                        sink.abort(e).await;
                        return;
                    }
                };
                match msg_type {
                    MessageType::Data => {
                        received += payload.len() as u64;
                        if sink.push(payload).await.is_err() {
                            // Consumer cancelled; drop the connection
                            // mid-stream rather than desync its framing.
                            return;
                        }
                    }
                    MessageType::End => {
                        if received < expected {
                            sink.abort(FsError::TruncatedStream(received)).await;
                        } else {
                            let _ = sink.finish().await;
                        }
                        Self::checkin(&pool, conn);
                        return;
                    }
                    MessageType::ServerError => {
                        let code = match Response::decode(msg_type, payload) {
                            Ok(Response::ServerError(code)) => code,
                            _ => {
                                sink.abort(FsError::Protocol("bad error frame".into())).await;
                                return;
                            }
                        };
                        sink.abort(FsError::from_code(code, &subject)).await;
                        Self::checkin(&pool, conn);
                        return;
                    }
                    other => {
                        sink.abort(FsError::Protocol(format!(
                            "unexpected frame {other:?} during download"
                        )))
                        .await;
                        return;
                    }
                }
            }
        });
        Ok(source)
    }

    async fn delete(&self, name: &str) -> FsResult<()> {
        expect_finished(self.unary(Command::Delete(name.to_string()), name).await?)
    }

    async fn delete_all(&self, names: &[String]) -> FsResult<()> {
        expect_finished(self.unary(Command::DeleteAll(names.to_vec()), "").await?)
    }

    async fn copy(&self, src: &str, dst: &str) -> FsResult<()> {
        let command = Command::Copy {
            src: src.to_string(),
            dst: dst.to_string(),
        };
        expect_finished(self.unary(command, src).await?)
    }

    async fn copy_all(&self, pairs: &HashMap<String, String>) -> FsResult<()> {
        expect_finished(self.unary(Command::CopyAll(pairs.clone()), "").await?)
    }

    async fn rename(&self, src: &str, dst: &str) -> FsResult<()> {
        let command = Command::Move {
            src: src.to_string(),
            dst: dst.to_string(),
        };
        expect_finished(self.unary(command, src).await?)
    }

    async fn rename_all(&self, pairs: &HashMap<String, String>) -> FsResult<()> {
        expect_finished(self.unary(Command::MoveAll(pairs.clone()), "").await?)
    }

    async fn list(&self, pattern: &str) -> FsResult<HashMap<String, FileMetadata>> {
        match self.unary(Command::List(pattern.to_string()), pattern).await? {
            Response::ListResult(entries) => Ok(entries),
            other => Err(FsError::Protocol(format!(
                "unexpected list response {other:?}"
            ))),
        }
    }

    async fn info(&self, name: &str) -> FsResult<Option<FileMetadata>> {
        match self.unary(Command::Info(name.to_string()), name).await? {
            Response::InfoResult(meta) => Ok(meta),
            other => Err(FsError::Protocol(format!(
                "unexpected info response {other:?}"
            ))),
        }
    }

    async fn info_all(&self, names: &[String]) -> FsResult<HashMap<String, FileMetadata>> {
        match self.unary(Command::InfoAll(names.to_vec()), "").await? {
            Response::InfoAllResult(entries) => Ok(entries),
            other => Err(FsError::Protocol(format!(
                "unexpected infoAll response {other:?}"
            ))),
        }
    }

    async fn ping(&self) -> FsResult<()> {
        match self.unary(Command::Ping, "").await? {
            Response::Pong => Ok(()),
            other => Err(FsError::Protocol(format!(
                "unexpected ping response {other:?}"
            ))),
        }
    }
}

fn expect_finished(response: Response) -> FsResult<()> {
    match response {
        Response::Finished => Ok(()),
        other => Err(FsError::Protocol(format!(
            "expected Finished, got {other:?}"
        ))),
    }
}
