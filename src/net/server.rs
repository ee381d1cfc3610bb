//! TCP server: serves any [`FileSystem`] over the framed protocol.
//!
//! One task per connection; a connection carries a sequence of commands.
//! Application failures answer `ServerError` and keep the connection;
//! protocol violations drop it.

use std::sync::Arc;

use tokio::io::{AsyncWriteExt, BufStream};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use crate::error::{FsError, FsResult};
use crate::fs::FileSystem;
use crate::net::protocol::{
    encode_data, encode_end, read_frame, write_frame, Command, MessageType, Response,
};

type Conn = BufStream<TcpStream>;

/// Accept loop. Runs until the listener fails.
pub async fn serve(fs: Arc<dyn FileSystem>, listener: TcpListener) -> std::io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        debug!(%peer, "connection accepted");
        let fs = Arc::clone(&fs);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(fs, stream).await {
                debug!(%peer, error = %e, "connection closed");
            }
        });
    }
}

async fn handle_connection(fs: Arc<dyn FileSystem>, stream: TcpStream) -> FsResult<()> {
    stream.set_nodelay(true)?;
    let mut conn = BufStream::new(stream);
    loop {
        let (msg_type, payload) = match read_frame(&mut conn).await {
            Ok(frame) => frame,
            // Peer hung up between commands.
            Err(FsError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };
        match Command::decode(msg_type, payload)? {
            Command::Upload { name, size } => {
                handle_upload_stream(&fs, &mut conn, &name, size, None).await?;
            }
            Command::Append { name, offset } => {
                handle_upload_stream(&fs, &mut conn, &name, None, Some(offset)).await?;
            }
            Command::Download {
                name,
                offset,
                limit,
            } => {
                handle_download(&fs, &mut conn, &name, offset, limit).await?;
            }
            Command::Copy { src, dst } => {
                respond(&mut conn, fs.copy(&src, &dst).await.map(|()| Response::Finished)).await?;
            }
            Command::CopyAll(pairs) => {
                respond(&mut conn, fs.copy_all(&pairs).await.map(|()| Response::Finished)).await?;
            }
            Command::Move { src, dst } => {
                respond(&mut conn, fs.rename(&src, &dst).await.map(|()| Response::Finished))
                    .await?;
            }
            Command::MoveAll(pairs) => {
                respond(&mut conn, fs.rename_all(&pairs).await.map(|()| Response::Finished))
                    .await?;
            }
            Command::Delete(name) => {
                respond(&mut conn, fs.delete(&name).await.map(|()| Response::Finished)).await?;
            }
            Command::DeleteAll(names) => {
                respond(&mut conn, fs.delete_all(&names).await.map(|()| Response::Finished))
                    .await?;
            }
            Command::List(pattern) => {
                respond(&mut conn, fs.list(&pattern).await.map(Response::ListResult)).await?;
            }
            Command::Info(name) => {
                respond(&mut conn, fs.info(&name).await.map(Response::InfoResult)).await?;
            }
            Command::InfoAll(names) => {
                respond(&mut conn, fs.info_all(&names).await.map(Response::InfoAllResult))
                    .await?;
            }
            Command::Ping => {
                respond(&mut conn, fs.ping().await.map(|()| Response::Pong)).await?;
            }
        }
        conn.flush().await?;
    }
}

async fn respond(conn: &mut Conn, result: FsResult<Response>) -> FsResult<()> {
    let response = match result {
        Ok(response) => response,
        Err(e) => {
            warn!(error = %e, "operation failed");
            Response::ServerError(e.code())
        }
    };
    write_frame(conn, &response.encode()).await
}

/// Shared receive loop for `Upload` and `Append`: ack the handshake, sink
/// the data frames, answer `Finished` once the store commits. Stream-stage
/// failures are remembered and reported after the terminator so the
/// connection's framing stays intact.
async fn handle_upload_stream(
    fs: &Arc<dyn FileSystem>,
    conn: &mut Conn,
    name: &str,
    size: Option<u64>,
    append_offset: Option<u64>,
) -> FsResult<()> {
    let (opened, ack) = match append_offset {
        Some(offset) => (fs.append(name, offset).await, Response::AppendAck),
        None => (fs.upload(name, size).await, Response::UploadAck),
    };
    let mut sink = match opened {
        Ok(sink) => Some(sink),
        Err(e) => {
            respond(conn, Err(e)).await?;
            return Ok(());
        }
    };
    write_frame(conn, &ack.encode()).await?;
    conn.flush().await?;

    let mut failure: Option<FsError> = None;
    loop {
        let (msg_type, payload) = read_frame(conn).await?;
        match msg_type {
            MessageType::Data => {
                if let Some(active) = sink.as_mut() {
                    if let Err(e) = active.push(payload).await {
                        failure = Some(e);
                        sink = None;
                    }
                }
            }
            MessageType::End => {
                let result = match (failure.take(), sink.take()) {
                    (None, Some(sink)) => sink.finish().await,
                    (Some(e), _) => Err(e),
                    (None, None) => Err(FsError::StreamClosed),
                };
                respond(conn, result.map(|()| Response::Finished)).await?;
                return Ok(());
            }
            other => {
                return Err(FsError::Protocol(format!(
                    "unexpected frame {other:?} during upload"
                )))
            }
        }
    }
}

async fn handle_download(
    fs: &Arc<dyn FileSystem>,
    conn: &mut Conn,
    name: &str,
    offset: u64,
    limit: u64,
) -> FsResult<()> {
    // Resolve the clamped size first so the handshake can promise an
    // exact byte count, then request precisely that range.
    let clamped = match fs.info(name).await {
        Ok(Some(meta)) => limit.min(meta.size.saturating_sub(offset)),
        Ok(None) => {
            respond(conn, Err(FsError::FileNotFound(name.to_string()))).await?;
            return Ok(());
        }
        Err(e) => {
            respond(conn, Err(e)).await?;
            return Ok(());
        }
    };
    let mut source = match fs.download(name, offset, clamped).await {
        Ok(source) => source,
        Err(e) => {
            respond(conn, Err(e)).await?;
            return Ok(());
        }
    };
    write_frame(conn, &Response::DownloadSize(clamped).encode()).await?;

    loop {
        match source.pull().await {
            Ok(Some(buf)) => write_frame(conn, &encode_data(&buf)).await?,
            Ok(None) => {
                source.finish(Ok(()));
                write_frame(conn, &encode_end()).await?;
                return Ok(());
            }
            Err(e) => {
                // Mid-stream failure: report it in-band; the client
                // aborts its local stream.
                warn!(name, error = %e, "download stream failed");
                write_frame(conn, &Response::ServerError(e.code()).encode()).await?;
                return Ok(());
            }
        }
    }
}
