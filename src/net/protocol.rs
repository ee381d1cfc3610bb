//! Framed TCP codec for the remote filesystem.
//!
//! One request is answered by one or more response frames on a single
//! full-duplex connection. Streaming operations interleave an ack frame,
//! raw data frames, then a terminator.
//!
//! Wire format: all multi-byte integers are big-endian, strings are
//! length-prefixed (u16 len + UTF-8).
//! Frame format: len:u32 | type:u8 | payload

use std::collections::HashMap;

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{FsError, FsResult};
use crate::metadata::FileMetadata;

/// Upper bound on one frame's payload (64MB)
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

// =============================================================================
// Message Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Upload = 0x01,
    Append = 0x02,
    Download = 0x03,
    Copy = 0x04,
    CopyAll = 0x05,
    Move = 0x06,
    MoveAll = 0x07,
    Delete = 0x08,
    DeleteAll = 0x09,
    List = 0x0A,
    Info = 0x0B,
    InfoAll = 0x0C,
    Ping = 0x0D,

    UploadAck = 0x20,
    AppendAck = 0x21,
    DownloadSize = 0x22,
    Finished = 0x23,
    ListResult = 0x24,
    InfoResult = 0x25,
    InfoAllResult = 0x26,
    Pong = 0x27,
    ServerError = 0x28,

    Data = 0x30,
    End = 0x31,
}

impl MessageType {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::Upload),
            0x02 => Some(Self::Append),
            0x03 => Some(Self::Download),
            0x04 => Some(Self::Copy),
            0x05 => Some(Self::CopyAll),
            0x06 => Some(Self::Move),
            0x07 => Some(Self::MoveAll),
            0x08 => Some(Self::Delete),
            0x09 => Some(Self::DeleteAll),
            0x0A => Some(Self::List),
            0x0B => Some(Self::Info),
            0x0C => Some(Self::InfoAll),
            0x0D => Some(Self::Ping),
            0x20 => Some(Self::UploadAck),
            0x21 => Some(Self::AppendAck),
            0x22 => Some(Self::DownloadSize),
            0x23 => Some(Self::Finished),
            0x24 => Some(Self::ListResult),
            0x25 => Some(Self::InfoResult),
            0x26 => Some(Self::InfoAllResult),
            0x27 => Some(Self::Pong),
            0x28 => Some(Self::ServerError),
            0x30 => Some(Self::Data),
            0x31 => Some(Self::End),
            _ => None,
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct UploadFlags: u8 {
        const HAS_SIZE = 1 << 0;
    }
}

// =============================================================================
// Payload helpers
// =============================================================================

fn frame(msg_type: MessageType, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(5 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_u8(msg_type as u8);
    buf.put_slice(payload);
    buf.freeze()
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn get_str(payload: &mut Bytes) -> FsResult<String> {
    if payload.remaining() < 2 {
        return Err(FsError::Protocol("string length truncated".into()));
    }
    let len = payload.get_u16() as usize;
    if payload.remaining() < len {
        return Err(FsError::Protocol("string truncated".into()));
    }
    String::from_utf8(payload.copy_to_bytes(len).to_vec())
        .map_err(|_| FsError::Protocol("invalid UTF-8 in string".into()))
}

fn get_u64(payload: &mut Bytes) -> FsResult<u64> {
    if payload.remaining() < 8 {
        return Err(FsError::Protocol("u64 truncated".into()));
    }
    Ok(payload.get_u64())
}

fn put_names(buf: &mut BytesMut, names: &[String]) {
    buf.put_u32(names.len() as u32);
    for name in names {
        put_str(buf, name);
    }
}

fn get_names(payload: &mut Bytes) -> FsResult<Vec<String>> {
    if payload.remaining() < 4 {
        return Err(FsError::Protocol("name list truncated".into()));
    }
    let count = payload.get_u32() as usize;
    let mut names = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        names.push(get_str(payload)?);
    }
    Ok(names)
}

fn put_pairs(buf: &mut BytesMut, pairs: &HashMap<String, String>) {
    buf.put_u32(pairs.len() as u32);
    for (src, dst) in pairs {
        put_str(buf, src);
        put_str(buf, dst);
    }
}

fn get_pairs(payload: &mut Bytes) -> FsResult<HashMap<String, String>> {
    if payload.remaining() < 4 {
        return Err(FsError::Protocol("pair list truncated".into()));
    }
    let count = payload.get_u32() as usize;
    let mut pairs = HashMap::with_capacity(count.min(1024));
    for _ in 0..count {
        let src = get_str(payload)?;
        let dst = get_str(payload)?;
        pairs.insert(src, dst);
    }
    Ok(pairs)
}

fn put_meta(buf: &mut BytesMut, meta: &FileMetadata) {
    buf.put_u64(meta.size);
    buf.put_i64(meta.timestamp);
}

fn get_meta(payload: &mut Bytes) -> FsResult<FileMetadata> {
    if payload.remaining() < 16 {
        return Err(FsError::Protocol("metadata truncated".into()));
    }
    let size = payload.get_u64();
    let timestamp = payload.get_i64();
    Ok(FileMetadata::new(size, timestamp))
}

fn put_meta_map(buf: &mut BytesMut, entries: &HashMap<String, FileMetadata>) {
    buf.put_u32(entries.len() as u32);
    for (name, meta) in entries {
        put_str(buf, name);
        put_meta(buf, meta);
    }
}

fn get_meta_map(payload: &mut Bytes) -> FsResult<HashMap<String, FileMetadata>> {
    if payload.remaining() < 4 {
        return Err(FsError::Protocol("metadata map truncated".into()));
    }
    let count = payload.get_u32() as usize;
    let mut entries = HashMap::with_capacity(count.min(1024));
    for _ in 0..count {
        let name = get_str(payload)?;
        let meta = get_meta(payload)?;
        entries.insert(name, meta);
    }
    Ok(entries)
}

// =============================================================================
// Commands
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Upload { name: String, size: Option<u64> },
    Append { name: String, offset: u64 },
    Download { name: String, offset: u64, limit: u64 },
    Copy { src: String, dst: String },
    CopyAll(HashMap<String, String>),
    Move { src: String, dst: String },
    MoveAll(HashMap<String, String>),
    Delete(String),
    DeleteAll(Vec<String>),
    List(String),
    Info(String),
    InfoAll(Vec<String>),
    Ping,
}

impl Command {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        let msg_type = match self {
            Command::Upload { name, size } => {
                let flags = match size {
                    Some(_) => UploadFlags::HAS_SIZE,
                    None => UploadFlags::empty(),
                };
                put_str(&mut buf, name);
                buf.put_u8(flags.bits());
                if let Some(size) = size {
                    buf.put_u64(*size);
                }
                MessageType::Upload
            }
            Command::Append { name, offset } => {
                put_str(&mut buf, name);
                buf.put_u64(*offset);
                MessageType::Append
            }
            Command::Download {
                name,
                offset,
                limit,
            } => {
                put_str(&mut buf, name);
                buf.put_u64(*offset);
                buf.put_u64(*limit);
                MessageType::Download
            }
            Command::Copy { src, dst } => {
                put_str(&mut buf, src);
                put_str(&mut buf, dst);
                MessageType::Copy
            }
            Command::CopyAll(pairs) => {
                put_pairs(&mut buf, pairs);
                MessageType::CopyAll
            }
            Command::Move { src, dst } => {
                put_str(&mut buf, src);
                put_str(&mut buf, dst);
                MessageType::Move
            }
            Command::MoveAll(pairs) => {
                put_pairs(&mut buf, pairs);
                MessageType::MoveAll
            }
            Command::Delete(name) => {
                put_str(&mut buf, name);
                MessageType::Delete
            }
            Command::DeleteAll(names) => {
                put_names(&mut buf, names);
                MessageType::DeleteAll
            }
            Command::List(pattern) => {
                put_str(&mut buf, pattern);
                MessageType::List
            }
            Command::Info(name) => {
                put_str(&mut buf, name);
                MessageType::Info
            }
            Command::InfoAll(names) => {
                put_names(&mut buf, names);
                MessageType::InfoAll
            }
            Command::Ping => MessageType::Ping,
        };
        frame(msg_type, &buf)
    }

    pub fn decode(msg_type: MessageType, mut payload: Bytes) -> FsResult<Command> {
        match msg_type {
            MessageType::Upload => {
                let name = get_str(&mut payload)?;
                if payload.remaining() < 1 {
                    return Err(FsError::Protocol("upload flags truncated".into()));
                }
                let flags = UploadFlags::from_bits_truncate(payload.get_u8());
                let size = if flags.contains(UploadFlags::HAS_SIZE) {
                    Some(get_u64(&mut payload)?)
                } else {
                    None
                };
                Ok(Command::Upload { name, size })
            }
            MessageType::Append => Ok(Command::Append {
                name: get_str(&mut payload)?,
                offset: get_u64(&mut payload)?,
            }),
            MessageType::Download => Ok(Command::Download {
                name: get_str(&mut payload)?,
                offset: get_u64(&mut payload)?,
                limit: get_u64(&mut payload)?,
            }),
            MessageType::Copy => Ok(Command::Copy {
                src: get_str(&mut payload)?,
                dst: get_str(&mut payload)?,
            }),
            MessageType::CopyAll => Ok(Command::CopyAll(get_pairs(&mut payload)?)),
            MessageType::Move => Ok(Command::Move {
                src: get_str(&mut payload)?,
                dst: get_str(&mut payload)?,
            }),
            MessageType::MoveAll => Ok(Command::MoveAll(get_pairs(&mut payload)?)),
            MessageType::Delete => Ok(Command::Delete(get_str(&mut payload)?)),
            MessageType::DeleteAll => Ok(Command::DeleteAll(get_names(&mut payload)?)),
            MessageType::List => Ok(Command::List(get_str(&mut payload)?)),
            MessageType::Info => Ok(Command::Info(get_str(&mut payload)?)),
            MessageType::InfoAll => Ok(Command::InfoAll(get_names(&mut payload)?)),
            MessageType::Ping => Ok(Command::Ping),
            other => Err(FsError::Protocol(format!(
                "expected command frame, got {other:?}"
            ))),
        }
    }
}

// =============================================================================
// Responses
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    UploadAck,
    AppendAck,
    DownloadSize(u64),
    Finished,
    ListResult(HashMap<String, FileMetadata>),
    InfoResult(Option<FileMetadata>),
    InfoAllResult(HashMap<String, FileMetadata>),
    Pong,
    ServerError(u32),
}

impl Response {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        let msg_type = match self {
            Response::UploadAck => MessageType::UploadAck,
            Response::AppendAck => MessageType::AppendAck,
            Response::DownloadSize(size) => {
                buf.put_u64(*size);
                MessageType::DownloadSize
            }
            Response::Finished => MessageType::Finished,
            Response::ListResult(entries) => {
                put_meta_map(&mut buf, entries);
                MessageType::ListResult
            }
            Response::InfoResult(meta) => {
                match meta {
                    Some(meta) => {
                        buf.put_u8(1);
                        put_meta(&mut buf, meta);
                    }
                    None => buf.put_u8(0),
                }
                MessageType::InfoResult
            }
            Response::InfoAllResult(entries) => {
                put_meta_map(&mut buf, entries);
                MessageType::InfoAllResult
            }
            Response::Pong => MessageType::Pong,
            Response::ServerError(code) => {
                buf.put_u32(*code);
                MessageType::ServerError
            }
        };
        frame(msg_type, &buf)
    }

    pub fn decode(msg_type: MessageType, mut payload: Bytes) -> FsResult<Response> {
        match msg_type {
            MessageType::UploadAck => Ok(Response::UploadAck),
            MessageType::AppendAck => Ok(Response::AppendAck),
            MessageType::DownloadSize => Ok(Response::DownloadSize(get_u64(&mut payload)?)),
            MessageType::Finished => Ok(Response::Finished),
            MessageType::ListResult => Ok(Response::ListResult(get_meta_map(&mut payload)?)),
            MessageType::InfoResult => {
                if payload.remaining() < 1 {
                    return Err(FsError::Protocol("info flag truncated".into()));
                }
                let present = payload.get_u8() != 0;
                let meta = if present {
                    Some(get_meta(&mut payload)?)
                } else {
                    None
                };
                Ok(Response::InfoResult(meta))
            }
            MessageType::InfoAllResult => {
                Ok(Response::InfoAllResult(get_meta_map(&mut payload)?))
            }
            MessageType::Pong => Ok(Response::Pong),
            MessageType::ServerError => {
                if payload.remaining() < 4 {
                    return Err(FsError::Protocol("error code truncated".into()));
                }
                Ok(Response::ServerError(payload.get_u32()))
            }
            other => Err(FsError::Protocol(format!(
                "expected response frame, got {other:?}"
            ))),
        }
    }
}

// =============================================================================
// Stream frames
// =============================================================================

pub fn encode_data(payload: &[u8]) -> Bytes {
    frame(MessageType::Data, payload)
}

pub fn encode_end() -> Bytes {
    frame(MessageType::End, &[])
}

// =============================================================================
// Frame I/O
// =============================================================================

pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> FsResult<(MessageType, Bytes)> {
    let len = r.read_u32().await? as usize;
    if len > MAX_FRAME_SIZE {
        return Err(FsError::Protocol(format!("frame too large: {len} bytes")));
    }
    let type_byte = r.read_u8().await?;
    let msg_type = MessageType::from_u8(type_byte)
        .ok_or_else(|| FsError::Protocol(format!("unknown frame type 0x{type_byte:02X}")))?;
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).await?;
    Ok((msg_type, Bytes::from(payload)))
}

pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Bytes) -> FsResult<()> {
    w.write_all(frame).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command_round_trip(cmd: Command) {
        let encoded = cmd.encode();
        let mut payload = encoded.clone();
        let len = payload.get_u32() as usize;
        let msg_type = MessageType::from_u8(payload.get_u8()).unwrap();
        assert_eq!(payload.remaining(), len);
        assert_eq!(Command::decode(msg_type, payload).unwrap(), cmd);
    }

    #[test]
    fn test_command_round_trips() {
        command_round_trip(Command::Upload {
            name: "a/b.txt".into(),
            size: Some(42),
        });
        command_round_trip(Command::Upload {
            name: "bare".into(),
            size: None,
        });
        command_round_trip(Command::Append {
            name: "log".into(),
            offset: 1024,
        });
        command_round_trip(Command::Download {
            name: "big.bin".into(),
            offset: 7,
            limit: u64::MAX,
        });
        command_round_trip(Command::MoveAll(
            [("a".to_string(), "b".to_string())].into_iter().collect(),
        ));
        command_round_trip(Command::DeleteAll(vec!["x".into(), "y".into()]));
        command_round_trip(Command::List("**/*.txt".into()));
        command_round_trip(Command::Ping);
    }

    fn response_round_trip(resp: Response) {
        let encoded = resp.encode();
        let mut payload = encoded.clone();
        let _ = payload.get_u32();
        let msg_type = MessageType::from_u8(payload.get_u8()).unwrap();
        assert_eq!(Response::decode(msg_type, payload).unwrap(), resp);
    }

    #[test]
    fn test_response_round_trips() {
        response_round_trip(Response::UploadAck);
        response_round_trip(Response::DownloadSize(99));
        response_round_trip(Response::InfoResult(Some(FileMetadata::new(5, 1234))));
        response_round_trip(Response::InfoResult(None));
        response_round_trip(Response::ListResult(
            [("a.txt".to_string(), FileMetadata::new(1, 2))]
                .into_iter()
                .collect(),
        ));
        response_round_trip(Response::ServerError(7));
    }

    #[tokio::test]
    async fn test_frame_io() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_frame(&mut client, &Command::Info("x".into()).encode())
            .await
            .unwrap();
        write_frame(&mut client, &encode_data(b"hello")).await.unwrap();
        write_frame(&mut client, &encode_end()).await.unwrap();

        let (t, payload) = read_frame(&mut server).await.unwrap();
        assert_eq!(
            Command::decode(t, payload).unwrap(),
            Command::Info("x".into())
        );
        let (t, payload) = read_frame(&mut server).await.unwrap();
        assert_eq!(t, MessageType::Data);
        assert_eq!(payload, Bytes::from_static(b"hello"));
        let (t, payload) = read_frame(&mut server).await.unwrap();
        assert_eq!(t, MessageType::End);
        assert!(payload.is_empty());
    }

    #[test]
    fn test_truncated_payload_is_rejected() {
        let err = Command::decode(MessageType::Download, Bytes::from_static(b"\x00\x01a"))
            .unwrap_err();
        assert!(matches!(err, FsError::Protocol(_)));
    }
}
