//! Local-disk filesystem: one partition's backing store.
//!
//! Uploads land in a hidden staging directory and are renamed into place
//! when the stream commits, so readers never observe a partial file.

use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tracing::trace;

use crate::error::{FsError, FsResult};
use crate::fs::{compile_glob, FileSystem, GLOB_OPTIONS};
use crate::metadata::FileMetadata;
use crate::stream::{byte_channel, ByteSink, ByteSource, DATA_CHUNK_SIZE, STREAM_CHANNEL_SIZE};

/// Hidden directory for in-flight uploads, skipped by `list`.
const STAGING_DIR: &str = ".staging";

pub struct LocalFs {
    root: PathBuf,
    staging: PathBuf,
    tmp_seq: AtomicU64,
}

impl LocalFs {
    /// Open (and create if needed) a store rooted at `root`.
    pub async fn new(root: impl Into<PathBuf>) -> FsResult<Self> {
        let root = root.into();
        let staging = root.join(STAGING_DIR);
        fs::create_dir_all(&staging).await?;
        Ok(Self {
            root,
            staging,
            tmp_seq: AtomicU64::new(0),
        })
    }

    /// Map a flat name onto a path under the root, rejecting anything that
    /// would escape it or touch the staging area.
    fn resolve(&self, name: &str) -> FsResult<PathBuf> {
        if name.is_empty() {
            return Err(FsError::BadPath(name.to_string()));
        }
        let rel = Path::new(name);
        if rel.is_absolute() {
            return Err(FsError::BadPath(name.to_string()));
        }
        let mut out = self.root.clone();
        for component in rel.components() {
            match component {
                Component::Normal(part) => out.push(part),
                Component::CurDir => {}
                _ => return Err(FsError::BadPath(name.to_string())),
            }
        }
        if out.starts_with(&self.staging) {
            return Err(FsError::BadPath(name.to_string()));
        }
        Ok(out)
    }

    fn temp_path(&self) -> PathBuf {
        let seq = self.tmp_seq.fetch_add(1, Ordering::Relaxed);
        self.staging
            .join(format!("{}-{}.tmp", std::process::id(), seq))
    }

    fn relative_name(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(parts.join("/"))
    }
}

fn mtime_secs(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Drive one upload stream into a staging file, renaming it into place at
/// commit time.
async fn run_upload(
    mut source: ByteSource,
    tmp: PathBuf,
    target: PathBuf,
    size: Option<u64>,
) {
    let mut file = match File::create(&tmp).await {
        Ok(f) => f,
        Err(e) => {
            source.finish(Err(e.into()));
            return;
        }
    };
    let mut seen: u64 = 0;
    let outcome = loop {
        match source.pull().await {
            Ok(Some(buf)) => {
                seen += buf.len() as u64;
                if size.is_some_and(|expected| seen > expected) {
                    break Err(FsError::UnexpectedData);
                }
                if let Err(e) = file.write_all(&buf).await {
                    break Err(e.into());
                }
            }
            Ok(None) => {
                if size.is_some_and(|expected| seen < expected) {
                    break Err(FsError::UnexpectedEndOfStream);
                }
                break commit(&mut file, &tmp, &target).await;
            }
            // Producer aborted or vanished; drop the partial staging file.
            Err(_) => {
                drop(file);
                let _ = fs::remove_file(&tmp).await;
                return;
            }
        }
    };
    if outcome.is_err() {
        let _ = fs::remove_file(&tmp).await;
    }
    source.finish(outcome);
}

async fn commit(file: &mut File, tmp: &Path, target: &Path) -> FsResult<()> {
    file.flush().await?;
    file.sync_all().await?;
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::rename(tmp, target).await?;
    trace!(target = %target.display(), "upload committed");
    Ok(())
}

#[async_trait]
impl FileSystem for LocalFs {
    async fn upload(&self, name: &str, size: Option<u64>) -> FsResult<ByteSink> {
        let target = self.resolve(name)?;
        match fs::metadata(&target).await {
            Ok(meta) if meta.is_dir() => return Err(FsError::IsDirectory(name.to_string())),
            _ => {}
        }
        let tmp = self.temp_path();
        let (sink, source) = byte_channel(STREAM_CHANNEL_SIZE);
        tokio::spawn(run_upload(source, tmp, target, size));
        Ok(sink)
    }

    async fn append(&self, name: &str, offset: u64) -> FsResult<ByteSink> {
        let target = self.resolve(name)?;
        let current = match fs::metadata(&target).await {
            Ok(meta) if meta.is_dir() => return Err(FsError::IsDirectory(name.to_string())),
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        if offset > current {
            return Err(FsError::IllegalOffset);
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(&target)
            .await?;
        file.seek(SeekFrom::Start(offset)).await?;

        let (sink, mut source) = byte_channel(STREAM_CHANNEL_SIZE);
        tokio::spawn(async move {
            let outcome = loop {
                match source.pull().await {
                    Ok(Some(buf)) => {
                        if let Err(e) = file.write_all(&buf).await {
                            break Err(e.into());
                        }
                    }
                    Ok(None) => {
                        let commit = async {
                            file.flush().await?;
                            file.sync_all().await?;
                            Ok(())
                        };
                        break commit.await;
                    }
                    Err(_) => return,
                }
            };
            source.finish(outcome);
        });
        Ok(sink)
    }

    async fn download(&self, name: &str, offset: u64, limit: u64) -> FsResult<ByteSource> {
        let path = self.resolve(name)?;
        let meta = match fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => return Err(FsError::IsDirectory(name.to_string())),
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FsError::FileNotFound(name.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let remaining = meta.len().saturating_sub(offset);
        let mut left = limit.min(remaining);

        let mut file = File::open(&path).await?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset)).await?;
        }

        let (mut sink, source) = byte_channel(STREAM_CHANNEL_SIZE);
        tokio::spawn(async move {
            while left > 0 {
                let chunk = (DATA_CHUNK_SIZE as u64).min(left) as usize;
                let mut buf = vec![0u8; chunk];
                let n = match file.read(&mut buf).await {
                    Ok(0) => {
                        // File shrank underneath us.
                        sink.abort(FsError::Io(std::io::ErrorKind::UnexpectedEof.into()))
                            .await;
                        return;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        sink.abort(e.into()).await;
                        return;
                    }
                };
                buf.truncate(n);
                if sink.push(Bytes::from(buf)).await.is_err() {
                    return;
                }
                left -= n as u64;
            }
            let _ = sink.finish().await;
        });
        Ok(source)
    }

    async fn delete(&self, name: &str) -> FsResult<()> {
        let path = self.resolve(name)?;
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => return Err(FsError::IsDirectory(name.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
            Ok(_) => {}
        }
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn copy(&self, src: &str, dst: &str) -> FsResult<()> {
        let from = self.resolve(src)?;
        let to = self.resolve(dst)?;
        if from == to {
            return Ok(());
        }
        match fs::metadata(&from).await {
            Ok(meta) if meta.is_dir() => return Err(FsError::IsDirectory(src.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FsError::FileNotFound(src.to_string()))
            }
            Err(e) => return Err(e.into()),
            Ok(_) => {}
        }
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::copy(&from, &to).await?;
        Ok(())
    }

    async fn rename(&self, src: &str, dst: &str) -> FsResult<()> {
        if src == dst {
            return Ok(());
        }
        let from = self.resolve(src)?;
        let to = self.resolve(dst)?;
        match fs::metadata(&from).await {
            Ok(meta) if meta.is_dir() => return Err(FsError::IsDirectory(src.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FsError::FileNotFound(src.to_string()))
            }
            Err(e) => return Err(e.into()),
            Ok(_) => {}
        }
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(&from, &to).await?;
        Ok(())
    }

    async fn list(&self, pattern: &str) -> FsResult<std::collections::HashMap<String, FileMetadata>> {
        let glob = compile_glob(pattern)?;
        let mut found = std::collections::HashMap::new();
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path == self.staging {
                    continue;
                }
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    stack.push(path);
                } else if file_type.is_file() {
                    let Some(name) = self.relative_name(&path) else {
                        continue;
                    };
                    if glob.matches_with(&name, GLOB_OPTIONS) {
                        let meta = entry.metadata().await?;
                        found.insert(name, FileMetadata::new(meta.len(), mtime_secs(&meta)));
                    }
                }
            }
        }
        Ok(found)
    }

    async fn info(&self, name: &str) -> FsResult<Option<FileMetadata>> {
        let path = self.resolve(name)?;
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => {
                Ok(Some(FileMetadata::new(meta.len(), mtime_secs(&meta))))
            }
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn ping(&self) -> FsResult<()> {
        Ok(())
    }
}
