//! The filesystem contract every composition layer implements.
//!
//! Files are opaque byte streams addressed by flat string names (the name
//! may contain `/`, but there is no directory abstraction). Single-node
//! stores, the cluster composer, and the wire clients all expose this same
//! surface, so layers stack freely.

pub mod local;
pub mod mount;

pub use local::LocalFs;
pub use mount::MountFs;

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;

use crate::error::{FsError, FsResult};
use crate::metadata::FileMetadata;
use crate::stream::{pump, read_bytes, write_bytes, ByteSink, ByteSource};

/// Pass to `download` for an unbounded read.
pub const NO_LIMIT: u64 = u64::MAX;

/// Glob matching options: `*`, `?` and `[...]` stay within one
/// `/`-separated segment, `**` crosses segments.
pub const GLOB_OPTIONS: glob::MatchOptions = glob::MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Compile a shell-style pattern, mapping rejects to `MALFORMED_GLOB`.
pub fn compile_glob(pattern: &str) -> FsResult<glob::Pattern> {
    glob::Pattern::new(pattern).map_err(|e| FsError::MalformedGlob(format!("{pattern}: {e}")))
}

/// The abstract operation set every store and composition layer exposes.
///
/// Every operation is asynchronous and cancellable: dropping a returned
/// future or stream half releases all resources held for it.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Accept an immutable file. With `size`, the stream must deliver
    /// exactly that many bytes (`UNEXPECTED_DATA` / `UNEXPECTED_END_OF_STREAM`
    /// otherwise). The sink's `finish` resolves once the content is
    /// durably committed.
    async fn upload(&self, name: &str, size: Option<u64>) -> FsResult<ByteSink>;

    /// Extend an existing file from `offset`. `ILLEGAL_OFFSET` when the
    /// offset lies past the current end; a smaller offset is an idempotent
    /// overlap whose bytes must match what is already stored.
    async fn append(&self, name: &str, offset: u64) -> FsResult<ByteSink>;

    /// Read up to `limit` bytes starting at `offset`. The limit is
    /// silently clamped to the remaining file contents.
    async fn download(&self, name: &str, offset: u64, limit: u64) -> FsResult<ByteSource>;

    /// Idempotent delete: removing an absent name succeeds.
    async fn delete(&self, name: &str) -> FsResult<()>;

    /// Bulk delete. Not atomic: any element error fails the batch while
    /// partial effects persist.
    async fn delete_all(&self, names: &[String]) -> FsResult<()> {
        let results = join_all(names.iter().map(|name| self.delete(name))).await;
        results.into_iter().collect()
    }

    /// Copy one file. Derived default: stream download into upload.
    async fn copy(&self, src: &str, dst: &str) -> FsResult<()> {
        let source = self.download(src, 0, NO_LIMIT).await?;
        let sink = self.upload(dst, None).await?;
        pump(source, sink).await?;
        Ok(())
    }

    /// Bulk copy of `source -> target` pairs. Not atomic.
    async fn copy_all(&self, pairs: &HashMap<String, String>) -> FsResult<()> {
        let results = join_all(pairs.iter().map(|(src, dst)| self.copy(src, dst))).await;
        results.into_iter().collect()
    }

    /// Move one file. Derived default: copy, then delete the source.
    async fn rename(&self, src: &str, dst: &str) -> FsResult<()> {
        if src == dst {
            return Ok(());
        }
        self.copy(src, dst).await?;
        self.delete(src).await
    }

    /// Bulk move. Not atomic.
    async fn rename_all(&self, pairs: &HashMap<String, String>) -> FsResult<()> {
        let results = join_all(pairs.iter().map(|(src, dst)| self.rename(src, dst))).await;
        results.into_iter().collect()
    }

    /// Names matching a shell-style pattern, with their metadata.
    async fn list(&self, pattern: &str) -> FsResult<HashMap<String, FileMetadata>>;

    /// Metadata of one file, `None` when absent.
    async fn info(&self, name: &str) -> FsResult<Option<FileMetadata>>;

    /// Metadata of several files; absent names are left out. Derived
    /// default: fan-out of `info`.
    async fn info_all(&self, names: &[String]) -> FsResult<HashMap<String, FileMetadata>> {
        let results = join_all(names.iter().map(|name| self.info(name))).await;
        let mut found = HashMap::new();
        for (name, result) in names.iter().zip(results) {
            if let Some(meta) = result? {
                found.insert(name.clone(), meta);
            }
        }
        Ok(found)
    }

    /// Cheap liveness check.
    async fn ping(&self) -> FsResult<()>;
}

/// Upload a whole in-memory buffer under `name`.
pub async fn upload_bytes(fs: &dyn FileSystem, name: &str, data: Bytes) -> FsResult<()> {
    let sink = fs.upload(name, Some(data.len() as u64)).await?;
    write_bytes(sink, data).await
}

/// Download a whole file into memory.
pub async fn download_bytes(fs: &dyn FileSystem, name: &str) -> FsResult<Bytes> {
    let source = fs.download(name, 0, NO_LIMIT).await?;
    read_bytes(source).await
}
