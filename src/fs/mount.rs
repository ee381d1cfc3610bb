//! Prefix mounting: dispatches each operation to the filesystem mounted
//! under the longest matching `/`-prefix of the name.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;

use crate::error::FsResult;
use crate::fs::{compile_glob, FileSystem, GLOB_OPTIONS, NO_LIMIT};
use crate::metadata::{merge_entry, FileMetadata};
use crate::stream::{pump, ByteSink, ByteSource};

pub struct MountFs {
    root: Arc<dyn FileSystem>,
    /// Sorted by prefix length, longest first.
    mounts: Vec<(String, Arc<dyn FileSystem>)>,
}

impl MountFs {
    pub fn new(root: Arc<dyn FileSystem>) -> Self {
        Self {
            root,
            mounts: Vec::new(),
        }
    }

    /// Mount `fs` under `prefix` (no trailing slash). Names shaped
    /// `prefix/rest` dispatch to `fs` as `rest`.
    pub fn mount(mut self, prefix: impl Into<String>, fs: Arc<dyn FileSystem>) -> Self {
        let prefix = prefix.into().trim_end_matches('/').to_string();
        self.mounts.push((prefix, fs));
        self.mounts.sort_by_key(|(p, _)| std::cmp::Reverse(p.len()));
        self
    }

    fn resolve<'a>(&'a self, name: &'a str) -> (&'a Arc<dyn FileSystem>, &'a str) {
        for (prefix, fs) in &self.mounts {
            if let Some(rest) = name
                .strip_prefix(prefix.as_str())
                .and_then(|rest| rest.strip_prefix('/'))
            {
                return (fs, rest);
            }
        }
        (&self.root, name)
    }
}

#[async_trait]
impl FileSystem for MountFs {
    async fn upload(&self, name: &str, size: Option<u64>) -> FsResult<ByteSink> {
        let (fs, rest) = self.resolve(name);
        fs.upload(rest, size).await
    }

    async fn append(&self, name: &str, offset: u64) -> FsResult<ByteSink> {
        let (fs, rest) = self.resolve(name);
        fs.append(rest, offset).await
    }

    async fn download(&self, name: &str, offset: u64, limit: u64) -> FsResult<ByteSource> {
        let (fs, rest) = self.resolve(name);
        fs.download(rest, offset, limit).await
    }

    async fn delete(&self, name: &str) -> FsResult<()> {
        let (fs, rest) = self.resolve(name);
        fs.delete(rest).await
    }

    async fn copy(&self, src: &str, dst: &str) -> FsResult<()> {
        let (src_fs, src_rest) = self.resolve(src);
        let (dst_fs, dst_rest) = self.resolve(dst);
        if Arc::ptr_eq(src_fs, dst_fs) {
            return src_fs.copy(src_rest, dst_rest).await;
        }
        // Cross-mount copy streams through this layer.
        let source = src_fs.download(src_rest, 0, NO_LIMIT).await?;
        let sink = dst_fs.upload(dst_rest, None).await?;
        pump(source, sink).await?;
        Ok(())
    }

    async fn rename(&self, src: &str, dst: &str) -> FsResult<()> {
        if src == dst {
            return Ok(());
        }
        let (src_fs, src_rest) = self.resolve(src);
        let (dst_fs, dst_rest) = self.resolve(dst);
        if Arc::ptr_eq(src_fs, dst_fs) {
            return src_fs.rename(src_rest, dst_rest).await;
        }
        self.copy(src, dst).await?;
        // Remove the moved file under its source name.
        src_fs.delete(src_rest).await
    }

    async fn list(&self, pattern: &str) -> FsResult<HashMap<String, FileMetadata>> {
        let glob = compile_glob(pattern)?;
        let mut found = self.root.list(pattern).await?;
        for (prefix, fs) in &self.mounts {
            for (name, meta) in fs.list("**").await? {
                let full = format!("{prefix}/{name}");
                if glob.matches_with(&full, GLOB_OPTIONS) {
                    merge_entry(&mut found, full, meta);
                }
            }
        }
        Ok(found)
    }

    async fn info(&self, name: &str) -> FsResult<Option<FileMetadata>> {
        let (fs, rest) = self.resolve(name);
        fs.info(rest).await
    }

    async fn ping(&self) -> FsResult<()> {
        let mut checks = vec![self.root.ping()];
        checks.extend(self.mounts.iter().map(|(_, fs)| fs.ping()));
        join_all(checks).await.into_iter().collect()
    }
}
