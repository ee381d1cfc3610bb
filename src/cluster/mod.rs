//! Cluster composer: one logical filesystem fanned out across partitions.
//!
//! Writes replicate to the best `upload_max` partitions for the name and
//! commit once `upload_min` replicas acknowledge. Reads broadcast to the
//! alive set and fan the replies in byte-exactly. Partitions that fail
//! with transport errors are evicted on the spot; once more than
//! `dead_threshold` of them are dead the cluster refuses service until a
//! ping sweep rehabilitates enough of them.

pub mod partitions;
pub mod select;

pub use partitions::{PartitionId, Partitions};
pub use select::{RendezvousSelector, ServerSelector};

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{FsError, FsResult};
use crate::fs::{compile_glob, FileSystem};
use crate::metadata::{merge_entry, FileMetadata};
use crate::stream::{merge, sized, split, ByteSink, ByteSource, SplitErrorHook};

/// Replication and degradation knobs.
///
/// Invariants: `dead_threshold < |partitions|` and
/// `0 < upload_min <= upload_max <= |partitions|`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Dead partitions tolerated before the cluster refuses service
    pub dead_threshold: u32,

    /// Replica acknowledgements required for an upload to commit
    pub upload_min: u32,

    /// Replicas attempted per upload
    pub upload_max: u32,
}

impl ClusterConfig {
    /// Convenience for `R`-way replication: tolerate `R - 1` dead
    /// partitions, write exactly `R` replicas.
    pub fn replication(count: u32) -> Self {
        assert!(count > 0, "replication count must be positive");
        Self {
            dead_threshold: count - 1,
            upload_min: count,
            upload_max: count,
        }
    }
}

#[derive(Clone, Copy)]
enum SinkOp {
    Upload(Option<u64>),
    Append(u64),
}

pub struct ClusterFs {
    partitions: Arc<Partitions>,
    config: ClusterConfig,
}

impl ClusterFs {
    pub fn new(partitions: Arc<Partitions>, config: ClusterConfig) -> Self {
        let total = partitions.len();
        assert!(
            (config.dead_threshold as usize) < total,
            "dead_threshold must be below the partition count"
        );
        assert!(
            config.upload_min > 0
                && config.upload_min <= config.upload_max
                && (config.upload_max as usize) <= total,
            "0 < upload_min <= upload_max <= partition count"
        );
        Self { partitions, config }
    }

    pub fn partitions(&self) -> &Arc<Partitions> {
        &self.partitions
    }

    fn ensure_not_degraded(&self) -> FsResult<()> {
        let dead = self.partitions.dead_count();
        let threshold = self.config.dead_threshold as usize;
        if dead > threshold {
            Err(FsError::ClusterDegraded { dead, threshold })
        } else {
            Ok(())
        }
    }

    /// Walk the rendezvous order opening a stream per partition until
    /// `upload_max` succeeded or the order is exhausted. Refusals evict
    /// per the liveness rules and move on to the next candidate.
    async fn open_replicas(
        &self,
        name: &str,
        op: SinkOp,
    ) -> FsResult<(Vec<PartitionId>, Vec<ByteSink>)> {
        let max = self.config.upload_max as usize;
        let mut ids = Vec::new();
        let mut sinks = Vec::new();
        for id in self.partitions.select(name) {
            if sinks.len() == max {
                break;
            }
            let Some(fs) = self.partitions.get(&id) else {
                continue;
            };
            let attempt = match op {
                SinkOp::Upload(size) => fs.upload(name, size).await,
                SinkOp::Append(offset) => fs.append(name, offset).await,
            };
            match self.partitions.wrap_result(&id, attempt) {
                Ok(sink) => {
                    ids.push(id);
                    sinks.push(sink);
                }
                Err(e) => {
                    debug!(partition = %id, error = %e, "replica refused stream, trying next");
                }
            }
        }
        let required = self.config.upload_min as usize;
        if sinks.len() < required {
            // Dropping the collected sinks closes the streams already
            // opened on their partitions.
            return Err(FsError::NotEnoughUploadTargets {
                required,
                got: sinks.len(),
            });
        }
        Ok((ids, sinks))
    }

    /// Fan one inbound stream out to the opened replicas. Mid-stream
    /// failures evict the partition and abort the upload only when the
    /// cluster degrades below its threshold or the survivor count drops
    /// under `upload_min`.
    fn replicated_sink(&self, ids: Vec<PartitionId>, sinks: Vec<ByteSink>) -> ByteSink {
        let partitions = Arc::clone(&self.partitions);
        let threshold = self.config.dead_threshold as usize;
        let hook: SplitErrorHook = Box::new(move |idx, err| {
            partitions.mark_if_dead(&ids[idx], err);
            let dead = partitions.dead_count();
            if dead > threshold {
                Err(FsError::ClusterDegraded { dead, threshold })
            } else {
                Ok(())
            }
        });
        split(sinks, self.config.upload_min as usize, hook)
    }

    /// Run `op` against every alive partition in parallel.
    async fn broadcast<T, F, Fut>(&self, op: F) -> Vec<(PartitionId, FsResult<T>)>
    where
        F: Fn(Arc<dyn FileSystem>) -> Fut,
        Fut: Future<Output = FsResult<T>>,
    {
        let attempts = self.partitions.alive().into_iter().map(|(id, fs)| {
            let attempt = op(fs);
            async move { (id, attempt.await) }
        });
        join_all(attempts).await
    }

    /// Shared tail of the mutating broadcasts: evict failed partitions,
    /// propagate application errors, then re-check the threshold.
    fn settle_broadcast(&self, results: Vec<(PartitionId, FsResult<()>)>) -> FsResult<()> {
        let mut application: Option<FsError> = None;
        for (id, result) in results {
            if let Err(e) = self.partitions.wrap_result(&id, result) {
                if e.is_application() {
                    application.get_or_insert(e);
                }
            }
        }
        if let Some(e) = application {
            return Err(e);
        }
        self.ensure_not_degraded()
    }
}

#[async_trait]
impl FileSystem for ClusterFs {
    async fn upload(&self, name: &str, size: Option<u64>) -> FsResult<ByteSink> {
        self.ensure_not_degraded()?;
        let (ids, sinks) = self.open_replicas(name, SinkOp::Upload(size)).await?;
        debug!(name, replicas = ids.len(), "upload fan-out opened");
        let sink = self.replicated_sink(ids, sinks);
        Ok(match size {
            Some(expected) => sized(sink, expected),
            None => sink,
        })
    }

    async fn append(&self, name: &str, offset: u64) -> FsResult<ByteSink> {
        self.ensure_not_degraded()?;
        let (ids, sinks) = self.open_replicas(name, SinkOp::Append(offset)).await?;
        debug!(name, replicas = ids.len(), "append fan-out opened");
        Ok(self.replicated_sink(ids, sinks))
    }

    async fn download(&self, name: &str, offset: u64, limit: u64) -> FsResult<ByteSource> {
        self.ensure_not_degraded()?;
        let results = self
            .broadcast(|fs| async move { fs.download(name, offset, limit).await })
            .await;
        if results.is_empty() {
            return Err(FsError::NoReplicasAvailable(name.to_string()));
        }

        let mut replicas = Vec::new();
        let mut transport_failures = 0;
        let mut application: Option<FsError> = None;
        for (id, result) in results {
            match self.partitions.wrap_result(&id, result) {
                Ok(source) => replicas.push(source),
                Err(FsError::FileNotFound(_)) => {}
                Err(e) if e.is_application() => {
                    application.get_or_insert(e);
                }
                Err(_) => transport_failures += 1,
            }
        }

        if !replicas.is_empty() {
            debug!(name, replicas = replicas.len(), "download fan-in assembled");
            return Ok(merge(replicas));
        }
        if transport_failures > 0 {
            // An unreachable replica may still hold the file, so absence
            // cannot be claimed.
            return Err(FsError::NoReplicasAvailable(name.to_string()));
        }
        match application {
            Some(e) => Err(e),
            None => Err(FsError::FileNotFound(name.to_string())),
        }
    }

    async fn delete(&self, name: &str) -> FsResult<()> {
        self.ensure_not_degraded()?;
        let results = self
            .broadcast(|fs| async move { fs.delete(name).await })
            .await;
        self.settle_broadcast(results)
    }

    async fn delete_all(&self, names: &[String]) -> FsResult<()> {
        self.ensure_not_degraded()?;
        let results = self
            .broadcast(|fs| async move { fs.delete_all(names).await })
            .await;
        self.settle_broadcast(results)
    }

    async fn list(&self, pattern: &str) -> FsResult<HashMap<String, FileMetadata>> {
        self.ensure_not_degraded()?;
        compile_glob(pattern)?;
        let results = self
            .broadcast(|fs| async move { fs.list(pattern).await })
            .await;
        let mut merged = HashMap::new();
        for (id, result) in results {
            match self.partitions.wrap_result(&id, result) {
                Ok(listing) => {
                    for (name, meta) in listing {
                        merge_entry(&mut merged, name, meta);
                    }
                }
                Err(e) if e.is_application() => return Err(e),
                // Evicted; the survivors' merged view still answers.
                Err(_) => {}
            }
        }
        Ok(merged)
    }

    async fn info(&self, name: &str) -> FsResult<Option<FileMetadata>> {
        self.ensure_not_degraded()?;
        let results = self
            .broadcast(|fs| async move { fs.info(name).await })
            .await;
        let mut best: Option<FileMetadata> = None;
        for (id, result) in results {
            match self.partitions.wrap_result(&id, result) {
                Ok(Some(meta)) => {
                    best = Some(match best {
                        Some(current) if current >= meta => current,
                        _ => meta,
                    });
                }
                Ok(None) => {}
                Err(e) if e.is_application() => return Err(e),
                Err(_) => {}
            }
        }
        Ok(best)
    }

    async fn info_all(&self, names: &[String]) -> FsResult<HashMap<String, FileMetadata>> {
        self.ensure_not_degraded()?;
        let results = self
            .broadcast(|fs| async move { fs.info_all(names).await })
            .await;
        let mut merged = HashMap::new();
        for (id, result) in results {
            match self.partitions.wrap_result(&id, result) {
                Ok(found) => {
                    for (name, meta) in found {
                        merge_entry(&mut merged, name, meta);
                    }
                }
                Err(e) if e.is_application() => return Err(e),
                Err(_) => {}
            }
        }
        Ok(merged)
    }

    /// Cluster ping doubles as the rehabilitation entry point: sweep all
    /// partitions, then apply the degradation predicate.
    async fn ping(&self) -> FsResult<()> {
        self.partitions.check_all_partitions().await;
        self.ensure_not_degraded()
    }
}
