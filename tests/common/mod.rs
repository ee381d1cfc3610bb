//! Shared test support: fault-injecting filesystem wrapper and cluster
//! harness.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use driftfs::stream::{byte_channel, ByteSink, ByteSource};
use driftfs::{
    ClusterConfig, ClusterFs, FileMetadata, FileSystem, FsError, LocalFs, Partitions,
};
use tempfile::TempDir;

type FsResult<T> = Result<T, FsError>;

/// Wraps a real store and injects failures: a partition-wide outage, or
/// streams that die after a configured number of bytes.
pub struct FlakyFs {
    inner: Arc<dyn FileSystem>,
    healthy: AtomicBool,
    fail_upload_after: Mutex<Option<u64>>,
    fail_download_after: Mutex<Option<u64>>,
}

pub fn outage() -> FsError {
    FsError::Io(std::io::Error::other("injected outage"))
}

impl FlakyFs {
    pub fn new(inner: Arc<dyn FileSystem>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            healthy: AtomicBool::new(true),
            fail_upload_after: Mutex::new(None),
            fail_download_after: Mutex::new(None),
        })
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn fail_uploads_after(&self, bytes: u64) {
        *self.fail_upload_after.lock().unwrap() = Some(bytes);
    }

    pub fn fail_downloads_after(&self, bytes: u64) {
        *self.fail_download_after.lock().unwrap() = Some(bytes);
    }

    fn check(&self) -> FsResult<()> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(outage())
        }
    }
}

/// Forward into `inner`, failing the stream once more than `fail_after`
/// bytes went through.
fn failing_sink(mut inner: ByteSink, fail_after: u64) -> ByteSink {
    let (sink, mut source) = byte_channel(8);
    tokio::spawn(async move {
        let mut seen: u64 = 0;
        loop {
            match source.pull().await {
                Ok(Some(buf)) => {
                    seen += buf.len() as u64;
                    if seen > fail_after {
                        inner.abort(outage()).await;
                        source.finish(Err(outage()));
                        return;
                    }
                    if let Err(e) = inner.push(buf).await {
                        source.finish(Err(e));
                        return;
                    }
                }
                Ok(None) => {
                    source.finish(inner.finish().await);
                    return;
                }
                Err(_) => return,
            }
        }
    });
    sink
}

/// Emit exactly `fail_after` bytes of `inner`, then fail.
fn failing_source(mut inner: ByteSource, fail_after: u64) -> ByteSource {
    let (mut sink, out) = byte_channel(8);
    tokio::spawn(async move {
        let mut seen: u64 = 0;
        loop {
            match inner.pull().await {
                Ok(Some(mut buf)) => {
                    if seen + buf.len() as u64 > fail_after {
                        let keep = (fail_after - seen) as usize;
                        if keep > 0 {
                            let _ = sink.push(buf.split_to(keep)).await;
                        }
                        sink.abort(outage()).await;
                        return;
                    }
                    seen += buf.len() as u64;
                    if sink.push(buf).await.is_err() {
                        return;
                    }
                }
                Ok(None) => {
                    inner.finish(Ok(()));
                    let _ = sink.finish().await;
                    return;
                }
                Err(e) => {
                    sink.abort(e).await;
                    return;
                }
            }
        }
    });
    out
}

#[async_trait]
impl FileSystem for FlakyFs {
    async fn upload(&self, name: &str, size: Option<u64>) -> FsResult<ByteSink> {
        self.check()?;
        let sink = self.inner.upload(name, size).await?;
        Ok(match *self.fail_upload_after.lock().unwrap() {
            Some(bytes) => failing_sink(sink, bytes),
            None => sink,
        })
    }

    async fn append(&self, name: &str, offset: u64) -> FsResult<ByteSink> {
        self.check()?;
        let sink = self.inner.append(name, offset).await?;
        Ok(match *self.fail_upload_after.lock().unwrap() {
            Some(bytes) => failing_sink(sink, bytes),
            None => sink,
        })
    }

    async fn download(&self, name: &str, offset: u64, limit: u64) -> FsResult<ByteSource> {
        self.check()?;
        let source = self.inner.download(name, offset, limit).await?;
        Ok(match *self.fail_download_after.lock().unwrap() {
            Some(bytes) => failing_source(source, bytes),
            None => source,
        })
    }

    async fn delete(&self, name: &str) -> FsResult<()> {
        self.check()?;
        self.inner.delete(name).await
    }

    async fn delete_all(&self, names: &[String]) -> FsResult<()> {
        self.check()?;
        self.inner.delete_all(names).await
    }

    async fn list(&self, pattern: &str) -> FsResult<HashMap<String, FileMetadata>> {
        self.check()?;
        self.inner.list(pattern).await
    }

    async fn info(&self, name: &str) -> FsResult<Option<FileMetadata>> {
        self.check()?;
        self.inner.info(name).await
    }

    async fn info_all(&self, names: &[String]) -> FsResult<HashMap<String, FileMetadata>> {
        self.check()?;
        self.inner.info_all(names).await
    }

    async fn ping(&self) -> FsResult<()> {
        self.check()
    }
}

/// A cluster of `n` flaky local partitions with ids `p0..pn`.
pub struct TestCluster {
    pub dirs: Vec<TempDir>,
    pub stores: Vec<Arc<dyn FileSystem>>,
    pub flaky: Vec<Arc<FlakyFs>>,
    pub partitions: Arc<Partitions>,
    pub cluster: ClusterFs,
}

pub async fn test_cluster(n: usize, config: ClusterConfig) -> TestCluster {
    let mut dirs = Vec::new();
    let mut stores: Vec<Arc<dyn FileSystem>> = Vec::new();
    let mut flaky = Vec::new();
    let mut handles: HashMap<String, Arc<dyn FileSystem>> = HashMap::new();
    for i in 0..n {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn FileSystem> = Arc::new(LocalFs::new(dir.path()).await.unwrap());
        let wrapper = FlakyFs::new(Arc::clone(&store));
        handles.insert(format!("p{i}"), Arc::clone(&wrapper) as Arc<dyn FileSystem>);
        dirs.push(dir);
        stores.push(store);
        flaky.push(wrapper);
    }
    let partitions = Arc::new(Partitions::new(handles));
    let cluster = ClusterFs::new(Arc::clone(&partitions), config);
    TestCluster {
        dirs,
        stores,
        flaky,
        partitions,
        cluster,
    }
}
