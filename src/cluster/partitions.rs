//! Partition directory and liveness tracker.
//!
//! Keeps the `{id -> remote filesystem}` registry split into alive and
//! dead sets. Operations move partitions dead on transport errors and
//! back alive on successful pings; application errors never evict.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::{join_all, BoxFuture, Shared};
use futures::FutureExt;
use tracing::{info, warn};

use crate::cluster::select::{RendezvousSelector, ServerSelector};
use crate::error::{FsError, FsResult};
use crate::fs::FileSystem;

/// Opaque partition identity. Two equal ids are the same logical
/// partition for the lifetime of the directory.
pub type PartitionId = String;

#[derive(Default)]
struct Registry {
    alive: HashMap<PartitionId, Arc<dyn FileSystem>>,
    dead: HashMap<PartitionId, Arc<dyn FileSystem>>,
}

type CheckFuture = Shared<BoxFuture<'static, ()>>;

pub struct Partitions {
    registry: Mutex<Registry>,
    selector: Box<dyn ServerSelector>,
    check_all: Mutex<Option<CheckFuture>>,
    check_dead: Mutex<Option<CheckFuture>>,
}

impl Partitions {
    /// Directory over the given partitions, all initially alive, ordered
    /// by the default rendezvous selector.
    pub fn new(partitions: HashMap<PartitionId, Arc<dyn FileSystem>>) -> Self {
        Self::with_selector(partitions, Box::new(RendezvousSelector))
    }

    pub fn with_selector(
        partitions: HashMap<PartitionId, Arc<dyn FileSystem>>,
        selector: Box<dyn ServerSelector>,
    ) -> Self {
        Self {
            registry: Mutex::new(Registry {
                alive: partitions,
                dead: HashMap::new(),
            }),
            selector,
            check_all: Mutex::new(None),
            check_dead: Mutex::new(None),
        }
    }

    /// Add (or replace) a partition; it starts alive.
    pub fn register(&self, id: PartitionId, fs: Arc<dyn FileSystem>) {
        let mut registry = self.registry.lock().unwrap();
        registry.dead.remove(&id);
        registry.alive.insert(id, fs);
    }

    /// Handle of an alive partition, `None` when dead or unknown.
    pub fn get(&self, id: &str) -> Option<Arc<dyn FileSystem>> {
        self.registry.lock().unwrap().alive.get(id).cloned()
    }

    /// Snapshot of the alive set.
    pub fn alive(&self) -> Vec<(PartitionId, Arc<dyn FileSystem>)> {
        let registry = self.registry.lock().unwrap();
        registry
            .alive
            .iter()
            .map(|(id, fs)| (id.clone(), Arc::clone(fs)))
            .collect()
    }

    pub fn alive_ids(&self) -> Vec<PartitionId> {
        self.registry.lock().unwrap().alive.keys().cloned().collect()
    }

    pub fn dead_ids(&self) -> Vec<PartitionId> {
        self.registry.lock().unwrap().dead.keys().cloned().collect()
    }

    pub fn dead_count(&self) -> usize {
        self.registry.lock().unwrap().dead.len()
    }

    /// Total number of registered partitions, dead or alive.
    pub fn len(&self) -> usize {
        let registry = self.registry.lock().unwrap();
        registry.alive.len() + registry.dead.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Alive partitions ordered for `name` by the server selector.
    pub fn select(&self, name: &str) -> Vec<PartitionId> {
        let mut ids = self.alive_ids();
        self.selector.select(name, &mut ids);
        ids
    }

    /// Move a partition to the dead set. Returns whether a transition
    /// happened, so callers do not log the same eviction twice.
    pub fn mark_dead(&self, id: &str, cause: &FsError) -> bool {
        let mut registry = self.registry.lock().unwrap();
        match registry.alive.remove_entry(id) {
            Some((id, fs)) => {
                warn!(partition = %id, error = %cause, "partition marked dead");
                registry.dead.insert(id, fs);
                true
            }
            None => false,
        }
    }

    /// Move a partition back to the alive set after a successful ping.
    pub fn mark_alive(&self, id: &str) -> bool {
        let mut registry = self.registry.lock().unwrap();
        match registry.dead.remove_entry(id) {
            Some((id, fs)) => {
                info!(partition = %id, "partition rehabilitated");
                registry.alive.insert(id, fs);
                true
            }
            None => false,
        }
    }

    /// Evict only on non-application causes; `FILE_NOT_FOUND` and friends
    /// say nothing about the partition's health.
    pub fn mark_if_dead(&self, id: &str, cause: &FsError) -> bool {
        if cause.is_application() {
            false
        } else {
            self.mark_dead(id, cause)
        }
    }

    /// Adapter installed on every outbound operation: evicts the
    /// partition on transport errors and tags the error with its id.
    pub fn wrap_result<T>(&self, id: &str, result: FsResult<T>) -> FsResult<T> {
        result.map_err(|e| {
            self.mark_if_dead(id, &e);
            e.node_failed(id)
        })
    }

    /// Ping every registered partition, reconciling both sets. Concurrent
    /// calls coalesce onto one in-flight sweep.
    pub async fn check_all_partitions(self: &Arc<Self>) {
        let this = Arc::clone(self);
        coalesce(&self.check_all, move || {
            async move {
                this.run_check(false).await;
                this.check_all.lock().unwrap().take();
            }
            .boxed()
            .shared()
        })
        .await;
    }

    /// Ping only the dead set, rehabilitating responders.
    pub async fn check_dead_partitions(self: &Arc<Self>) {
        let this = Arc::clone(self);
        coalesce(&self.check_dead, move || {
            async move {
                this.run_check(true).await;
                this.check_dead.lock().unwrap().take();
            }
            .boxed()
            .shared()
        })
        .await;
    }

    async fn run_check(&self, only_dead: bool) {
        let targets: Vec<(PartitionId, Arc<dyn FileSystem>)> = {
            let registry = self.registry.lock().unwrap();
            let dead = registry
                .dead
                .iter()
                .map(|(id, fs)| (id.clone(), Arc::clone(fs)));
            if only_dead {
                dead.collect()
            } else {
                registry
                    .alive
                    .iter()
                    .map(|(id, fs)| (id.clone(), Arc::clone(fs)))
                    .chain(dead)
                    .collect()
            }
        };
        let outcomes = join_all(targets.into_iter().map(|(id, fs)| async move {
            let outcome = fs.ping().await;
            (id, outcome)
        }))
        .await;
        for (id, outcome) in outcomes {
            match outcome {
                Ok(()) => {
                    self.mark_alive(&id);
                }
                Err(e) => {
                    self.mark_dead(&id, &e);
                }
            }
        }
    }
}

async fn coalesce(slot: &Mutex<Option<CheckFuture>>, make: impl FnOnce() -> CheckFuture) {
    let fut = {
        let mut guard = slot.lock().unwrap();
        match guard.as_ref() {
            Some(inflight) => inflight.clone(),
            None => {
                let fut = make();
                *guard = Some(fut.clone());
                fut
            }
        }
    };
    fut.await;
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::metadata::FileMetadata;
    use crate::stream::{ByteSink, ByteSource};

    /// Ping-only stub partition.
    struct StubFs {
        healthy: AtomicBool,
        pings: AtomicUsize,
    }

    impl StubFs {
        fn new(healthy: bool) -> Arc<Self> {
            Arc::new(Self {
                healthy: AtomicBool::new(healthy),
                pings: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl FileSystem for StubFs {
        async fn upload(&self, _: &str, _: Option<u64>) -> FsResult<ByteSink> {
            unimplemented!()
        }
        async fn append(&self, _: &str, _: u64) -> FsResult<ByteSink> {
            unimplemented!()
        }
        async fn download(&self, _: &str, _: u64, _: u64) -> FsResult<ByteSource> {
            unimplemented!()
        }
        async fn delete(&self, _: &str) -> FsResult<()> {
            unimplemented!()
        }
        async fn list(
            &self,
            _: &str,
        ) -> FsResult<std::collections::HashMap<String, FileMetadata>> {
            unimplemented!()
        }
        async fn info(&self, _: &str) -> FsResult<Option<FileMetadata>> {
            unimplemented!()
        }
        async fn ping(&self) -> FsResult<()> {
            self.pings.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(FsError::StreamClosed)
            }
        }
    }

    fn directory(stubs: &[(&str, Arc<StubFs>)]) -> Arc<Partitions> {
        let map: HashMap<PartitionId, Arc<dyn FileSystem>> = stubs
            .iter()
            .map(|(id, fs)| (id.to_string(), Arc::clone(fs) as Arc<dyn FileSystem>))
            .collect();
        Arc::new(Partitions::new(map))
    }

    #[tokio::test]
    async fn test_transport_errors_evict_application_errors_do_not() {
        let parts = directory(&[("p1", StubFs::new(true)), ("p2", StubFs::new(true))]);

        assert!(!parts.mark_if_dead("p1", &FsError::FileNotFound("x".into())));
        assert_eq!(parts.dead_count(), 0);

        assert!(parts.mark_if_dead("p1", &FsError::StreamClosed));
        assert_eq!(parts.dead_count(), 1);
        assert!(parts.get("p1").is_none());

        // Second eviction reports no transition.
        assert!(!parts.mark_if_dead("p1", &FsError::StreamClosed));
    }

    #[tokio::test]
    async fn test_wrap_result_tags_transport_errors() {
        let parts = directory(&[("p1", StubFs::new(true))]);

        let err = parts
            .wrap_result::<()>("p1", Err(FsError::StreamClosed))
            .unwrap_err();
        assert!(matches!(err, FsError::NodeFailed { ref id, .. } if id == "p1"));
        assert_eq!(parts.dead_count(), 1);

        let err = parts
            .wrap_result::<()>("p1", Err(FsError::FileNotFound("x".into())))
            .unwrap_err();
        assert!(matches!(err, FsError::FileNotFound(_)));
    }

    #[tokio::test]
    async fn test_ping_reconciliation() {
        let flaky = StubFs::new(false);
        let parts = directory(&[("p1", StubFs::new(true)), ("p2", Arc::clone(&flaky))]);

        parts.check_all_partitions().await;
        assert_eq!(parts.alive_ids(), vec!["p1".to_string()]);
        assert_eq!(parts.dead_ids(), vec!["p2".to_string()]);

        flaky.healthy.store(true, Ordering::SeqCst);
        parts.check_dead_partitions().await;
        assert_eq!(parts.dead_count(), 0);
        assert!(parts.select("anything").contains(&"p2".to_string()));
    }

    #[tokio::test]
    async fn test_concurrent_checks_coalesce() {
        let stub = StubFs::new(true);
        let parts = directory(&[("p1", Arc::clone(&stub))]);

        // Both futures are in flight at once, so they share one sweep.
        futures::join!(parts.check_all_partitions(), parts.check_all_partitions());

        assert_eq!(stub.pings.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_select_is_subset_of_alive() {
        let parts = directory(&[
            ("p1", StubFs::new(true)),
            ("p2", StubFs::new(true)),
            ("p3", StubFs::new(true)),
        ]);
        parts.mark_dead("p2", &FsError::StreamClosed);

        let picked = parts.select("file.bin");
        assert_eq!(picked.len(), 2);
        assert!(!picked.contains(&"p2".to_string()));
    }
}
