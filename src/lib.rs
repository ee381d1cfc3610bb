//! driftfs - a replicated remote filesystem.
//!
//! Fans one logical filesystem out across N partitions: writes replicate
//! to the best candidates for the name, reads fan several replicas back
//! into one byte-exact stream, and a liveness directory evicts partitions
//! on transport failures and rehabilitates them on ping.
//!
//! # Architecture
//!
//! ```text
//! Upload (replicate on write):
//! +--------+     +-----------+     +-----------+
//! | caller | --> |  cluster  | --> | fan-out   | --> K partitions
//! |        |     | composer  |     | splitter  |     (>= upload_min acks)
//! +--------+     +-----------+     +-----------+
//!
//! Download (fan-in on read):
//! all alive partitions --> +-----------+     +--------+
//!                          |  fan-in   | --> | caller |
//!                          | combiner  |     |        |
//!                          +-----------+     +--------+
//! ```
//!
//! Every layer implements the same [`fs::FileSystem`] contract, so local
//! stores, wire clients, prefix mounts, and the cluster stack freely.

pub mod cluster;
pub mod error;
pub mod fs;
pub mod http;
pub mod metadata;
pub mod net;
pub mod stream;

pub use cluster::{ClusterConfig, ClusterFs, PartitionId, Partitions, RendezvousSelector, ServerSelector};
pub use error::{FsError, FsResult};
pub use fs::{download_bytes, upload_bytes, FileSystem, LocalFs, MountFs, NO_LIMIT};
pub use http::HttpFs;
pub use metadata::FileMetadata;
pub use net::RemoteFs;
pub use stream::{byte_channel, ByteSink, ByteSource};
