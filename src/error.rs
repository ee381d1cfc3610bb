//! Error model shared by every filesystem implementation.
//!
//! Two disjoint families: application errors carry domain meaning, travel
//! verbatim across composition layers, and never evict a partition.
//! Transport errors evict the partition they came from and are rewrapped
//! as [`FsError::NodeFailed`] before propagation.

use std::io;

use thiserror::Error;

/// Stable integer codes used by both wire formats (TCP and HTTP).
pub const CODE_UNKNOWN: u32 = 0;
pub const CODE_FILE_NOT_FOUND: u32 = 1;
pub const CODE_FILE_EXISTS: u32 = 2;
pub const CODE_BAD_PATH: u32 = 3;
pub const CODE_BAD_RANGE: u32 = 4;
pub const CODE_IS_DIRECTORY: u32 = 5;
pub const CODE_MALFORMED_GLOB: u32 = 6;
pub const CODE_ILLEGAL_OFFSET: u32 = 7;
pub const CODE_UNEXPECTED_DATA: u32 = 8;
pub const CODE_UNEXPECTED_END_OF_STREAM: u32 = 9;

#[derive(Debug, Error)]
pub enum FsError {
    // Application errors (codes 1-9).
    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("file already exists: {0}")]
    FileExists(String),

    #[error("name escapes storage root: {0}")]
    BadPath(String),

    #[error("negative offset or limit")]
    BadRange,

    #[error("target is a directory: {0}")]
    IsDirectory(String),

    #[error("malformed glob pattern: {0}")]
    MalformedGlob(String),

    #[error("append offset past end of file")]
    IllegalOffset,

    #[error("received more bytes than the declared size")]
    UnexpectedData,

    #[error("stream ended before the declared size")]
    UnexpectedEndOfStream,

    // Transport and cluster errors (code 0 on the wire).
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("partition {id} failed")]
    NodeFailed {
        id: String,
        #[source]
        source: Box<FsError>,
    },

    #[error("cluster degraded: {dead} partitions dead, threshold {threshold}")]
    ClusterDegraded { dead: usize, threshold: usize },

    #[error("not enough upload targets: required {required}, got {got}")]
    NotEnoughUploadTargets { required: usize, got: usize },

    #[error("no replicas available for {0}")]
    NoReplicasAvailable(String),

    #[error("combined download truncated at byte {0}")]
    TruncatedStream(u64),

    #[error("stream closed")]
    StreamClosed,

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("remote error code {0}")]
    Unknown(u32),
}

impl FsError {
    /// Stable wire code. Everything outside the application family maps
    /// to [`CODE_UNKNOWN`].
    pub fn code(&self) -> u32 {
        match self {
            FsError::FileNotFound(_) => CODE_FILE_NOT_FOUND,
            FsError::FileExists(_) => CODE_FILE_EXISTS,
            FsError::BadPath(_) => CODE_BAD_PATH,
            FsError::BadRange => CODE_BAD_RANGE,
            FsError::IsDirectory(_) => CODE_IS_DIRECTORY,
            FsError::MalformedGlob(_) => CODE_MALFORMED_GLOB,
            FsError::IllegalOffset => CODE_ILLEGAL_OFFSET,
            FsError::UnexpectedData => CODE_UNEXPECTED_DATA,
            FsError::UnexpectedEndOfStream => CODE_UNEXPECTED_END_OF_STREAM,
            _ => CODE_UNKNOWN,
        }
    }

    /// Whether this error belongs to the application family.
    ///
    /// Application errors must never mark a partition dead.
    pub fn is_application(&self) -> bool {
        self.code() != CODE_UNKNOWN
    }

    /// Reconstruct an error from a wire code. `subject` is the name the
    /// failed operation was addressing.
    pub fn from_code(code: u32, subject: &str) -> FsError {
        match code {
            CODE_FILE_NOT_FOUND => FsError::FileNotFound(subject.to_string()),
            CODE_FILE_EXISTS => FsError::FileExists(subject.to_string()),
            CODE_BAD_PATH => FsError::BadPath(subject.to_string()),
            CODE_BAD_RANGE => FsError::BadRange,
            CODE_IS_DIRECTORY => FsError::IsDirectory(subject.to_string()),
            CODE_MALFORMED_GLOB => FsError::MalformedGlob(subject.to_string()),
            CODE_ILLEGAL_OFFSET => FsError::IllegalOffset,
            CODE_UNEXPECTED_DATA => FsError::UnexpectedData,
            CODE_UNEXPECTED_END_OF_STREAM => FsError::UnexpectedEndOfStream,
            other => FsError::Unknown(other),
        }
    }

    /// Wrap a transport error with the partition it came from.
    /// Application errors pass through untouched.
    pub fn node_failed(self, id: &str) -> FsError {
        if self.is_application() {
            self
        } else {
            FsError::NodeFailed {
                id: id.to_string(),
                source: Box::new(self),
            }
        }
    }
}

/// Result alias used across the crate.
pub type FsResult<T> = std::result::Result<T, FsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_round_trip() {
        for code in 1..=9u32 {
            let err = FsError::from_code(code, "a/b.txt");
            assert_eq!(err.code(), code);
            assert!(err.is_application());
        }
    }

    #[test]
    fn test_unknown_codes_are_not_application() {
        let err = FsError::from_code(42, "x");
        assert_eq!(err.code(), CODE_UNKNOWN);
        assert!(!err.is_application());
    }

    #[test]
    fn test_node_failed_preserves_application_errors() {
        let err = FsError::FileNotFound("x".into()).node_failed("p1");
        assert!(matches!(err, FsError::FileNotFound(_)));

        let err = FsError::StreamClosed.node_failed("p1");
        match err {
            FsError::NodeFailed { id, .. } => assert_eq!(id, "p1"),
            other => panic!("expected NodeFailed, got {:?}", other),
        }
    }
}
