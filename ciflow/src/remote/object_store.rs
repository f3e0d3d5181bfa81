//! Object storage used by the cache subsystem.

use crate::errors::EngineError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;

/// Metadata of a stored object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Entity tag reported by the store.
    pub etag: String,
    /// User metadata stored alongside the object.
    pub metadata: HashMap<String, String>,
}

/// Options for an upload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadOptions {
    /// User metadata to attach.
    pub metadata: HashMap<String, String>,
    /// Use the standard storage class.
    pub standard_redundancy: bool,
    /// Multipart part size in bytes.
    pub part_size: u64,
}

/// A key/value blob store.
///
/// `stat` must return [`EngineError::NotFound`] when the key is absent so
/// callers can tell a cache miss from a failed call.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Returns metadata for `key`.
    async fn stat(&self, key: &str) -> Result<ObjectInfo, EngineError>;

    /// Uploads the file at `path` under `key`.
    async fn upload(&self, key: &str, path: &Path, options: UploadOptions) -> Result<(), EngineError>;

    /// Downloads `key` into the file at `path`, replacing it.
    async fn download(&self, key: &str, path: &Path) -> Result<(), EngineError>;
}
