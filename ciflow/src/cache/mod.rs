//! Build cache save and restore.
//!
//! This module provides:
//! - Cache key templating with `checksum`, `epoch`, `arch` and `os`
//! - Save: archive paths and upload unless an identical archive is stored
//! - Restore: download, verify the content hash and unarchive
//!
//! Uploads and downloads run under a [`Backoff`](crate::retry::Backoff)
//! policy built from [`CacheConfig::retry`], one instance per call.

mod key;
mod restore;
mod save;

pub use key::{
    arch, checksum, content_hash, content_hash_blocking, os, render_key, resolve_key,
    CONTENT_HASH_METADATA_KEY,
};
pub use restore::RestoreOutcome;

use crate::archive::{Archiver, TarArchiver};
use crate::config::{CacheConfig, EngineConfig};
use crate::errors::EngineError;
use crate::remote::{ExpressionEvaluator, ObjectStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Saves and restores build caches against an object store.
#[derive(Clone)]
pub struct CacheService {
    store: Arc<dyn ObjectStore>,
    archiver: Arc<dyn Archiver>,
    evaluator: Arc<dyn ExpressionEvaluator>,
    config: CacheConfig,
    work_dir: PathBuf,
    tmp_dir: PathBuf,
}

impl CacheService {
    /// Creates a cache service.
    ///
    /// The same `archiver` is used for save and restore so both sides agree
    /// on the archive format.
    #[must_use]
    pub fn new(
        store: Arc<dyn ObjectStore>,
        archiver: Arc<dyn Archiver>,
        evaluator: Arc<dyn ExpressionEvaluator>,
        config: CacheConfig,
        work_dir: impl Into<PathBuf>,
        tmp_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            archiver,
            evaluator,
            config,
            work_dir: work_dir.into(),
            tmp_dir: tmp_dir.into(),
        }
    }

    /// Creates a cache service with a [`TarArchiver`] rooted at the work dir.
    #[must_use]
    pub fn from_config(
        store: Arc<dyn ObjectStore>,
        evaluator: Arc<dyn ExpressionEvaluator>,
        config: &EngineConfig,
    ) -> Self {
        let archiver =
            TarArchiver::new(config.work_dir.clone()).with_compression(config.cache.compress);
        Self::new(
            store,
            Arc::new(archiver),
            evaluator,
            config.cache.clone(),
            config.work_dir.clone(),
            config.tmp_dir.clone(),
        )
    }

    /// Directory archives are restored into.
    #[must_use]
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Per-step archive file.
    fn archive_path(&self, step_id: &str) -> PathBuf {
        self.tmp_dir.join(step_id)
    }
}

impl std::fmt::Debug for CacheService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheService")
            .field("config", &self.config)
            .field("work_dir", &self.work_dir)
            .field("tmp_dir", &self.tmp_dir)
            .finish_non_exhaustive()
    }
}

/// Runs a blocking archive operation off the async runtime.
async fn run_blocking<F>(f: F) -> Result<(), EngineError>
where
    F: FnOnce() -> Result<(), EngineError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| EngineError::Join(e.to_string()))?
}
