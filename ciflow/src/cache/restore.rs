use super::key::{content_hash_blocking, resolve_key, CONTENT_HASH_METADATA_KEY};
use super::{run_blocking, CacheService};
use crate::core::{RestoreCacheStep, StageOutput};
use crate::errors::{EngineError, IntegrityError};
use crate::retry::{retry_notify, RetryError};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Result of a restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreOutcome {
    /// The resolved cache key.
    pub key: String,
    /// False when no cache existed and the step tolerated it.
    pub restored: bool,
}

impl CacheService {
    /// Restores the cache for the step's resolved key into the work dir.
    ///
    /// A missing key is a no-op unless `fail_if_not_exist` is set, in which
    /// case it fails without retrying. A content hash mismatch after
    /// download also fails without retrying.
    pub async fn restore(
        &self,
        step_id: &str,
        step: &RestoreCacheStep,
        stage_output: &StageOutput,
    ) -> Result<RestoreOutcome, EngineError> {
        let start = Instant::now();
        let key = resolve_key(
            self.evaluator.as_ref(),
            step_id,
            &step.key,
            stage_output,
            &self.work_dir,
        )
        .await?;

        let restored = self
            .download_and_unarchive(step_id, &key, step.fail_if_not_exist)
            .await
            .map_err(|e| EngineError::cache("restore cache", key.clone(), e))?;

        info!(
            step_id,
            key = %key,
            restored,
            elapsed_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
            "Restore cache finished"
        );
        Ok(RestoreOutcome { key, restored })
    }

    async fn download_and_unarchive(
        &self,
        step_id: &str,
        key: &str,
        fail_if_not_exist: bool,
    ) -> Result<bool, EngineError> {
        let archive = self.archive_path(step_id);
        let mut backoff = self.config.retry.backoff();
        let path: &Path = &archive;
        let found =
            retry_notify(&mut backoff, || self.fetch(key, path, fail_if_not_exist)).await?;

        if !found {
            warn!(step_id, key, "Cache does not exist, skipping restore");
            return Ok(false);
        }

        let archiver = Arc::clone(&self.archiver);
        let dst_dir = self.work_dir.clone();
        run_blocking(move || archiver.unarchive(&archive, &dst_dir)).await?;
        Ok(true)
    }

    /// One stat, download and verify attempt.
    ///
    /// Returns `Ok(false)` for a tolerated cache miss.
    async fn fetch(
        &self,
        key: &str,
        path: &Path,
        fail_if_not_exist: bool,
    ) -> Result<bool, RetryError<EngineError>> {
        let info = match self.store.stat(key).await {
            Ok(info) => info,
            Err(EngineError::NotFound { .. }) if !fail_if_not_exist => return Ok(false),
            Err(e @ EngineError::NotFound { .. }) => return Err(RetryError::Permanent(e)),
            Err(e) => return Err(RetryError::classify(e)),
        };

        self.store
            .download(key, path)
            .await
            .map_err(RetryError::classify)?;

        let Some(expected) = info.metadata.get(CONTENT_HASH_METADATA_KEY) else {
            debug!(key, "Cache object has no content hash, skipping integrity check");
            return Ok(true);
        };
        let actual = content_hash_blocking(path.to_path_buf())
            .await
            .map_err(RetryError::classify)?;
        if &actual != expected {
            return Err(RetryError::Permanent(
                IntegrityError {
                    path: path.display().to_string(),
                    expected: expected.clone(),
                    actual,
                }
                .into(),
            ));
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{Archiver, TarArchiver};
    use crate::config::CacheConfig;
    use crate::core::SaveCacheStep;
    use crate::errors::{RemoteCode, RemoteStatus};
    use crate::remote::{MockObjectStore, ObjectInfo, ObjectStore};
    use crate::retry::{JitterStrategy, RetryConfig};
    use crate::testing::{InMemoryObjectStore, StaticEvaluator, StoreOp};
    use parking_lot::Mutex;
    use std::fs;
    use tempfile::TempDir;

    /// Records unarchive calls and delegates to a real archiver.
    struct CountingArchiver {
        inner: TarArchiver,
        unarchived: Mutex<usize>,
    }

    impl Archiver for CountingArchiver {
        fn archive(&self, src_paths: &[String], dst_file: &Path) -> Result<(), EngineError> {
            self.inner.archive(src_paths, dst_file)
        }

        fn unarchive(&self, archive_file: &Path, dst_dir: &Path) -> Result<(), EngineError> {
            *self.unarchived.lock() += 1;
            self.inner.unarchive(archive_file, dst_dir)
        }
    }

    fn fast_config() -> CacheConfig {
        CacheConfig::default().with_retry(
            RetryConfig::new()
                .with_max_attempts(3)
                .with_base_delay_ms(1)
                .with_jitter(JitterStrategy::None),
        )
    }

    fn service(
        store: Arc<dyn ObjectStore>,
        archiver: Arc<dyn Archiver>,
        work: &TempDir,
        tmp: &TempDir,
    ) -> CacheService {
        CacheService::new(
            store,
            archiver,
            Arc::new(StaticEvaluator::new()),
            fast_config(),
            work.path(),
            tmp.path(),
        )
    }

    fn counting(work: &TempDir) -> Arc<CountingArchiver> {
        Arc::new(CountingArchiver {
            inner: TarArchiver::new(work.path()).with_compression(true),
            unarchived: Mutex::new(0),
        })
    }

    fn restore_step(key: &str, fail_if_not_exist: bool) -> RestoreCacheStep {
        RestoreCacheStep {
            key: key.to_string(),
            fail_if_not_exist,
        }
    }

    #[tokio::test]
    async fn test_round_trip_restores_identical_contents() {
        let work = tempfile::tempdir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(work.path().join("target/debug")).unwrap();
        fs::write(work.path().join("target/debug/app"), [0u8, 159, 146, 150]).unwrap();
        let store = Arc::new(InMemoryObjectStore::new());
        let archiver = counting(&work);
        let cache = service(store.clone(), archiver.clone(), &work, &tmp);

        let save = SaveCacheStep {
            key: "target-v1".to_string(),
            paths: vec!["target".to_string()],
        };
        cache.save("save", &save, &StageOutput::new()).await.unwrap();
        fs::remove_dir_all(work.path().join("target")).unwrap();

        let outcome = cache
            .restore("restore", &restore_step("target-v1", true), &StageOutput::new())
            .await
            .unwrap();

        assert!(outcome.restored);
        assert_eq!(outcome.key, "target-v1");
        assert_eq!(
            fs::read(work.path().join("target/debug/app")).unwrap(),
            vec![0u8, 159, 146, 150]
        );
        assert_eq!(*archiver.unarchived.lock(), 1);
    }

    #[tokio::test]
    async fn test_missing_key_tolerated_without_unarchive() {
        let work = tempfile::tempdir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryObjectStore::new());
        let archiver = counting(&work);
        let cache = service(store.clone(), archiver.clone(), &work, &tmp);

        let outcome = cache
            .restore("restore", &restore_step("absent", false), &StageOutput::new())
            .await
            .unwrap();

        assert!(!outcome.restored);
        assert_eq!(*archiver.unarchived.lock(), 0);
        assert_eq!(store.count(StoreOp::Download), 0);
    }

    #[tokio::test]
    async fn test_missing_key_fails_when_required() {
        let work = tempfile::tempdir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryObjectStore::new());
        let cache = service(store.clone(), counting(&work), &work, &tmp);

        let err = cache
            .restore("restore", &restore_step("absent", true), &StageOutput::new())
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::Cache { operation: "restore cache", .. }));
        assert!(err.to_string().contains("absent"));
        assert_eq!(store.count(StoreOp::Stat), 1);
    }

    #[tokio::test]
    async fn test_hash_mismatch_fails_without_retry() {
        let work = tempfile::tempdir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        fs::write(work.path().join("a.txt"), "a").unwrap();
        let store = Arc::new(InMemoryObjectStore::new());
        let archiver = counting(&work);
        let cache = service(store.clone(), archiver.clone(), &work, &tmp);

        let save = SaveCacheStep {
            key: "k".to_string(),
            paths: vec!["a.txt".to_string()],
        };
        cache.save("save", &save, &StageOutput::new()).await.unwrap();
        store.corrupt("k");

        let err = cache
            .restore("restore", &restore_step("k", false), &StageOutput::new())
            .await
            .unwrap_err();

        assert!(err.is_permanent());
        assert!(err.to_string().contains("content hash mismatch"));
        assert_eq!(store.count(StoreOp::Download), 1);
        assert_eq!(*archiver.unarchived.lock(), 0);
    }

    #[tokio::test]
    async fn test_transient_stat_errors_retry_whole_sequence() {
        let work = tempfile::tempdir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        fs::write(work.path().join("a.txt"), "a").unwrap();
        let store = Arc::new(InMemoryObjectStore::new());
        let cache = service(store.clone(), counting(&work), &work, &tmp);
        let save = SaveCacheStep {
            key: "k".to_string(),
            paths: vec!["a.txt".to_string()],
        };
        cache.save("save", &save, &StageOutput::new()).await.unwrap();
        store.reset_counts();

        store.fail_next(StoreOp::Stat, RemoteStatus::unavailable("flaky"));
        store.fail_next(StoreOp::Download, RemoteStatus::unavailable("reset"));

        let outcome = cache
            .restore("restore", &restore_step("k", true), &StageOutput::new())
            .await
            .unwrap();

        assert!(outcome.restored);
        assert_eq!(store.count(StoreOp::Stat), 3);
        assert_eq!(store.count(StoreOp::Download), 2);
    }

    #[tokio::test]
    async fn test_permanent_stat_error_stops() {
        let work = tempfile::tempdir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let mut store = MockObjectStore::new();
        store.expect_stat().times(1).returning(|_| {
            Err(RemoteStatus::new(RemoteCode::Unauthenticated, "missing credentials").into())
        });
        store.expect_download().never();
        let cache = service(Arc::new(store), counting(&work), &work, &tmp);

        let err = cache
            .restore("restore", &restore_step("k", false), &StageOutput::new())
            .await
            .unwrap_err();

        assert_eq!(err.status_message(), "missing credentials");
    }

    #[tokio::test]
    async fn test_object_without_hash_is_trusted() {
        let work = tempfile::tempdir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("b.txt"), "b").unwrap();
        let blob = src.path().join("blob");
        TarArchiver::new(src.path())
            .with_compression(true)
            .archive(&["b.txt".to_string()], &blob)
            .unwrap();
        let bytes = fs::read(&blob).unwrap();

        let mut store = MockObjectStore::new();
        store
            .expect_stat()
            .returning(|_| Ok(ObjectInfo::default()));
        store.expect_download().times(1).returning(move |_, path| {
            fs::write(path, &bytes).unwrap();
            Ok(())
        });
        let cache = service(Arc::new(store), counting(&work), &work, &tmp);

        let outcome = cache
            .restore("restore", &restore_step("k", true), &StageOutput::new())
            .await
            .unwrap();

        assert!(outcome.restored);
        assert_eq!(fs::read_to_string(work.path().join("b.txt")).unwrap(), "b");
    }
}
