use super::key::{content_hash_blocking, resolve_key, CONTENT_HASH_METADATA_KEY};
use super::{run_blocking, CacheService};
use crate::core::{SaveCacheStep, StageOutput};
use crate::errors::EngineError;
use crate::remote::{resolve_embedded, UploadOptions};
use crate::retry::{retry_notify, RetryError};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

impl CacheService {
    /// Saves the step's paths under its resolved key.
    ///
    /// The upload is skipped when the store already holds an object under
    /// the key with the same content hash. Returns the resolved key.
    pub async fn save(
        &self,
        step_id: &str,
        step: &SaveCacheStep,
        stage_output: &StageOutput,
    ) -> Result<String, EngineError> {
        let start = Instant::now();
        let key = resolve_key(
            self.evaluator.as_ref(),
            step_id,
            &step.key,
            stage_output,
            &self.work_dir,
        )
        .await?;

        let mut paths = Vec::with_capacity(step.paths.len());
        for path in &step.paths {
            paths.push(resolve_embedded(self.evaluator.as_ref(), step_id, path, stage_output).await?);
        }

        self.archive_and_upload(step_id, &key, paths)
            .await
            .map_err(|e| EngineError::cache("save cache", key.clone(), e))?;

        info!(
            step_id,
            key = %key,
            elapsed_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
            "Saved cache"
        );
        Ok(key)
    }

    async fn archive_and_upload(
        &self,
        step_id: &str,
        key: &str,
        paths: Vec<String>,
    ) -> Result<(), EngineError> {
        let archive = self.archive_path(step_id);
        let archiver = Arc::clone(&self.archiver);
        let dst = archive.clone();
        run_blocking(move || archiver.archive(&paths, &dst)).await?;

        let hash = content_hash_blocking(archive.clone()).await?;
        if self.is_cached(step_id, key, &hash).await {
            info!(step_id, key, "Cache already exists with the same content, skipping upload");
            return Ok(());
        }

        let options = UploadOptions {
            metadata: HashMap::from([(CONTENT_HASH_METADATA_KEY.to_string(), hash)]),
            standard_redundancy: self.config.standard_redundancy,
            part_size: self.config.upload_part_size,
        };

        let mut backoff = self.config.retry.backoff();
        let store = &self.store;
        let path: &Path = &archive;
        retry_notify(&mut backoff, || {
            let options = options.clone();
            async move {
                store
                    .upload(key, path, options)
                    .await
                    .map_err(RetryError::classify)
            }
        })
        .await?;

        debug!(step_id, key, "Uploaded cache archive");
        Ok(())
    }

    /// True if `key` already holds an archive with `hash`.
    async fn is_cached(&self, step_id: &str, key: &str, hash: &str) -> bool {
        match self.store.stat(key).await {
            Ok(info) => info
                .metadata
                .get(CONTENT_HASH_METADATA_KEY)
                .is_some_and(|stored| stored == hash),
            Err(EngineError::NotFound { .. }) => {
                debug!(step_id, key, "Cache miss");
                false
            }
            Err(e) => {
                warn!(step_id, key, error = %e, "Failed to stat cache object, uploading");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::TarArchiver;
    use crate::config::CacheConfig;
    use crate::errors::{RemoteCode, RemoteStatus};
    use crate::remote::{MockObjectStore, ObjectStore};
    use crate::retry::{JitterStrategy, RetryConfig};
    use crate::testing::{InMemoryObjectStore, StaticEvaluator, StoreOp};
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        work: TempDir,
        tmp: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let work = tempfile::tempdir().unwrap();
            fs::create_dir_all(work.path().join("deps")).unwrap();
            fs::write(work.path().join("deps/lib.txt"), "library").unwrap();
            fs::write(work.path().join("deps.lock"), "v1").unwrap();
            Self {
                work,
                tmp: tempfile::tempdir().unwrap(),
            }
        }

        fn service(&self, store: Arc<dyn ObjectStore>, evaluator: StaticEvaluator) -> CacheService {
            let retry = RetryConfig::new()
                .with_max_attempts(3)
                .with_base_delay_ms(1)
                .with_jitter(JitterStrategy::None);
            CacheService::new(
                store,
                Arc::new(TarArchiver::new(self.work.path())),
                Arc::new(evaluator),
                CacheConfig::default().with_retry(retry),
                self.work.path(),
                self.tmp.path(),
            )
        }
    }

    fn step() -> SaveCacheStep {
        SaveCacheStep {
            key: r#"deps-{{ checksum "deps.lock" }}"#.to_string(),
            paths: vec!["deps".to_string()],
        }
    }

    #[tokio::test]
    async fn test_save_uploads_with_content_hash() {
        let fixture = Fixture::new();
        let store = Arc::new(InMemoryObjectStore::new());
        let service = fixture.service(store.clone(), StaticEvaluator::new());

        let key = service.save("save1", &step(), &StageOutput::new()).await.unwrap();

        assert!(key.starts_with("deps-"));
        assert_eq!(store.count(StoreOp::Upload), 1);
        let hash = content_hash_blocking(fixture.tmp.path().join("save1")).await.unwrap();
        assert_eq!(
            store.metadata(&key).unwrap().get(CONTENT_HASH_METADATA_KEY),
            Some(&hash)
        );
    }

    #[tokio::test]
    async fn test_second_save_skips_upload() {
        let fixture = Fixture::new();
        let store = Arc::new(InMemoryObjectStore::new());
        let service = fixture.service(store.clone(), StaticEvaluator::new());

        service.save("save1", &step(), &StageOutput::new()).await.unwrap();
        service.save("save2", &step(), &StageOutput::new()).await.unwrap();

        assert_eq!(store.count(StoreOp::Upload), 1);
        assert_eq!(store.count(StoreOp::Stat), 2);
    }

    #[tokio::test]
    async fn test_transient_upload_failures_are_retried() {
        let fixture = Fixture::new();
        let store = Arc::new(InMemoryObjectStore::new());
        store.fail_next(StoreOp::Upload, RemoteStatus::unavailable("busy"));
        store.fail_next(StoreOp::Upload, RemoteStatus::unavailable("busy"));
        let service = fixture.service(store.clone(), StaticEvaluator::new());

        let key = service.save("save1", &step(), &StageOutput::new()).await.unwrap();

        assert_eq!(store.count(StoreOp::Upload), 3);
        assert!(store.contains(&key));
    }

    #[tokio::test]
    async fn test_exhausted_retries_name_the_key() {
        let fixture = Fixture::new();
        let store = Arc::new(InMemoryObjectStore::new());
        for _ in 0..3 {
            store.fail_next(StoreOp::Upload, RemoteStatus::internal("disk full"));
        }
        let service = fixture.service(store.clone(), StaticEvaluator::new());

        let err = service.save("save1", &step(), &StageOutput::new()).await.unwrap_err();

        assert!(matches!(err, EngineError::Cache { operation: "save cache", .. }));
        assert!(err.to_string().contains("deps-"));
        assert_eq!(err.status_message(), "disk full");
        assert_eq!(store.count(StoreOp::Upload), 3);
    }

    #[tokio::test]
    async fn test_permanent_upload_failure_stops() {
        let fixture = Fixture::new();
        let store = Arc::new(InMemoryObjectStore::new());
        store.fail_next(
            StoreOp::Upload,
            RemoteStatus::new(RemoteCode::PermissionDenied, "no write access"),
        );
        let service = fixture.service(store.clone(), StaticEvaluator::new());

        let err = service.save("save1", &step(), &StageOutput::new()).await.unwrap_err();

        assert!(err.is_permanent());
        assert_eq!(store.count(StoreOp::Upload), 1);
    }

    #[tokio::test]
    async fn test_stat_error_falls_back_to_upload() {
        let fixture = Fixture::new();
        let mut store = MockObjectStore::new();
        store
            .expect_stat()
            .times(1)
            .returning(|_| Err(RemoteStatus::unavailable("timeout").into()));
        store.expect_upload().times(1).returning(|_, path, options| {
            assert!(path.exists());
            assert!(options.metadata.contains_key(CONTENT_HASH_METADATA_KEY));
            assert!(options.standard_redundancy);
            Ok(())
        });
        let service = fixture.service(Arc::new(store), StaticEvaluator::new());

        service.save("save1", &step(), &StageOutput::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_paths_and_key_resolve_expressions() {
        let fixture = Fixture::new();
        let store = Arc::new(InMemoryObjectStore::new());
        let evaluator = StaticEvaluator::new()
            .with_value("${steps.build.output.dir}", "deps")
            .with_value("${steps.build.output.tag}", "main");
        let service = fixture.service(store.clone(), evaluator);

        let step = SaveCacheStep {
            key: "cache-${steps.build.output.tag}".to_string(),
            paths: vec!["${steps.build.output.dir}".to_string()],
        };
        let key = service.save("save1", &step, &StageOutput::new()).await.unwrap();

        assert_eq!(key, "cache-main");
        assert!(store.contains("cache-main"));
    }

    #[tokio::test]
    async fn test_template_error_fails_before_archiving() {
        let fixture = Fixture::new();
        let store = Arc::new(InMemoryObjectStore::new());
        let service = fixture.service(store.clone(), StaticEvaluator::new());

        let step = SaveCacheStep {
            key: "{{ branch }}".to_string(),
            paths: vec!["deps".to_string()],
        };
        let err = service.save("save1", &step, &StageOutput::new()).await.unwrap_err();

        assert!(matches!(err, EngineError::Template(_)));
        assert_eq!(store.count(StoreOp::Stat), 0);
        assert!(!fixture.tmp.path().join("save1").exists());
    }
}
