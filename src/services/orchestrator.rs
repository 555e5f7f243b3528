//! The provisioning run: a fixed sequence of backend calls.
//!
//! Each backend step is isolated. Its error is logged and recorded in the
//! `RunReport` and the run moves on; nothing is retried. Steps that need a
//! bucket which was never created are recorded as skipped. Local scratch
//! files are removed on every exit path, and a local IO failure while
//! creating them ends the run.

use super::report::{RunReport, steps};
use crate::{
    backend::{
        StorageBackend,
        resource::{ObjectResource, ServiceResource},
    },
    errors::{ProvisionError, StepError, StorageError, StorageResult},
    models::{
        Acl, Bucket, CannedAcl, ObjectIdentifier, ObjectSummary, PutOptions,
        ServerSideEncryption, StorageClass, VersioningStatus,
    },
    naming,
    temp_file::{TempFile, TempFileFactory},
};
use futures::TryStreamExt;
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tokio::fs;
use tracing::{debug, info, warn};

/// Largest batch handed to a single bulk delete.
pub const MAX_BULK_DELETE: usize = 1000;

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// Region every bucket is created in.
    pub region: String,
    pub first_prefix: String,
    pub second_prefix: String,
    /// Where scratch files are written.
    pub work_dir: PathBuf,
    /// Where downloaded copies land.
    pub download_dir: PathBuf,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            region: "eu-west-1".into(),
            first_prefix: "first".into(),
            second_prefix: "second".into(),
            work_dir: PathBuf::from("."),
            download_dir: std::env::temp_dir(),
        }
    }
}

/// Runs the provisioning sequence against an injected backend.
pub struct Orchestrator<B: StorageBackend> {
    backend: B,
    config: OrchestratorConfig,
    temp_files: TempFileFactory,
}

/// Local files created during a run.
#[derive(Default)]
struct Scratch {
    files: Vec<TempFile>,
    downloads: Vec<PathBuf>,
}

impl Scratch {
    fn track(&mut self, file: TempFile) -> TempFile {
        self.files.push(file.clone());
        file
    }

    /// Try every removal, then report the first failure.
    async fn remove_all(&mut self) -> Result<usize, ProvisionError> {
        let mut removed = 0;
        let mut first_err = None;

        for file in self.files.drain(..) {
            match file.remove().await {
                Ok(()) => removed += 1,
                Err(err) => {
                    warn!("could not remove {}: {}", file.path().display(), err);
                    first_err.get_or_insert(ProvisionError::local_io(
                        "removing temp file",
                        file.path(),
                        err,
                    ));
                }
            }
        }

        for path in self.downloads.drain(..) {
            match fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    debug!("download {} was never written", path.display());
                }
                Err(err) => {
                    warn!("could not remove {}: {}", path.display(), err);
                    first_err.get_or_insert(ProvisionError::local_io(
                        "removing downloaded file",
                        path,
                        err,
                    ));
                }
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(removed),
        }
    }
}

impl<B: StorageBackend> Orchestrator<B> {
    pub fn new(backend: B, config: OrchestratorConfig) -> Self {
        let temp_files = TempFileFactory::new(config.work_dir.clone());
        Self {
            backend,
            config,
            temp_files,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Execute the whole sequence once.
    ///
    /// Backend failures end up in the report. Only local IO failures on
    /// scratch files are returned as errors, after whatever scratch files
    /// exist have been removed.
    pub async fn run(&self) -> Result<RunReport, ProvisionError> {
        let mut report = RunReport::default();
        let mut scratch = Scratch::default();

        let outcome = self.run_steps(&mut report, &mut scratch).await;
        let cleanup = scratch.remove_all().await;
        outcome?;

        report.capture(steps::REMOVE_LOCAL_FILES, Ok::<_, ProvisionError>(cleanup?), |n| {
            format!("removed {} local files", n)
        });
        info!(
            "run finished: {} steps, {} not successful",
            report.steps.len(),
            report.failures().count()
        );
        Ok(report)
    }

    async fn run_steps(
        &self,
        report: &mut RunReport,
        scratch: &mut Scratch,
    ) -> Result<(), ProvisionError> {
        let service = ServiceResource::new(&self.backend);
        let region = self.config.region.as_str();

        // The first bucket goes through the backend directly, the second
        // through a bucket handle.
        let first_name = naming::generate_bucket_name(&self.config.first_prefix);
        let first = report
            .capture(
                steps::CREATE_FIRST_BUCKET,
                self.backend.create_bucket(&first_name, region).await,
                describe_bucket,
            )
            .map(|bucket| bucket.name);

        let second_name = naming::generate_bucket_name(&self.config.second_prefix);
        let second = report
            .capture(
                steps::CREATE_SECOND_BUCKET,
                service.bucket(second_name).create(region).await,
                describe_bucket,
            )
            .map(|bucket| bucket.name);

        report.first_bucket = first.clone();
        report.second_bucket = second.clone();
        let (first, second) = (first.as_deref(), second.as_deref());

        let first_file = self
            .create_scratch(scratch, 300, "firstfile.txt", "f")
            .await?;

        if let Some(bucket) = report.require(&[steps::UPLOAD_FIRST_FILE], first) {
            let uploaded = self
                .backend
                .put_object(
                    bucket,
                    first_file.name(),
                    first_file.path(),
                    PutOptions::default(),
                )
                .await;
            report.capture(steps::UPLOAD_FIRST_FILE, uploaded, describe_object);
        }

        if let Some(bucket) = report.require(&[steps::DOWNLOAD_FIRST_FILE], first) {
            let destination = self.config.download_dir.join(first_file.name());
            scratch.downloads.push(destination.clone());
            let downloaded = self
                .download_and_verify(bucket, &first_file, &destination)
                .await;
            report.capture(steps::DOWNLOAD_FIRST_FILE, downloaded, |bytes| {
                format!("{} identical bytes in {}", bytes, destination.display())
            });
        }

        if let Some((from, to)) = report.require_both(&[steps::COPY_FIRST_FILE], first, second) {
            let copied = service
                .bucket(to)
                .object(first_file.name())
                .copy_from(from, first_file.name())
                .await;
            report.capture(steps::COPY_FIRST_FILE, copied, describe_object);
        }

        if let Some(bucket) = report.require(&[steps::DELETE_COPIED_FILE], second) {
            let deleted = self.backend.delete_object(bucket, first_file.name()).await;
            report.capture(steps::DELETE_COPIED_FILE, deleted, |_| {
                format!("deleted {}/{}", bucket, first_file.name())
            });
        }

        let second_file = self
            .create_scratch(scratch, 400, "secondfile.txt", "s")
            .await?;

        let acl_steps = [
            steps::UPLOAD_PUBLIC_FILE,
            steps::READ_PUBLIC_ACL,
            steps::MAKE_FILE_PRIVATE,
            steps::READ_PRIVATE_ACL,
        ];
        if let Some(bucket) = report.require(&acl_steps, first) {
            let object = service.bucket(bucket).object(second_file.name());
            let uploaded = object
                .upload_file(
                    second_file.path(),
                    PutOptions::default().acl(CannedAcl::PublicRead),
                )
                .await;
            report.capture(steps::UPLOAD_PUBLIC_FILE, uploaded, describe_object);
            report.capture(steps::READ_PUBLIC_ACL, object.acl().await, describe_acl);
            report.capture(
                steps::MAKE_FILE_PRIVATE,
                object.put_acl(CannedAcl::Private).await,
                |_| format!("{} is now private", object.key()),
            );
            report.capture(steps::READ_PRIVATE_ACL, object.acl().await, describe_acl);
        }

        let third_file = self
            .create_scratch(scratch, 300, "thirdfile.txt", "t")
            .await?;

        let encryption_steps = [
            steps::UPLOAD_ENCRYPTED_FILE,
            steps::UPLOAD_INFREQUENT_ACCESS_FILE,
        ];
        if let Some(bucket) = report.require(&encryption_steps, first) {
            let object = service.bucket(bucket).object(third_file.name());
            let encrypted = upload_and_load(
                &object,
                third_file.path(),
                PutOptions::default().server_side_encryption(ServerSideEncryption::Aes256),
            )
            .await;
            report.capture(steps::UPLOAD_ENCRYPTED_FILE, encrypted, |summary| {
                format!(
                    "server-side encryption {}",
                    summary
                        .server_side_encryption
                        .map_or("none", |sse| sse.as_str())
                )
            });

            let infrequent = upload_and_load(
                &object,
                third_file.path(),
                PutOptions::default()
                    .server_side_encryption(ServerSideEncryption::Aes256)
                    .storage_class(StorageClass::StandardIa),
            )
            .await;
            report.capture(
                steps::UPLOAD_INFREQUENT_ACCESS_FILE,
                infrequent,
                |summary| format!("storage class {}", summary.storage_class),
            );
        }

        let versioning_steps = [
            steps::ENABLE_VERSIONING,
            steps::REUPLOAD_SECOND_FILE,
            steps::READ_FIRST_FILE_VERSION,
        ];
        if let Some(bucket) = report.require(&versioning_steps, first) {
            let handle = service.bucket(bucket);
            report.capture(
                steps::ENABLE_VERSIONING,
                handle.enable_versioning().await,
                describe_versioning,
            );
            let reuploaded = handle
                .object(second_file.name())
                .upload_file(second_file.path(), PutOptions::default())
                .await;
            report.capture(steps::REUPLOAD_SECOND_FILE, reuploaded, describe_object);
            report.capture(
                steps::READ_FIRST_FILE_VERSION,
                handle.object(first_file.name()).load().await,
                |summary| format!("{} has version id {}", summary.key, summary.version_id),
            );
        }

        let handles = service.buckets().await.map(|buckets| {
            buckets
                .iter()
                .map(|bucket| bucket.name().to_string())
                .collect::<Vec<_>>()
        });
        report.capture(steps::LIST_BUCKETS_HANDLE, handles, |names| names.join(", "));
        report.capture(
            steps::LIST_BUCKETS_DIRECT,
            self.backend.list_buckets().await,
            |buckets| {
                buckets
                    .iter()
                    .map(describe_bucket)
                    .collect::<Vec<_>>()
                    .join(", ")
            },
        );

        let listing_steps = [steps::LIST_OBJECT_KEYS, steps::LIST_OBJECT_DETAILS];
        if let Some(bucket) = report.require(&listing_steps, first) {
            let handle = service.bucket(bucket);
            let keys: StorageResult<Vec<String>> =
                handle.objects().map_ok(|object| object.key).try_collect().await;
            report.capture(steps::LIST_OBJECT_KEYS, keys, |keys| keys.join(", "));

            let details: StorageResult<Vec<ObjectSummary>> = handle.objects().try_collect().await;
            report.capture(steps::LIST_OBJECT_DETAILS, details, |objects| {
                objects
                    .iter()
                    .map(describe_listing)
                    .collect::<Vec<_>>()
                    .join("; ")
            });
        }

        // Buckets must be empty, every version included, before deletion.
        for (step, bucket) in [
            (steps::EMPTY_FIRST_BUCKET, first),
            (steps::EMPTY_SECOND_BUCKET, second),
        ] {
            if let Some(bucket) = report.require(&[step], bucket) {
                report.capture(step, empty_bucket(&self.backend, bucket).await, |n| {
                    format!("removed {} versions from {}", n, bucket)
                });
            }
        }

        if let Some(bucket) = report.require(&[steps::DELETE_FIRST_BUCKET], first) {
            report.capture(
                steps::DELETE_FIRST_BUCKET,
                service.bucket(bucket).delete().await,
                |_| format!("deleted {}", bucket),
            );
        }
        if let Some(bucket) = report.require(&[steps::DELETE_SECOND_BUCKET], second) {
            report.capture(
                steps::DELETE_SECOND_BUCKET,
                self.backend.delete_bucket(bucket).await,
                |_| format!("deleted {}", bucket),
            );
        }

        Ok(())
    }

    async fn create_scratch(
        &self,
        scratch: &mut Scratch,
        repeat_count: usize,
        base_name: &str,
        content: &str,
    ) -> Result<TempFile, ProvisionError> {
        let file = self
            .temp_files
            .create_temp_file(repeat_count, base_name, content)
            .await
            .map_err(|err| {
                ProvisionError::local_io(
                    "creating temp file",
                    self.temp_files.dir().join(base_name),
                    err,
                )
            })?;
        info!("Temporary file {} ({} bytes)", file.name(), file.size_bytes());
        Ok(scratch.track(file))
    }

    /// Download `file` back from `bucket` and compare it byte for byte.
    async fn download_and_verify(
        &self,
        bucket: &str,
        file: &TempFile,
        destination: &Path,
    ) -> Result<u64, StepError> {
        self.backend
            .get_object(bucket, file.name(), destination)
            .await?;

        let expected = read_local(file.path()).await?;
        let actual = read_local(destination).await?;
        if expected != actual {
            return Err(StepError::ContentMismatch {
                key: file.name().to_string(),
                expected: expected.len() as u64,
                actual: actual.len() as u64,
            });
        }
        Ok(actual.len() as u64)
    }
}

/// Delete every version and delete marker in `bucket`.
///
/// The full version list is collected before anything is deleted, then
/// removed in batches of at most `MAX_BULK_DELETE`. Returns how many
/// entries were removed.
pub async fn empty_bucket<B: StorageBackend + ?Sized>(
    backend: &B,
    bucket: &str,
) -> StorageResult<usize> {
    let versions: Vec<ObjectIdentifier> = backend
        .list_object_versions(bucket)
        .map_ok(|version| ObjectIdentifier::from(&version))
        .try_collect()
        .await?;
    debug!("{} versions to delete in {}", versions.len(), bucket);

    let mut removed = 0;
    for batch in versions.chunks(MAX_BULK_DELETE) {
        let result = backend.delete_objects_bulk(bucket, batch).await?;
        if let Some(first) = result.errors.first() {
            return Err(StorageError::PartialDelete {
                bucket: bucket.to_string(),
                requested: batch.len(),
                failed: result.errors.len(),
                first: first.message.clone(),
            });
        }
        removed += result.deleted.len();
    }
    Ok(removed)
}

async fn upload_and_load<B: StorageBackend>(
    object: &ObjectResource<'_, B>,
    source: &Path,
    options: PutOptions,
) -> StorageResult<ObjectSummary> {
    object.upload_file(source, options).await?;
    object.load().await
}

async fn read_local(path: &Path) -> Result<Vec<u8>, StepError> {
    fs::read(path).await.map_err(|source| StepError::LocalRead {
        path: path.to_path_buf(),
        source,
    })
}

fn describe_bucket(bucket: &Bucket) -> String {
    format!("{} ({})", bucket.name, bucket.region)
}

fn describe_object(object: &ObjectSummary) -> String {
    format!(
        "{}/{} ({} bytes, etag {})",
        object.bucket,
        object.key,
        object.size_bytes,
        object.etag.as_deref().unwrap_or("-")
    )
}

fn describe_listing(object: &ObjectSummary) -> String {
    format!(
        "{} {} {} version {} metadata {:?}",
        object.key,
        object.storage_class,
        object.last_modified.to_rfc3339(),
        object.version_id,
        object.metadata
    )
}

fn describe_acl(acl: &Acl) -> String {
    acl.grants
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn describe_versioning(status: &Option<VersioningStatus>) -> String {
    match status {
        Some(status) => format!("versioning {}", status),
        None => "versioning unset".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{backend::local::LocalBackend, db, services::report::StepOutcome};
    use futures::StreamExt;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Fixture {
        _root: TempDir,
        work_dir: PathBuf,
        download_dir: PathBuf,
        backend: LocalBackend,
    }

    async fn fixture() -> Fixture {
        let root = TempDir::new().unwrap();
        let work_dir = root.path().join("work");
        let download_dir = root.path().join("downloads");
        std::fs::create_dir_all(&work_dir).unwrap();
        let db = db::open_in_memory().await.unwrap();
        let backend = LocalBackend::new(Arc::new(db), root.path().join("objects"));
        Fixture {
            _root: root,
            work_dir,
            download_dir,
            backend,
        }
    }

    fn config(fx: &Fixture) -> OrchestratorConfig {
        OrchestratorConfig {
            work_dir: fx.work_dir.clone(),
            download_dir: fx.download_dir.clone(),
            ..OrchestratorConfig::default()
        }
    }

    fn dir_is_empty(path: &Path) -> bool {
        std::fs::read_dir(path)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(true)
    }

    #[tokio::test]
    async fn full_run_succeeds_and_cleans_up() {
        let fx = fixture().await;
        let cfg = config(&fx);
        let orchestrator = Orchestrator::new(fx.backend.clone(), cfg);
        let report = orchestrator.run().await.unwrap();

        let failed: Vec<_> = report.failures().collect();
        assert!(failed.is_empty(), "unexpected failures: {failed:?}");
        assert_eq!(report.steps.len(), 24);
        assert!(report.first_bucket.as_deref().unwrap().starts_with("first-"));
        assert!(report.second_bucket.as_deref().unwrap().starts_with("second-"));

        match report.step(steps::READ_PUBLIC_ACL) {
            Some(StepOutcome::Succeeded { detail }) => assert!(detail.contains("AllUsers")),
            other => panic!("unexpected outcome {other:?}"),
        }
        match report.step(steps::READ_PRIVATE_ACL) {
            Some(StepOutcome::Succeeded { detail }) => assert!(!detail.contains("AllUsers")),
            other => panic!("unexpected outcome {other:?}"),
        }
        match report.step(steps::UPLOAD_INFREQUENT_ACCESS_FILE) {
            Some(StepOutcome::Succeeded { detail }) => assert!(detail.ends_with("STANDARD_IA")),
            other => panic!("unexpected outcome {other:?}"),
        }
        match report.step(steps::ENABLE_VERSIONING) {
            Some(StepOutcome::Succeeded { detail }) => assert_eq!(detail, "versioning Enabled"),
            other => panic!("unexpected outcome {other:?}"),
        }

        assert!(fx.backend.list_buckets().await.unwrap().is_empty());
        assert!(dir_is_empty(&fx.work_dir));
        assert!(dir_is_empty(&fx.download_dir));
    }

    #[tokio::test]
    async fn failed_second_bucket_skips_dependent_steps() {
        let fx = fixture().await;
        let cfg = OrchestratorConfig {
            second_prefix: "Not_Valid".into(),
            ..config(&fx)
        };
        let report = Orchestrator::new(fx.backend.clone(), cfg).run().await.unwrap();

        assert!(matches!(
            report.step(steps::CREATE_SECOND_BUCKET),
            Some(StepOutcome::Failed { .. })
        ));
        for step in [
            steps::COPY_FIRST_FILE,
            steps::DELETE_COPIED_FILE,
            steps::EMPTY_SECOND_BUCKET,
            steps::DELETE_SECOND_BUCKET,
        ] {
            assert!(
                matches!(report.step(step), Some(StepOutcome::Skipped { .. })),
                "{step} should be skipped"
            );
        }
        assert!(matches!(
            report.step(steps::DELETE_FIRST_BUCKET),
            Some(StepOutcome::Succeeded { .. })
        ));
        assert_eq!(report.failures().count(), 5);
        assert!(fx.backend.list_buckets().await.unwrap().is_empty());
        assert!(dir_is_empty(&fx.work_dir));
    }

    #[tokio::test]
    async fn unsupported_region_still_removes_local_files() {
        let fx = fixture().await;
        let cfg = OrchestratorConfig {
            region: "nowhere-1".into(),
            ..config(&fx)
        };
        let report = Orchestrator::new(fx.backend.clone(), cfg).run().await.unwrap();

        assert_eq!(report.first_bucket, None);
        assert_eq!(report.second_bucket, None);
        assert!(matches!(
            report.step(steps::LIST_BUCKETS_DIRECT),
            Some(StepOutcome::Succeeded { .. })
        ));
        assert!(matches!(
            report.step(steps::REMOVE_LOCAL_FILES),
            Some(StepOutcome::Succeeded { .. })
        ));
        assert!(dir_is_empty(&fx.work_dir));
    }

    #[tokio::test]
    async fn missing_work_dir_is_fatal() {
        let fx = fixture().await;
        let cfg = OrchestratorConfig {
            work_dir: fx.work_dir.join("missing"),
            ..config(&fx)
        };
        let err = Orchestrator::new(fx.backend.clone(), cfg)
            .run()
            .await
            .unwrap_err();
        let ProvisionError::LocalIo { context, source, .. } = err;
        assert_eq!(context, "creating temp file");
        assert_eq!(source.kind(), ErrorKind::NotFound);
    }

    /// Nest directories under `root` until the path is exactly `len` bytes.
    fn dir_of_length(root: &Path, len: usize) -> PathBuf {
        let mut dir = root.to_path_buf();
        loop {
            let remaining = len - dir.as_os_str().len();
            if remaining <= 250 {
                dir.push("d".repeat(remaining - 1));
                return dir;
            }
            dir.push("d".repeat(200));
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn fatal_error_after_first_file_still_removes_it() {
        // PATH_MAX is 4096 including the terminator: the first scratch path
        // fits exactly, the second is one byte longer and is rejected.
        const PATH_MAX: usize = 4096;
        let fx = fixture().await;
        let first_name_len = naming::temp_file_name("firstfile.txt").len();
        let work_dir = dir_of_length(&fx.work_dir, PATH_MAX - 2 - first_name_len);
        std::fs::create_dir_all(&work_dir).unwrap();

        let cfg = OrchestratorConfig {
            work_dir: work_dir.clone(),
            ..config(&fx)
        };
        let orchestrator = Orchestrator::new(fx.backend.clone(), cfg);
        let err = orchestrator.run().await.unwrap_err();

        let ProvisionError::LocalIo { context, path, .. } = err;
        assert_eq!(context, "creating temp file");
        assert!(path.ends_with("secondfile.txt"));

        // The first file was created and uploaded before the failure.
        let buckets = fx.backend.list_buckets().await.unwrap();
        assert_eq!(buckets.len(), 2);
        let first = buckets
            .iter()
            .find(|b| b.name.starts_with("first-"))
            .unwrap();
        let keys: Vec<String> = fx
            .backend
            .list_objects(&first.name)
            .map(|o| o.unwrap().key)
            .collect()
            .await;
        assert_eq!(keys.len(), 1);
        assert!(keys[0].ends_with("_firstfile.txt"));

        assert!(dir_is_empty(&work_dir));
        assert!(dir_is_empty(&fx.download_dir));
    }

    #[tokio::test]
    async fn empty_bucket_removes_every_version() {
        let fx = fixture().await;
        let bucket = "versions-to-empty";
        fx.backend.create_bucket(bucket, "local").await.unwrap();
        fx.backend.set_bucket_versioning(bucket, true).await.unwrap();
        let src = fx.work_dir.join("payload.txt");
        std::fs::write(&src, "payload").unwrap();

        const KEYS: usize = 4;
        const VERSIONS: usize = 3;
        for k in 0..KEYS {
            for _ in 0..VERSIONS {
                fx.backend
                    .put_object(bucket, &format!("key-{k}"), &src, PutOptions::default())
                    .await
                    .unwrap();
            }
        }
        assert_eq!(fx.backend.list_objects(bucket).count().await, KEYS);
        assert!(matches!(
            fx.backend.delete_bucket(bucket).await.unwrap_err(),
            StorageError::BucketNotEmpty(_)
        ));

        let removed = empty_bucket(&fx.backend, bucket).await.unwrap();
        assert_eq!(removed, KEYS * VERSIONS);
        assert_eq!(
            fx.backend.list_object_versions(bucket).count().await,
            0
        );
        fx.backend.delete_bucket(bucket).await.unwrap();
    }
}
