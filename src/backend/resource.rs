//! Bucket- and object-scoped handles over a `StorageBackend`.
//!
//! A handle remembers its bucket (and key), so callers pass only what
//! changes between calls. Handles hold no state of their own; every method
//! is a single backend call.

use super::StorageBackend;
use crate::{
    errors::StorageResult,
    models::{
        Acl, Bucket, BulkDeleteResult, CannedAcl, ObjectIdentifier, ObjectSummary, ObjectVersion,
        PutOptions, VersioningStatus,
    },
};
use futures::stream::BoxStream;
use std::path::Path;

/// Entry point: the whole store.
pub struct ServiceResource<'a, B: StorageBackend + ?Sized> {
    backend: &'a B,
}

impl<'a, B: StorageBackend + ?Sized> ServiceResource<'a, B> {
    pub fn new(backend: &'a B) -> Self {
        Self { backend }
    }

    pub fn bucket(&self, name: impl Into<String>) -> BucketResource<'a, B> {
        BucketResource {
            backend: self.backend,
            name: name.into(),
        }
    }

    /// Handles for every bucket the backend reports.
    pub async fn buckets(&self) -> StorageResult<Vec<BucketResource<'a, B>>> {
        Ok(self
            .backend
            .list_buckets()
            .await?
            .into_iter()
            .map(|bucket| self.bucket(bucket.name))
            .collect())
    }
}

pub struct BucketResource<'a, B: StorageBackend + ?Sized> {
    backend: &'a B,
    name: String,
}

impl<'a, B: StorageBackend + ?Sized> BucketResource<'a, B> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn create(&self, region: &str) -> StorageResult<Bucket> {
        self.backend.create_bucket(&self.name, region).await
    }

    /// Fetch the current bucket record.
    pub async fn load(&self) -> StorageResult<Bucket> {
        self.backend.head_bucket(&self.name).await
    }

    pub fn object(&self, key: impl Into<String>) -> ObjectResource<'a, B> {
        ObjectResource {
            backend: self.backend,
            bucket: self.name.clone(),
            key: key.into(),
        }
    }

    pub fn objects(&self) -> BoxStream<'_, StorageResult<ObjectSummary>> {
        self.backend.list_objects(&self.name)
    }

    pub fn object_versions(&self) -> BoxStream<'_, StorageResult<ObjectVersion>> {
        self.backend.list_object_versions(&self.name)
    }

    /// Enable versioning and return the status the backend now reports.
    pub async fn enable_versioning(&self) -> StorageResult<Option<VersioningStatus>> {
        self.backend.set_bucket_versioning(&self.name, true).await?;
        self.backend.get_bucket_versioning(&self.name).await
    }

    pub async fn delete_objects(
        &self,
        objects: &[ObjectIdentifier],
    ) -> StorageResult<BulkDeleteResult> {
        self.backend.delete_objects_bulk(&self.name, objects).await
    }

    pub async fn delete(&self) -> StorageResult<()> {
        self.backend.delete_bucket(&self.name).await
    }
}

pub struct ObjectResource<'a, B: StorageBackend + ?Sized> {
    backend: &'a B,
    bucket: String,
    key: String,
}

impl<'a, B: StorageBackend + ?Sized> ObjectResource<'a, B> {
    pub fn bucket_name(&self) -> &str {
        &self.bucket
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn upload_file(
        &self,
        source: &Path,
        options: PutOptions,
    ) -> StorageResult<ObjectSummary> {
        self.backend
            .put_object(&self.bucket, &self.key, source, options)
            .await
    }

    pub async fn download_file(&self, destination: &Path) -> StorageResult<ObjectSummary> {
        self.backend
            .get_object(&self.bucket, &self.key, destination)
            .await
    }

    /// Fetch current metadata (storage class, encryption, version id).
    pub async fn load(&self) -> StorageResult<ObjectSummary> {
        self.backend.head_object(&self.bucket, &self.key).await
    }

    /// Replace this object with a copy of `source_bucket/source_key`.
    pub async fn copy_from(
        &self,
        source_bucket: &str,
        source_key: &str,
    ) -> StorageResult<ObjectSummary> {
        self.backend
            .copy_object(source_bucket, source_key, &self.bucket, &self.key)
            .await
    }

    pub async fn acl(&self) -> StorageResult<Acl> {
        self.backend.get_object_acl(&self.bucket, &self.key).await
    }

    pub async fn put_acl(&self, acl: CannedAcl) -> StorageResult<()> {
        self.backend
            .set_object_acl(&self.bucket, &self.key, acl)
            .await
    }

    pub async fn delete(&self) -> StorageResult<()> {
        self.backend.delete_object(&self.bucket, &self.key).await
    }
}
