//! The storage capability consumed by the orchestrator.
//!
//! `StorageBackend` is the low-level call form: one method per backend
//! operation, bucket and key passed on every call. [`resource`] layers
//! bucket- and object-scoped handles over any implementation.

pub mod local;
pub mod resource;

use crate::{
    errors::StorageResult,
    models::{
        Acl, Bucket, BulkDeleteResult, CannedAcl, ObjectIdentifier, ObjectSummary, ObjectVersion,
        PutOptions, VersioningStatus,
    },
};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::path::Path;

/// Object store operations. Every call is independently fallible.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn create_bucket(&self, name: &str, region: &str) -> StorageResult<Bucket>;

    async fn head_bucket(&self, name: &str) -> StorageResult<Bucket>;

    async fn list_buckets(&self) -> StorageResult<Vec<Bucket>>;

    /// Fails with `BucketNotEmpty` while any version or delete marker remains.
    async fn delete_bucket(&self, name: &str) -> StorageResult<()>;

    /// `false` suspends versioning; a versioned bucket never becomes unversioned.
    async fn set_bucket_versioning(&self, bucket: &str, enabled: bool) -> StorageResult<()>;

    async fn get_bucket_versioning(&self, bucket: &str)
    -> StorageResult<Option<VersioningStatus>>;

    /// Upload the contents of `source` as `key`.
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        source: &Path,
        options: PutOptions,
    ) -> StorageResult<ObjectSummary>;

    /// Download the current version of `key` into `destination`.
    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        destination: &Path,
    ) -> StorageResult<ObjectSummary>;

    async fn head_object(&self, bucket: &str, key: &str) -> StorageResult<ObjectSummary>;

    async fn copy_object(
        &self,
        source_bucket: &str,
        source_key: &str,
        dest_bucket: &str,
        dest_key: &str,
    ) -> StorageResult<ObjectSummary>;

    /// Delete the current version. On a versioned bucket this leaves a
    /// delete marker and keeps older versions.
    async fn delete_object(&self, bucket: &str, key: &str) -> StorageResult<()>;

    /// Permanently delete each listed version (or the current one when no
    /// version is given). Failures are reported per entry.
    async fn delete_objects_bulk(
        &self,
        bucket: &str,
        objects: &[ObjectIdentifier],
    ) -> StorageResult<BulkDeleteResult>;

    /// Current, non-deleted objects in key order, fetched page by page.
    fn list_objects<'a>(&'a self, bucket: &'a str) -> BoxStream<'a, StorageResult<ObjectSummary>>;

    /// Every version and delete marker, key order then newest first.
    fn list_object_versions<'a>(
        &'a self,
        bucket: &'a str,
    ) -> BoxStream<'a, StorageResult<ObjectVersion>>;

    async fn get_object_acl(&self, bucket: &str, key: &str) -> StorageResult<Acl>;

    async fn set_object_acl(&self, bucket: &str, key: &str, acl: CannedAcl) -> StorageResult<()>;
}
