//! src/backend/local.rs
//!
//! LocalBackend: a `StorageBackend` backed by SQLite for metadata and local
//! disk for object payloads. Payloads live beneath
//! `base_path/{bucket}/{shard}/{shard}/{object-id}`, one file per stored
//! version, so older versions survive overwrites while versioning is on.

use crate::{
    backend::StorageBackend,
    errors::{StorageError, StorageResult},
    models::{
        Acl, Bucket, BulkDeleteError, BulkDeleteResult, CannedAcl, NULL_VERSION_ID,
        ObjectIdentifier, ObjectSummary, ObjectVersion, PutOptions, VersioningStatus,
    },
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{
    Stream, StreamExt, TryStreamExt, pin_mut,
    stream::{self, BoxStream},
};
use md5::Context;
use sqlx::{FromRow, QueryBuilder, SqlitePool, sqlite::Sqlite};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

const MAX_OBJECT_KEY_LEN: usize = 1024;
const BUCKET_NAME_MIN_LEN: usize = 3;
const BUCKET_NAME_MAX_LEN: usize = 63;
const DEFAULT_PAGE_SIZE: i64 = 1000;
const SUPPORTED_REGIONS: [&str; 16] = [
    "local",
    "us-east-1",
    "us-east-2",
    "us-west-1",
    "us-west-2",
    "eu-west-1",
    "ap-southeast-1",
    "ap-northeast-1",
    "ap-south-1",
    "ap-south-2",
    "ap-southeast-2",
    "ap-southeast-3",
    "ap-southeast-4",
    "ap-northeast-2",
    "ap-northeast-3",
    "me-south-1",
];

const BUCKET_COLUMNS: &str = "id, name, owner_id, region, created_at, versioning_status";
const OBJECT_COLUMNS: &str = "seq, id, key, version_id, content_type, size_bytes, \
     etag, storage_class, server_side_encryption, acl, metadata, last_modified, is_latest, \
     is_delete_marker";

/// LocalBackend keeps one `objects` row per stored version. The row with
/// `is_latest = 1` is the current version of its key; if that row is a
/// delete marker the key reads as missing.
#[derive(Clone)]
pub struct LocalBackend {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where object payloads are stored.
    pub base_path: PathBuf,

    page_size: i64,
}

#[derive(FromRow)]
struct BucketRow {
    id: Uuid,
    name: String,
    owner_id: Uuid,
    region: String,
    created_at: DateTime<Utc>,
    versioning_status: Option<String>,
}

impl TryFrom<BucketRow> for Bucket {
    type Error = StorageError;

    fn try_from(row: BucketRow) -> StorageResult<Self> {
        Ok(Bucket {
            versioning: row
                .versioning_status
                .as_deref()
                .map(|v| parse_column::<VersioningStatus>("versioning_status", v))
                .transpose()?,
            id: row.id,
            name: row.name,
            owner_id: row.owner_id,
            region: row.region,
            created_at: row.created_at,
        })
    }
}

#[derive(FromRow, Clone, Debug)]
struct ObjectRow {
    seq: i64,
    id: Uuid,
    key: String,
    version_id: String,
    content_type: Option<String>,
    size_bytes: i64,
    etag: Option<String>,
    storage_class: String,
    server_side_encryption: Option<String>,
    acl: String,
    metadata: String,
    last_modified: DateTime<Utc>,
    is_latest: bool,
    is_delete_marker: bool,
}

impl ObjectRow {
    fn into_summary(self, bucket: &str) -> StorageResult<ObjectSummary> {
        Ok(ObjectSummary {
            storage_class: parse_column("storage_class", &self.storage_class)?,
            server_side_encryption: self
                .server_side_encryption
                .as_deref()
                .map(|v| parse_column("server_side_encryption", v))
                .transpose()?,
            metadata: serde_json::from_str(&self.metadata)?,
            bucket: bucket.to_string(),
            key: self.key,
            version_id: self.version_id,
            size_bytes: self.size_bytes,
            etag: self.etag,
            content_type: self.content_type,
            last_modified: self.last_modified,
        })
    }

    fn to_version(&self) -> ObjectVersion {
        ObjectVersion {
            key: self.key.clone(),
            version_id: self.version_id.clone(),
            is_latest: self.is_latest,
            is_delete_marker: self.is_delete_marker,
            last_modified: self.last_modified,
        }
    }

    fn canned_acl(&self) -> StorageResult<CannedAcl> {
        parse_column("acl", &self.acl)
    }
}

/// A version about to be inserted; either a payload or a delete marker.
struct NewVersion<'a> {
    key: &'a str,
    row_id: Uuid,
    version_id: String,
    size_bytes: i64,
    etag: Option<String>,
    options: &'a PutOptions,
    delete_marker: bool,
}

/// Paging position for the lazy listings.
enum Cursor<T> {
    Start,
    After(T),
    Done,
}

impl LocalBackend {
    /// Create a new LocalBackend backed by the provided SQLite pool and
    /// using `base_path` as the root directory for object payloads.
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            db,
            base_path: base_path.into(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Number of rows fetched per page by the lazy listings.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.clamp(1, DEFAULT_PAGE_SIZE as usize) as i64;
        self
    }

    /// Basic key validation to avoid trivial path traversal vectors.
    fn ensure_key_safe(&self, key: &str) -> StorageResult<()> {
        if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
            return Err(StorageError::InvalidObjectKey);
        }
        if key.starts_with('/') || key.contains("..") {
            return Err(StorageError::InvalidObjectKey);
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(StorageError::InvalidObjectKey);
        }
        Ok(())
    }

    /// Validate bucket name format.
    ///
    /// Enforces S3-like naming rules:
    /// - 3–63 characters
    /// - lowercase letters, digits, dots, hyphens only
    /// - cannot start/end with dot or hyphen
    /// - cannot contain consecutive dots or dot-hyphen patterns
    /// - cannot look like an IPv4 address
    fn ensure_bucket_name_safe(&self, name: &str) -> StorageResult<()> {
        let invalid = |reason: &str| StorageError::InvalidBucketName {
            name: name.to_string(),
            reason: reason.to_string(),
        };

        if name.trim() != name {
            return Err(invalid("cannot begin or end with whitespace"));
        }

        let len = name.len();
        if !(BUCKET_NAME_MIN_LEN..=BUCKET_NAME_MAX_LEN).contains(&len) {
            return Err(invalid("must be between 3 and 63 characters"));
        }

        if !name
            .chars()
            .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
        {
            return Err(invalid(
                "allowed characters are lowercase letters, digits, dots, and hyphens",
            ));
        }

        if name.starts_with(['.', '-']) || name.ends_with(['.', '-']) {
            return Err(invalid("must start and end with a lowercase letter or digit"));
        }

        if name.contains("..") || name.contains("-.") || name.contains(".-") {
            return Err(invalid(
                "cannot contain consecutive dots or dot-hyphen combinations",
            ));
        }

        if is_ipv4_like(name) {
            return Err(invalid("must not be formatted like an IP address"));
        }

        Ok(())
    }

    /// Case-insensitive check against SUPPORTED_REGIONS.
    fn ensure_region_valid(&self, region: &str) -> StorageResult<()> {
        if SUPPORTED_REGIONS
            .iter()
            .any(|candidate| candidate.eq_ignore_ascii_case(region))
        {
            Ok(())
        } else {
            Err(StorageError::UnsupportedRegion(region.to_string()))
        }
    }

    fn bucket_root(&self, bucket_name: &str) -> PathBuf {
        self.base_path.join(bucket_name)
    }

    /// Two-level shard directories from MD5(bucket/key), first two bytes as hex.
    fn object_shards(bucket_name: &str, key: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", bucket_name, key));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    /// base_path/bucket/{shard}/{shard}/{object-id}. Parents may not exist yet.
    fn payload_path(&self, bucket_name: &str, key: &str, row_id: Uuid) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(bucket_name, key);
        let mut path = self.bucket_root(bucket_name);
        path.push(shard_a);
        path.push(shard_b);
        path.push(row_id.simple().to_string());
        path
    }

    async fn fetch_bucket(&self, bucket: &str) -> StorageResult<Bucket> {
        self.ensure_bucket_name_safe(bucket)?;
        let row = sqlx::query_as::<_, BucketRow>(&format!(
            "SELECT {} FROM buckets WHERE name = ?",
            BUCKET_COLUMNS
        ))
        .bind(bucket)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StorageError::BucketNotFound(bucket.to_string()),
            other => StorageError::Sqlx(other),
        })?;
        Bucket::try_from(row)
    }

    /// Current version of `key`. A delete marker counts as missing.
    async fn fetch_latest(&self, bucket: &Bucket, key: &str) -> StorageResult<ObjectRow> {
        let row = sqlx::query_as::<_, ObjectRow>(&format!(
            "SELECT {} FROM objects WHERE bucket_id = ? AND key = ? AND is_latest = 1",
            OBJECT_COLUMNS
        ))
        .bind(bucket.id)
        .bind(key)
        .fetch_optional(&*self.db)
        .await?;

        match row {
            Some(row) if !row.is_delete_marker => Ok(row),
            _ => Err(StorageError::ObjectNotFound {
                bucket: bucket.name.clone(),
                key: key.to_string(),
            }),
        }
    }

    async fn open_payload(&self, bucket: &Bucket, row: &ObjectRow) -> StorageResult<File> {
        let path = self.payload_path(&bucket.name, &row.key, row.id);
        File::open(&path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StorageError::ObjectNotFound {
                    bucket: bucket.name.clone(),
                    key: row.key.clone(),
                }
            } else {
                StorageError::Io(err)
            }
        })
    }

    /// Stream bytes into a temporary file, then rename it into place.
    ///
    /// Computes size and MD5 etag while streaming and fsyncs before the
    /// rename. The temporary file is removed on every error path.
    async fn write_payload<S>(
        &self,
        bucket_name: &str,
        key: &str,
        row_id: Uuid,
        stream: S,
    ) -> StorageResult<(PathBuf, i64, String)>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let file_path = self.payload_path(bucket_name, key, row_id);
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StorageError::Io(io::Error::other("object path missing parent directory"))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut size_bytes: i64 = 0;
        let mut digest = Context::new();
        pin_mut!(stream);
        while let Some(chunk_res) = stream.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(StorageError::Io(err));
                }
            };
            size_bytes += chunk.len() as i64;
            digest.consume(&chunk);
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StorageError::Io(err));
            }
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }

        Ok((file_path, size_bytes, format!("{:x}", digest.compute())))
    }

    /// Write a payload and record it as the newest version of `key`.
    async fn store_object<S>(
        &self,
        bucket: &Bucket,
        key: &str,
        stream: S,
        options: PutOptions,
    ) -> StorageResult<ObjectSummary>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let row_id = Uuid::new_v4();
        let (file_path, size_bytes, etag) =
            self.write_payload(&bucket.name, key, row_id, stream).await?;

        let version = NewVersion {
            key,
            row_id,
            version_id: next_version_id(bucket),
            size_bytes,
            etag: Some(etag),
            options: &options,
            delete_marker: false,
        };

        match self.insert_version(bucket, version).await {
            Ok((row, replaced)) => {
                if let Some(old) = replaced {
                    if let Err(err) = self.remove_payload(&bucket.name, &old).await {
                        debug!("failed to remove replaced payload for {}: {}", key, err);
                    }
                }
                debug!(
                    "stored {}/{} version {} ({} bytes)",
                    bucket.name, key, row.version_id, row.size_bytes
                );
                row.into_summary(&bucket.name)
            }
            Err(err) => {
                let _ = fs::remove_file(&file_path).await;
                Err(err)
            }
        }
    }

    /// Insert a version row and demote the previous latest one.
    ///
    /// A `"null"` version replaces any existing `"null"` version of the key;
    /// the replaced row is returned so its payload can be removed.
    async fn insert_version(
        &self,
        bucket: &Bucket,
        version: NewVersion<'_>,
    ) -> StorageResult<(ObjectRow, Option<ObjectRow>)> {
        let mut tx = self.db.begin().await?;

        let replaced = if version.version_id == NULL_VERSION_ID {
            sqlx::query_as::<_, ObjectRow>(&format!(
                "SELECT {} FROM objects WHERE bucket_id = ? AND key = ? AND version_id = ?",
                OBJECT_COLUMNS
            ))
            .bind(bucket.id)
            .bind(version.key)
            .bind(NULL_VERSION_ID)
            .fetch_optional(&mut *tx)
            .await?
        } else {
            None
        };
        if let Some(old) = &replaced {
            sqlx::query("DELETE FROM objects WHERE seq = ?")
                .bind(old.seq)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query("UPDATE objects SET is_latest = 0 WHERE bucket_id = ? AND key = ? AND is_latest = 1")
            .bind(bucket.id)
            .bind(version.key)
            .execute(&mut *tx)
            .await?;

        let options = version.options;
        let row = sqlx::query_as::<_, ObjectRow>(&format!(
            "INSERT INTO objects (
                id, bucket_id, key, version_id, content_type, size_bytes, etag,
                storage_class, server_side_encryption, acl, metadata, last_modified,
                is_latest, is_delete_marker
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?)
            RETURNING {}",
            OBJECT_COLUMNS
        ))
        .bind(version.row_id)
        .bind(bucket.id)
        .bind(version.key)
        .bind(&version.version_id)
        .bind(options.content_type.clone())
        .bind(version.size_bytes)
        .bind(version.etag.clone())
        .bind(options.storage_class.unwrap_or_default().as_str())
        .bind(options.server_side_encryption.map(|sse| sse.as_str()))
        .bind(options.acl.unwrap_or_default().as_str())
        .bind(serde_json::to_string(&options.metadata)?)
        .bind(Utc::now())
        .bind(version.delete_marker)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok((row, replaced))
    }

    /// Remove a version's payload file and prune empty shard directories.
    async fn remove_payload(&self, bucket_name: &str, row: &ObjectRow) -> StorageResult<()> {
        if row.is_delete_marker {
            return Ok(());
        }
        let file_path = self.payload_path(bucket_name, &row.key, row.id);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", file_path.display());
            }
            Err(err) => return Err(StorageError::Io(err)),
        }

        if let Some(parent) = file_path.parent() {
            let bucket_root = self.bucket_root(bucket_name);
            self.prune_empty_dirs(parent, &bucket_root).await;
        }
        Ok(())
    }

    /// Permanently remove one version. If it was the latest, the newest
    /// remaining version of the key takes its place.
    async fn delete_version(
        &self,
        bucket: &Bucket,
        key: &str,
        version_id: &str,
    ) -> StorageResult<()> {
        self.ensure_key_safe(key)?;
        let mut tx = self.db.begin().await?;

        let row = sqlx::query_as::<_, ObjectRow>(&format!(
            "SELECT {} FROM objects WHERE bucket_id = ? AND key = ? AND version_id = ?",
            OBJECT_COLUMNS
        ))
        .bind(bucket.id)
        .bind(key)
        .bind(version_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StorageError::ObjectNotFound {
            bucket: bucket.name.clone(),
            key: format!("{}?versionId={}", key, version_id),
        })?;

        sqlx::query("DELETE FROM objects WHERE seq = ?")
            .bind(row.seq)
            .execute(&mut *tx)
            .await?;

        if row.is_latest {
            sqlx::query(
                "UPDATE objects SET is_latest = 1 WHERE seq =
                    (SELECT MAX(seq) FROM objects WHERE bucket_id = ? AND key = ?)",
            )
            .bind(bucket.id)
            .bind(key)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        self.remove_payload(&bucket.name, &row).await
    }

    /// One page of current objects, plus the cursor for the next page.
    async fn list_objects_page(
        &self,
        bucket: &str,
        cursor: Cursor<String>,
    ) -> StorageResult<Option<(Vec<ObjectSummary>, Cursor<String>)>> {
        let start_after = match cursor {
            Cursor::Start => None,
            Cursor::After(key) => Some(key),
            Cursor::Done => return Ok(None),
        };
        let bucket_rec = self.fetch_bucket(bucket).await?;

        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM objects WHERE bucket_id = ",
            OBJECT_COLUMNS
        ));
        builder.push_bind(bucket_rec.id);
        builder.push(" AND is_latest = 1 AND is_delete_marker = 0");
        if let Some(after) = start_after {
            builder.push(" AND key > ");
            builder.push_bind(after);
        }
        builder.push(" ORDER BY key ASC LIMIT ");
        builder.push_bind(self.page_size + 1);

        let mut rows: Vec<ObjectRow> = builder.build_query_as().fetch_all(&*self.db).await?;
        let next = if rows.len() as i64 > self.page_size {
            rows.truncate(self.page_size as usize);
            rows.last()
                .map_or(Cursor::Done, |row| Cursor::After(row.key.clone()))
        } else {
            Cursor::Done
        };

        let objects = rows
            .into_iter()
            .map(|row| row.into_summary(&bucket_rec.name))
            .collect::<StorageResult<Vec<_>>>()?;
        Ok(Some((objects, next)))
    }

    /// One page of the version history. Versions of a key are ordered newest
    /// first, so the cursor is the last `(key, seq)` pair returned.
    async fn list_versions_page(
        &self,
        bucket: &str,
        cursor: Cursor<(String, i64)>,
    ) -> StorageResult<Option<(Vec<ObjectVersion>, Cursor<(String, i64)>)>> {
        let after = match cursor {
            Cursor::Start => None,
            Cursor::After(position) => Some(position),
            Cursor::Done => return Ok(None),
        };
        let bucket_rec = self.fetch_bucket(bucket).await?;

        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM objects WHERE bucket_id = ",
            OBJECT_COLUMNS
        ));
        builder.push_bind(bucket_rec.id);
        if let Some((key, seq)) = after {
            builder.push(" AND (key > ");
            builder.push_bind(key.clone());
            builder.push(" OR (key = ");
            builder.push_bind(key);
            builder.push(" AND seq < ");
            builder.push_bind(seq);
            builder.push("))");
        }
        builder.push(" ORDER BY key ASC, seq DESC LIMIT ");
        builder.push_bind(self.page_size + 1);

        let mut rows: Vec<ObjectRow> = builder.build_query_as().fetch_all(&*self.db).await?;
        let next = if rows.len() as i64 > self.page_size {
            rows.truncate(self.page_size as usize);
            rows.last()
                .map_or(Cursor::Done, |row| Cursor::After((row.key.clone(), row.seq)))
        } else {
            Cursor::Done
        };

        Ok(Some((rows.iter().map(ObjectRow::to_version).collect(), next)))
    }

    /// Recursively remove empty directories up to bucket root.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    /// Validates name and region, inserts the metadata row and creates the
    /// bucket folder on disk.
    async fn create_bucket(&self, name: &str, region: &str) -> StorageResult<Bucket> {
        self.ensure_bucket_name_safe(name)?;
        let normalized_region = region.to_lowercase();
        self.ensure_region_valid(&normalized_region)?;

        let bucket = Bucket {
            id: Uuid::new_v4(),
            name: name.to_string(),
            owner_id: Uuid::new_v4(),
            region: normalized_region,
            created_at: Utc::now(),
            versioning: None,
        };

        match sqlx::query(
            "INSERT INTO buckets (id, name, owner_id, region, created_at, versioning_status)
             VALUES (?, ?, ?, ?, ?, NULL)",
        )
        .bind(bucket.id)
        .bind(&bucket.name)
        .bind(bucket.owner_id)
        .bind(&bucket.region)
        .bind(bucket.created_at)
        .execute(&*self.db)
        .await
        {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err) => {
                return Err(StorageError::BucketAlreadyExists(name.to_string()));
            }
            Err(err) => return Err(StorageError::Sqlx(err)),
        }

        fs::create_dir_all(self.bucket_root(name)).await?;
        debug!("created bucket {} in {}", bucket.name, bucket.region);
        Ok(bucket)
    }

    async fn head_bucket(&self, name: &str) -> StorageResult<Bucket> {
        self.fetch_bucket(name).await
    }

    async fn list_buckets(&self) -> StorageResult<Vec<Bucket>> {
        let rows = sqlx::query_as::<_, BucketRow>(&format!(
            "SELECT {} FROM buckets ORDER BY name ASC",
            BUCKET_COLUMNS
        ))
        .fetch_all(&*self.db)
        .await?;
        rows.into_iter().map(Bucket::try_from).collect()
    }

    /// Removes the metadata row, then the bucket directory. A missing
    /// directory is not an error.
    async fn delete_bucket(&self, name: &str) -> StorageResult<()> {
        let bucket = self.fetch_bucket(name).await?;
        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM objects WHERE bucket_id = ?")
            .bind(bucket.id)
            .fetch_one(&*self.db)
            .await?;
        if remaining > 0 {
            return Err(StorageError::BucketNotEmpty(name.to_string()));
        }

        let result = sqlx::query("DELETE FROM buckets WHERE id = ?")
            .bind(bucket.id)
            .execute(&*self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::BucketNotFound(name.to_string()));
        }

        let bucket_path = self.bucket_root(name);
        if let Err(err) = fs::remove_dir_all(&bucket_path).await {
            if err.kind() != ErrorKind::NotFound {
                debug!(
                    "failed to remove bucket directory {} after delete: {}",
                    bucket_path.display(),
                    err
                );
            }
        }

        Ok(())
    }

    async fn set_bucket_versioning(&self, bucket: &str, enabled: bool) -> StorageResult<()> {
        let bucket_rec = self.fetch_bucket(bucket).await?;
        let status = if enabled {
            VersioningStatus::Enabled
        } else {
            VersioningStatus::Suspended
        };
        sqlx::query("UPDATE buckets SET versioning_status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(bucket_rec.id)
            .execute(&*self.db)
            .await?;
        debug!("versioning on {} is now {}", bucket, status);
        Ok(())
    }

    async fn get_bucket_versioning(
        &self,
        bucket: &str,
    ) -> StorageResult<Option<VersioningStatus>> {
        Ok(self.fetch_bucket(bucket).await?.versioning)
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        source: &Path,
        options: PutOptions,
    ) -> StorageResult<ObjectSummary> {
        self.ensure_key_safe(key)?;
        let bucket_rec = self.fetch_bucket(bucket).await?;
        let file = File::open(source).await?;
        self.store_object(&bucket_rec, key, ReaderStream::new(file), options)
            .await
    }

    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        destination: &Path,
    ) -> StorageResult<ObjectSummary> {
        self.ensure_key_safe(key)?;
        let bucket_rec = self.fetch_bucket(bucket).await?;
        let row = self.fetch_latest(&bucket_rec, key).await?;
        let mut payload = self.open_payload(&bucket_rec, &row).await?;

        if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let mut out = File::create(destination).await?;
        let copied = tokio::io::copy(&mut payload, &mut out).await?;
        out.flush().await?;
        debug!(
            "downloaded {}/{} ({} bytes) to {}",
            bucket,
            key,
            copied,
            destination.display()
        );

        row.into_summary(&bucket_rec.name)
    }

    async fn head_object(&self, bucket: &str, key: &str) -> StorageResult<ObjectSummary> {
        self.ensure_key_safe(key)?;
        let bucket_rec = self.fetch_bucket(bucket).await?;
        self.fetch_latest(&bucket_rec, key)
            .await?
            .into_summary(&bucket_rec.name)
    }

    /// Copies content, content type and user metadata. ACL, storage class
    /// and encryption fall back to defaults on the copy.
    async fn copy_object(
        &self,
        source_bucket: &str,
        source_key: &str,
        dest_bucket: &str,
        dest_key: &str,
    ) -> StorageResult<ObjectSummary> {
        self.ensure_key_safe(source_key)?;
        self.ensure_key_safe(dest_key)?;
        let src_bucket = self.fetch_bucket(source_bucket).await?;
        let src = self.fetch_latest(&src_bucket, source_key).await?;
        let dst_bucket = self.fetch_bucket(dest_bucket).await?;

        let payload = self.open_payload(&src_bucket, &src).await?;
        let options = PutOptions {
            content_type: src.content_type.clone(),
            metadata: serde_json::from_str(&src.metadata)?,
            ..PutOptions::default()
        };
        self.store_object(&dst_bucket, dest_key, ReaderStream::new(payload), options)
            .await
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> StorageResult<()> {
        self.ensure_key_safe(key)?;
        let bucket_rec = self.fetch_bucket(bucket).await?;
        let current = self.fetch_latest(&bucket_rec, key).await?;

        if bucket_rec.versioning.is_none() {
            sqlx::query("DELETE FROM objects WHERE seq = ?")
                .bind(current.seq)
                .execute(&*self.db)
                .await?;
            return self.remove_payload(&bucket_rec.name, &current).await;
        }

        let options = PutOptions::default();
        let marker = NewVersion {
            key,
            row_id: Uuid::new_v4(),
            version_id: next_version_id(&bucket_rec),
            size_bytes: 0,
            etag: None,
            options: &options,
            delete_marker: true,
        };
        let (row, replaced) = self.insert_version(&bucket_rec, marker).await?;
        if let Some(old) = replaced {
            self.remove_payload(&bucket_rec.name, &old).await?;
        }
        debug!(
            "delete marker {} written for {}/{}",
            row.version_id, bucket, key
        );
        Ok(())
    }

    async fn delete_objects_bulk(
        &self,
        bucket: &str,
        objects: &[ObjectIdentifier],
    ) -> StorageResult<BulkDeleteResult> {
        let bucket_rec = self.fetch_bucket(bucket).await?;
        let mut result = BulkDeleteResult::default();

        for object in objects {
            let outcome = match &object.version_id {
                Some(version_id) => {
                    self.delete_version(&bucket_rec, &object.key, version_id)
                        .await
                }
                None => self.delete_object(bucket, &object.key).await,
            };
            match outcome {
                Ok(()) => result.deleted.push(object.clone()),
                Err(err) => result.errors.push(BulkDeleteError {
                    object: object.clone(),
                    message: err.to_string(),
                }),
            }
        }

        debug!(
            "bulk delete in {}: {} deleted, {} failed",
            bucket,
            result.deleted.len(),
            result.errors.len()
        );
        Ok(result)
    }

    fn list_objects<'a>(&'a self, bucket: &'a str) -> BoxStream<'a, StorageResult<ObjectSummary>> {
        stream::try_unfold(Cursor::Start, move |cursor| {
            self.list_objects_page(bucket, cursor)
        })
        .map_ok(|page| stream::iter(page.into_iter().map(Ok::<_, StorageError>)))
        .try_flatten()
        .boxed()
    }

    fn list_object_versions<'a>(
        &'a self,
        bucket: &'a str,
    ) -> BoxStream<'a, StorageResult<ObjectVersion>> {
        stream::try_unfold(Cursor::Start, move |cursor| {
            self.list_versions_page(bucket, cursor)
        })
        .map_ok(|page| stream::iter(page.into_iter().map(Ok::<_, StorageError>)))
        .try_flatten()
        .boxed()
    }

    async fn get_object_acl(&self, bucket: &str, key: &str) -> StorageResult<Acl> {
        self.ensure_key_safe(key)?;
        let bucket_rec = self.fetch_bucket(bucket).await?;
        let row = self.fetch_latest(&bucket_rec, key).await?;
        Ok(Acl::from_canned(bucket_rec.owner_id, row.canned_acl()?))
    }

    async fn set_object_acl(&self, bucket: &str, key: &str, acl: CannedAcl) -> StorageResult<()> {
        self.ensure_key_safe(key)?;
        let bucket_rec = self.fetch_bucket(bucket).await?;
        let row = self.fetch_latest(&bucket_rec, key).await?;
        sqlx::query("UPDATE objects SET acl = ? WHERE seq = ?")
            .bind(acl.as_str())
            .bind(row.seq)
            .execute(&*self.db)
            .await?;
        Ok(())
    }
}

/// `"null"` unless versioning is enabled, in which case a fresh id.
fn next_version_id(bucket: &Bucket) -> String {
    if bucket.versioning_enabled() {
        Uuid::new_v4().simple().to_string()
    } else {
        NULL_VERSION_ID.to_string()
    }
}

fn parse_column<T>(column: &str, value: &str) -> StorageResult<T>
where
    T: FromStr<Err = String>,
{
    value
        .parse()
        .map_err(|err| StorageError::Corrupt(format!("column `{}`: {}", column, err)))
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}

/// Check if a string matches IPv4-like dotted decimal form.
fn is_ipv4_like(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() != 4 {
        return false;
    }
    parts.iter().all(|segment| {
        !segment.is_empty()
            && segment.len() <= 3
            && segment.chars().all(|c| c.is_ascii_digit())
            && segment.parse::<u8>().is_ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::models::{ServerSideEncryption, StorageClass};
    use tempfile::TempDir;

    async fn backend() -> (LocalBackend, TempDir) {
        let dir = TempDir::new().unwrap();
        let db = db::open_in_memory().await.unwrap();
        (LocalBackend::new(Arc::new(db), dir.path().join("objects")), dir)
    }

    async fn write_file(dir: &TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, body).await.unwrap();
        path
    }

    #[tokio::test]
    async fn create_bucket_rejects_bad_names_and_regions() {
        let (backend, _dir) = backend().await;
        for name in ["ab", "Upper-case", "-lead", "trail.", "a..b", "192.168.0.1", " pad"] {
            let err = backend.create_bucket(name, "local").await.unwrap_err();
            assert!(
                matches!(err, StorageError::InvalidBucketName { .. }),
                "{name}: {err}"
            );
        }
        let err = backend.create_bucket("valid-name", "mars-1").await.unwrap_err();
        assert!(matches!(err, StorageError::UnsupportedRegion(_)));
    }

    #[tokio::test]
    async fn create_bucket_twice_conflicts() {
        let (backend, _dir) = backend().await;
        let bucket = backend.create_bucket("dup-bucket", "EU-WEST-1").await.unwrap();
        assert_eq!(bucket.region, "eu-west-1");
        assert_eq!(bucket.versioning, None);
        let err = backend.create_bucket("dup-bucket", "local").await.unwrap_err();
        assert!(matches!(err, StorageError::BucketAlreadyExists(_)));
    }

    #[tokio::test]
    async fn put_get_round_trip_keeps_bytes_and_attributes() {
        let (backend, dir) = backend().await;
        backend.create_bucket("round-trip", "local").await.unwrap();
        let src = write_file(&dir, "src.txt", &"f".repeat(300)).await;

        let options = PutOptions::default()
            .server_side_encryption(ServerSideEncryption::Aes256)
            .storage_class(StorageClass::StandardIa)
            .content_type("text/plain");
        let put = backend
            .put_object("round-trip", "docs/a.txt", &src, options)
            .await
            .unwrap();
        assert_eq!(put.size_bytes, 300);
        assert_eq!(put.version_id, NULL_VERSION_ID);
        assert_eq!(
            put.etag.as_deref(),
            Some(format!("{:x}", md5::compute("f".repeat(300))).as_str())
        );

        let dest = dir.path().join("out/a.txt");
        let got = backend
            .get_object("round-trip", "docs/a.txt", &dest)
            .await
            .unwrap();
        assert_eq!(fs::read(&dest).await.unwrap(), fs::read(&src).await.unwrap());
        assert_eq!(got.storage_class, StorageClass::StandardIa);
        assert_eq!(got.server_side_encryption, Some(ServerSideEncryption::Aes256));
        assert_eq!(got.content_type.as_deref(), Some("text/plain"));
    }

    #[tokio::test]
    async fn overwrite_without_versioning_keeps_one_version() {
        let (backend, dir) = backend().await;
        backend.create_bucket("overwrite", "local").await.unwrap();
        let first = write_file(&dir, "one.txt", "one").await;
        let second = write_file(&dir, "two.txt", "two-two").await;
        backend
            .put_object("overwrite", "k", &first, PutOptions::default())
            .await
            .unwrap();
        backend
            .put_object("overwrite", "k", &second, PutOptions::default())
            .await
            .unwrap();

        let versions: Vec<ObjectVersion> = backend
            .list_object_versions("overwrite")
            .try_collect()
            .await
            .unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].version_id, NULL_VERSION_ID);
        assert_eq!(
            backend.head_object("overwrite", "k").await.unwrap().size_bytes,
            7
        );
    }

    #[tokio::test]
    async fn versioned_bucket_keeps_history_and_delete_markers() {
        let (backend, dir) = backend().await;
        backend.create_bucket("versioned", "local").await.unwrap();
        backend.set_bucket_versioning("versioned", true).await.unwrap();
        assert_eq!(
            backend.get_bucket_versioning("versioned").await.unwrap(),
            Some(VersioningStatus::Enabled)
        );

        let src = write_file(&dir, "v.txt", "v").await;
        let a = backend
            .put_object("versioned", "k", &src, PutOptions::default())
            .await
            .unwrap();
        let b = backend
            .put_object("versioned", "k", &src, PutOptions::default())
            .await
            .unwrap();
        assert_ne!(a.version_id, b.version_id);
        assert_ne!(a.version_id, NULL_VERSION_ID);

        backend.delete_object("versioned", "k").await.unwrap();
        assert!(matches!(
            backend.head_object("versioned", "k").await.unwrap_err(),
            StorageError::ObjectNotFound { .. }
        ));

        let versions: Vec<ObjectVersion> = backend
            .list_object_versions("versioned")
            .try_collect()
            .await
            .unwrap();
        assert_eq!(versions.len(), 3);
        assert!(versions[0].is_delete_marker && versions[0].is_latest);
        assert_eq!(versions[1].version_id, b.version_id);
        assert_eq!(versions[2].version_id, a.version_id);

        let listed: Vec<ObjectSummary> = backend
            .list_objects("versioned")
            .try_collect()
            .await
            .unwrap();
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn deleting_marker_version_restores_previous() {
        let (backend, dir) = backend().await;
        backend.create_bucket("restore", "local").await.unwrap();
        backend.set_bucket_versioning("restore", true).await.unwrap();
        let src = write_file(&dir, "r.txt", "restore me").await;
        let put = backend
            .put_object("restore", "k", &src, PutOptions::default())
            .await
            .unwrap();
        backend.delete_object("restore", "k").await.unwrap();

        let marker = backend
            .list_object_versions("restore")
            .try_collect::<Vec<_>>()
            .await
            .unwrap()
            .remove(0);
        let result = backend
            .delete_objects_bulk("restore", &[ObjectIdentifier::from(&marker)])
            .await
            .unwrap();
        assert_eq!(result.deleted.len(), 1);

        let head = backend.head_object("restore", "k").await.unwrap();
        assert_eq!(head.version_id, put.version_id);
    }

    #[tokio::test]
    async fn bulk_delete_reports_missing_entries() {
        let (backend, _dir) = backend().await;
        backend.create_bucket("bulk-missing", "local").await.unwrap();
        let result = backend
            .delete_objects_bulk(
                "bulk-missing",
                &[
                    ObjectIdentifier::new("nope"),
                    ObjectIdentifier::with_version("nope", "abc"),
                ],
            )
            .await
            .unwrap();
        assert!(result.deleted.is_empty());
        assert_eq!(result.errors.len(), 2);
    }

    #[tokio::test]
    async fn delete_bucket_requires_empty_bucket() {
        let (backend, dir) = backend().await;
        backend.create_bucket("not-empty", "local").await.unwrap();
        let src = write_file(&dir, "x.txt", "x").await;
        backend
            .put_object("not-empty", "x", &src, PutOptions::default())
            .await
            .unwrap();

        let err = backend.delete_bucket("not-empty").await.unwrap_err();
        assert!(matches!(err, StorageError::BucketNotEmpty(_)));

        backend.delete_object("not-empty", "x").await.unwrap();
        backend.delete_bucket("not-empty").await.unwrap();
        assert!(!backend.bucket_root("not-empty").exists());
        assert!(matches!(
            backend.head_bucket("not-empty").await.unwrap_err(),
            StorageError::BucketNotFound(_)
        ));
    }

    #[tokio::test]
    async fn copy_duplicates_content_across_buckets() {
        let (backend, dir) = backend().await;
        backend.create_bucket("copy-src", "local").await.unwrap();
        backend.create_bucket("copy-dst", "local").await.unwrap();
        let src = write_file(&dir, "c.txt", "copy me").await;
        backend
            .put_object(
                "copy-src",
                "c",
                &src,
                PutOptions::default()
                    .acl(CannedAcl::PublicRead)
                    .metadata("origin", "src"),
            )
            .await
            .unwrap();

        let copied = backend
            .copy_object("copy-src", "c", "copy-dst", "c2")
            .await
            .unwrap();
        assert_eq!(copied.bucket, "copy-dst");
        assert_eq!(copied.metadata.get("origin").map(String::as_str), Some("src"));

        // overwrite source; the copy keeps the old content
        let newer = write_file(&dir, "c-new.txt", "changed").await;
        backend
            .put_object("copy-src", "c", &newer, PutOptions::default())
            .await
            .unwrap();

        let out = dir.path().join("copied.txt");
        backend.get_object("copy-dst", "c2", &out).await.unwrap();
        assert_eq!(fs::read_to_string(&out).await.unwrap(), "copy me");
        assert!(!backend.get_object_acl("copy-dst", "c2").await.unwrap().is_public());
    }

    #[tokio::test]
    async fn acl_can_be_read_and_replaced() {
        let (backend, dir) = backend().await;
        let bucket = backend.create_bucket("acl-bucket", "local").await.unwrap();
        let src = write_file(&dir, "acl.txt", "acl").await;
        backend
            .put_object(
                "acl-bucket",
                "k",
                &src,
                PutOptions::default().acl(CannedAcl::PublicRead),
            )
            .await
            .unwrap();

        let acl = backend.get_object_acl("acl-bucket", "k").await.unwrap();
        assert_eq!(acl.owner_id, bucket.owner_id);
        assert!(acl.is_public());

        backend
            .set_object_acl("acl-bucket", "k", CannedAcl::Private)
            .await
            .unwrap();
        let acl = backend.get_object_acl("acl-bucket", "k").await.unwrap();
        assert_eq!(acl.canned, CannedAcl::Private);
        assert_eq!(acl.grants.len(), 1);
    }

    #[tokio::test]
    async fn listings_page_through_all_rows() {
        let (backend, dir) = backend().await;
        let backend = backend.with_page_size(2);
        backend.create_bucket("paged", "local").await.unwrap();
        backend.set_bucket_versioning("paged", true).await.unwrap();
        let src = write_file(&dir, "p.txt", "p").await;
        for key in ["a", "b", "c", "d", "e"] {
            for _ in 0..2 {
                backend
                    .put_object("paged", key, &src, PutOptions::default())
                    .await
                    .unwrap();
            }
        }

        let keys: Vec<String> = backend
            .list_objects("paged")
            .map_ok(|o| o.key)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(keys, vec!["a", "b", "c", "d", "e"]);

        let versions: Vec<ObjectVersion> = backend
            .list_object_versions("paged")
            .try_collect()
            .await
            .unwrap();
        assert_eq!(versions.len(), 10);
        assert_eq!(versions.iter().filter(|v| v.is_latest).count(), 5);
    }

    #[tokio::test]
    async fn listing_missing_bucket_yields_error() {
        let (backend, _dir) = backend().await;
        let result: StorageResult<Vec<ObjectSummary>> =
            backend.list_objects("no-such-bucket").try_collect().await;
        assert!(matches!(result, Err(StorageError::BucketNotFound(_))));
    }

    #[tokio::test]
    async fn unsafe_keys_are_rejected() {
        let (backend, dir) = backend().await;
        backend.create_bucket("keys", "local").await.unwrap();
        let src = write_file(&dir, "k.txt", "k").await;
        for key in ["", "/abs", "a/../b", "tab\tkey", "back\\slash"] {
            let err = backend
                .put_object("keys", key, &src, PutOptions::default())
                .await
                .unwrap_err();
            assert!(matches!(err, StorageError::InvalidObjectKey), "{key:?}");
        }
    }

    #[test]
    fn ipv4_detection() {
        assert!(is_ipv4_like("10.0.0.1"));
        assert!(!is_ipv4_like("10.0.0.256"));
        assert!(!is_ipv4_like("10.0.0"));
        assert!(!is_ipv4_like("a.b.c.d"));
    }
}
