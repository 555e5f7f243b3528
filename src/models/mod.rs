//! Data models exchanged with a storage backend.
//!
//! These types describe buckets, objects and their access controls as a
//! backend reports them. They serialize naturally as JSON via `serde`.

pub mod acl;
pub mod bucket;
pub mod object;

pub use acl::{Acl, CannedAcl, Grant, Grantee, Permission};
pub use bucket::{Bucket, VersioningStatus};
pub use object::{
    BulkDeleteError, BulkDeleteResult, NULL_VERSION_ID, ObjectIdentifier, ObjectSummary,
    ObjectVersion, PutOptions, ServerSideEncryption, StorageClass,
};
