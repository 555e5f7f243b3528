//! Represents a logical bucket, a top-level container for objects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use uuid::Uuid;

/// A storage bucket as reported by a backend.
///
/// Buckets act as namespaces for objects and belong to a single owner.
/// The orchestrator never caches these; it asks the backend again whenever
/// it needs the current state.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Bucket {
    /// Backend-internal identifier.
    pub id: Uuid,

    /// Globally unique bucket name (must conform to DNS naming rules).
    pub name: String,

    /// ID of the account that owns this bucket. Owner of every ACL in it.
    pub owner_id: Uuid,

    /// Region where the bucket is hosted (e.g. "eu-west-1").
    pub region: String,

    /// When this bucket was created.
    pub created_at: DateTime<Utc>,

    /// `None` until versioning has been configured at least once.
    pub versioning: Option<VersioningStatus>,
}

impl Bucket {
    pub fn versioning_enabled(&self) -> bool {
        self.versioning == Some(VersioningStatus::Enabled)
    }
}

/// Bucket versioning state. A bucket that was versioned can only be
/// suspended, never returned to the unversioned state.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum VersioningStatus {
    Enabled,
    Suspended,
}

impl VersioningStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VersioningStatus::Enabled => "Enabled",
            VersioningStatus::Suspended => "Suspended",
        }
    }
}

impl fmt::Display for VersioningStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VersioningStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Enabled" => Ok(VersioningStatus::Enabled),
            "Suspended" => Ok(VersioningStatus::Suspended),
            other => Err(format!("unknown versioning status `{}`", other)),
        }
    }
}
