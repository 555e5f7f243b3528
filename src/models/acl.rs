//! Object access-control lists.
//!
//! Objects carry a canned ACL. Reading an ACL expands it into the explicit
//! grant list S3 reports for that canned value.

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use uuid::Uuid;

pub const ALL_USERS_URI: &str = "http://acs.amazonaws.com/groups/global/AllUsers";
pub const AUTHENTICATED_USERS_URI: &str =
    "http://acs.amazonaws.com/groups/global/AuthenticatedUsers";

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CannedAcl {
    #[default]
    Private,
    PublicRead,
    PublicReadWrite,
    AuthenticatedRead,
}

impl CannedAcl {
    pub fn as_str(&self) -> &'static str {
        match self {
            CannedAcl::Private => "private",
            CannedAcl::PublicRead => "public-read",
            CannedAcl::PublicReadWrite => "public-read-write",
            CannedAcl::AuthenticatedRead => "authenticated-read",
        }
    }
}

impl fmt::Display for CannedAcl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CannedAcl {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "private" => Ok(CannedAcl::Private),
            "public-read" => Ok(CannedAcl::PublicRead),
            "public-read-write" => Ok(CannedAcl::PublicReadWrite),
            "authenticated-read" => Ok(CannedAcl::AuthenticatedRead),
            other => Err(format!("unknown canned ACL `{}`", other)),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Permission {
    FullControl,
    Read,
    Write,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum Grantee {
    CanonicalUser { id: Uuid },
    Group { uri: String },
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Grant {
    pub grantee: Grantee,
    pub permission: Permission,
}

impl fmt::Display for Grant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let permission = match self.permission {
            Permission::FullControl => "FULL_CONTROL",
            Permission::Read => "READ",
            Permission::Write => "WRITE",
        };
        match &self.grantee {
            Grantee::CanonicalUser { id } => write!(f, "{} -> user {}", permission, id),
            Grantee::Group { uri } => write!(f, "{} -> group {}", permission, uri),
        }
    }
}

/// The effective ACL of an object.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Acl {
    pub owner_id: Uuid,
    pub canned: CannedAcl,
    pub grants: Vec<Grant>,
}

impl Acl {
    /// Expand a canned ACL. The owner always holds FULL_CONTROL.
    pub fn from_canned(owner_id: Uuid, canned: CannedAcl) -> Self {
        let mut grants = vec![Grant {
            grantee: Grantee::CanonicalUser { id: owner_id },
            permission: Permission::FullControl,
        }];
        let group = |uri: &str, permission| Grant {
            grantee: Grantee::Group {
                uri: uri.to_string(),
            },
            permission,
        };
        match canned {
            CannedAcl::Private => {}
            CannedAcl::PublicRead => grants.push(group(ALL_USERS_URI, Permission::Read)),
            CannedAcl::PublicReadWrite => {
                grants.push(group(ALL_USERS_URI, Permission::Read));
                grants.push(group(ALL_USERS_URI, Permission::Write));
            }
            CannedAcl::AuthenticatedRead => {
                grants.push(group(AUTHENTICATED_USERS_URI, Permission::Read))
            }
        }
        Self {
            owner_id,
            canned,
            grants,
        }
    }

    /// True when anyone, signed in or not, can read the object.
    pub fn is_public(&self) -> bool {
        self.grants.iter().any(|g| {
            matches!(&g.grantee, Grantee::Group { uri } if uri == ALL_USERS_URI)
        })
    }
}
