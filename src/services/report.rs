//! Step-by-step record of a provisioning run.

use serde::Serialize;
use std::fmt::Display;
use tracing::{info, warn};

/// Step names, in the order a run records them.
pub mod steps {
    pub const CREATE_FIRST_BUCKET: &str = "create first bucket";
    pub const CREATE_SECOND_BUCKET: &str = "create second bucket";
    pub const UPLOAD_FIRST_FILE: &str = "upload first file";
    pub const DOWNLOAD_FIRST_FILE: &str = "download first file";
    pub const COPY_FIRST_FILE: &str = "copy first file to second bucket";
    pub const DELETE_COPIED_FILE: &str = "delete first file from second bucket";
    pub const UPLOAD_PUBLIC_FILE: &str = "upload second file as public-read";
    pub const READ_PUBLIC_ACL: &str = "read second file ACL";
    pub const MAKE_FILE_PRIVATE: &str = "set second file ACL to private";
    pub const READ_PRIVATE_ACL: &str = "read second file ACL after update";
    pub const UPLOAD_ENCRYPTED_FILE: &str = "upload third file with AES256";
    pub const UPLOAD_INFREQUENT_ACCESS_FILE: &str = "upload third file as STANDARD_IA";
    pub const ENABLE_VERSIONING: &str = "enable versioning on first bucket";
    pub const REUPLOAD_SECOND_FILE: &str = "upload second file to versioned bucket";
    pub const READ_FIRST_FILE_VERSION: &str = "read first file version id";
    pub const LIST_BUCKETS_HANDLE: &str = "list buckets through handles";
    pub const LIST_BUCKETS_DIRECT: &str = "list buckets through backend";
    pub const LIST_OBJECT_KEYS: &str = "list object keys in first bucket";
    pub const LIST_OBJECT_DETAILS: &str = "list object details in first bucket";
    pub const EMPTY_FIRST_BUCKET: &str = "empty first bucket";
    pub const EMPTY_SECOND_BUCKET: &str = "empty second bucket";
    pub const DELETE_FIRST_BUCKET: &str = "delete first bucket";
    pub const DELETE_SECOND_BUCKET: &str = "delete second bucket";
    pub const REMOVE_LOCAL_FILES: &str = "remove local files";
}

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
    Succeeded { detail: String },
    Failed { error: String },
    Skipped { reason: String },
}

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct StepRecord {
    pub step: String,
    #[serde(flatten)]
    pub outcome: StepOutcome,
}

/// Ordered outcomes of one run, plus the bucket names it generated.
#[derive(Serialize, Clone, Debug, Default)]
pub struct RunReport {
    pub first_bucket: Option<String>,
    pub second_bucket: Option<String>,
    pub steps: Vec<StepRecord>,
}

impl RunReport {
    /// Record a step result, logging it, and hand back the success value.
    pub fn capture<T, E: Display>(
        &mut self,
        step: &str,
        result: Result<T, E>,
        describe: impl FnOnce(&T) -> String,
    ) -> Option<T> {
        match result {
            Ok(value) => {
                let detail = describe(&value);
                info!("{}: {}", step, detail);
                self.push(step, StepOutcome::Succeeded { detail });
                Some(value)
            }
            Err(err) => {
                warn!("{} failed: {}", step, err);
                self.push(
                    step,
                    StepOutcome::Failed {
                        error: err.to_string(),
                    },
                );
                None
            }
        }
    }

    /// Pass `dependency` through. When it is absent every step in `steps`
    /// is recorded as skipped.
    pub fn require<'b>(
        &mut self,
        steps: &[&str],
        dependency: Option<&'b str>,
    ) -> Option<&'b str> {
        if dependency.is_none() {
            for step in steps {
                info!("{} skipped: required bucket was not created", step);
                self.push(
                    step,
                    StepOutcome::Skipped {
                        reason: "required bucket was not created".to_string(),
                    },
                );
            }
        }
        dependency
    }

    /// Like `require`, for steps that need both buckets.
    pub fn require_both<'b>(
        &mut self,
        steps: &[&str],
        first: Option<&'b str>,
        second: Option<&'b str>,
    ) -> Option<(&'b str, &'b str)> {
        match (first, second) {
            (Some(a), Some(b)) => Some((a, b)),
            _ => {
                self.require(steps, None);
                None
            }
        }
    }

    pub fn step(&self, name: &str) -> Option<&StepOutcome> {
        self.steps
            .iter()
            .find(|record| record.step == name)
            .map(|record| &record.outcome)
    }

    pub fn failures(&self) -> impl Iterator<Item = &StepRecord> {
        self.steps
            .iter()
            .filter(|record| !matches!(record.outcome, StepOutcome::Succeeded { .. }))
    }

    /// True when every recorded step succeeded.
    pub fn is_clean(&self) -> bool {
        self.failures().next().is_none()
    }

    fn push(&mut self, step: &str, outcome: StepOutcome) {
        self.steps.push(StepRecord {
            step: step.to_string(),
            outcome,
        });
    }
}
