//! Storage provisioning helpers.
//!
//! Generates unique bucket and scratch-file names, materializes scratch
//! payloads, and runs a fixed bucket lifecycle (create, upload, download,
//! copy, ACL and encryption changes, versioning, listing, teardown) against
//! an injected [`backend::StorageBackend`].

pub mod backend;
pub mod config;
pub mod db;
pub mod errors;
pub mod models;
pub mod naming;
pub mod services;
pub mod temp_file;

pub use backend::{StorageBackend, local::LocalBackend};
pub use errors::{ProvisionError, StorageError, StorageResult};
pub use services::{
    orchestrator::{Orchestrator, OrchestratorConfig, empty_bucket},
    report::{RunReport, StepOutcome, StepRecord, steps},
};
