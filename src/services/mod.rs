//! Provisioning services built on top of a `StorageBackend`.

pub mod orchestrator;
pub mod report;
