use crate::services::orchestrator::OrchestratorConfig;
use clap::Parser;
use std::{env, path::PathBuf};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments. Every value has a
/// default, so a bare invocation runs the whole sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub storage_dir: String,
    pub database_url: String,
    pub region: String,
    pub work_dir: PathBuf,
    pub download_dir: PathBuf,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Provision, exercise and tear down storage buckets")]
pub struct Args {
    /// Directory where object payloads are stored (overrides PROVISIONER_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Metadata database URL (overrides PROVISIONER_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Region to create buckets in (overrides PROVISIONER_REGION)
    #[arg(long)]
    pub region: Option<String>,

    /// Directory for scratch upload files (overrides PROVISIONER_WORK_DIR)
    #[arg(long)]
    pub work_dir: Option<PathBuf>,

    /// Directory downloads are written to (overrides PROVISIONER_DOWNLOAD_DIR)
    #[arg(long)]
    pub download_dir: Option<PathBuf>,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig.
    pub fn from_env_and_args() -> Self {
        Self::from_args(Args::parse(), |key| env::var(key).ok())
    }

    /// Merge parsed `args` over values found through `lookup`.
    pub fn from_args(args: Args, lookup: impl Fn(&str) -> Option<String>) -> Self {
        // --- Environment fallback ---
        let env_storage =
            lookup("PROVISIONER_STORAGE_DIR").unwrap_or_else(|| "./data/objects".into());
        let env_db = lookup("PROVISIONER_DATABASE_URL")
            .unwrap_or_else(|| "sqlite://./data/meta/provisioner.db".into());
        let env_region = lookup("PROVISIONER_REGION").unwrap_or_else(|| "eu-west-1".into());
        let env_work = lookup("PROVISIONER_WORK_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let env_download = lookup("PROVISIONER_DOWNLOAD_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(env::temp_dir);

        // --- Merge ---
        Self {
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            region: args.region.unwrap_or(env_region),
            work_dir: args.work_dir.unwrap_or(env_work),
            download_dir: args.download_dir.unwrap_or(env_download),
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            region: self.region.clone(),
            work_dir: self.work_dir.clone(),
            download_dir: self.download_dir.clone(),
            ..OrchestratorConfig::default()
        }
    }
}
