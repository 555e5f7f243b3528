use anyhow::{Context, Result};
use bucket_provisioner::{LocalBackend, Orchestrator, config::AppConfig, db};
use std::{fs, path::Path, sync::Arc};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // --- Parse config ---
    let cfg = AppConfig::from_env_and_args();
    tracing::info!("Starting bucket-provisioner with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize SQLite connection ---
    let db_path = cfg
        .database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    if !db_path.contains(":memory:") {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
                tracing::info!("Created missing directory {:?}", parent);
            }
        }
    }

    let db = db::connect(&cfg.database_url)
        .await
        .with_context(|| format!("connecting to {}", cfg.database_url))?;
    db::run_migrations(&db)
        .await
        .context("applying metadata schema")?;

    // --- Run the provisioning sequence ---
    let backend = LocalBackend::new(Arc::new(db), cfg.storage_dir.clone());
    let orchestrator = Orchestrator::new(backend, cfg.orchestrator_config());
    let report = orchestrator.run().await?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.is_clean() {
        tracing::warn!(
            "{} steps did not succeed; see report above",
            report.failures().count()
        );
    }

    Ok(())
}
