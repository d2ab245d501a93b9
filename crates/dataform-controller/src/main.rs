use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use dataform_controller::Controller;
use dataform_controller::config::loader::{DEFAULT_CONFIG_PATH, load_config};
use dataform_controller::observability::{apply_logging_level, init_tracing};
use dataform_controller::seed::seed_store;
use dataform_db_memory::create_record_store;
use dataform_provisioner::InMemoryProvisioner;
use tokio::sync::watch;

#[derive(Parser, Debug)]
#[command(name = "dataform")]
#[command(about = "Provision managed database instances for declared records")]
#[command(version)]
struct Cli {
    /// Configuration file (missing file means defaults plus environment)
    #[arg(short, long, env = "DATAFORM_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// JSON array of records to load at startup (overrides store.seed_file)
    #[arg(long)]
    seed: Option<PathBuf>,

    /// Number of reconcile workers (overrides controller.workers)
    #[arg(short, long)]
    workers: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is fine
    if let Err(e) = dotenvy::dotenv() {
        if !matches!(e, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound) {
            eprintln!("Warning: Failed to load .env file: {e}");
        }
    }

    let cli = Cli::parse();
    init_tracing();

    let mut cfg = load_config(Some(&cli.config))
        .map_err(anyhow::Error::msg)
        .context("configuration error")?;
    if let Some(workers) = cli.workers {
        cfg.controller.workers = workers;
        cfg.validate()
            .map_err(anyhow::Error::msg)
            .context("invalid --workers")?;
    }
    apply_logging_level(&cfg.logging.level);
    tracing::info!(path = %cli.config, workers = cfg.controller.workers, "Configuration loaded");

    let store = create_record_store();
    let seed = cli
        .seed
        .or_else(|| cfg.store.seed_file.as_ref().map(PathBuf::from));
    if let Some(path) = seed {
        seed_store(&store, &path).await?;
    }
    store.mark_synced();

    let provisioner = Arc::new(InMemoryProvisioner::with_region(cfg.provisioner.region.clone()));
    let controller = Controller::builder()
        .with_lister(store.clone())
        .with_watcher(store.clone())
        .with_writer(store.clone())
        .with_provisioner(provisioner)
        .with_config(&cfg)?
        .build()?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Received Ctrl-C"),
            Err(e) => tracing::warn!(error = %e, "Failed to listen for Ctrl-C, stopping"),
        }
        shutdown_tx.send_replace(true);
    });

    controller.run(shutdown_rx).await?;
    Ok(())
}
