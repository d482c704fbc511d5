use anyhow::Result;
use std::sync::Arc;
use tm_common::{BackendConfig, ClusterDirectory, Config};
use tm_worker::{run, MasterApi, WorkerSettings};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("tm_worker=debug,tm_common=info,reqwest=info")
        .init();

    let config = Config::from_env()?;
    let settings = WorkerSettings::from_config(&config);

    // Directorio de clústeres: fichero local o el que publica el master
    let backend = match &config.clusters_config {
        Some(path) => BackendConfig::load(path)?,
        None => {
            let api = MasterApi::new(&settings.master_url, settings.request_timeout)?;
            api.backend_config().await?
        }
    };
    let directory = Arc::new(ClusterDirectory::in_memory(&backend));

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c recibido, deteniendo worker");
            shutdown.cancel();
        }
    });

    run(settings, directory, cancel).await?;
    Ok(())
}
