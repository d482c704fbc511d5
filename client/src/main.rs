use clap::Parser;
use std::{process, sync::Arc};
use tm_client::{cli, TaskClient};
use tm_common::{BackendConfig, ClusterDirectory, Config};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("tm_client=info")
        .with_writer(std::io::stderr)
        .init();

    let args = cli::Cli::parse();
    let config = Config::from_env()?;

    // Ctrl-C cancela las esperas y los reintentos en curso
    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c recibido, cancelando");
            shutdown.cancel();
        }
    });

    let mut client = TaskClient::new(&config, cancel)?;
    if let Some(path) = &config.clusters_config {
        let backend = BackendConfig::load(path)?;
        client = client.with_directory(Arc::new(ClusterDirectory::in_memory(&backend)));
    }

    if let Err(e) = cli::run(args, &client).await {
        if config.log_exit_code {
            eprintln!("tm-client: exit code 1");
        }
        eprintln!("Error: {e}");
        process::exit(1);
    }
    Ok(())
}
