use std::env;

use tm_common::{BackendConfig, ClusterDirectory, Config};
use tm_master::{build_router, monitor, AppState, MasterSettings};
use tokio::net::TcpListener;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("tm_master=debug,tm_common=info,tower_http=info")
        .init();

    let config = Config::from_env()?;

    // directorio de clústeres
    let directory = match &config.clusters_config {
        Some(path) => ClusterDirectory::in_memory(&BackendConfig::load(path)?),
        None => {
            info!("sin TM_CLUSTERS_CONFIG: directorio de clústeres vacío");
            ClusterDirectory::new("default")
        }
    };
    let state = AppState::new(directory, MasterSettings::default());

    // router HTTP
    let app = build_router(state.clone());

    // monitor de heartbeats y leases en segundo plano
    let monitor_state = state.clone();
    tokio::spawn(async move {
        monitor::monitor_loop(monitor_state).await;
    });

    let addr = env::var("TM_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = TcpListener::bind(&addr).await?;
    info!("master escuchando en {}", listener.local_addr()?);

    if let Err(e) = axum::serve(listener, app).await {
        error!("el servidor HTTP terminó con error: {}", e);
        return Err(e.into());
    }
    Ok(())
}
