use std::env;
use std::path::PathBuf;

use tokio::net::TcpListener;
use tracing::{error, info};

use voiceline::{ServerConfig, routes, state::AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    // Optional first argument: path to the YAML config file.
    let config_path = env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.yaml"));

    let config = ServerConfig::from_file(&config_path)?;
    let address = config.address();

    let app_state = AppState::new(config).await.inspect_err(|e| {
        error!("Failed to initialize components: {e:#}");
    })?;
    let app = routes::build_router(app_state.clone());

    let listener = TcpListener::bind(&address).await?;
    info!("Listening on {address}");
    info!("WebSocket: ws://{address}/ws");
    info!("Health check: http://{address}/health");
    info!("Statistics: http://{address}/stats");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down server...");
    app_state.shutdown().await;
    info!("Server shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
