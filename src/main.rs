#![forbid(unsafe_code)]

use anyhow::Result;
use sfu_rooms::config::ServerConfig;
use sfu_rooms::media::{MediaConfig, MediasoupEngine, WorkerPool};
use sfu_rooms::metrics::ServerMetrics;
use sfu_rooms::room::RoomRegistry;
use sfu_rooms::server::ApiServer;
use sfu_rooms::signaling::ChannelHub;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sfu_rooms=debug,mediasoup=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("sfu-rooms - Starting server");

    let config = ServerConfig::from_env()?;
    info!(
        "{} workers, announcing {}, RTC ports {}-{}, close grace {:?}",
        config.num_workers, config.announce_ip, config.rtc_min_port, config.rtc_max_port, config.room_close_grace
    );

    let engine = MediasoupEngine::new(MediaConfig::from_server_config(&config));
    let pool = Arc::new(WorkerPool::initialize(&engine, config.num_workers).await?);

    let metrics = ServerMetrics::new();
    let registry = RoomRegistry::new(
        pool.clone(),
        Arc::new(ChannelHub::new()),
        metrics,
        config.registry_config(),
    );

    info!("Room registry and worker pool initialized");

    let server = ApiServer::new(registry.clone(), config.metrics_token.clone());

    // Run server with graceful shutdown
    tokio::select! {
        result = server.serve(config.port) => {
            if let Err(e) = result {
                error!("HTTP server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    registry.shutdown().await;
    pool.close_all_workers().await;

    info!("Server shutdown complete");
    Ok(())
}
