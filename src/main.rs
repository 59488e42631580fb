use imagecdn::{config::CdnConfig, router, ImageCdn};
use std::net::SocketAddr;

/// Image CDN server entry point.
///
/// Initializes tracing, loads configuration and starts the HTTP server.
///
/// # Configuration
/// Environment variables (see `CdnConfig::from_env`):
/// - `IMAGECDN_CACHE_BACKEND`: `memory` or `disk` (default: memory)
/// - `IMAGECDN_BLOB_BACKEND`: `fs` or `http` (default: fs under ./media)
/// - `IMAGECDN_CATALOG`: JSON catalog of objects and sessions; without it every
///   key is served as a public object
/// - `IMAGECDN_ADMIN_TOKEN`: enables the `/admin` routes
/// - `PORT`: HTTP listen port (default: 8080)
/// - `RUST_LOG`: Logging verbosity (default: "imagecdn=debug,tower_http=debug")
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "imagecdn=debug,tower_http=debug".into())
        )
        .init();

    tracing::info!("Starting image CDN server");

    let cfg = CdnConfig::from_env()?;
    let port = cfg.port;
    let cdn = ImageCdn::init(cfg).await?;
    let app = router(cdn.clone());

    // Bind to 0.0.0.0 for external access (required for containerized deployment)
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Server listening on {}", addr);
    println!("Server listening on {}", addr);

    axum::serve(
        tokio::net::TcpListener::bind(addr).await?,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    cdn.shutdown();
    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
