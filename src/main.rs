use media_range_proxy::{
    config::Config,
    http_server::MediaProxyServer,
    logging::LoggerManager,
    media_resolver::MediaResolver,
    shutdown::ShutdownCoordinator,
    upstream_client::UpstreamClient,
    Result,
};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    let hostname = gethostname::gethostname().to_string_lossy().to_string();
    let logger = Arc::new(LoggerManager::new(config.logging.clone(), hostname));
    logger.initialize()?;
    if let Err(e) = logger.cleanup_old_logs(30) {
        error!("Failed to clean up old application logs: {}", e);
    }

    info!("Starting media range proxy v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Listening on {}:{}, upstream {}",
        config.server.bind_address, config.server.http_port, config.upstream.base_url
    );

    let resolver: Arc<dyn MediaResolver> = Arc::new(UpstreamClient::new(&config.upstream)?);

    let shutdown_coordinator = Arc::new(ShutdownCoordinator::new(config.server.shutdown_timeout));

    let mut server = MediaProxyServer::new(Arc::new(config), resolver)?;
    server.set_logger_manager(Arc::clone(&logger));

    let server_signal = shutdown_coordinator.signal();
    let server_handle = tokio::spawn(async move { server.start(server_signal).await });

    let signal_coordinator = Arc::clone(&shutdown_coordinator);
    let signal_handle = tokio::spawn(async move {
        if let Err(e) = signal_coordinator.listen_for_shutdown().await {
            error!("Shutdown signal listener failed: {}", e);
            signal_coordinator.initiate_shutdown();
        }
    });

    let result = match server_handle.await {
        Ok(result) => result,
        Err(e) => {
            error!("HTTP server task failed: {}", e);
            Err(media_range_proxy::ProxyError::SystemError(format!(
                "HTTP server task failed: {}",
                e
            )))
        }
    };

    signal_handle.abort();

    info!("Media range proxy shut down");
    result
}
