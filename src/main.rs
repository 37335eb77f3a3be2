use tracing::{info, warn};

use tunecache::{Config, MediaCore, OriginServer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cfg = Config::from_env();
    info!(
        "tunecache engine {} starting (cache root {})",
        env!("CARGO_PKG_VERSION"),
        cfg.cache_root.display()
    );

    let core = MediaCore::from_config(&cfg).await?;
    let server = OriginServer::new(core.clone(), cfg.bind);
    let addr = server.start().await?;
    info!("tunecache engine listening on http://{addr}");

    shutdown_signal().await;

    // Helper first: it holds a stream connection open against the server.
    if let Err(e) = core.osd.set_enabled(false).await {
        warn!("failed to stop OSD helper: {e:#}");
    }
    server.stop().await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async { tokio::signal::ctrl_c().await.ok(); };

    #[cfg(unix)]
    let term = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let term = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = term => {},
    }

    warn!("Shutdown signal received.");
}
