use crate::{config::ApplicationConfig, server::GatewayServer};

/// Run the gateway until it fails or the process is asked to terminate.
pub async fn entrypoint(config: ApplicationConfig) -> color_eyre::Result<()> {
    let server = GatewayServer::new(config).await?;
    server.run().await?;
    #[cfg(not(coverage_nightly))]
    tracing::info!("portcullis is now running.");
    // Add OS signal handlers for termination.
    tokio::select! {
        _ = wait_for_signal() => (),
        result = server.wait() => return result,
    }
    #[cfg(not(coverage_nightly))]
    tracing::info!("portcullis is shutting down.");
    server.close();
    server.wait().await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let (Ok(mut signal_terminate), Ok(mut signal_interrupt)) = (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) else {
        #[cfg(not(coverage_nightly))]
        tracing::error!("Unable to listen for termination signals.");
        return std::future::pending().await;
    };

    tokio::select! {
        _ = signal_terminate.recv() => {
            #[cfg(not(coverage_nightly))]
            tracing::debug!("Received SIGTERM.");
        }
        _ = signal_interrupt.recv() => {
            #[cfg(not(coverage_nightly))]
            tracing::debug!("Received SIGINT.");
        }
    };
}

#[cfg(windows)]
async fn wait_for_signal() {
    use tokio::signal::windows;

    let (Ok(mut signal_c), Ok(mut signal_break)) = (windows::ctrl_c(), windows::ctrl_break())
    else {
        #[cfg(not(coverage_nightly))]
        tracing::error!("Unable to listen for termination signals.");
        return std::future::pending().await;
    };

    tokio::select! {
        _ = signal_c.recv() => {
            #[cfg(not(coverage_nightly))]
            tracing::debug!("Received CTRL_C.");
        }
        _ = signal_break.recv() => {
            #[cfg(not(coverage_nightly))]
            tracing::debug!("Received CTRL_BREAK.");
        }
    };
}
