use bridge_node::{api, bootstrap, metrics, AppState, NodeConfig};

fn main() -> eyre::Result<()> {
    // Install color-eyre for better error reporting
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    init_logging();

    tracing::info!("Starting yield bridge node");

    let config = NodeConfig::load()?;
    tracing::info!(
        sender = %config.sender.address,
        receiver = %config.receiver.address,
        pool = %config.pool.address,
        yield_rate_bps = config.pool.yield_rate_bps,
        "Configuration loaded"
    );

    if let Err(e) = config.verify_deployment() {
        tracing::error!(error = %e, "Deployment verification failed");
    }

    let (gateways, mut relay) = bootstrap(&config)?;
    metrics::set_up(true);

    let (shutdown_tx, shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = shutdown_tx.send(()).await;
    });

    let state = AppState::new(gateways);
    let bind_address = config.api.bind_address.clone();
    let port = config.api.port;

    tokio::select! {
        result = relay.run(shutdown_rx) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Relay error");
            }
        }
        result = api::start_server(&bind_address, port, state) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "API server error");
            }
        }
    }

    metrics::set_up(false);
    tracing::info!("Yield bridge node stopped");
    Ok(())
}

/// Initialize tracing/logging with structured output
///
/// `LOG_FORMAT=json` switches to JSON lines.
fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,yield_bridge=debug,bridge_node=debug"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .with(filter)
            .init();
    }
}

/// Wait for shutdown signals (SIGINT/SIGTERM)
async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
