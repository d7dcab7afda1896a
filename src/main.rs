use std::net::SocketAddr;
use std::process::ExitCode;

use anyhow::Context;
use tokio::signal;
use tracing::{error, info, warn};

use ledgerlink_core as app;
use app::config::AppConfigError;

#[tokio::main]
async fn main() -> ExitCode {
    let cfg = match app::config::load_config() {
        Ok(cfg) => cfg,
        Err(AppConfigError::Missing(names)) => {
            eprintln!("Missing required environment variables: {}", names.join(", "));
            return ExitCode::FAILURE;
        }
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };
    app::config::init_tracing(&cfg.log_level, cfg.log_json);

    match run(cfg).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{:#}", e), "ledgerlink-core stopped with an error");
            ExitCode::FAILURE
        }
    }
}

async fn run(cfg: app::config::AppConfig) -> anyhow::Result<()> {
    let registry = app::ProviderRegistry::global();
    registry
        .init(&cfg)
        .await
        .context("failed to initialize providers")?;

    let factory = app::ServiceFactory::from_registry(registry, &cfg)?;
    let services = app::ServiceContainer::new(&factory);
    let app = app::router(app::AppState::new(services));

    if cfg.skip_auth {
        warn!("SKIP_AUTH is set; requests are not authenticated");
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!(environment = %cfg.node_env, database = %cfg.db_provider, "ledgerlink-core listening on http://{}", addr);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    registry.shutdown().await;
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
