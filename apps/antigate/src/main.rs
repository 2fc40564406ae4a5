use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use antigate_common::{CliArgs, GatewayConfig};
use antigate_router::RouterState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = CliArgs::parse();
    let config = match GatewayConfig::from_args(args) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "startup configuration invalid");
            std::process::exit(1);
        }
    };

    let boot = match antigate_core::bootstrap(config).await {
        Ok(boot) => boot,
        Err(err) => {
            error!(error = %err, "bootstrap failed");
            std::process::exit(1);
        }
    };

    let state = RouterState {
        config: std::sync::Arc::new(boot.config.clone()),
        engine: boot.engine.clone(),
        store: boot.store.clone(),
        pool: boot.pool.clone(),
        log: boot.log.clone(),
        sessions: boot.sessions.clone(),
        auth_api: boot.auth_api.clone(),
    };

    let app = axum::Router::new()
        .merge(antigate_router::proxy_router(state.clone()))
        .merge(antigate_router::admin_router(state));

    let bind = format!("{}:{}", boot.config.host, boot.config.port);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(%bind, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

/// SIGINT/SIGTERM start a graceful drain; a watchdog forces exit after the
/// five second grace window.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown requested, draining connections");
    tokio::spawn(async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        error!("drain window elapsed, forcing exit");
        std::process::exit(0);
    });
}
