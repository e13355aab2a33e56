use std::sync::Arc;

use finflow_api::app::{AppServices, build_app};
use finflow_infra::config::EngineConfig;

#[tokio::main]
async fn main() {
    finflow_observability::init();

    let config = match EngineConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "invalid configuration");
            std::process::exit(2);
        }
    };

    let services = match AppServices::from_config(config.clone()) {
        Ok(services) => Arc::new(services),
        Err(err) => {
            tracing::error!(error = %err, "cannot open the event store");
            std::process::exit(1);
        }
    };
    services
        .start_workers()
        .expect("failed to start background workers");

    let app = build_app(services.clone());

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind {}: {e}", config.bind_addr));

    tracing::info!("listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await
        .expect("server error");

    services.shutdown();
}
