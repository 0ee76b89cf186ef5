//! Broker Kit Worker - Main Entry Point
//!
//! Keeps a broker connection alive, optionally consumes one queue and
//! serves a health endpoint.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tower_http::trace::TraceLayer;
use tracing::info;

use brokerkit::api::{handlers, AppState};
use brokerkit::messaging::AmqpManager;
use brokerkit::telemetry::{init_tracing, LogFormat};
use brokerkit::types::BrokerConfig;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing(LogFormat::from_env());

    let config = match std::env::var("BROKER_CONFIG") {
        Ok(path) => BrokerConfig::load(&path).with_context(|| format!("loading {path}"))?,
        Err(_) => BrokerConfig::from_env(),
    };

    info!("Starting Broker Kit worker v{}", env!("CARGO_PKG_VERSION"));
    info!(
        environment = %config.environment,
        ack_mode = ?config.ack_mode,
        "Loaded broker configuration"
    );

    let manager = AmqpManager::amqp(config);
    manager.connect().await.context("connecting to broker")?;

    if let Ok(queue) = std::env::var("WORKER_QUEUE") {
        let exchange = std::env::var("WORKER_EXCHANGE").unwrap_or_default();
        let declared = manager.setup(&queue, &exchange, true).await?;
        let deliveries = manager.consume(&declared.name, Default::default()).await?;
        manager.handle_messages(&declared.name, deliveries, |body| async move {
            info!(body = %String::from_utf8_lossy(&body), "Received message");
            Ok(())
        });
    }

    let state = Arc::new(AppState::new(manager.clone()));
    let app = handlers::router(state).layer(TraceLayer::new_for_http());

    let port = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(3017);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    manager.shutdown().await?;
    info!("Worker stopped");
    Ok(())
}
