//! HTTP request handlers for the worker.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::messaging::{BrokerConnectionManager, ConnectionState, Transport};

/// Application state shared across handlers.
pub struct AppState<T: Transport> {
    pub manager: BrokerConnectionManager<T>,
    pub started_at: DateTime<Utc>,
}

impl<T: Transport> AppState<T> {
    pub fn new(manager: BrokerConnectionManager<T>) -> Self {
        Self {
            manager,
            started_at: Utc::now(),
        }
    }
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: String,
    version: String,
    connection: ConnectionState,
    connected_since: Option<DateTime<Utc>>,
    tracked_channels: usize,
    reconnects: u64,
    uptime_secs: i64,
}

/// Health check endpoint. Reports 503 unless the broker connection is up.
pub async fn health_check<T: Transport>(
    State(state): State<Arc<AppState<T>>>,
) -> (StatusCode, Json<HealthResponse>) {
    let connection = state.manager.state().await;
    let (code, status) = match connection {
        ConnectionState::Connected => (StatusCode::OK, "healthy"),
        _ => (StatusCode::SERVICE_UNAVAILABLE, "degraded"),
    };

    let body = HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        connection,
        connected_since: state.manager.connected_since().await,
        tracked_channels: state.manager.tracked_channels().await,
        reconnects: state.manager.reconnect_count(),
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
    };
    (code, Json(body))
}

/// Routes served by the worker.
pub fn router<T: Transport>(state: Arc<AppState<T>>) -> Router {
    Router::new()
        .route("/health", get(health_check::<T>))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::MemoryTransport;
    use crate::types::BrokerConfig;

    fn state(transport: &MemoryTransport) -> Arc<AppState<MemoryTransport>> {
        let manager = BrokerConnectionManager::new(BrokerConfig::with_uri("memory://"), transport.clone());
        Arc::new(AppState::new(manager))
    }

    #[tokio::test]
    async fn test_health_reports_connected() {
        let transport = MemoryTransport::new();
        let state = state(&transport);
        state.manager.connect().await.unwrap();
        state.manager.channel_by_name("orders").await.unwrap();

        let (code, Json(body)) = health_check(State(Arc::clone(&state))).await;

        assert_eq!(code, StatusCode::OK);
        assert_eq!(body.status, "healthy");
        assert_eq!(body.connection, ConnectionState::Connected);
        assert_eq!(body.tracked_channels, 1);
        assert!(body.connected_since.is_some());
    }

    #[tokio::test]
    async fn test_health_degraded_before_connect() {
        let transport = MemoryTransport::new();

        let (code, Json(body)) = health_check(State(state(&transport))).await;

        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body.connection, ConnectionState::Disconnected);
    }
}
