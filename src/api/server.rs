//! API server for cache administration

use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::context::CacheContext;

use super::routes::{health_check, invalidate, invalidation_info, AppState};

/// Configuration for the API server
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Build the router over shared cache services
pub fn router(context: Arc<CacheContext>) -> Router {
    let app_state = Arc::new(AppState { context });

    Router::new()
        .route("/health", get(health_check))
        .route("/cache/invalidate", post(invalidate).get(invalidation_info))
        .with_state(app_state)
        .layer(CorsLayer::permissive())
}

/// API server
pub struct ApiServer {
    config: ApiServerConfig,
    context: Arc<CacheContext>,
}

impl ApiServer {
    /// Create a new API server with configuration
    pub fn new(config: ApiServerConfig, context: Arc<CacheContext>) -> Self {
        Self { config, context }
    }

    /// Create a new API server with default configuration
    pub fn with_defaults(context: Arc<CacheContext>) -> Self {
        Self::new(ApiServerConfig::default(), context)
    }

    /// Serve until Ctrl-C
    pub async fn start(self) -> Result<()> {
        let app = router(Arc::clone(&self.context));

        let addr = format!("{}:{}", self.config.host, self.config.port);
        info!("Starting API server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        info!("API server stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for shutdown signal: {}", e);
    }
}
