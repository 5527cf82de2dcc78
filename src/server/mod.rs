//! HTTP server for the operational surface
//!
//! Wraps the router in request tracing and ties its lifetime to the
//! process shutdown signal.

pub mod router;

pub use router::{build_router, AppState, HealthResponse};

use std::future::Future;
use std::net::SocketAddr;

use tokio::net::TcpListener;

use crate::config::ServerConfig;

/// HTTP server for sportswire-sync
pub struct Server {
    config: ServerConfig,
    state: AppState,
}

impl Server {
    pub fn new(config: ServerConfig, state: AppState) -> Self {
        Self { config, state }
    }

    /// Get the configured bind address
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(
            self.config.host.parse().unwrap_or([127, 0, 0, 1].into()),
            self.config.port,
        )
    }

    /// Run the server until `shutdown` resolves
    pub async fn run(
        self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(), ServerError> {
        let addr = self.bind_addr();
        let app = build_router(self.state).layer(tower_http::trace::TraceLayer::new_for_http());

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind(e.to_string()))?;

        tracing::info!("Server listening on {}", addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| ServerError::Serve(e.to_string()))?;

        tracing::info!("Server shutdown complete");
        Ok(())
    }
}

/// Server error types
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Failed to bind to address
    #[error("Failed to bind to address: {0}")]
    Bind(String),

    /// Failed to serve requests
    #[error("Server error: {0}")]
    Serve(String),
}
