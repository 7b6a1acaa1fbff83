//! Axum gateway server

use axum::{
    routing::{delete, get, post},
    Router,
};
use canopy_core::error::{CanopyError, Result};
use canopy_core::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::api::{self, AppState};
use crate::ws;

/// Server configuration
pub struct ServerConfig {
    pub port: u16,
    pub address: String,
    pub cors_enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 4710,
            address: "127.0.0.1".to_string(),
            cors_enabled: true,
        }
    }
}

impl ServerConfig {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn with_cors(mut self, enabled: bool) -> Self {
        self.cors_enabled = enabled;
        self
    }
}

/// Build the router with all API and WebSocket routes
pub fn build_router(state: AppState, cors_enabled: bool) -> Router {
    let api_routes = Router::new()
        .route("/health", get(api::get_health))
        .route("/worktrees", get(api::list_worktrees))
        .route("/worktrees", post(api::create_worktree))
        .route("/worktrees/{name}", delete(api::delete_worktree))
        .route("/worktrees/{name}/services/{op}", post(api::services_op))
        .route(
            "/worktrees/{name}/services/{service}/{op}",
            post(api::service_op),
        )
        .route("/ports", get(api::get_ports));

    let router = Router::new()
        .nest("/api", api_routes)
        // WebSocket surface: control channel at the root, terminals and
        // log streams per workspace.
        .route("/", get(ws::control_ws_handler))
        .route("/terminal/{workspace}", get(ws::terminal_ws_handler))
        .route("/logs/{workspace}", get(ws::logs_ws_handler))
        .route(
            "/logs/{workspace}/{service}",
            get(ws::service_logs_ws_handler),
        )
        .with_state(state);

    if cors_enabled {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
        router.layer(cors)
    } else {
        router
    }
}

/// Start the gateway for a built context.
pub async fn serve(ctx: Arc<Context>, config: ServerConfig) -> Result<()> {
    let state = AppState::new(ctx);
    let app = build_router(state, config.cors_enabled);

    let addr: SocketAddr = format!("{}:{}", config.address, config.port)
        .parse()
        .map_err(|_| CanopyError::ServerBindFailed {
            address: format!("{}:{}", config.address, config.port),
        })?;
    tracing::info!(category = "gateway", %addr, "Starting gateway");

    let listener =
        tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|_| CanopyError::ServerBindFailed {
                address: addr.to_string(),
            })?;
    axum::serve(listener, app)
        .await
        .map_err(|e| CanopyError::Internal(e.to_string()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 4710);
        assert_eq!(config.address, "127.0.0.1");
        assert!(config.cors_enabled);
    }

    #[test]
    fn test_server_config_builder() {
        let config = ServerConfig::new(8080)
            .with_address("0.0.0.0")
            .with_cors(false);
        assert_eq!(config.port, 8080);
        assert_eq!(config.address, "0.0.0.0");
        assert!(!config.cors_enabled);
    }
}
