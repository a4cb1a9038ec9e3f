//! `RelayServer`: Axum HTTP + WebSocket listener.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::json;
use tether_runtime::LifecycleManager;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::auth::{AuthError, IdentityProvider, authenticate_request};
use crate::config::ServerConfig;
use crate::errors::ServerError;
use crate::health::{self, HealthResponse};
use crate::metrics::WS_REJECTED_TOTAL;
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::session::{SessionOptions, run_ws_session};

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Relay core.
    pub lifecycle: Arc<LifecycleManager>,
    /// Credential verifier.
    pub identity: Arc<dyn IdentityProvider>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// Listener and transport settings.
    pub config: Arc<ServerConfig>,
    /// Prometheus handle for `/metrics`.
    pub metrics: PrometheusHandle,
    /// When the server started.
    pub start_time: Instant,
}

/// Optional `?token=` on upgrade and API requests.
#[derive(Debug, Default, Deserialize)]
pub struct TokenQuery {
    /// Bearer token, for clients that cannot set headers on upgrade.
    pub token: Option<String>,
}

/// The relay's network front end.
pub struct RelayServer {
    config: Arc<ServerConfig>,
    lifecycle: Arc<LifecycleManager>,
    identity: Arc<dyn IdentityProvider>,
    shutdown: Arc<ShutdownCoordinator>,
    metrics: PrometheusHandle,
    start_time: Instant,
}

impl RelayServer {
    /// Create a new server.
    pub fn new(
        config: ServerConfig,
        lifecycle: Arc<LifecycleManager>,
        identity: Arc<dyn IdentityProvider>,
        metrics: PrometheusHandle,
    ) -> Self {
        Self {
            config: Arc::new(config),
            lifecycle,
            identity,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            metrics,
            start_time: Instant::now(),
        }
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            lifecycle: Arc::clone(&self.lifecycle),
            identity: Arc::clone(&self.identity),
            shutdown: Arc::clone(&self.shutdown),
            config: Arc::clone(&self.config),
            metrics: self.metrics.clone(),
            start_time: self.start_time,
        };

        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/api/live-location/active-sessions", get(active_sessions_handler))
            .route("/metrics", get(metrics_handler))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    /// Bind and serve in the background until shutdown.
    ///
    /// Returns the bound address (useful with port `0`) and the serve task.
    pub async fn listen(&self) -> Result<(SocketAddr, JoinHandle<()>), ServerError> {
        let addr = self.config.bind_addr();
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr: addr.clone(), source })?;
        let local = listener.local_addr()?;

        let router = self.router();
        let token = self.shutdown.token();
        info!(addr = %local, "relay listening");

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
            {
                warn!(error = %e, "server stopped with error");
            }
        });
        Ok((local, handle))
    }

    /// Relay core.
    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    /// Shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

fn json_error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "success": false, "error": message }))).into_response()
}

/// GET /ws
///
/// Refusals happen before the upgrade so clients see a plain HTTP status.
async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if state.shutdown.is_shutting_down() {
        counter!(WS_REJECTED_TOTAL, "reason" => "shutting_down").increment(1);
        return json_error(StatusCode::SERVICE_UNAVAILABLE, "Server is shutting down");
    }
    if state.lifecycle.registry().connection_count() >= state.config.max_connections {
        counter!(WS_REJECTED_TOTAL, "reason" => "capacity").increment(1);
        warn!(max = state.config.max_connections, "connection limit reached");
        return json_error(StatusCode::SERVICE_UNAVAILABLE, "Too many connections");
    }

    let principal = match authenticate_request(state.identity.as_ref(), &headers, query.token.as_deref()) {
        Ok(p) => p,
        Err(AuthError::MissingCredential) => {
            counter!(WS_REJECTED_TOTAL, "reason" => "missing_token").increment(1);
            debug!("rejected upgrade without a token");
            return json_error(StatusCode::UNAUTHORIZED, "No token provided");
        }
        Err(e) => {
            counter!(WS_REJECTED_TOTAL, "reason" => "invalid_token").increment(1);
            debug!(error = %e, "rejected upgrade");
            return json_error(StatusCode::UNAUTHORIZED, "Invalid token");
        }
    };

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let options = SessionOptions::from(state.config.as_ref());
    let cancel = state.shutdown.child_token();
    let lifecycle = Arc::clone(&state.lifecycle);
    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| run_ws_session(socket, principal, lifecycle, options, cancel))
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let registry = state.lifecycle.registry();
    Json(health::health_check(
        state.start_time,
        state.shutdown.is_shutting_down(),
        registry.connection_count(),
        registry.principal_count(),
        state.lifecycle.store().active_count(),
    ))
}

/// GET /api/live-location/active-sessions
///
/// 401 without a token, 403 with one that does not verify.
async fn active_sessions_handler(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> Response {
    let principal = match authenticate_request(state.identity.as_ref(), &headers, query.token.as_deref()) {
        Ok(p) => p,
        Err(AuthError::MissingCredential) => {
            return json_error(StatusCode::UNAUTHORIZED, "No token provided");
        }
        Err(e) => {
            debug!(error = %e, "rejected active-sessions request");
            return json_error(StatusCode::FORBIDDEN, "Invalid token");
        }
    };

    let sessions = state.lifecycle.active_sessions_for(&principal);
    Json(json!({ "success": true, "sessions": sessions })).into_response()
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        crate::metrics::render(&state.metrics),
    )
}
