//! HTTP and WebSocket handlers for the Scribe server.
//!
//! A handshake on `{websocket_path}/{documentId}` is authenticated and
//! admitted before the upgrade; a rejected handshake never reaches the hub.

use crate::auth::Authenticator;
use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard, MeteredConnection};
use anyhow::Result;
use axum::{
    extract::{ws::WebSocket, ConnectInfo, Path, Query, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use scribe_core::{
    admit, AccessPolicy, AdmissionError, AllowAuthenticated, Hub, HubHandle, Identity, Session,
};
use scribe_transport::{AxumConnection, WireFormat};
use serde::Deserialize;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// Handle to the collaboration hub.
    pub hub: HubHandle,
    /// Server configuration.
    pub config: Config,
    /// Token verification.
    pub auth: Authenticator,
    /// Per-document access decisions.
    pub policy: Arc<dyn AccessPolicy>,
}

impl AppState {
    /// Create app state admitting every authenticated user.
    #[must_use]
    pub fn new(config: Config, hub: HubHandle) -> Self {
        let auth = Authenticator::new(config.auth.jwt_secret.as_deref());
        Self {
            hub,
            config,
            auth,
            policy: Arc::new(AllowAuthenticated),
        }
    }

    /// Replace the access policy.
    #[must_use]
    pub fn with_policy(mut self, policy: Arc<dyn AccessPolicy>) -> Self {
        self.policy = policy;
        self
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConnectParams {
    token: Option<String>,
    /// `json` for clients that read text frames before they send anything.
    format: Option<String>,
}

impl ConnectParams {
    fn wire_format(&self) -> WireFormat {
        match self.format.as_deref() {
            Some(format) if format.eq_ignore_ascii_case("json") => WireFormat::Json,
            _ => WireFormat::Binary,
        }
    }
}

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    let document_route = format!(
        "{}/:document_id",
        state.config.transport.websocket_path.trim_end_matches('/')
    );

    Router::new()
        .route(&document_route, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server until Ctrl-C or SIGTERM.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    if config.auth.jwt_secret.is_none() {
        warn!("No JWT secret configured, every connection will be rejected");
    }

    let (hub, hub_task) = Hub::spawn(config.hub_config());
    if config.metrics.enabled {
        match metrics::start_metrics_server(config.metrics.port) {
            Ok(()) => {
                tokio::spawn(metrics::track_hub(hub.clone(), metrics::HUB_POLL_INTERVAL));
            }
            Err(e) => error!("Failed to start metrics server: {}", e),
        }
    }
    let state = Arc::new(AppState::new(config.clone(), hub));

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Scribe server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}/{{documentId}}",
        addr,
        config.transport.websocket_path.trim_end_matches('/')
    );

    serve(listener, state, shutdown_signal()).await?;
    if let Err(e) = hub_task.await {
        error!("Hub task failed: {}", e);
    }
    Ok(())
}

/// Serve on `listener` until `shutdown` resolves, then stop the hub.
///
/// # Errors
///
/// Returns an error if the listener fails.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let hub = state.hub.clone();
    let app = router(state);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown.await;
        info!("Shutting down");
        // Releasing every session lets open sockets finish.
        if hub.shutdown().await.is_err() {
            debug!("Hub already stopped");
        }
    })
    .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Hub statistics handler.
async fn stats_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.hub.stats().await {
        Ok(stats) => {
            metrics::set_active_rooms(stats.room_count);
            Json(stats).into_response()
        }
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(document_id): Path<String>,
    Query(params): Query<ConnectParams>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    let identity = match state.auth.authenticate(&headers, params.token.as_deref()) {
        Ok(identity) => identity,
        Err(e) => return reject(&remote, &document_id, e.into()),
    };

    if let Err(e) = admit(state.policy.as_ref(), &identity, &document_id).await {
        return reject(&remote, &document_id, e);
    }

    let format = params.wire_format();
    let max_message_size = state.config.limits.max_message_size;
    ws.max_message_size(max_message_size).on_upgrade(move |socket| {
        handle_websocket(socket, state, document_id, identity, remote, format)
    })
}

fn reject(remote: &SocketAddr, document_id: &str, err: AdmissionError) -> Response {
    let status = match err {
        AdmissionError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
        AdmissionError::InvalidDocument(_) => StatusCode::BAD_REQUEST,
        AdmissionError::Forbidden { .. } => StatusCode::FORBIDDEN,
    };
    debug!(remote = %remote, document = %document_id, error = %err, "Handshake rejected");
    metrics::record_rejection(err.reason());
    (status, err.to_string()).into_response()
}

/// Run an admitted WebSocket as a session.
async fn handle_websocket(
    socket: WebSocket,
    state: Arc<AppState>,
    document_id: String,
    identity: Identity,
    remote: SocketAddr,
    format: WireFormat,
) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let connection = AxumConnection::new(socket)
        .with_max_message_size(state.config.limits.max_message_size)
        .with_wire_format(format)
        .with_remote_addr(remote.to_string());
    let session = Session::new(document_id, identity, state.config.session_config());

    let outcome = session
        .run(
            state.hub.clone(),
            Box::new(MeteredConnection::new(Box::new(connection))),
        )
        .await;
    metrics::record_outcome(outcome);

    if let Ok(stats) = state.hub.stats().await {
        metrics::set_active_rooms(stats.room_count);
    }
}
