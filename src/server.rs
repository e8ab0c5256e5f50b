use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::{HeaderValue, Method},
    response::{Json, Redirect},
    routing::get,
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};

use crate::{
    auth,
    config::Config,
    error::Result,
    mcp::{router::MessageRouter, websocket},
    registry::ConnectionRegistry,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<ConnectionRegistry>,
    pub router: Arc<MessageRouter>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let router = Arc::new(MessageRouter::new(Arc::clone(&registry)));
        Self {
            config: Arc::new(config),
            registry,
            router,
        }
    }
}

pub async fn run_server(config: Config) -> Result<()> {
    let state = AppState::new(config);

    let pending_timeout = Duration::from_secs(state.config.websocket.pending_timeout);
    let idle_timeout = match state.config.websocket.idle_timeout {
        0 => None,
        seconds => Some(Duration::from_secs(seconds)),
    };
    let _maintenance = state.router.spawn_maintenance(pending_timeout, idle_timeout);

    let address = state.config.server_address();
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&address).await?;
    info!("MCP endpoint server listening on {}", address);
    info!(
        "tool server endpoint: ws://{}/mcp_endpoint/mcp/  caller endpoint: ws://{}/mcp_endpoint/call/",
        address, address
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("server stopped");
    Ok(())
}

pub fn build_router(state: AppState) -> Router {
    let mut app = Router::new()
        .route("/", get(redirect_root))
        .route("/mcp_endpoint/", get(root_info))
        .route("/mcp_endpoint/health", get(health_check))
        .route("/mcp_endpoint/mcp/", get(websocket::tool_server_handler))
        .route("/mcp_endpoint/call/", get(websocket::caller_handler));

    if state.config.security.enable_cors {
        app = app.layer(build_cors(&state.config.security.allowed_origins));
    }

    app.layer(TraceLayer::new_for_http()).with_state(state)
}

fn build_cors(allowed_origins: &str) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    if allowed_origins.trim() == "*" {
        cors.allow_origin(Any)
    } else {
        let origins: Vec<HeaderValue> = allowed_origins
            .split(',')
            .filter_map(|origin| origin.trim().parse().ok())
            .collect();
        cors.allow_origin(origins)
    }
}

async fn redirect_root() -> Redirect {
    Redirect::temporary("/mcp_endpoint/")
}

async fn root_info() -> Json<Value> {
    Json(json!({
        "message": "MCP Endpoint Server",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
    }))
}

#[derive(Debug, Deserialize)]
struct HealthQuery {
    key: Option<String>,
}

async fn health_check(
    State(state): State<AppState>,
    Query(query): Query<HealthQuery>,
) -> Result<Json<Value>> {
    let provided = query.key.unwrap_or_default();
    if !auth::verify_health_key(&provided, &state.config.server.key) {
        return Ok(Json(json!({ "status": "key_error" })));
    }

    Ok(Json(json!({
        "status": "success",
        "connections": state.registry.stats(),
    })))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {}", e);
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
                error!("failed to install SIGTERM handler: {}", e);
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
    info!("shutdown signal received");
}
