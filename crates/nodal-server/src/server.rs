use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::http::{HeaderValue, Method};
use axum::routing::get;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::info;

use libnodal::{ExecutionWorker, LuaEngine, UserRegistry};
use nodal_protocol::ClientConfig;

use crate::config::ServerConfig;
use crate::session;

/// Per-connection protocol timings, fixed at startup.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub client: ClientConfig,
    pub batch_interval: Duration,
    pub login_timeout: Duration,
}

pub struct AppState {
    pub registry: Arc<UserRegistry>,
    pub worker: ExecutionWorker,
    pub settings: SessionSettings,
}

impl AppState {
    pub fn new(config: &ServerConfig, storage_root: PathBuf) -> Self {
        Self {
            registry: Arc::new(UserRegistry::new(storage_root, config.flood_threshold())),
            worker: ExecutionWorker::new(Arc::new(LuaEngine::new())),
            settings: SessionSettings {
                client: config.client_config(),
                batch_interval: config.batch_interval(),
                login_timeout: config.login_timeout(),
            },
        }
    }
}

/// Builds the HTTP surface: `GET /ws` for sessions and `GET /health`.
///
/// The storage root is made absolute here because worker threads change the
/// process working directory while scripts run.
pub fn app(config: &ServerConfig) -> Result<Router> {
    let storage_root = std::path::absolute(&config.storage_dir).with_context(|| {
        format!("invalid storage directory {}", config.storage_dir.display())
    })?;
    std::fs::create_dir_all(&storage_root)
        .with_context(|| format!("failed to create {}", storage_root.display()))?;

    let state = Arc::new(AppState::new(config, storage_root));
    let cors = build_cors(&config.allow_origins)?;

    Ok(Router::new()
        .route("/ws", get(session::ws_handler))
        .route("/health", get(health))
        .layer(cors)
        .with_state(state))
}

async fn health() -> &'static str {
    "ok"
}

fn build_cors(origins: &[String]) -> Result<CorsLayer> {
    if origins.iter().any(|o| o == "*") {
        return Ok(CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::OPTIONS])
            .allow_headers(Any));
    }

    let mut headers = Vec::with_capacity(origins.len());
    for origin in origins {
        headers.push(
            HeaderValue::from_str(origin)
                .with_context(|| format!("invalid allow_origins value: {origin}"))?,
        );
    }

    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list(headers))
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any))
}

/// Serves `app` on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, app: Router, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("server error")
}

pub async fn run(config: ServerConfig) -> Result<()> {
    let app = app(&config)?;
    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind listener on {}", config.listen))?;
    info!(
        addr = %listener.local_addr()?,
        storage = %config.storage_dir.display(),
        "nodal-server listening"
    );

    serve(listener, app, async {
        tokio::signal::ctrl_c().await.ok();
        info!("shutting down...");
    })
    .await
}
