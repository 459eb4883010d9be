//! Modelgate Proxy Library
//!
//! A model-aware admission-control reverse proxy for LLM-style inference
//! backends. Clients send JSON bodies naming a `model`; the proxy admits at
//! most a configured number of concurrent requests per model, streams the
//! origin's response back, and reports per-pool queue state on change.
//!
//! This library can be embedded (see [`run_server`]) or used through the
//! `modelgate` binary.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

pub mod config;
pub mod error;
pub mod forwarder;
pub mod handler;
pub mod payload;
pub mod state;

pub use config::Config;
pub use state::AppState;

use modelgate_core::{spawn_reporters, ModelCapacity};

/// Server configuration for the proxy.
///
/// The timeout fields carry the deployed defaults; tests shorten them.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on.
    pub listen_addr: String,

    /// Origin requests are forwarded to.
    pub backend_url: String,

    /// Per-model admission capacities.
    pub models: Vec<ModelCapacity>,

    /// Capacity of the catch-all `default` pool.
    pub default_capacity: usize,

    /// Maximum admission wait before a request is rejected with a 503.
    pub admission_wait: Duration,

    /// Absolute bound on a request from receipt to terminal state.
    pub lifecycle_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            backend_url: "http://127.0.0.1:11434".to_string(),
            models: Vec::new(),
            default_capacity: 100,
            admission_wait: Duration::from_secs(75),
            lifecycle_timeout: Duration::from_secs(99),
        }
    }
}

impl From<Config> for ServerConfig {
    fn from(config: Config) -> Self {
        Self {
            listen_addr: config.listen_addr,
            backend_url: config.backend_url,
            models: config
                .models
                .into_iter()
                .map(|(name, entry)| ModelCapacity::new(name, entry.capacity))
                .collect(),
            default_capacity: config.default_capacity,
            ..Self::default()
        }
    }
}

/// Build the router.
///
/// Every method and path belongs to the origin, so the only route is the
/// fallback; local routes would shadow origin paths. A defect that panics
/// inside the handler unwinds through the request's guards (releasing any
/// held admission slot) and surfaces as a 500.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .fallback(handler::proxy_request)
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::new())
        .with_state(state)
}

/// Run the proxy server until SIGINT or SIGTERM.
///
/// Construction order is explicit: state (pools + upstream client), then
/// reporters, then the listener. On shutdown the listener stops accepting,
/// in-flight requests drain (each is bounded by the lifecycle ceiling), and
/// the registry is shut down so the reporters exit.
pub async fn run_server(config: ServerConfig) -> anyhow::Result<()> {
    info!(
        listen_addr = %config.listen_addr,
        backend_url = %config.backend_url,
        "starting modelgate v{}",
        env!("CARGO_PKG_VERSION")
    );

    let state = Arc::new(AppState::new(&config)?);
    for pool in state.registry.pools() {
        info!(model = %pool.name(), capacity = pool.capacity(), "admission pool ready");
    }
    let reporters = spawn_reporters(&state.registry);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!("modelgate listening on http://{}", config.listen_addr);

    axum::serve(
        listener,
        app(Arc::clone(&state)).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    state.registry.shutdown();
    for reporter in reporters {
        reporter.await?;
    }
    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received, draining in-flight requests");
}
