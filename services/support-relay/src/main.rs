//! Support Relay
//!
//! Single-binary Rust service that:
//! 1. Loads a pool of Gemini API keys from the environment
//! 2. Accepts customer questions on `POST /api/ask-ai`
//! 3. Renders them into the support prompt and asks Gemini
//! 4. Rotates to the next key when one runs out of quota

mod admin;
mod config;
mod error;
mod metrics;
mod relay;
mod service;

use anyhow::{Context, Result};
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, Method};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use generation::{Credential, GeminiGenerator, PromptTemplate};
use key_pool::{FailoverExecutor, KeyPool};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use metrics_exporter_prometheus::PrometheusHandle;

use crate::admin::AdminState;
use crate::config::Config;
use crate::relay::RelayState;
use crate::service::{
    DRAIN_TIMEOUT, ServiceAction, ServiceEvent, ServiceMetrics, ServiceState, handle_event,
};

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    relay: RelayState,
    pool: Arc<KeyPool>,
    prometheus: PrometheusHandle,
}

/// Build the axum router with all public routes and shared state.
///
/// `max_connections` bounds concurrently handled requests.
fn build_router(state: AppState, max_connections: usize, cors: CorsLayer) -> Router {
    Router::new()
        .route("/api/ask-ai", post(ask_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(cors)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

/// CORS for the browser frontend. No configured origins allows any origin.
fn cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.is_empty() {
        AllowOrigin::from(Any)
    } else {
        let parsed: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|o| match o.parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!(origin = %o, "skipping invalid CORS origin");
                    None
                }
            })
            .collect();
        AllowOrigin::list(parsed)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
        .max_age(Duration::from_secs(3600))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting support-relay");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

    let state = ServiceState::Initializing;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let mut config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        base_url = %config.backend.base_url,
        model = %config.backend.model,
        keys = config.pool.keys.len(),
        cooldown_secs = config.pool.cooldown_secs,
        "configuration loaded"
    );

    // Transition: Initializing -> Starting (or Stopped with no keys)
    let (state, action) = handle_event(
        state,
        ServiceEvent::ConfigLoaded {
            listen_addr: config.server.listen_addr,
            keys: config.pool.keys.len(),
        },
    );
    let listen_addr = match action {
        ServiceAction::StartListener { addr } => addr,
        ServiceAction::Shutdown { exit_code } => {
            error!(exit_code, ?state, "no API keys configured, refusing to start");
            return Err(error::Error::EmptyKeyPool.into());
        }
        _ => anyhow::bail!("unexpected action after ConfigLoaded: {action:?}"),
    };

    let template = PromptTemplate::new(std::mem::take(&mut config.prompt.template))
        .context("invalid prompt template")?;

    let keys: Vec<Credential> = std::mem::take(&mut config.pool.keys)
        .into_iter()
        .map(Credential::from)
        .collect();
    let pool = Arc::new(KeyPool::new(
        keys,
        Duration::from_secs(config.pool.cooldown_secs),
    ));

    let generator = Arc::new(GeminiGenerator::new(
        reqwest::Client::new(),
        config.backend.base_url.clone(),
        config.backend.model.clone(),
        Duration::from_secs(config.backend.timeout_secs),
    ));

    let mut executor = FailoverExecutor::new(pool.clone(), generator, template);
    if let Some(fallback) = config.prompt.fallback_answer.take() {
        executor = executor.with_fallback_answer(fallback);
    }

    let service_metrics = ServiceMetrics::new();
    // Fired on drain timeout to abort generations still in flight
    let abort = CancellationToken::new();
    // Fired on shutdown signal to stop accepting connections
    let shutdown = CancellationToken::new();

    let app_state = AppState {
        relay: RelayState {
            executor: Arc::new(executor),
            metrics: service_metrics.clone(),
            cancel: abort.clone(),
        },
        pool: pool.clone(),
        prometheus: prometheus_handle,
    };

    let app = build_router(
        app_state,
        config.server.max_connections,
        cors_layer(&config.server.cors_origins),
    );

    let listener = match TcpListener::bind(listen_addr).await {
        Ok(l) => l,
        Err(source) => {
            let _ = handle_event(state, ServiceEvent::ListenerFailed(source.to_string()));
            return Err(error::Error::Listener {
                addr: listen_addr,
                source,
            }
            .into());
        }
    };

    if let Some(admin_addr) = config.server.admin_listen_addr {
        let admin_listener = TcpListener::bind(admin_addr)
            .await
            .map_err(|source| error::Error::Listener {
                addr: admin_addr,
                source,
            })?;
        let admin_app = admin::build_admin_router(AdminState::new(pool.clone()));
        let admin_shutdown = shutdown.clone();
        info!(addr = %admin_addr, "admin API listening");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(admin_listener, admin_app)
                .with_graceful_shutdown(async move { admin_shutdown.cancelled().await })
                .await
            {
                error!(error = %e, "admin server error");
            }
        });
    }

    // Transition: Starting -> Running
    let (state, _action) = handle_event(state, ServiceEvent::ListenerReady);
    info!(addr = %listen_addr, keys = pool.len(), "state: Running, accepting requests");

    let server_shutdown = shutdown.clone();
    let mut server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await
    });

    shutdown_signal().await;

    // Transition: Running -> Draining. The drain deadline starts at signal
    // receipt, not at server start.
    let (state, action) = handle_event(state, ServiceEvent::ShutdownSignal);
    if action == ServiceAction::BeginDrain {
        shutdown.cancel();
    }

    let drained = match tokio::time::timeout(DRAIN_TIMEOUT, &mut server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
            true
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
            true
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
            true
        }
        Err(_) => false,
    };

    if drained {
        let _ = handle_event(state, ServiceEvent::DrainComplete);
    } else {
        let (_state, action) = handle_event(state, ServiceEvent::DrainTimeout);
        if action == ServiceAction::AbortInFlight {
            warn!(
                remaining = service_metrics.in_flight.load(Ordering::Relaxed),
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, cancelling in-flight generations"
            );
            abort.cancel();
            // Cancelled handlers answer immediately; give them a moment to flush
            if tokio::time::timeout(Duration::from_secs(1), &mut server_handle)
                .await
                .is_err()
            {
                server_handle.abort();
            }
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// POST /api/ask-ai
async fn ask_handler(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    relay::ask(&state.relay, &headers, body, request_id).await
}

/// Health endpoint: pool summary plus uptime and request counters.
/// Returns 503 when no API keys are configured.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let metrics = &state.relay.metrics;
    let mut body = state.pool.health().await;
    if let Some(obj) = body.as_object_mut() {
        obj.insert(
            "uptime_seconds".into(),
            metrics.started_at.elapsed().as_secs().into(),
        );
        obj.insert(
            "requests_served".into(),
            metrics.requests_total.load(Ordering::Relaxed).into(),
        );
        obj.insert(
            "errors_total".into(),
            metrics.errors_total.load(Ordering::Relaxed).into(),
        );
        obj.insert(
            "in_flight".into(),
            metrics.in_flight.load(Ordering::Relaxed).into(),
        );
    }

    let status_code = if state.pool.is_empty() {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    } else {
        axum::http::StatusCode::OK
    };

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
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
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
