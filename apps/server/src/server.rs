// SPDX-FileCopyrightText: © 2025 WebMCast Contributors
//
// SPDX-License-Identifier: MPL-2.0

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{any, get};
use axum::Router;
use futures::TryStreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info, warn};

use webmcast_core::error::EngineError;
use webmcast_engine::{ClaimOutcome, Registry, RegistryConfig, SubscriberQueue};

use crate::config::Config;

struct AppState {
    registry: Arc<Registry>,
}

/// Builds the axum app and returns it alongside the address it should bind.
///
/// # Errors
///
/// Returns an error if `config.server.address` is not a valid socket address.
pub fn create_app(config: &Config) -> Result<(Router, SocketAddr), Box<dyn std::error::Error>> {
    let (router, addr, _registry) = build_app(config)?;
    Ok((router, addr))
}

fn build_app(
    config: &Config,
) -> Result<(Router, SocketAddr, Arc<Registry>), Box<dyn std::error::Error>> {
    let addr: SocketAddr = config.server.address.parse()?;

    let registry_config: RegistryConfig = config.limits.to_registry_config();
    let registry = Registry::new(registry_config);
    let state = Arc::new(AppState { registry: registry.clone() });

    let router = Router::new()
        .route("/healthz", get(health_handler))
        .route("/stream/{name}", any(stream_handler))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http());

    Ok((router, addr, registry))
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

async fn stream_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    method: Method,
    request: axum::extract::Request<Body>,
) -> Response {
    if name.contains('/') {
        return (StatusCode::BAD_REQUEST, "stream name must not contain '/'").into_response();
    }

    match method {
        Method::POST | Method::PUT => handle_publish(&state, name, request).await,
        Method::GET | Method::HEAD => handle_subscribe(&state, name).await,
        _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
    }
}

async fn handle_publish(
    state: &AppState,
    name: String,
    request: axum::extract::Request<Body>,
) -> Response {
    let channel = match state.registry.claim(&name) {
        Ok(ClaimOutcome::Created(channel)) => channel,
        Ok(ClaimOutcome::Reclaimed(channel)) => {
            if let Err(err) = channel.reclaim().await {
                error!(stream = %name, error = %err, "failed to reset channel for reclaiming publisher");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
            channel
        }
        Err(EngineError::NameTaken(name)) => {
            return (StatusCode::FORBIDDEN, format!("stream '{name}' is already live")).into_response();
        }
        Err(err) => {
            error!(stream = %name, error = %err, "unexpected error claiming stream");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let mut body = request.into_body().into_data_stream();
    let mut publish_error = None;

    loop {
        match body.try_next().await {
            Ok(Some(chunk)) => {
                if let Err(err) = channel.publish(chunk).await {
                    publish_error = Some(err);
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                warn!(stream = %name, error = %err, "error reading publisher request body");
                break;
            }
        }
    }

    channel.publisher_ended();
    state.registry.release(name.clone(), channel);

    match publish_error {
        Some(EngineError::MalformedEbml(msg)) => {
            (StatusCode::BAD_REQUEST, format!("malformed EBML: {msg}")).into_response()
        }
        Some(err) => {
            error!(stream = %name, error = %err, "unexpected error publishing");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn handle_subscribe(state: &AppState, name: String) -> Response {
    let Some(channel) = state.registry.lookup(&name) else {
        return (StatusCode::NOT_FOUND, format!("stream '{name}' is not live")).into_response();
    };

    let queue = Arc::new(SubscriberQueue::new(state.registry.max_enqueued_frames()));
    let slot = match channel.connect(queue.clone()).await {
        Ok(slot) => slot,
        Err(err) => {
            error!(stream = %name, error = %err, "failed to attach subscriber");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    info!(stream = %name, "subscriber attached");

    let (tx, rx) = tokio::sync::mpsc::channel::<Result<bytes::Bytes, std::io::Error>>(8);
    tokio::spawn(async move {
        while let Some(chunk) = queue.recv().await {
            if tx.send(Ok(chunk)).await.is_err() {
                break;
            }
        }
        channel.disconnect(slot);
    });

    let body = Body::from_stream(ReceiverStream::new(rx));
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "video/webm")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Starts the HTTP server and blocks until a shutdown signal is received.
///
/// # Errors
///
/// Returns an error if the configured address cannot be bound.
///
/// # Panics
///
/// Panics if the Ctrl+C or SIGTERM signal handler cannot be installed, which
/// indicates a critical OS failure.
pub async fn start_server(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let (app, addr, registry) = build_app(config)?;

    info!(address = %addr, "starting webmcast HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    #[allow(clippy::expect_used)]
    let shutdown_signal = async move {
        let ctrl_c = async {
            tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install signal handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            () = ctrl_c => info!("received CTRL-C signal, initiating graceful shutdown"),
            () = terminate => info!("received SIGTERM signal, initiating graceful shutdown"),
        }

        // Stop every channel actor now, concurrently with axum draining
        // in-flight HTTP responses, so publishers and subscribers see a
        // clean end-of-stream rather than a severed connection.
        registry.shutdown_all();
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server error");
            e.into()
        })
}
