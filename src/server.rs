//! Publication server
//!
//! Serves the subscription artifact over HTTP: a constant liveness page at
//! the root and the encoded blob at the configured path. Everything else is
//! 404. Requests are handled from read-only filesystem state and are not
//! logged. A process-wide guard makes a second spawn a no-op instead of a
//! second bind (the entry point may be re-invoked by a supervising platform).

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::Settings;

/// Set once when the first listener binds; never cleared.
static SERVER_STARTED: AtomicBool = AtomicBool::new(false);

/// Server startup failures.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The port is held by an unrelated process.
    #[error("Failed to bind publication server on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Clone)]
struct ServeState {
    subscription_file: Arc<PathBuf>,
}

async fn liveness() -> Html<&'static str> {
    Html("Hello World")
}

async fn subscription(State(state): State<ServeState>) -> Response {
    match tokio::fs::read(state.subscription_file.as_ref()).await {
        Ok(bytes) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            bytes,
        )
            .into_response(),
        // Absent until the first synthesis completes; that is a 404, not an
        // error worth logging per request.
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Build the two-route router for the given subscription path token.
///
/// The token is normalized first; a raw value the route parser would reject
/// (empty, or containing parameter syntax) must not panic the bootstrap.
pub fn build_router(sub_path: &str, subscription_file: PathBuf) -> Router {
    let sub_path = crate::config::sanitize_sub_path(sub_path);
    let state = ServeState {
        subscription_file: Arc::new(subscription_file),
    };
    Router::new()
        .route("/", get(liveness))
        .route(&format!("/{sub_path}"), get(subscription))
        .with_state(state)
}

/// Bind and spawn the publication server, once per process.
///
/// Re-entry is an expected no-op: the guard flips before the bind so a second
/// call can never race its way into a second listener. A bind failure means
/// an unrelated process owns the port and is fatal.
pub async fn spawn_publication_server(settings: &Settings) -> Result<(), ServerError> {
    if SERVER_STARTED
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        warn!("Publication server already running, skipping second start");
        return Ok(());
    }

    let port = settings.http_port;
    let listener = match TcpListener::bind(("0.0.0.0", port)).await {
        Ok(listener) => listener,
        Err(source) => {
            // Leave the guard set: the port is unusable either way.
            return Err(ServerError::Bind { port, source });
        }
    };

    let router = build_router(&settings.sub_path, settings.subscription_path());
    info!("Publication server listening on port {}", port);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            warn!("Publication server stopped: {}", e);
        }
    });

    Ok(())
}
