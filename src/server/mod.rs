//! HTTP server for the chat ledger API.
//!
//! Provides REST endpoints for:
//! - Folders, chats and messages
//! - Settings, API keys and saved prompts
//! - Export and import of the whole ledger
//!
//! Any other path is served from the static front-end directory.

pub mod error;
pub mod routes;
pub mod state;

pub use error::{ApiError, ApiResult, ErrorBody};
pub use routes::create_router;
pub use state::AppState;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tower_http::trace::TraceLayer;

/// Router with request tracing. No CORS layer: the API is same-origin only.
#[must_use]
pub fn build_app(state: Arc<AppState>) -> Router {
    create_router(state).layer(TraceLayer::new_for_http())
}

/// Start the HTTP server with graceful shutdown support.
///
/// The server will stop accepting new connections when `shutdown_signal` completes.
///
/// # Errors
/// Returns an error if the listener cannot be bound or the server fails.
pub async fn run_server_with_shutdown<F>(
    state: Arc<AppState>,
    addr: SocketAddr,
    shutdown_signal: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = build_app(state);

    tracing::info!("Chat ledger listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
}
