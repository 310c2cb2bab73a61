//! HTTP surface of the token server.
//!
//! - `token` - Docker and OAuth2 token endpoints (/token)
//! - `health` - Liveness endpoint (/healthz)
//! - `openapi` - OpenAPI/Utoipa configuration, served at /api-docs

pub mod health;
pub mod openapi;
pub mod token;

pub use health::MISC_TAG;
pub use token::{TOKEN_TAG, TokenServerState};

use std::future::Future;
use std::net::SocketAddr;

use axum::Router;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utoipa::OpenApi;
use utoipa_axum::{router::OpenApiRouter, routes};
use utoipa_redoc::{Redoc, Servable};

/// Builds the application router with all routes and middleware.
pub fn router(state: TokenServerState) -> Router {
    let (router, api) = OpenApiRouter::with_openapi(openapi::ApiDoc::openapi())
        .merge(token::router(state))
        .routes(routes!(health::health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .split_for_parts();

    router.merge(Redoc::with_url("/api-docs", api))
}

/// Serves the router on `addr` until `shutdown` resolves.
#[tracing::instrument(skip(state, shutdown))]
pub async fn start_webserver(
    state: TokenServerState,
    addr: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> color_eyre::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "token server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| color_eyre::Report::msg(format!("Failed to run server: {e}")))?;

    tracing::info!("token server stopped");
    Ok(())
}
