mod error;
mod extract;
mod handlers;
mod views;

use std::time::Instant;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::{DefaultBodyLimit, Request};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tracing::info;

use crate::app::AppState;
use crate::core::EventStore;

/// Admin routes over the shared state.
pub fn router<S: EventStore>(
    state: AppState<S>,
    max_post_size: usize
) -> Router {
    Router::new()
        .route("/", get(handlers::dashboard::<S>))
        .route("/zone/{zone}/{kind}", get(handlers::zone::<S>))
        .route("/message/{id}", get(handlers::message::<S>))
        .route("/log/{id}/{seq}", get(handlers::smtp_log::<S>))
        .route("/fetch/{id}", get(handlers::fetch::<S>))
        .route("/find", post(handlers::find::<S>))
        .route("/search", get(handlers::search::<S>))
        .route("/send", post(handlers::send::<S>))
        .route("/delete", post(handlers::delete::<S>))
        .route("/send-now", post(handlers::send_now::<S>))
        .route("/blacklist", get(handlers::blacklist::<S>))
        .route("/blacklist/add", post(handlers::blacklist_add::<S>))
        .route("/blacklist/delete", post(handlers::blacklist_delete::<S>))
        .route("/suppressionlist", get(handlers::suppression_list::<S>))
        .route("/suppressionlist/add", post(handlers::suppression_add::<S>))
        .route("/suppressionlist/delete", post(handlers::suppression_delete::<S>))
        .fallback(handlers::not_found)
        .method_not_allowed_fallback(handlers::method_not_allowed)
        .layer(DefaultBodyLimit::max(max_post_size))
        .layer(middleware::from_fn(trace_request))
        .with_state(state)
}

/// Serves the admin routes until the shared shutdown token is cancelled.
pub async fn run_http_server<S: EventStore>(
    listen: &str,
    state: AppState<S>,
    max_post_size: usize
) -> Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind http listener on {listen}"))?;
    info!("http server listening: address={}", listener.local_addr()?);

    let shutdown = state.shutdown.clone();
    axum::serve(listener, router(state, max_post_size))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("http server failed")?;

    info!("http server stopped");
    Ok(())
}

async fn trace_request(
    request: Request,
    next: Next
) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();

    let response = next.run(request).await;

    info!(
        "http request: method={}, path={}, status={}, elapsed_ms={}",
        method,
        path,
        response.status().as_u16(),
        started.elapsed().as_millis()
    );
    response
}
