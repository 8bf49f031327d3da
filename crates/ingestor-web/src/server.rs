//! Axum router and server loop

use std::future::Future;

use axum::{
    http::{header, Method},
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::{api, events, state::AppState};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/dataset", post(api::post_dataset))
        .route(
            "/transfer",
            get(api::get_transfer).delete(api::delete_transfer),
        )
        .route("/transfer/external", get(api::get_external_transfers))
        .route("/events", get(events::events_handler))
        .route("/version", get(api::get_version))
        .route("/health", get(api::get_health))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
                .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the API until `shutdown` resolves, then stop the task queue
pub async fn run_server<F>(state: AppState, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = format!(
        "{}:{}",
        state.config.web_server.host, state.config.web_server.port
    );
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("ingestor listening on http://{}", listener.local_addr()?);
    tracing::info!(
        method = %state.config.transfer.method,
        workers = state.config.transfer.concurrency_limit,
        "transfer queue ready"
    );

    let queue = state.queue.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;

    tracing::info!("http server stopped, cancelling running transfers");
    queue.shutdown().await;
    Ok(())
}
