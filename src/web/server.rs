use axum::{
    routing::{get, post},
    Router,
};
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

use crate::config::WebConfig;

use super::api::{
    get_status, health_check, list_jobs, list_partitions, publish_record, request_fill, AppState,
};

/// Builds the admin API router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/status", get(get_status))
        .route("/api/jobs", get(list_jobs))
        .route("/api/fill", post(request_fill))
        .route("/api/streams/:name/records", post(publish_record))
        .route("/api/partitions", get(list_partitions))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the web server and serve until `shutdown_rx` flips to true
pub async fn run_server(
    state: AppState,
    web_config: WebConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), std::io::Error> {
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&web_config.listen).await?;
    tracing::info!("Web server listening on {}", web_config.listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.wait_for(|&v| v).await;
            tracing::info!("Web server shutting down gracefully");
        })
        .await
}
