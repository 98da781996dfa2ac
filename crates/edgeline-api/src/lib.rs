pub mod handlers;

use axum::routing::{get, post, put};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

pub use handlers::ApiState;

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/tasks", post(handlers::handle_submit_task))
        .route("/events", post(handlers::handle_events))
        .route("/status", get(handlers::handle_status))
        .route("/cache", get(handlers::handle_cache))
        .route("/cache/clear", post(handlers::handle_cache_clear))
        .route("/agents", get(handlers::handle_agents))
        .route("/agents/{task_type}", put(handlers::handle_set_agents))
        .route("/connectivity", get(handlers::handle_connectivity))
        .route("/cluster", get(handlers::handle_cluster))
        .route("/daemon/shutdown", post(handlers::handle_shutdown))
        .with_state(state);

    Router::new().nest("/api", api_routes).layer(cors)
}

pub async fn serve(state: ApiState, port: u16) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    tracing::info!(port, "API listening on 127.0.0.1");
    axum::serve(listener, app).await?;
    Ok(())
}
