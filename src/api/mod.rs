//! HTTP facade
//!
//! Every endpoint is POST with a JSON body and a JSON response. Non-2xx:
//! 400 on decode failure or invalid start config, 409 on an illegal
//! lifecycle transition, 500 on internal failure.

use axum::{routing::post, Router};
use tower_http::trace::TraceLayer;

use crate::api::state::SharedState;

pub mod handlers;
pub mod state;

pub use state::NodeState;

/// Build the facade router.
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/ping", post(handlers::ping))
        .nest(
            "/ops/rpc",
            Router::new()
                .route("/addrs/put", post(handlers::addrs_put))
                .route("/addrs/get", post(handlers::addrs_get))
                .route("/server/start", post(handlers::server_start))
                .route("/server/stop", post(handlers::server_stop)),
        )
        .nest(
            "/cmd",
            Router::new()
                .route("/ping", post(handlers::cmd_ping))
                .route("/add", post(handlers::cmd_add))
                .route("/knn", post(handlers::cmd_knn)),
        )
        .nest(
            "/info",
            Router::new()
                .route("/namespaces", post(handlers::info_namespaces))
                .route("/namespace", post(handlers::info_namespace))
                .route("/dim", post(handlers::info_dim))
                .route("/len", post(handlers::info_len))
                .route("/cap", post(handlers::info_cap))
                .route("/knnLatency", post(handlers::info_knn_latency))
                .route("/knnMonitor", post(handlers::info_knn_monitor)),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
