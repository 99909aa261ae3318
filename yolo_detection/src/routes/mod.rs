mod detect;
mod health;
mod labels;
mod metrics;

use crate::{model_service::ModelService, server::SharedState, state::State};
use axum::{
    routing::{get, post},
    Router,
};

pub use detect::DetectImageError;
pub use metrics::track_http_metrics;

pub fn api_routes<M: ModelService, S: State>() -> Router<SharedState<M, S>> {
    Router::new()
        .route("/health", get(health::healthcheck))
        .route("/metrics", get(metrics::metrics_handler::<M, S>))
        .route("/v1/detect", post(detect::detect::<M, S>))
        .route("/v1/labels", get(labels::class_labels::<M, S>))
}
