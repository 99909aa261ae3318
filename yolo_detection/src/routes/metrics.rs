use crate::{model_service::ModelService, server::SharedState, state::State, telemetry::Metrics};
use axum::{
    extract::{MatchedPath, Request, State as AxumState},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use prometheus::{Encoder, TextEncoder};
use std::{sync::Arc, time::Instant};

pub async fn metrics_handler<M: ModelService, S: State>(
    AxumState(state): AxumState<SharedState<M, S>>,
) -> impl IntoResponse {
    let metric_families = state.metrics.registry.gather();

    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }

    (
        [(axum::http::header::CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    )
        .into_response()
}

/// Records method, matched route and status of every routed request.
pub async fn track_http_metrics(
    AxumState(metrics): AxumState<Arc<Metrics>>,
    request: Request,
    next: Next,
) -> Response {
    let started = Instant::now();
    let method = request.method().to_string();
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());

    let response = next.run(request).await;

    metrics.record_http_request(
        &route,
        &method,
        response.status().as_u16(),
        started.elapsed().as_millis() as u64,
    );
    response
}
