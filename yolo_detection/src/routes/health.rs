use axum::{response::IntoResponse, response::Json};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
pub struct Status {
    ok: bool,
    model_loaded: bool,
}

// The router is only built once the model has loaded.
pub async fn healthcheck() -> impl IntoResponse {
    Json(Status {
        ok: true,
        model_loaded: true,
    })
}
