use crate::{model_service::ModelService, server::SharedState, state::State};
use axum::{extract::State as AxumState, response::Json};
use serde::Serialize;

#[derive(Serialize)]
pub struct ClassLabels {
    model: String,
    labels: Vec<String>,
}

pub async fn class_labels<M: ModelService, S: State>(
    AxumState(state): AxumState<SharedState<M, S>>,
) -> Json<ClassLabels> {
    Json(ClassLabels {
        model: state.inference_service.model_name().to_string(),
        labels: state.inference_service.labels().to_vec(),
    })
}
