mod routes;

pub mod config;
pub mod detection;
pub mod inference_service;
pub mod model_service;
pub mod ort_service;
pub mod server;
pub mod state;
pub mod telemetry;

pub use routes::DetectImageError;
pub use server::{create_router, start_server};
