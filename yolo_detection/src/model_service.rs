use crate::detection::RawDetection;
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("failed to load model: {0}")]
    Load(String),
    #[error("failed to build input tensor: {0}")]
    Input(String),
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("unexpected model output: {0}")]
    Output(String),
}

/// A loaded detection model. Implementations must be safe to call from
/// several requests at once.
pub trait ModelService: Send + Sync + Clone + 'static {
    /// Runs the model over an RGB image and returns its detections in the
    /// model's native order, boxes in source-image pixels.
    fn infer(&self, image: &RgbImage) -> Result<Vec<RawDetection>, ModelError>;

    fn model_name(&self) -> &str;
}
