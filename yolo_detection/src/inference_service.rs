use crate::{
    detection::{filter_detections, format_timestamp, throughput_estimate, DetectionResponse},
    model_service::{ModelError, ModelService},
    state::State,
};
use image::RgbImage;
use std::{io::Cursor, sync::Arc, time::Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectError {
    #[error("invalid image: {0}")]
    InvalidImage(#[from] image::ImageError),
    #[error("{0}")]
    Inference(#[from] ModelError),
}

pub fn decode_image(image_data: &[u8]) -> Result<RgbImage, DetectError> {
    let image_reader = image::ImageReader::new(Cursor::new(image_data))
        .with_guessed_format()
        .map_err(image::ImageError::IoError)?;

    Ok(image_reader.decode()?.to_rgb8())
}

pub struct InferenceService<M: ModelService, S: State> {
    model_service: Arc<M>,
    service_state: Arc<S>,
}

impl<M: ModelService, S: State> Clone for InferenceService<M, S> {
    fn clone(&self) -> Self {
        Self {
            model_service: self.model_service.clone(),
            service_state: self.service_state.clone(),
        }
    }
}

impl<M: ModelService, S: State> InferenceService<M, S> {
    pub fn new(model_service: M, state: S) -> Self {
        Self {
            model_service: Arc::new(model_service),
            service_state: Arc::new(state),
        }
    }

    pub fn model_name(&self) -> &str {
        self.model_service.model_name()
    }

    pub fn labels(&self) -> &[String] {
        self.service_state.get_labels()
    }

    /// Decodes an uploaded image, runs the model and shapes the response.
    /// `started` is when the request arrived and feeds the fps estimate.
    pub fn detect(
        &self,
        image_data: &[u8],
        started: Instant,
    ) -> Result<DetectionResponse, DetectError> {
        let image = decode_image(image_data)?;
        let raw_detections = self.model_service.infer(&image)?;
        let detections = filter_detections(&raw_detections);

        tracing::debug!(
            "Kept {} of {} detections for {}x{} image",
            detections.len(),
            raw_detections.len(),
            image.width(),
            image.height()
        );
        for (i, detection) in detections.iter().enumerate() {
            tracing::debug!(
                "Detection {}: class={}, confidence={:.3}, bbox=({:.1}, {:.1}, {:.1}, {:.1})",
                i,
                detection.class_label,
                detection.confidence,
                detection.bounding_box[0],
                detection.bounding_box[1],
                detection.bounding_box[2],
                detection.bounding_box[3]
            );
        }

        Ok(DetectionResponse {
            timestamp: format_timestamp(chrono::Utc::now()),
            model_identifier: self.model_name().to_string(),
            throughput_estimate: throughput_estimate(started.elapsed()),
            detections,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{detection::RawDetection, state::ServiceState};
    use image::{ImageBuffer, Rgb};

    #[derive(Clone)]
    struct MockModelService {
        detections: Vec<RawDetection>,
    }

    impl ModelService for MockModelService {
        fn infer(&self, _image: &RgbImage) -> Result<Vec<RawDetection>, ModelError> {
            Ok(self.detections.clone())
        }

        fn model_name(&self) -> &str {
            "mock.onnx"
        }
    }

    #[derive(Clone)]
    struct FailingModelService;

    impl ModelService for FailingModelService {
        fn infer(&self, _image: &RgbImage) -> Result<Vec<RawDetection>, ModelError> {
            Err(ModelError::Inference("session exploded".to_string()))
        }

        fn model_name(&self) -> &str {
            "failing.onnx"
        }
    }

    fn png_bytes() -> Vec<u8> {
        let img = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_pixel(64, 48, Rgb([255, 255, 255]));
        let mut cursor = Cursor::new(Vec::new());
        img.write_to(&mut cursor, image::ImageFormat::Png).unwrap();
        cursor.into_inner()
    }

    fn service(detections: Vec<RawDetection>) -> InferenceService<MockModelService, ServiceState> {
        InferenceService::new(
            MockModelService { detections },
            ServiceState::from_labels(vec!["person".to_string()]),
        )
    }

    #[test]
    fn test_detect() {
        let service = service(vec![
            RawDetection {
                class_id: 7,
                confidence: 0.95,
                x1: 10.0,
                y1: 20.0,
                x2: 100.0,
                y2: 150.0,
            },
            RawDetection {
                class_id: 42,
                confidence: 0.3,
                x1: 200.0,
                y1: 50.0,
                x2: 300.0,
                y2: 200.0,
            },
        ]);

        let response = service.detect(&png_bytes(), Instant::now()).unwrap();

        assert_eq!(response.model_identifier, "mock.onnx");
        assert_eq!(response.detections.len(), 1);
        assert_eq!(response.detections[0].class_label, "7");
        assert_eq!(response.detections[0].bounding_box, [10.0, 20.0, 90.0, 130.0]);
        assert!(response.throughput_estimate >= 0.0);
        assert!(response.timestamp.ends_with('Z'));
    }

    #[test]
    fn test_detect_is_repeatable() {
        let service = service(vec![RawDetection {
            class_id: 2,
            confidence: 0.9,
            x1: 10.0,
            y1: 10.0,
            x2: 50.0,
            y2: 80.0,
        }]);

        let first = service.detect(&png_bytes(), Instant::now()).unwrap();
        let second = service.detect(&png_bytes(), Instant::now()).unwrap();

        assert_eq!(first.detections, second.detections);
    }

    #[test]
    fn test_invalid_bytes_are_rejected() {
        let service = service(Vec::new());

        let result = service.detect(b"definitely not an image", Instant::now());

        assert!(matches!(result, Err(DetectError::InvalidImage(_))));
    }

    #[test]
    fn test_model_failure_is_reported() {
        let service = InferenceService::new(FailingModelService, ServiceState::default());

        let result = service.detect(&png_bytes(), Instant::now());

        assert!(matches!(result, Err(DetectError::Inference(_))));
    }

    #[test]
    fn test_labels_are_exposed() {
        assert_eq!(service(Vec::new()).labels(), ["person"]);
    }
}
