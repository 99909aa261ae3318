use crate::{
    config::{ModelConfig, Validatable},
    detection::RawDetection,
    model_service::{ModelError, ModelService},
};
use image::{imageops::FilterType, RgbImage};
use ndarray::{s, Array, ArrayViewD, Axis, Ix4};
use ort::{
    execution_providers::CPUExecutionProvider,
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

/// Parameters applied when turning raw model output into detections.
#[derive(Debug, Clone, Copy)]
pub struct DecodeParams {
    pub input_size: u32,
    pub min_probability: f32,
    pub iou_threshold: f32,
}

fn intersection(box1: &RawDetection, box2: &RawDetection) -> f32 {
    let width = (box1.x2.min(box2.x2) - box1.x1.max(box2.x1)).max(0.);
    let height = (box1.y2.min(box2.y2) - box1.y1.max(box2.y1)).max(0.);
    width * height
}

fn union(box1: &RawDetection, box2: &RawDetection) -> f32 {
    box1.area() + box2.area() - intersection(box1, box2)
}

/// Zero when both boxes are degenerate.
pub fn iou(box1: &RawDetection, box2: &RawDetection) -> f32 {
    let total = union(box1, box2);
    if total <= 0. {
        return 0.;
    }
    intersection(box1, box2) / total
}

/// Class-agnostic NMS. Output is ordered by descending confidence.
pub fn non_max_suppression(mut boxes: Vec<RawDetection>, iou_threshold: f32) -> Vec<RawDetection> {
    boxes.sort_by(|box1, box2| box2.confidence.total_cmp(&box1.confidence));
    let mut result = Vec::new();

    while let Some((best, rest)) = boxes.split_first() {
        let best = *best;
        result.push(best);
        boxes = rest
            .iter()
            .filter(|candidate| iou(&best, candidate) < iou_threshold)
            .copied()
            .collect();
    }

    result
}

/// Resizes to the square model input and lays the pixels out as a
/// normalized NCHW tensor.
pub fn transform_image(image: &RgbImage, input_size: u32) -> Array<f32, Ix4> {
    let size = input_size as usize;
    let resized = image::imageops::resize(image, input_size, input_size, FilterType::CatmullRom);

    let mut input = Array::zeros((1, 3, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let x = x as usize;
        let y = y as usize;
        let [r, g, b] = pixel.0;
        input[[0, 0, y, x]] = (r as f32) / 255.;
        input[[0, 1, y, x]] = (g as f32) / 255.;
        input[[0, 2, y, x]] = (b as f32) / 255.;
    }

    input
}

/// Decodes a YOLOv8-style `[1, 4 + classes, candidates]` output. Boxes come
/// out in source-image pixels, clipped to the image.
pub fn decode_output(
    output: ArrayViewD<f32>,
    params: &DecodeParams,
    img_width: u32,
    img_height: u32,
) -> Result<Vec<RawDetection>, ModelError> {
    let shape = output.shape();
    if shape.len() != 3 || shape[0] != 1 || shape[1] < 5 {
        return Err(ModelError::Output(format!(
            "expected shape [1, 4 + classes, candidates], got {:?}",
            shape
        )));
    }

    let output = output.index_axis(Axis(0), 0);
    let scale_x = img_width as f32 / params.input_size as f32;
    let scale_y = img_height as f32 / params.input_size as f32;
    let max_x = img_width as f32;
    let max_y = img_height as f32;

    let mut boxes = Vec::new();
    for candidate in output.axis_iter(Axis(1)) {
        let best = candidate
            .slice(s![4..])
            .iter()
            .copied()
            .enumerate()
            .reduce(|accum, row| if row.1 > accum.1 { row } else { accum });
        let Some((class_id, prob)) = best else {
            continue;
        };

        if prob < params.min_probability {
            continue;
        }

        let xc = candidate[0] * scale_x;
        let yc = candidate[1] * scale_y;
        let w = candidate[2] * scale_x;
        let h = candidate[3] * scale_y;

        boxes.push(RawDetection {
            class_id,
            confidence: prob,
            x1: (xc - w / 2.).clamp(0., max_x),
            y1: (yc - h / 2.).clamp(0., max_y),
            x2: (xc + w / 2.).clamp(0., max_x),
            y2: (yc + h / 2.).clamp(0., max_y),
        });
    }

    Ok(non_max_suppression(boxes, params.iou_threshold))
}

#[derive(Clone)]
pub struct OrtModelService {
    sessions: Arc<Vec<Arc<Mutex<Session>>>>,
    counter: Arc<AtomicUsize>,
    params: DecodeParams,
    model_name: Arc<str>,
}

impl OrtModelService {
    pub fn new(model_config: &ModelConfig) -> Result<Self, ModelError> {
        model_config.validate().map_err(ModelError::Load)?;

        let model_path = model_config.get_path();
        let num_instances = model_config.num_instances.max(1);
        let sessions = (0..num_instances)
            .map(|_| {
                let session = Session::builder()?
                    .with_execution_providers([CPUExecutionProvider::default().build()])?
                    .with_optimization_level(GraphOptimizationLevel::Level3)?
                    .with_intra_threads(model_config.intra_threads)?
                    .commit_from_file(&model_path)?;
                Ok(Arc::new(Mutex::new(session)))
            })
            .collect::<Result<Vec<_>, ort::Error>>()
            .map_err(|e| ModelError::Load(format!("{:?}: {}", model_path, e)))?;

        tracing::info!(
            "Created {} ONNX sessions from {:?}",
            num_instances,
            model_path
        );

        Ok(Self {
            sessions: Arc::new(sessions),
            counter: Arc::new(AtomicUsize::new(0)),
            params: DecodeParams {
                input_size: model_config.input_size,
                min_probability: model_config.min_probability,
                iou_threshold: model_config.iou_threshold,
            },
            model_name: model_config.model_name().into(),
        })
    }

    pub fn run_inference(&self, input: &Array<f32, Ix4>) -> Result<ndarray::ArrayD<f32>, ModelError> {
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % self.sessions.len();
        let mut session = self.sessions[index].lock();

        tracing::debug!("Handling request with session {}", index);
        let tensor_ref = TensorRef::from_array_view(input.view())
            .map_err(|e| ModelError::Input(e.to_string()))?;

        let outputs = session
            .run(ort::inputs![tensor_ref])
            .map_err(|e| ModelError::Inference(e.to_string()))?;

        let output = outputs[0]
            .try_extract_array::<f32>()
            .map_err(|e| ModelError::Output(e.to_string()))?;

        Ok(output.to_owned())
    }
}

impl ModelService for OrtModelService {
    fn infer(&self, image: &RgbImage) -> Result<Vec<RawDetection>, ModelError> {
        let (img_width, img_height) = image.dimensions();
        if img_width == 0 || img_height == 0 {
            return Err(ModelError::Input("image has no pixels".to_string()));
        }

        let input = transform_image(image, self.params.input_size);
        let output = self.run_inference(&input)?;

        decode_output(output.view(), &self.params, img_width, img_height)
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use ndarray::Array3;

    const PARAMS: DecodeParams = DecodeParams {
        input_size: 640,
        min_probability: 0.25,
        iou_threshold: 0.7,
    };

    fn raw(confidence: f32, corners: [f32; 4]) -> RawDetection {
        RawDetection {
            class_id: 0,
            confidence,
            x1: corners[0],
            y1: corners[1],
            x2: corners[2],
            y2: corners[3],
        }
    }

    /// Builds a `[1, 4 + classes, candidates]` tensor from (cx, cy, w, h, scores).
    fn output(candidates: &[([f32; 4], Vec<f32>)]) -> ndarray::ArrayD<f32> {
        let classes = candidates[0].1.len();
        let mut array = Array3::<f32>::zeros((1, 4 + classes, candidates.len()));
        for (i, (bbox, scores)) in candidates.iter().enumerate() {
            for (row, value) in bbox.iter().chain(scores.iter()).enumerate() {
                array[[0, row, i]] = *value;
            }
        }
        array.into_dyn()
    }

    #[test]
    fn test_transform_image() {
        let img = RgbImage::from_pixel(100, 50, Rgb([255, 0, 0]));

        let input = transform_image(&img, 640);

        assert_eq!(input.shape(), &[1, 3, 640, 640]);
        assert!((input[[0, 0, 320, 320]] - 1.0).abs() < 1e-3);
        assert!(input[[0, 1, 320, 320]].abs() < 1e-3);
        assert!(input[[0, 2, 320, 320]].abs() < 1e-3);
    }

    #[test]
    fn test_decode_scales_to_source_image() {
        // 640x640 model space, 1280x320 source image.
        let output = output(&[([320., 320., 64., 64.], vec![0.1, 0.9, 0.3])]);

        let detections = decode_output(output.view(), &PARAMS, 1280, 320).unwrap();

        assert_eq!(detections.len(), 1);
        let detection = detections[0];
        assert_eq!(detection.class_id, 1);
        assert!((detection.confidence - 0.9).abs() < 1e-6);
        assert_eq!(
            [detection.x1, detection.y1, detection.x2, detection.y2],
            [576., 144., 704., 176.]
        );
    }

    #[test]
    fn test_decode_drops_candidates_below_floor() {
        let output = output(&[
            ([100., 100., 10., 10.], vec![0.2, 0.1]),
            ([300., 300., 10., 10.], vec![0.1, 0.6]),
        ]);

        let detections = decode_output(output.view(), &PARAMS, 640, 640).unwrap();

        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].class_id, 1);
    }

    #[test]
    fn test_decode_clips_to_image() {
        let output = output(&[([5., 635., 20., 20.], vec![0.8])]);

        let detections = decode_output(output.view(), &PARAMS, 640, 640).unwrap();

        let detection = detections[0];
        assert_eq!(detection.x1, 0.);
        assert_eq!(detection.y2, 640.);
        assert!(detection.width() >= 0. && detection.height() >= 0.);
    }

    #[test]
    fn test_decode_rejects_unexpected_shape() {
        let output = ndarray::ArrayD::<f32>::zeros(ndarray::IxDyn(&[1, 4, 10]));

        let result = decode_output(output.view(), &PARAMS, 640, 640);

        assert!(matches!(result, Err(ModelError::Output(_))));
    }

    #[test]
    fn test_nms_suppresses_overlapping_boxes() {
        let boxes = vec![
            raw(0.6, [0., 0., 100., 100.]),
            raw(0.9, [2., 2., 100., 100.]),
            raw(0.7, [200., 200., 300., 300.]),
        ];

        let kept = non_max_suppression(boxes, 0.7);

        let confidences: Vec<f32> = kept.iter().map(|b| b.confidence).collect();
        assert_eq!(confidences, vec![0.9, 0.7]);
    }

    #[test]
    fn test_iou_of_disjoint_boxes_is_zero() {
        let a = raw(0.9, [0., 0., 10., 10.]);
        let b = raw(0.9, [20., 20., 30., 30.]);

        assert_eq!(iou(&a, &b), 0.);
        assert!((iou(&a, &a) - 1.).abs() < 1e-6);
    }

    #[test]
    fn test_degenerate_boxes_do_not_suppress_each_other() {
        // Flattened against the bottom edge by clipping.
        let a = raw(0.9, [10., 640., 30., 640.]);
        let b = raw(0.8, [300., 640., 320., 640.]);

        assert_eq!(iou(&a, &b), 0.);
        assert_eq!(non_max_suppression(vec![a, b], 0.7).len(), 2);
    }

    #[test]
    fn test_missing_model_file_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let config = ModelConfig {
            onnx_file: "missing.onnx".to_string(),
            model_dir: dir.path().to_path_buf(),
            num_instances: 1,
            input_size: 640,
            min_probability: 0.25,
            iou_threshold: 0.7,
            intra_threads: 1,
        };

        assert!(matches!(
            OrtModelService::new(&config),
            Err(ModelError::Load(_))
        ));
    }
}
