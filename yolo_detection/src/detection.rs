use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Detections at or below this confidence never reach a response.
pub const CONFIDENCE_THRESHOLD: f32 = 0.5;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

/// One detection as produced by the model host, box in corner format.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawDetection {
    pub class_id: usize,
    pub confidence: f32,
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl RawDetection {
    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    #[serde(rename = "cls")]
    pub class_label: String,
    #[serde(rename = "conf")]
    pub confidence: f32,
    #[serde(rename = "bbox_xywh")]
    pub bounding_box: [f32; 4],
}

impl From<&RawDetection> for Detection {
    // The class index is reported as-is; see `/v1/labels` for names.
    fn from(raw: &RawDetection) -> Self {
        Detection {
            class_label: raw.class_id.to_string(),
            confidence: raw.confidence,
            bounding_box: [raw.x1, raw.y1, raw.width(), raw.height()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResponse {
    #[serde(rename = "ts")]
    pub timestamp: String,
    #[serde(rename = "model")]
    pub model_identifier: String,
    #[serde(rename = "fps")]
    pub throughput_estimate: f64,
    pub detections: Vec<Detection>,
}

/// Keeps detections strictly above [`CONFIDENCE_THRESHOLD`], preserving order.
pub fn filter_detections(raw: &[RawDetection]) -> Vec<Detection> {
    raw.iter()
        .filter(|detection| detection.confidence > CONFIDENCE_THRESHOLD)
        .map(Detection::from)
        .collect()
}

/// Inverse of a single request's latency. Zero when no time was measured.
pub fn throughput_estimate(elapsed: Duration) -> f64 {
    let seconds = elapsed.as_secs_f64();
    if seconds > 0.0 {
        1.0 / seconds
    } else {
        0.0
    }
}

pub fn format_timestamp(time: DateTime<Utc>) -> String {
    time.format(TIMESTAMP_FORMAT).to_string()
}
