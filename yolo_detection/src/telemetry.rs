use opentelemetry::{
    metrics::{Counter, Histogram, MeterProvider},
    KeyValue,
};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::Registry;
use std::collections::HashSet;

pub struct Metrics {
    http_request_counter: Counter<u64>,
    http_request_duration: Histogram<u64>,
    request_counter: Counter<u64>,
    detection_counter: Counter<u64>,
    detection_duration: Histogram<u64>,
    pub registry: Registry,
    // Dropping the provider shuts down the reader feeding `registry`.
    _provider: SdkMeterProvider,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()?;

        let provider = SdkMeterProvider::builder().with_reader(exporter).build();

        let meter = provider.meter("yolo_detection");

        let http_request_counter = meter
            .u64_counter("http_server_requests_total")
            .with_description("Total number of HTTP requests by route and status")
            .build();

        let http_request_duration = meter
            .u64_histogram("http_server_request_duration_ms")
            .with_boundaries(generate_boundaries((10, 50, 100, 500, 2000)))
            .with_description("Duration of HTTP requests in milliseconds")
            .build();

        let request_counter = meter
            .u64_counter("detect_requests_total")
            .with_description("Total number of detection requests by outcome")
            .build();

        let detection_counter = meter
            .u64_counter("detections_total")
            .with_description("Total number of detections returned")
            .build();

        let boundaries = generate_boundaries((10, 50, 100, 500, 2000));

        let detection_duration = meter
            .u64_histogram("detection_duration_ms")
            .with_boundaries(boundaries)
            .with_description("Duration of decode and inference in milliseconds")
            .build();

        Ok(Metrics {
            http_request_counter,
            http_request_duration,
            request_counter,
            detection_counter,
            detection_duration,
            registry,
            _provider: provider,
        })
    }

    pub fn record_http_request(&self, route: &str, method: &str, status: u16, duration_ms: u64) {
        let attributes = [
            KeyValue::new("route", route.to_string()),
            KeyValue::new("method", method.to_string()),
            KeyValue::new("status", i64::from(status)),
        ];
        self.http_request_counter.add(1, &attributes);
        self.http_request_duration.record(duration_ms, &attributes[..2]);
    }

    pub fn record_request(&self, outcome: &str) {
        let attributes = [KeyValue::new("outcome", outcome.to_string())];
        self.request_counter.add(1, &attributes);
    }

    pub fn record_detections(&self, count: usize, model: &str) {
        let attributes = [KeyValue::new("model", model.to_string())];
        self.detection_counter.add(count as u64, &attributes);
    }

    pub fn record_detection_duration(&self, duration_ms: u64, model: &str) {
        let attributes = [KeyValue::new("model", model.to_string())];
        self.detection_duration.record(duration_ms, &attributes);
    }
}

fn generate_boundaries(parts: (i32, i32, i32, i32, i32)) -> Vec<f64> {
    let first_step: usize = 10;
    let middle_step: usize = 25;
    let end_step: usize = 100;
    let tail_step: usize = 500;
    let first_part = (parts.0..=parts.1).step_by(first_step);
    let middle_part = (parts.1..=parts.2).step_by(middle_step);
    let end_part = (parts.2..=parts.3).step_by(end_step);
    let tail_part = (parts.3..=parts.4).step_by(tail_step);

    let mut seen = HashSet::new();
    first_part
        .chain(middle_part)
        .chain(end_part)
        .chain(tail_part)
        .filter(|&x| seen.insert(x))
        .map(|x| x as f64)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_boundaries() {
        let parts = (10, 50, 100, 500, 2000);
        let get = generate_boundaries(parts);
        let expected = vec![
            10.0, 20.0, 30.0, 40.0, 50.0, 75.0, 100.0, 200.0, 300.0, 400.0, 500.0, 1000.0,
            1500.0, 2000.0,
        ];

        assert_eq!(get, expected);
    }

    fn exported_names(metrics: &Metrics) -> Vec<String> {
        metrics
            .registry
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect()
    }

    #[test]
    fn test_metrics_survive_another_instance() {
        let first = Metrics::new().unwrap();
        let _second = Metrics::new().unwrap();
        first.record_request("ok");
        first.record_http_request("/health", "GET", 200, 1);

        let names = exported_names(&first);

        assert!(names.iter().any(|name| name.starts_with("detect_requests")));
        assert!(names.iter().any(|name| name.starts_with("http_server_requests")));
    }

    #[test]
    fn test_metrics_are_exported() {
        let metrics = Metrics::new().unwrap();
        metrics.record_request("ok");
        metrics.record_detections(3, "best.onnx");
        metrics.record_detection_duration(42, "best.onnx");

        let names = exported_names(&metrics);

        assert!(names.iter().any(|name| name.starts_with("detect_requests")));
        assert!(names.iter().any(|name| name.starts_with("detection_duration")));
    }
}
