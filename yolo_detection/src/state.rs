use crate::config::{LabelsConfig, Validatable};
use std::{
    fs::File,
    io::{self, BufRead},
    path::Path,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LabelsError {
    #[error("failed to read labels file: {0}")]
    Io(#[from] io::Error),
    #[error("invalid labels line {line}: {content}")]
    InvalidLine { line: usize, content: String },
}

/// Class-name table of the loaded model, indexed by class id.
pub trait State: Send + Sync + 'static {
    fn get_labels(&self) -> &[String];
}

#[derive(Debug, Default)]
pub struct ServiceState {
    class_labels: Vec<String>,
}

impl ServiceState {
    pub fn new(labels_cfg: Option<&LabelsConfig>) -> Result<Self, LabelsError> {
        let class_labels = match labels_cfg {
            Some(cfg) => load_yolov8_labels(&cfg.get_path())?,
            None => Vec::new(),
        };
        tracing::info!("Loaded {} class labels", class_labels.len());

        Ok(ServiceState { class_labels })
    }

    pub fn from_labels(class_labels: Vec<String>) -> Self {
        ServiceState { class_labels }
    }
}

impl State for ServiceState {
    fn get_labels(&self) -> &[String] {
        &self.class_labels
    }
}

/// Reads one class per line, either `name` or `name,r,g,b`. Blank lines are
/// skipped.
pub fn load_yolov8_labels(filepath: &Path) -> Result<Vec<String>, LabelsError> {
    let file = File::open(filepath)?;
    let reader = io::BufReader::new(file);
    let mut labels = Vec::new();

    for (index, line_result) in reader.lines().enumerate() {
        let line = line_result?;
        if line.trim().is_empty() {
            continue;
        }

        let parts: Vec<&str> = line.split(',').map(str::trim).collect();
        let valid = match parts.as_slice() {
            [name] => !name.is_empty(),
            [name, red, green, blue] => {
                !name.is_empty()
                    && [red, green, blue]
                        .iter()
                        .all(|value| value.parse::<u8>().is_ok())
            }
            _ => false,
        };

        if !valid {
            return Err(LabelsError::InvalidLine {
                line: index + 1,
                content: line,
            });
        }

        labels.push(parts[0].to_string());
    }

    Ok(labels)
}
