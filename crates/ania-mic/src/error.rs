use std::error::Error;
use std::fmt;

/// Failure kinds raised by the feature builders, models and engines.
///
/// Library functions return `anyhow::Result`; the root cause of a domain
/// failure is always one of these variants and can be recovered with
/// `err.downcast_ref::<AniaError>()`.
#[derive(Debug, Clone, PartialEq)]
pub enum AniaError {
    /// Declared and actual tensor dimensions disagree.
    ShapeMismatch { expected: String, actual: String },
    /// The target column is absent or holds missing values.
    MissingTarget(String),
    /// A required column is absent from a table.
    MissingColumn(String),
    /// The source table has no data rows.
    EmptyDataset(String),
    UnsupportedModelType(String),
    InvalidHyperparameter(String),
    /// The search never produced a finite, improving validation loss.
    NoViableModel,
    /// Requested accelerator is absent; recovered by falling back.
    AcceleratorUnavailable(String),
    /// Grad-CAM was requested without a captured activation/gradient pair.
    GradientNotCaptured(String),
    MissingModality(String),
    UnsupportedDevice(String),
}

impl fmt::Display for AniaError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AniaError::ShapeMismatch { expected, actual } => {
                write!(f, "Shape mismatch: expected {}, got {}", expected, actual)
            }
            AniaError::MissingTarget(msg) => write!(f, "Missing target: {}", msg),
            AniaError::MissingColumn(col) => write!(f, "Missing column: '{}'", col),
            AniaError::EmptyDataset(msg) => write!(f, "Empty dataset: {}", msg),
            AniaError::UnsupportedModelType(name) => {
                write!(f, "Unsupported model type: '{}'", name)
            }
            AniaError::InvalidHyperparameter(msg) => write!(f, "Invalid hyperparameter: {}", msg),
            AniaError::NoViableModel => write!(
                f,
                "No valid model was found during the search: no combination produced a finite, improving validation loss"
            ),
            AniaError::AcceleratorUnavailable(device) => {
                write!(f, "Accelerator '{}' is not available", device)
            }
            AniaError::GradientNotCaptured(msg) => {
                write!(f, "No captured activation/gradient: {}", msg)
            }
            AniaError::MissingModality(msg) => write!(f, "Missing input modality: {}", msg),
            AniaError::UnsupportedDevice(device) => {
                write!(f, "Unsupported device type: {}", device)
            }
        }
    }
}

impl Error for AniaError {}

impl AniaError {
    pub fn shape_mismatch(expected: impl fmt::Debug, actual: impl fmt::Debug) -> Self {
        AniaError::ShapeMismatch {
            expected: format!("{:?}", expected),
            actual: format!("{:?}", actual),
        }
    }
}

/// Returns the `AniaError` at the root of an `anyhow` chain, if any.
pub fn root_ania_error(err: &anyhow::Error) -> Option<&AniaError> {
    err.chain().find_map(|cause| cause.downcast_ref::<AniaError>())
}
