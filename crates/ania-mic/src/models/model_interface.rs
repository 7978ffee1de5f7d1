use anyhow::{anyhow, Result};
use candle_core::backprop::GradStore;
use candle_core::{Device, Tensor, Var};
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use crate::building_blocks::inception::BranchCapture;
use crate::building_blocks::nn::Autocast;
use crate::error::AniaError;
use crate::models::ania::AniaModelComposite;
use crate::models::fcgr_ania::FcgrAnia;
use crate::models::word_embedding_ania::WordEmbeddingAnia;
use crate::training::hyperparams::Hyperparameters;
use crate::utils::data_handling::{MicDataset, ModelInput};

// Constants for the supported architecture tags
pub const MODEL_TYPES: &[&str] = &["fcgr_ania", "word_embedding_ania", "ania"];

/// Architecture tag used in configuration files and checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    FcgrAnia,
    WordEmbeddingAnia,
    Ania,
}

impl ModelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelType::FcgrAnia => "fcgr_ania",
            ModelType::WordEmbeddingAnia => "word_embedding_ania",
            ModelType::Ania => "ania",
        }
    }

    pub fn needs_fcgr(&self) -> bool {
        matches!(self, ModelType::FcgrAnia | ModelType::Ania)
    }

    pub fn needs_word(&self) -> bool {
        matches!(self, ModelType::WordEmbeddingAnia | ModelType::Ania)
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "fcgr_ania" => Ok(ModelType::FcgrAnia),
            "word_embedding_ania" => Ok(ModelType::WordEmbeddingAnia),
            "ania" => Ok(ModelType::Ania),
            other => Err(AniaError::UnsupportedModelType(other.to_string()).into()),
        }
    }
}

/// Input modality; selects an extractor of the composite model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Fcgr,
    Word,
}

impl Modality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Fcgr => "fcgr",
            Modality::Word => "word",
        }
    }
}

impl FromStr for Modality {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "fcgr" => Ok(Modality::Fcgr),
            "word" => Ok(Modality::Word),
            other => Err(AniaError::MissingModality(format!("unknown modality '{}'", other)).into()),
        }
    }
}

/// Per-sample input shape stored with a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputShape {
    /// `[C, H, W]`
    Image([usize; 3]),
    /// `[C, L]`
    Sequence([usize; 2]),
    Composite { fcgr: [usize; 3], word: [usize; 2] },
}

impl fmt::Display for InputShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputShape::Image(s) => write!(f, "{:?}", s),
            InputShape::Sequence(s) => write!(f, "{:?}", s),
            InputShape::Composite { fcgr, word } => write!(f, "{{fcgr: {:?}, word: {:?}}}", fcgr, word),
        }
    }
}

fn image_shape(dims: Option<Vec<usize>>, what: &str) -> Result<[usize; 3]> {
    let dims = dims.ok_or_else(|| AniaError::MissingModality(format!("{} features are required", what)))?;
    match dims.as_slice() {
        [c, h, w] => Ok([*c, *h, *w]),
        other => Err(AniaError::shape_mismatch("[C, H, W]", other).into()),
    }
}

fn sequence_shape(dims: Option<Vec<usize>>, what: &str) -> Result<[usize; 2]> {
    let dims = dims.ok_or_else(|| AniaError::MissingModality(format!("{} features are required", what)))?;
    match dims.as_slice() {
        [c, l] => Ok([*c, *l]),
        other => Err(AniaError::shape_mismatch("[C, L]", other).into()),
    }
}

/// Construction parameters of each architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    Fcgr { input_shape: [usize; 3] },
    WordEmbedding { input_shape: [usize; 2] },
    Composite { fcgr_shape: [usize; 3], word_shape: [usize; 2] },
}

impl ModelKind {
    pub fn model_type(&self) -> ModelType {
        match self {
            ModelKind::Fcgr { .. } => ModelType::FcgrAnia,
            ModelKind::WordEmbedding { .. } => ModelType::WordEmbeddingAnia,
            ModelKind::Composite { .. } => ModelType::Ania,
        }
    }

    pub fn input_shape(&self) -> InputShape {
        match *self {
            ModelKind::Fcgr { input_shape } => InputShape::Image(input_shape),
            ModelKind::WordEmbedding { input_shape } => InputShape::Sequence(input_shape),
            ModelKind::Composite {
                fcgr_shape,
                word_shape,
            } => InputShape::Composite {
                fcgr: fcgr_shape,
                word: word_shape,
            },
        }
    }

    /// Rebuilds the kind recorded in a checkpoint.
    pub fn from_parts(model_type: ModelType, shape: InputShape) -> Result<Self> {
        match (model_type, shape) {
            (ModelType::FcgrAnia, InputShape::Image(input_shape)) => Ok(ModelKind::Fcgr { input_shape }),
            (ModelType::WordEmbeddingAnia, InputShape::Sequence(input_shape)) => {
                Ok(ModelKind::WordEmbedding { input_shape })
            }
            (ModelType::Ania, InputShape::Composite { fcgr, word }) => Ok(ModelKind::Composite {
                fcgr_shape: fcgr,
                word_shape: word,
            }),
            (t, s) => Err(AniaError::shape_mismatch(format!("an input shape for {}", t), s.to_string()).into()),
        }
    }

    /// Derives the kind from the tensors a dataset carries.
    pub fn from_dataset(model_type: ModelType, dataset: &MicDataset) -> Result<Self> {
        match model_type {
            ModelType::FcgrAnia => Ok(ModelKind::Fcgr {
                input_shape: image_shape(dataset.fcgr_shape(), "FCGR")?,
            }),
            ModelType::WordEmbeddingAnia => Ok(ModelKind::WordEmbedding {
                input_shape: sequence_shape(dataset.word_shape(), "word embedding")?,
            }),
            ModelType::Ania => Ok(ModelKind::Composite {
                fcgr_shape: image_shape(dataset.fcgr_shape(), "FCGR")?,
                word_shape: sequence_shape(dataset.word_shape(), "word embedding")?,
            }),
        }
    }
}

/// Returns the tensor of `modality` from `input` after checking its per-sample shape.
pub(crate) fn require_input<'a>(
    input: &'a ModelInput,
    modality: Modality,
    expected: &[usize],
) -> Result<&'a Tensor> {
    let tensor = match modality {
        Modality::Fcgr => input.fcgr.as_ref(),
        Modality::Word => input.word.as_ref(),
    }
    .ok_or_else(|| AniaError::MissingModality(format!("{} input is required", modality.as_str())))?;
    if &tensor.dims()[1..] != expected {
        return Err(AniaError::shape_mismatch(expected, &tensor.dims()[1..]).into());
    }
    Ok(tensor)
}

/// Checks a single-extractor Grad-CAM request against the model's own modality.
pub(crate) fn check_modality(own: Modality, requested: Option<Modality>) -> Result<()> {
    match requested {
        Some(m) if m != own => Err(AniaError::MissingModality(format!(
            "this model has no {} extractor",
            m.as_str()
        ))
        .into()),
        _ => Ok(()),
    }
}

/// Scalar predictions `(N, 1)` and the attention weights of one forward pass.
#[derive(Debug, Clone)]
pub struct ModelOutput {
    pub prediction: Tensor,
    pub attn_weights: Tensor,
}

/// Detached explainability artifacts of one model: one capture per extractor
/// plus the latest training-mode attention weights.
#[derive(Debug, Clone, Default)]
pub struct ExplainabilityRecord {
    pub captures: BTreeMap<Modality, BranchCapture>,
    pub attn_weights: Option<Tensor>,
}

impl ExplainabilityRecord {
    /// Flat tensor names used in checkpoint files.
    ///
    /// Single-extractor models use `features.<branch>`; the composite model
    /// inserts the modality, as in `features.fcgr.<branch>`.
    pub fn named_tensors(&self) -> Vec<(String, Tensor)> {
        let nested = self.captures.len() > 1;
        let mut out = Vec::new();
        for (modality, capture) in &self.captures {
            let prefix = |kind: &str| {
                if nested {
                    format!("{}.{}.", kind, modality.as_str())
                } else {
                    format!("{}.", kind)
                }
            };
            for (name, t) in &capture.features {
                out.push((format!("{}{}", prefix("features"), name), t.clone()));
            }
            for (name, t) in &capture.gradients {
                out.push((format!("{}{}", prefix("gradients"), name), t.clone()));
            }
        }
        if let Some(attn) = &self.attn_weights {
            out.push(("attn_weights".to_string(), attn.clone()));
        }
        out
    }

    /// Inverse of `named_tensors`, removing the explainability entries from `tensors`.
    pub fn take_from_tensors(model_type: ModelType, tensors: &mut HashMap<String, Tensor>) -> Self {
        let mut record = ExplainabilityRecord {
            attn_weights: tensors.remove("attn_weights"),
            ..Default::default()
        };
        let keys: Vec<String> = tensors
            .keys()
            .filter(|k| k.starts_with("features.") || k.starts_with("gradients."))
            .cloned()
            .collect();
        for key in keys {
            let mut parts = key.splitn(2, '.');
            let kind = parts.next().unwrap_or_default();
            let rest = parts.next().unwrap_or_default();
            let (modality, branch) = match model_type {
                ModelType::FcgrAnia => (Modality::Fcgr, rest.to_string()),
                ModelType::WordEmbeddingAnia => (Modality::Word, rest.to_string()),
                ModelType::Ania => match rest.split_once('.') {
                    Some((m, b)) => match m.parse::<Modality>() {
                        Ok(m) => (m, b.to_string()),
                        Err(_) => continue,
                    },
                    None => continue,
                },
            };
            if let Some(t) = tensors.remove(&key) {
                let capture = record.captures.entry(modality).or_default();
                if kind == "features" {
                    capture.features.insert(branch, t);
                } else {
                    capture.gradients.insert(branch, t);
                }
            }
        }
        record
    }

    pub fn feature_names(&self) -> Vec<String> {
        self.names_of("features.")
    }

    pub fn gradient_names(&self) -> Vec<String> {
        self.names_of("gradients.")
    }

    fn names_of(&self, prefix: &str) -> Vec<String> {
        self.named_tensors()
            .into_iter()
            .map(|(n, _)| n)
            .filter(|n| n.starts_with(prefix))
            .collect()
    }

    /// Grad-CAM over the stored capture.
    pub fn grad_cam(&self, branch: &str, modality: Option<Modality>) -> Result<Tensor> {
        let capture = match modality {
            Some(m) => self.captures.get(&m),
            None if self.captures.len() == 1 => self.captures.values().next(),
            None => {
                return Err(AniaError::MissingModality(
                    "Grad-CAM on the composite model requires a modality selector".to_string(),
                )
                .into())
            }
        };
        capture
            .ok_or_else(|| anyhow!(AniaError::GradientNotCaptured(format!("no capture stored for '{}'", branch))))?
            .grad_cam(branch)
    }
}

/// Shared behaviour of the three ANIA architectures.
pub trait AniaModel: Send + Sync {
    fn kind(&self) -> ModelKind;

    fn hyperparams(&self) -> &Hyperparameters;

    /// Runs the model on one batch. Training mode updates the BatchNorm
    /// statistics, applies dropout, and captures explainability state.
    fn forward(&mut self, input: &ModelInput) -> Result<ModelOutput>;

    /// Set model to evaluation mode for inference.
    /// This disables dropout and capture, and uses running BatchNorm statistics.
    fn set_evaluation_mode(&mut self);

    fn set_training_mode(&mut self);

    fn is_training(&self) -> bool;

    fn set_autocast(&mut self, autocast: Autocast);

    fn varmap(&self) -> &VarMap;

    fn device(&self) -> &Device;

    /// Var-map prefixes owned by the Inception extractor(s).
    fn inception_prefixes(&self) -> Vec<&'static str>;

    /// Records the gradient reaching each extractor output after `backward`.
    fn capture_gradients(&mut self, grads: &GradStore, grad_scale: f64) -> Result<bool>;

    /// Detached copy of the current captures and attention weights.
    fn explainability(&self) -> Result<ExplainabilityRecord>;

    /// Grad-CAM for the first sample of the latest captured batch.
    fn compute_gradcam(&self, branch: &str, modality: Option<Modality>) -> Result<Tensor>;

    /// Attention weights of the latest training-mode forward pass.
    fn attn_weights(&self) -> Option<&Tensor>;

    fn model_type(&self) -> ModelType {
        self.kind().model_type()
    }

    fn input_shape(&self) -> InputShape {
        self.kind().input_shape()
    }

    /// Variables handed to the optimizer, sorted by name.
    ///
    /// With `freeze_inception` every variable under an Inception prefix is
    /// left out, so its values are never updated.
    fn trainable_vars(&self, freeze_inception: bool) -> Result<Vec<Var>> {
        let prefixes = self.inception_prefixes();
        let data = self
            .varmap()
            .data()
            .lock()
            .map_err(|e| anyhow!("VarMap lock poisoned: {}", e))?;
        let mut named: Vec<(&String, &Var)> = data
            .iter()
            .filter(|(name, _)| {
                !(freeze_inception && prefixes.iter().any(|p| name.starts_with(&format!("{}.", p))))
            })
            .collect();
        named.sort_by(|a, b| a.0.cmp(b.0));
        Ok(named.into_iter().map(|(_, v)| v.clone()).collect())
    }

    fn param_count(&self) -> Result<usize> {
        let data = self
            .varmap()
            .data()
            .lock()
            .map_err(|e| anyhow!("VarMap lock poisoned: {}", e))?;
        Ok(data
            .iter()
            .filter(|(name, _)| !name.contains("running_"))
            .map(|(_, v)| v.elem_count())
            .sum())
    }

    /// Forward-only prediction `(N, 1)` in evaluation mode.
    fn predict(&mut self, input: &ModelInput) -> Result<Tensor> {
        let was_training = self.is_training();
        self.set_evaluation_mode();
        let out = self.forward(input).map(|o| o.prediction.detach());
        if was_training {
            self.set_training_mode();
        }
        out
    }

    fn print_summary(&self) {
        log::info!(
            "[{}] input shape {}, {} parameters, hyperparameters {}",
            self.model_type(),
            self.input_shape(),
            self.param_count().unwrap_or(0),
            self.hyperparams()
        );
    }
}

/// Builds a freshly initialised model of `kind`.
///
/// Hyperparameters are validated before any variable is created.
pub fn build_model(kind: ModelKind, hp: &Hyperparameters, device: &Device) -> Result<Box<dyn AniaModel>> {
    hp.validate_for(kind.model_type())?;
    let model: Box<dyn AniaModel> = match kind {
        ModelKind::Fcgr { input_shape } => Box::new(FcgrAnia::new(input_shape, hp, device)?),
        ModelKind::WordEmbedding { input_shape } => Box::new(WordEmbeddingAnia::new(input_shape, hp, device)?),
        ModelKind::Composite {
            fcgr_shape,
            word_shape,
        } => Box::new(AniaModelComposite::new(fcgr_shape, word_shape, hp, device)?),
    };
    log::debug!(
        "[build_model] Built {} with {} parameters",
        kind.model_type(),
        model.param_count()?
    );
    Ok(model)
}
