use anyhow::{anyhow, Context, Result};
use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::models::model_interface::{
    build_model, AniaModel, ExplainabilityRecord, InputShape, ModelKind, ModelType,
};
use crate::training::hyperparams::Hyperparameters;

pub const TRAINED_SUFFIX: &str = "_full";
pub const FINE_TUNED_SUFFIX: &str = "_finetuned_full";

pub fn framework_version() -> String {
    concat!("ania-mic ", env!("CARGO_PKG_VERSION"), " (candle)").to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainStats {
    pub train_losses: Vec<f64>,
    pub val_losses: Vec<f64>,
    /// Number of epochs the saved weights were trained for (the last epoch run,
    /// which is later than the lowest validation loss after an early stop).
    pub best_epoch: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValMetrics {
    pub best_val_loss: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FineTuneStats {
    pub train_losses: Vec<f64>,
    pub epochs: usize,
    /// Seconds.
    pub fine_tune_time: f64,
}

/// Names of the explainability tensors stored next to the weights.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExplainabilityIndex {
    pub features: Vec<String>,
    pub gradients: Vec<String>,
    pub attn_weights: bool,
}

/// JSON sidecar of a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub model_type: ModelType,
    /// File name of the tensor file, relative to the sidecar.
    pub state_dict: String,
    pub hyperparams: Hyperparameters,
    pub input_shape: InputShape,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub train_stats: Option<TrainStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub val_metrics: Option<ValMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fine_tune_stats: Option<FineTuneStats>,
    /// Wall-clock seconds of the run that produced the checkpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub training_time: Option<f64>,
    pub framework_version: String,
    #[serde(default)]
    pub explainability: ExplainabilityIndex,
}

impl CheckpointRecord {
    pub fn new(model_type: ModelType, hyperparams: Hyperparameters, input_shape: InputShape) -> Self {
        Self {
            model_type,
            state_dict: String::new(),
            hyperparams,
            input_shape,
            train_stats: None,
            val_metrics: None,
            fine_tune_stats: None,
            training_time: None,
            framework_version: framework_version(),
            explainability: ExplainabilityIndex::default(),
        }
    }
}

/// The persisted result of a training or fine-tuning run.
#[derive(Debug, Clone)]
pub struct TrainedModelState {
    pub record: CheckpointRecord,
    pub explainability: ExplainabilityRecord,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointPaths {
    pub weights: PathBuf,
    pub metadata: PathBuf,
}

/// `<output_path><suffix>` without touching any dot already in the file name.
pub fn checkpoint_base(output_path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = output_path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Accepts a checkpoint base or either of its two files.
pub fn checkpoint_paths(path: &Path) -> CheckpointPaths {
    let base = match path.extension().and_then(|e| e.to_str()) {
        Some("json") | Some("safetensors") => path.with_extension(""),
        _ => path.to_path_buf(),
    };
    CheckpointPaths {
        weights: checkpoint_base(&base, ".safetensors"),
        metadata: checkpoint_base(&base, ".json"),
    }
}

/// Writes `<base>.safetensors` (weights + explainability) and `<base>.json`.
pub fn save_checkpoint(
    model: &dyn AniaModel,
    state: &mut TrainedModelState,
    base: &Path,
) -> Result<CheckpointPaths> {
    let paths = checkpoint_paths(base);
    if let Some(dir) = paths.weights.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
    }

    let mut tensors: HashMap<String, Tensor> = HashMap::new();
    {
        let data = model
            .varmap()
            .data()
            .lock()
            .map_err(|e| anyhow!("VarMap lock poisoned: {}", e))?;
        for (name, var) in data.iter() {
            tensors.insert(name.clone(), var.as_tensor().to_device(&Device::Cpu)?);
        }
    }
    for (name, tensor) in state.explainability.named_tensors() {
        if tensors.contains_key(&name) {
            return Err(anyhow!("Tensor name collision in checkpoint: '{}'", name));
        }
        tensors.insert(name, tensor.contiguous()?);
    }
    candle_core::safetensors::save(&tensors, &paths.weights)
        .with_context(|| format!("Failed to write {:?}", paths.weights))?;

    state.record.state_dict = paths
        .weights
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    state.record.explainability = ExplainabilityIndex {
        features: state.explainability.feature_names(),
        gradients: state.explainability.gradient_names(),
        attn_weights: state.explainability.attn_weights.is_some(),
    };
    let json = serde_json::to_string_pretty(&state.record)?;
    std::fs::write(&paths.metadata, json)
        .with_context(|| format!("Failed to write {:?}", paths.metadata))?;

    log::info!(
        "[Checkpoint] Saved {} model ({} tensors) to {:?}",
        state.record.model_type,
        tensors.len(),
        paths.weights
    );
    Ok(paths)
}

pub fn read_checkpoint_record(path: &Path) -> Result<CheckpointRecord> {
    let paths = checkpoint_paths(path);
    let content = std::fs::read_to_string(&paths.metadata)
        .with_context(|| format!("Failed to read checkpoint metadata {:?}", paths.metadata))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse checkpoint metadata {:?}", paths.metadata))
}

/// A rebuilt model together with the state it was saved with.
pub struct LoadedCheckpoint {
    pub model: Box<dyn AniaModel>,
    pub state: TrainedModelState,
}

/// Rebuilds the architecture from the sidecar and loads its weights.
pub fn load_checkpoint(path: &Path, device: &Device) -> Result<LoadedCheckpoint> {
    let record = read_checkpoint_record(path)?;
    let paths = checkpoint_paths(path);
    let weights_path = paths
        .metadata
        .parent()
        .map(|d| d.join(&record.state_dict))
        .unwrap_or_else(|| PathBuf::from(&record.state_dict));

    let kind = ModelKind::from_parts(record.model_type, record.input_shape)?;
    let model = build_model(kind, &record.hyperparams, device)
        .with_context(|| format!("Failed to rebuild {} from {:?}", record.model_type, paths.metadata))?;

    let mut tensors = candle_core::safetensors::load(&weights_path, &Device::Cpu)
        .with_context(|| format!("Failed to read checkpoint weights {:?}", weights_path))?;
    let explainability = ExplainabilityRecord::take_from_tensors(record.model_type, &mut tensors);
    {
        let data = model
            .varmap()
            .data()
            .lock()
            .map_err(|e| anyhow!("VarMap lock poisoned: {}", e))?;
        for (name, var) in data.iter() {
            let tensor = tensors
                .get(name)
                .ok_or_else(|| anyhow!("Checkpoint {:?} has no tensor '{}'", weights_path, name))?;
            var.set(&tensor.to_device(device)?)
                .with_context(|| format!("Failed to load tensor '{}'", name))?;
        }
    }
    log::info!(
        "[Checkpoint] Loaded {} model from {:?} ({})",
        record.model_type,
        weights_path,
        record.framework_version
    );

    Ok(LoadedCheckpoint {
        model,
        state: TrainedModelState {
            record,
            explainability,
        },
    })
}
