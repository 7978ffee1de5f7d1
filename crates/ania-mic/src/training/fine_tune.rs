use anyhow::{Context, Result};
use log::info;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::error::AniaError;
use crate::models::model_interface::{AniaModel, ModelKind};
use crate::training::checkpoint::{
    checkpoint_base, load_checkpoint, save_checkpoint, CheckpointPaths, FineTuneStats,
    TrainedModelState, FINE_TUNED_SUFFIX,
};
use crate::training::optim::{GradScaler, TrainOptimizer};
use crate::training::search::{autocast_for, train_epoch};
use crate::utils::data_handling::MicDataset;
use crate::utils::logging::MemoryStats;
use crate::utils::plot::write_loss_curve;
use crate::utils::stats::{LossHistory, TrainingPhase};
use crate::utils::utils::resolve_execution_device;

#[derive(Debug, Clone)]
pub struct FineTuneOptions {
    pub epochs: usize,
    pub batch_size: usize,
    /// Keep every Inception variable out of the optimizer.
    pub freeze_inception: bool,
    pub mixed_precision: bool,
    pub device: String,
    pub seed: u64,
    pub output_path: PathBuf,
}

impl Default for FineTuneOptions {
    fn default() -> Self {
        Self {
            epochs: 10,
            batch_size: 128,
            freeze_inception: true,
            mixed_precision: true,
            device: "cuda:0".to_string(),
            seed: 42,
            output_path: PathBuf::from("ania_model"),
        }
    }
}

pub struct FineTuneOutcome {
    pub model: Box<dyn AniaModel>,
    pub state: TrainedModelState,
    pub checkpoint: CheckpointPaths,
    pub loss_curve: Option<PathBuf>,
}

/// Continues training a saved model on `dataset` for a fixed number of
/// epochs and writes `<output_path>_finetuned_full.*`.
pub fn fine_tune_model(
    checkpoint_path: &Path,
    dataset: &MicDataset,
    options: &FineTuneOptions,
) -> Result<FineTuneOutcome> {
    let start_time = Instant::now();
    let resolved = resolve_execution_device(&options.device)?;
    let device = resolved.device.clone();

    let mut memory = MemoryStats::reset();
    memory.log("Before fine-tuning");

    if dataset.is_empty() {
        return Err(AniaError::EmptyDataset("fine-tuning dataset has no rows".to_string()).into());
    }
    if options.epochs == 0 || options.batch_size == 0 {
        return Err(AniaError::InvalidHyperparameter(format!(
            "fine-tuning needs epochs > 0 and batch_size > 0, got {} and {}",
            options.epochs, options.batch_size
        ))
        .into());
    }

    let loaded = load_checkpoint(checkpoint_path, &device)
        .with_context(|| format!("Failed to load checkpoint {:?} for fine-tuning", checkpoint_path))?;
    let mut model = loaded.model;
    let mut record = loaded.state.record;
    let model_type = record.model_type;

    let stored_kind = model.kind();
    let data_kind = ModelKind::from_dataset(model_type, dataset)?;
    if data_kind != stored_kind {
        return Err(AniaError::shape_mismatch(
            stored_kind.input_shape().to_string(),
            data_kind.input_shape().to_string(),
        )
        .into());
    }
    let data = dataset.to_device(&device)?;

    let autocast = autocast_for(&device, options.mixed_precision);
    model.set_autocast(autocast);
    let vars = model.trainable_vars(options.freeze_inception)?;
    let hp = model.hyperparams().clone();
    let mut optimizer = TrainOptimizer::new(hp.optimizer, vars.clone(), hp.learning_rate, hp.weight_decay)?;
    let mut scaler = GradScaler::new(autocast.is_enabled());
    let mut rng = StdRng::seed_from_u64(options.seed);

    info!(
        "[fine-tuning] {} on {} rows for {} epochs ({} trainable tensors, inception {}, optimizer {}, loss {})",
        model_type,
        data.len(),
        options.epochs,
        vars.len(),
        if options.freeze_inception { "frozen" } else { "trainable" },
        hp.optimizer.as_str(),
        hp.loss_function.as_str()
    );

    let mut history = LossHistory::default();
    for epoch in 0..options.epochs {
        let description = format!("[fine-tuning] Epoch {}:", epoch + 1);
        let avg_loss = train_epoch(
            model.as_mut(),
            &data,
            options.batch_size,
            hp.loss_function,
            &mut optimizer,
            &mut scaler,
            &vars,
            &mut rng,
            &description,
        )?;
        history.push(TrainingPhase::Train, avg_loss);
        info!("[fine-tuning] Epoch {}: avg loss {:.6}", epoch + 1, avg_loss);
        memory.record();
    }

    let fine_tune_time = start_time.elapsed().as_secs_f64();
    record.fine_tune_stats = Some(FineTuneStats {
        train_losses: history.train_losses.clone(),
        epochs: options.epochs,
        fine_tune_time,
    });

    let mut state = TrainedModelState {
        record,
        explainability: model.explainability()?,
    };
    let base = checkpoint_base(&options.output_path, FINE_TUNED_SUFFIX);
    let checkpoint = save_checkpoint(model.as_ref(), &mut state, &base)
        .context("Failed to persist the fine-tuned model")?;

    let loss_curve = match write_loss_curve(&history, &options.output_path, model_type.as_str(), "finetune") {
        Ok(path) => Some(path),
        Err(e) => {
            log::warn!("[fine-tuning] Could not write the loss curve: {:#}", e);
            None
        }
    };

    info!("[fine-tuning] Finished in {:.2}s", fine_tune_time);
    memory.record();
    memory.log("After fine-tuning");

    model.set_evaluation_mode();
    Ok(FineTuneOutcome {
        model,
        state,
        checkpoint,
        loss_curve,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::root_ania_error;
    use candle_core::{Device, Tensor};

    #[test]
    fn defaults_use_large_batches_and_a_frozen_extractor() {
        let options = FineTuneOptions::default();
        assert_eq!(options.epochs, 10);
        assert_eq!(options.batch_size, 128);
        assert!(options.freeze_inception);
    }

    #[test]
    fn zero_batch_size_is_rejected_before_loading() -> Result<()> {
        let device = Device::Cpu;
        let dataset = MicDataset::new(
            Some(Tensor::zeros((2, 1, 2, 2), candle_core::DType::F32, &device)?),
            None,
            Tensor::zeros((2, 1), candle_core::DType::F32, &device)?,
        )?;
        let options = FineTuneOptions {
            batch_size: 0,
            device: "cpu".to_string(),
            ..Default::default()
        };
        let err = fine_tune_model(Path::new("missing_model_full.json"), &dataset, &options)
            .err()
            .unwrap();
        assert!(matches!(
            root_ania_error(&err),
            Some(AniaError::InvalidHyperparameter(_))
        ));
        Ok(())
    }
}
