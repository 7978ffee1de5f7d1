use anyhow::{Context, Result};
use candle_core::{DType, Device, Var};
use log::info;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::time::Instant;

use crate::building_blocks::nn::Autocast;
use crate::error::AniaError;
use crate::models::model_interface::{
    build_model, AniaModel, ExplainabilityRecord, ModelKind, ModelType,
};
use crate::training::checkpoint::{
    checkpoint_base, save_checkpoint, CheckpointPaths, CheckpointRecord, TrainStats,
    TrainedModelState, ValMetrics, TRAINED_SUFFIX,
};
use crate::training::hyperparams::{HyperparameterGrid, Hyperparameters, LossKind};
use crate::training::optim::{compute_loss, GradScaler, TrainOptimizer};
use crate::utils::data_handling::{num_batches, MicDataset};
use crate::utils::logging::{MemoryStats, Progress};
use crate::utils::plot::write_loss_curve;
use crate::utils::stats::{compute_loss_stats, LossHistory, TrainingPhase};
use crate::utils::utils::resolve_execution_device;

#[derive(Debug, Clone)]
pub struct SearchOptions {
    /// Fraction of rows (taken from the top, unshuffled) used for training.
    pub train_split: f64,
    pub patience: usize,
    pub random_search: bool,
    pub num_random_samples: usize,
    pub mixed_precision: bool,
    pub seed: u64,
    pub device: String,
    /// Base path of the artifacts; `_full.safetensors`/`_full.json` are appended.
    pub output_path: PathBuf,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            train_split: 0.8,
            patience: 10,
            random_search: false,
            num_random_samples: 50,
            mixed_precision: true,
            seed: 42,
            device: "cuda:0".to_string(),
            output_path: PathBuf::from("ania_model"),
        }
    }
}

/// Patience-based stopping rule of one trial.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    best: f64,
    epochs_no_improve: usize,
}

impl EarlyStopping {
    pub fn new(patience: usize) -> Self {
        Self {
            patience,
            best: f64::INFINITY,
            epochs_no_improve: 0,
        }
    }

    /// Records one validation loss; returns true when the trial should stop.
    pub fn step(&mut self, val_loss: f64) -> bool {
        if val_loss < self.best {
            self.best = val_loss;
            self.epochs_no_improve = 0;
            false
        } else {
            self.epochs_no_improve += 1;
            self.epochs_no_improve >= self.patience
        }
    }

    /// Lowest validation loss seen so far, infinite before any improvement.
    pub fn best(&self) -> f64 {
        self.best
    }
}

/// Everything a finished trial can contribute to the final checkpoint.
pub struct TrialResult<M> {
    /// 0-based position in the trial list.
    pub index: usize,
    pub hyperparams: Hyperparameters,
    pub model: M,
    pub history: LossHistory,
    pub best_val_loss: f64,
    pub explainability: ExplainabilityRecord,
}

/// The best trial seen so far. Only replaced at trial boundaries.
pub struct BestTrialState<M> {
    best: Option<TrialResult<M>>,
}

impl<M> Default for BestTrialState<M> {
    fn default() -> Self {
        Self { best: None }
    }
}

impl<M> BestTrialState<M> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn best_val_loss(&self) -> f64 {
        self.best
            .as_ref()
            .map(|t| t.best_val_loss)
            .unwrap_or(f64::INFINITY)
    }

    /// Promotes `trial` when its loss is finite and strictly lower than the
    /// current best. Returns whether it was promoted.
    pub fn consider(&mut self, trial: TrialResult<M>) -> bool {
        if trial.best_val_loss.is_finite() && trial.best_val_loss < self.best_val_loss() {
            self.best = Some(trial);
            true
        } else {
            false
        }
    }

    pub fn best(&self) -> Option<&TrialResult<M>> {
        self.best.as_ref()
    }

    pub fn into_best(self) -> Option<TrialResult<M>> {
        self.best
    }
}

/// Result of `train_model`: the winning model, its persisted state and the
/// files that were written.
pub struct SearchOutcome {
    pub model: Box<dyn AniaModel>,
    pub state: TrainedModelState,
    pub checkpoint: CheckpointPaths,
    pub loss_curve: Option<PathBuf>,
    pub trials_run: usize,
    /// 0-based index of the winning trial.
    pub best_trial: usize,
    /// Best validation loss of every trial, in run order.
    pub trial_losses: Vec<f64>,
}

/// Reduced precision is only used on CUDA; elsewhere the request is inert.
pub(crate) fn autocast_for(device: &Device, mixed_precision: bool) -> Autocast {
    if mixed_precision && device.is_cuda() {
        Autocast::half(DType::F16)
    } else {
        if mixed_precision {
            log::debug!("[Training] Mixed precision requested but inactive on this device");
        }
        Autocast::disabled()
    }
}

/// One shuffled pass over `data`; returns the mean batch loss.
#[allow(clippy::too_many_arguments)]
pub(crate) fn train_epoch<R: Rng + ?Sized>(
    model: &mut dyn AniaModel,
    data: &MicDataset,
    batch_size: usize,
    loss_kind: LossKind,
    optimizer: &mut TrainOptimizer,
    scaler: &mut GradScaler,
    vars: &[Var],
    rng: &mut R,
    description: &str,
) -> Result<f64> {
    model.set_training_mode();
    let mut indices: Vec<usize> = (0..data.len()).collect();
    indices.shuffle(rng);

    let batches = num_batches(data.len(), batch_size);
    let progress = Progress::new(batches, description);
    let mut total_loss = 0.0f64;

    for chunk in indices.chunks(batch_size.max(1)) {
        let (input, target) = data.select(chunk)?;
        let output = model.forward(&input)?;
        let loss = compute_loss(loss_kind, &output.prediction, &target)?;

        let mut grads = scaler.scale_loss(&loss)?.backward()?;
        model.capture_gradients(&grads, scaler.scale())?;
        scaler.step(optimizer, &mut grads, vars)?;

        total_loss += loss.to_scalar::<f32>()? as f64;
        progress.inc();
    }

    let avg_loss = total_loss / batches.max(1) as f64;
    progress.update_description(&format!("{} Avg. Batch Loss: {:.4}", description, avg_loss));
    progress.finish();
    Ok(avg_loss)
}

/// Sequential evaluation pass without parameter updates; returns the mean batch loss.
pub(crate) fn evaluate_loss(
    model: &mut dyn AniaModel,
    data: &MicDataset,
    batch_size: usize,
    loss_kind: LossKind,
) -> Result<f64> {
    model.set_evaluation_mode();
    let indices: Vec<usize> = (0..data.len()).collect();
    let mut total_loss = 0.0f64;
    for chunk in indices.chunks(batch_size.max(1)) {
        let (input, target) = data.select(chunk)?;
        let output = model.forward(&input)?;
        let loss = compute_loss(loss_kind, &output.prediction.detach(), &target)?;
        total_loss += loss.to_scalar::<f32>()? as f64;
    }
    Ok(total_loss / num_batches(data.len(), batch_size).max(1) as f64)
}

#[allow(clippy::too_many_arguments)]
fn run_trial(
    index: usize,
    total: usize,
    combination: &Map<String, Value>,
    kind: ModelKind,
    train: &MicDataset,
    val: &MicDataset,
    options: &SearchOptions,
    autocast: Autocast,
    device: &Device,
    rng: &mut StdRng,
) -> Result<TrialResult<Box<dyn AniaModel>>> {
    let hp = Hyperparameters::from_combination(combination)?;
    let mut model = build_model(kind, &hp, device)?;
    model.set_autocast(autocast);

    let vars = model.trainable_vars(false)?;
    let mut optimizer = TrainOptimizer::new(hp.optimizer, vars.clone(), hp.learning_rate, hp.weight_decay)?;
    let mut scaler = GradScaler::new(autocast.is_enabled());
    let mut stopper = EarlyStopping::new(options.patience);
    let mut history = LossHistory::default();

    info!("[Search] Trial {}/{}", index + 1, total);
    model.print_summary();

    for epoch in 0..hp.epochs {
        let description = format!("[trial {}/{}] Epoch {}:", index + 1, total, epoch + 1);
        let train_loss = train_epoch(
            model.as_mut(),
            train,
            hp.batch_size,
            hp.loss_function,
            &mut optimizer,
            &mut scaler,
            &vars,
            rng,
            &description,
        )?;
        let val_loss = evaluate_loss(model.as_mut(), val, hp.batch_size, hp.loss_function)?;
        history.push(TrainingPhase::Train, train_loss);
        history.push(TrainingPhase::Validation, val_loss);
        log::debug!(
            "[Search] Trial {} epoch {}: train loss {:.6}, val loss {:.6}",
            index + 1,
            epoch + 1,
            train_loss,
            val_loss
        );

        if stopper.step(val_loss) {
            info!(
                "[Search] Trial {} stopped early after epoch {} (patience {})",
                index + 1,
                epoch + 1,
                options.patience
            );
            break;
        }
    }

    let (mean_val, std_val) = compute_loss_stats(&history.val_losses);
    info!(
        "[Search] Trial {} finished: best val loss {:.6} (mean {:.6} ± {:.6} over {} epochs)",
        index + 1,
        stopper.best(),
        mean_val,
        std_val,
        history.epochs()
    );

    Ok(TrialResult {
        index,
        explainability: model.explainability()?,
        hyperparams: hp,
        model,
        history,
        best_val_loss: stopper.best(),
    })
}

/// Searches the grid for `model_type`, keeps the trial with the lowest
/// finite validation loss, and persists it as `<output_path>_full.*`.
///
/// # Errors
///
/// - `EmptyDataset` when the split leaves no training or validation rows.
/// - `MissingModality` when the dataset lacks a tensor the model needs.
/// - `InvalidHyperparameter` when a combination breaks a model invariant.
/// - `NoViableModel` when no trial produced a finite validation loss.
pub fn train_model(
    dataset: &MicDataset,
    model_type: ModelType,
    grid: &HyperparameterGrid,
    options: &SearchOptions,
) -> Result<SearchOutcome> {
    let start_time = Instant::now();
    let resolved = resolve_execution_device(&options.device)?;
    let device = resolved.device.clone();
    info!(
        "[Search] Using device {} (requested '{}'{})",
        resolved.label(),
        resolved.requested,
        if resolved.fell_back { ", fell back" } else { "" }
    );

    let mut memory = MemoryStats::reset();
    memory.log("Before training");

    let kind = ModelKind::from_dataset(model_type, dataset)?;
    let (train, val) = dataset.split(options.train_split)?;
    if train.is_empty() || val.is_empty() {
        return Err(AniaError::EmptyDataset(format!(
            "train_split {} of {} rows leaves {} training and {} validation rows",
            options.train_split,
            dataset.len(),
            train.len(),
            val.len()
        ))
        .into());
    }
    let train = train.to_device(&device)?;
    let val = val.to_device(&device)?;

    let mut rng = StdRng::seed_from_u64(options.seed);
    let combinations = if options.random_search {
        grid.sample(options.num_random_samples, &mut rng)
    } else {
        grid.combinations()
    };
    info!(
        "[Search] {} search for {}: {} hyperparameters, {} combinations (of {}), {} train / {} val rows",
        if options.random_search { "Random" } else { "Grid" },
        model_type,
        grid.num_params(),
        combinations.len(),
        grid.total_combinations(),
        train.len(),
        val.len()
    );

    let autocast = autocast_for(&device, options.mixed_precision);
    let mut best: BestTrialState<Box<dyn AniaModel>> = BestTrialState::new();
    let mut trial_losses = Vec::with_capacity(combinations.len());

    for (index, combination) in combinations.iter().enumerate() {
        let trial = run_trial(
            index,
            combinations.len(),
            combination,
            kind,
            &train,
            &val,
            options,
            autocast,
            &device,
            &mut rng,
        );
        let trial = match trial {
            Ok(trial) => trial,
            Err(e) => {
                log::error!(
                    "[Search] Trial {} of {} failed: {:#}",
                    index + 1,
                    model_type,
                    e
                );
                return Err(e.context(format!("Trial {} of {} failed", index + 1, model_type)));
            }
        };
        let trial_loss = trial.best_val_loss;
        trial_losses.push(trial_loss);
        if best.consider(trial) {
            info!(
                "[Search] Trial {} is the new best (val loss {:.6})",
                index + 1,
                trial_loss
            );
        }
        memory.record();
    }

    let best = best.into_best().ok_or(AniaError::NoViableModel)?;
    let training_time = start_time.elapsed().as_secs_f64();

    let mut record = CheckpointRecord::new(model_type, best.hyperparams.clone(), kind.input_shape());
    // saved weights are the state after the trial's final epoch
    let best_epoch = Some(best.history.train_losses.len()).filter(|&n| n > 0);
    record.train_stats = Some(TrainStats {
        train_losses: best.history.train_losses.clone(),
        val_losses: best.history.val_losses.clone(),
        best_epoch,
    });
    record.val_metrics = Some(ValMetrics {
        best_val_loss: best.best_val_loss,
    });
    record.training_time = Some(training_time);

    let mut state = TrainedModelState {
        record,
        explainability: best.explainability,
    };
    let base = checkpoint_base(&options.output_path, TRAINED_SUFFIX);
    let checkpoint = save_checkpoint(best.model.as_ref(), &mut state, &base)
        .context("Failed to persist the best model")?;

    let loss_curve = match write_loss_curve(
        &best.history,
        &options.output_path,
        model_type.as_str(),
        "best_combination",
    ) {
        Ok(path) => Some(path),
        Err(e) => {
            log::warn!("[Search] Could not write the loss curve: {:#}", e);
            None
        }
    };

    info!(
        "[Search] Best trial {} of {}: val loss {:.6}, hyperparameters {}, training time {:.2}s",
        best.index + 1,
        combinations.len(),
        best.best_val_loss,
        best.hyperparams,
        training_time
    );
    memory.record();
    memory.log("After training");

    let mut model = best.model;
    model.set_evaluation_mode();
    Ok(SearchOutcome {
        model,
        state,
        checkpoint,
        loss_curve,
        trials_run: combinations.len(),
        best_trial: best.index,
        trial_losses,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trial(index: usize, loss: f64) -> TrialResult<&'static str> {
        TrialResult {
            index,
            hyperparams: Hyperparameters::default(),
            model: if index == 0 { "first" } else { "second" },
            history: LossHistory::default(),
            best_val_loss: loss,
            explainability: ExplainabilityRecord::default(),
        }
    }

    /// Epoch (1-based) at which the rule stops for a loss sequence.
    fn stop_epoch(losses: &[f64], patience: usize) -> usize {
        let mut stopper = EarlyStopping::new(patience);
        for (i, loss) in losses.iter().enumerate() {
            if stopper.step(*loss) {
                return i + 1;
            }
        }
        losses.len()
    }

    #[test]
    fn early_stopping_at_k_plus_p() {
        // improves until epoch 3, flat afterwards
        let losses = [1.0, 0.8, 0.5, 0.6, 0.7, 0.5, 0.9, 0.9, 0.9];
        assert_eq!(stop_epoch(&losses, 2), 5);
        assert_eq!(stop_epoch(&losses, 4), 7);
        // epoch cap comes first
        assert_eq!(stop_epoch(&losses[..4], 3), 4);
    }

    #[test]
    fn nan_counts_as_no_improvement() {
        let mut stopper = EarlyStopping::new(1);
        assert!(stopper.step(f64::NAN));
        assert!(stopper.best().is_infinite());
    }

    #[test]
    fn later_better_trial_is_promoted() {
        let mut best = BestTrialState::new();
        assert!(best.consider(trial(0, 0.5)));
        assert!(best.consider(trial(1, 0.3)));
        let winner = best.into_best().unwrap();
        assert_eq!(winner.model, "second");
        assert_eq!(winner.best_val_loss, 0.3);
    }

    #[test]
    fn ties_and_non_finite_are_not_promoted() {
        let mut best = BestTrialState::new();
        assert!(!best.consider(trial(0, f64::NAN)));
        assert!(!best.consider(trial(0, f64::INFINITY)));
        assert!(best.best().is_none());
        assert!(best.consider(trial(0, 0.4)));
        assert!(!best.consider(trial(1, 0.4)));
        assert_eq!(best.best().unwrap().model, "first");
    }

    #[test]
    fn autocast_is_inert_on_cpu() {
        assert!(!autocast_for(&Device::Cpu, true).is_enabled());
    }

    fn tiny_fcgr_split(val_target: f32) -> Result<(MicDataset, MicDataset)> {
        let device = Device::Cpu;
        let x = candle_core::Tensor::randn(0f32, 1., (4, 1, 4, 4), &device)?;
        let y = candle_core::Tensor::from_vec(vec![1.0f32, 2.0, val_target, val_target], (4, 1), &device)?;
        MicDataset::new(Some(x), None, y)?.split(0.5)
    }

    fn combination(epochs: usize) -> Map<String, Value> {
        let value = serde_json::json!({
            "inception_out_channels": 4,
            "num_heads": 2,
            "d_model": 4,
            "dense_hidden_dim": 4,
            "dropout_rate": 0.0,
            "optimizer": "adam",
            "learning_rate": 0.001,
            "batch_size": 2,
            "epochs": epochs,
            "loss_function": "mse"
        });
        value.as_object().cloned().unwrap_or_default()
    }

    fn trial_on(
        train: &MicDataset,
        val: &MicDataset,
        epochs: usize,
        patience: usize,
    ) -> Result<TrialResult<Box<dyn AniaModel>>> {
        let options = SearchOptions {
            patience,
            mixed_precision: false,
            device: "cpu".to_string(),
            ..Default::default()
        };
        let kind = ModelKind::from_dataset(ModelType::FcgrAnia, train)?;
        let mut rng = StdRng::seed_from_u64(7);
        run_trial(
            0,
            1,
            &combination(epochs),
            kind,
            train,
            val,
            &options,
            Autocast::disabled(),
            &Device::Cpu,
            &mut rng,
        )
    }

    #[test]
    fn trial_without_improvement_stops_after_patience_epochs() -> Result<()> {
        // NaN validation targets never improve, so k = 0 and the trial stops at epoch p
        let (train, val) = tiny_fcgr_split(f32::NAN)?;
        let trial = trial_on(&train, &val, 8, 3)?;
        assert_eq!(trial.history.train_losses.len(), 3);
        assert_eq!(trial.history.val_losses.len(), 3);
        assert!(trial.best_val_loss.is_infinite());
        Ok(())
    }

    #[test]
    fn trial_stops_at_the_epoch_cap_before_patience() -> Result<()> {
        let (train, val) = tiny_fcgr_split(1.5)?;
        let trial = trial_on(&train, &val, 2, 5)?;
        assert_eq!(trial.history.val_losses.len(), 2);
        assert!(trial.best_val_loss.is_finite());
        let lowest = trial
            .history
            .val_losses
            .iter()
            .cloned()
            .fold(f64::INFINITY, f64::min);
        assert_eq!(trial.best_val_loss, lowest);
        Ok(())
    }
}
