use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingPhase {
    Train,
    Validation,
}

/// Per-epoch average losses of one training run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LossHistory {
    pub train_losses: Vec<f64>,
    pub val_losses: Vec<f64>,
}

impl LossHistory {
    pub fn push(&mut self, phase: TrainingPhase, loss: f64) {
        match phase {
            TrainingPhase::Train => self.train_losses.push(loss),
            TrainingPhase::Validation => self.val_losses.push(loss),
        }
    }

    pub fn epochs(&self) -> usize {
        self.train_losses.len()
    }

    /// Lowest validation loss seen, ignoring NaN epochs.
    pub fn best_val_loss(&self) -> Option<f64> {
        self.val_losses
            .iter()
            .copied()
            .filter(|v| !v.is_nan())
            .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.min(v))))
    }
}

/// Regression quality of a set of predictions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegressionMetrics {
    pub mae: f32,
    pub mse: f32,
    pub rmse: f32,
    pub r2: f32,
    pub pcc: f32,
}

impl RegressionMetrics {
    pub fn compute(pred: &[f32], target: &[f32]) -> Self {
        let mse = Metrics::mse(pred, target);
        Self {
            mae: Metrics::mae(pred, target),
            mse,
            rmse: mse.sqrt(),
            r2: Metrics::r2(pred, target),
            pcc: Metrics::pearson(pred, target),
        }
    }
}

impl std::fmt::Display for RegressionMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "MAE={:.4} MSE={:.4} RMSE={:.4} R2={:.4} PCC={:.4}",
            self.mae, self.mse, self.rmse, self.r2, self.pcc
        )
    }
}

pub struct Metrics;

impl Metrics {
    pub fn mae(pred: &[f32], target: &[f32]) -> f32 {
        pred.iter()
            .zip(target)
            .map(|(p, t)| (p - t).abs())
            .sum::<f32>()
            / pred.len() as f32
    }

    pub fn mse(pred: &[f32], target: &[f32]) -> f32 {
        pred.iter()
            .zip(target)
            .map(|(p, t)| (p - t).powi(2))
            .sum::<f32>()
            / pred.len() as f32
    }

    pub fn rmse(pred: &[f32], target: &[f32]) -> f32 {
        Self::mse(pred, target).sqrt()
    }

    pub fn r2(pred: &[f32], target: &[f32]) -> f32 {
        let mean_t = target.iter().copied().sum::<f32>() / target.len() as f32;
        let ss_res = pred
            .iter()
            .zip(target)
            .map(|(p, t)| (t - p).powi(2))
            .sum::<f32>();
        let ss_tot = target.iter().map(|t| (t - mean_t).powi(2)).sum::<f32>();
        if ss_tot.abs() < 1e-9 {
            0.0
        } else {
            1.0 - ss_res / ss_tot
        }
    }

    /// Pearson correlation; NaN when either side has zero variance.
    pub fn pearson(pred: &[f32], target: &[f32]) -> f32 {
        let n = pred.len() as f64;
        if n == 0.0 {
            return f32::NAN;
        }
        let mean_p = pred.iter().map(|&v| v as f64).sum::<f64>() / n;
        let mean_t = target.iter().map(|&v| v as f64).sum::<f64>() / n;
        let (mut cov, mut var_p, mut var_t) = (0.0f64, 0.0f64, 0.0f64);
        for (&p, &t) in pred.iter().zip(target) {
            let dp = p as f64 - mean_p;
            let dt = t as f64 - mean_t;
            cov += dp * dt;
            var_p += dp * dp;
            var_t += dt * dt;
        }
        if var_p == 0.0 || var_t == 0.0 {
            return f32::NAN;
        }
        (cov / (var_p.sqrt() * var_t.sqrt())) as f32
    }
}

/// Mean and standard deviation of a slice of losses.
pub fn compute_loss_stats(losses: &[f64]) -> (f64, f64) {
    if losses.is_empty() {
        return (f64::NAN, f64::NAN);
    }
    let mean = losses.iter().sum::<f64>() / losses.len() as f64;
    let var = losses.iter().map(|l| (l - mean).powi(2)).sum::<f64>() / losses.len() as f64;
    (mean, var.sqrt())
}
