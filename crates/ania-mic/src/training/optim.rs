use candle_core::backprop::GradStore;
use candle_core::{DType, Result, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};

use crate::training::hyperparams::{LossKind, OptimizerKind};

#[derive(Clone, Debug)]
pub struct ParamsAdam {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    /// L2 penalty added to the gradient before the moment updates.
    pub weight_decay: f64,
}

impl Default for ParamsAdam {
    fn default() -> Self {
        Self {
            lr: 0.001,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
        }
    }
}

#[derive(Debug)]
struct VarAdam {
    var: Var,
    first_moment: Var,
    second_moment: Var,
}

/// Adam with coupled (L2) weight decay.
#[derive(Debug)]
pub struct Adam {
    vars: Vec<VarAdam>,
    step_t: usize,
    params: ParamsAdam,
}

impl Optimizer for Adam {
    type Config = ParamsAdam;

    fn new(vars: Vec<Var>, params: ParamsAdam) -> Result<Self> {
        let vars = vars
            .into_iter()
            .filter(|var| var.dtype().is_float())
            .map(|var| {
                let first_moment = Var::zeros(var.shape(), var.dtype(), var.device())?;
                let second_moment = Var::zeros(var.shape(), var.dtype(), var.device())?;
                Ok(VarAdam {
                    var,
                    first_moment,
                    second_moment,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            vars,
            step_t: 0,
            params,
        })
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr
    }

    fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.step_t += 1;
        let ParamsAdam {
            lr,
            beta1,
            beta2,
            eps,
            weight_decay,
        } = self.params;
        let scale_m = 1f64 / (1f64 - beta1.powi(self.step_t as i32));
        let scale_v = 1f64 / (1f64 - beta2.powi(self.step_t as i32));
        for var in self.vars.iter() {
            let theta = &var.var;
            let m = &var.first_moment;
            let v = &var.second_moment;
            if let Some(g) = grads.get(theta) {
                let g = if weight_decay != 0.0 {
                    g.add(&theta.as_tensor().affine(weight_decay, 0.0)?)?
                } else {
                    g.clone()
                };
                let next_m = ((m.as_tensor() * beta1)? + (&g * (1.0 - beta1))?)?;
                let next_v = ((v.as_tensor() * beta2)? + (g.sqr()? * (1.0 - beta2))?)?;
                let m_hat = (&next_m * scale_m)?;
                let v_hat = (&next_v * scale_v)?;
                let update = (m_hat / (v_hat.sqrt()? + eps)?)?;
                theta.set(&theta.as_tensor().sub(&(update * lr)?)?)?;
                m.set(&next_m)?;
                v.set(&next_v)?;
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct ParamsSgd {
    pub lr: f64,
    pub momentum: f64,
    pub weight_decay: f64,
}

impl Default for ParamsSgd {
    fn default() -> Self {
        Self {
            lr: 0.01,
            momentum: 0.9,
            weight_decay: 0.0,
        }
    }
}

/// SGD with heavy-ball momentum and coupled weight decay.
#[derive(Debug)]
pub struct MomentumSgd {
    vars: Vec<(Var, Var)>,
    params: ParamsSgd,
}

impl Optimizer for MomentumSgd {
    type Config = ParamsSgd;

    fn new(vars: Vec<Var>, params: ParamsSgd) -> Result<Self> {
        let vars = vars
            .into_iter()
            .filter(|var| var.dtype().is_float())
            .map(|var| {
                let buf = Var::zeros(var.shape(), var.dtype(), var.device())?;
                Ok((var, buf))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { vars, params })
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr
    }

    fn step(&mut self, grads: &GradStore) -> Result<()> {
        let ParamsSgd {
            lr,
            momentum,
            weight_decay,
        } = self.params;
        for (var, buf) in self.vars.iter() {
            if let Some(g) = grads.get(var) {
                let g = if weight_decay != 0.0 {
                    g.add(&var.as_tensor().affine(weight_decay, 0.0)?)?
                } else {
                    g.clone()
                };
                // a zero buffer makes the first step equal to the raw gradient
                let next_buf = ((buf.as_tensor() * momentum)? + g)?;
                var.set(&var.as_tensor().sub(&(&next_buf * lr)?)?)?;
                buf.set(&next_buf)?;
            }
        }
        Ok(())
    }
}

/// The optimizer of one trial or fine-tuning run.
pub enum TrainOptimizer {
    Adam(Adam),
    AdamW(AdamW),
    Sgd(MomentumSgd),
}

impl TrainOptimizer {
    pub fn new(kind: OptimizerKind, vars: Vec<Var>, lr: f64, weight_decay: f64) -> Result<Self> {
        Ok(match kind {
            OptimizerKind::Adam => TrainOptimizer::Adam(Adam::new(
                vars,
                ParamsAdam {
                    lr,
                    weight_decay,
                    ..Default::default()
                },
            )?),
            OptimizerKind::AdamW => TrainOptimizer::AdamW(AdamW::new(
                vars,
                ParamsAdamW {
                    lr,
                    weight_decay,
                    ..Default::default()
                },
            )?),
            OptimizerKind::Sgd => TrainOptimizer::Sgd(MomentumSgd::new(
                vars,
                ParamsSgd {
                    lr,
                    weight_decay,
                    ..Default::default()
                },
            )?),
        })
    }

    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        match self {
            TrainOptimizer::Adam(opt) => opt.step(grads),
            TrainOptimizer::AdamW(opt) => opt.step(grads),
            TrainOptimizer::Sgd(opt) => opt.step(grads),
        }
    }

    pub fn learning_rate(&self) -> f64 {
        match self {
            TrainOptimizer::Adam(opt) => opt.learning_rate(),
            TrainOptimizer::AdamW(opt) => opt.learning_rate(),
            TrainOptimizer::Sgd(opt) => opt.learning_rate(),
        }
    }
}

/// Mean loss between `(N, 1)` predictions and targets.
pub fn compute_loss(kind: LossKind, predicted: &Tensor, target: &Tensor) -> Result<Tensor> {
    let predicted = predicted.to_dtype(DType::F32)?;
    match kind {
        LossKind::Mse => candle_nn::loss::mse(&predicted, target),
        LossKind::L1 => predicted.sub(target)?.abs()?.mean_all(),
        LossKind::SmoothL1 => {
            let diff = predicted.sub(target)?.abs()?;
            let quadratic = (diff.sqr()? * 0.5)?;
            let linear = (&diff - 0.5)?;
            diff.lt(1.0)?.where_cond(&quadratic, &linear)?.mean_all()
        }
    }
}

/// Dynamic loss scaling for reduced-precision training.
///
/// The loss is multiplied by `scale` before `backward`; gradients are divided
/// by it again before the optimizer step. A step whose gradients contain a
/// non-finite value is skipped and the scale is halved; after
/// `growth_interval` consecutive clean steps the scale doubles.
#[derive(Debug, Clone)]
pub struct GradScaler {
    enabled: bool,
    scale: f64,
    growth_factor: f64,
    backoff_factor: f64,
    growth_interval: usize,
    growth_tracker: usize,
}

impl GradScaler {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            scale: 65536.0,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
            growth_tracker: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Current loss multiplier; 1 when scaling is off.
    pub fn scale(&self) -> f64 {
        if self.enabled {
            self.scale
        } else {
            1.0
        }
    }

    pub fn scale_loss(&self, loss: &Tensor) -> Result<Tensor> {
        if self.enabled {
            loss.affine(self.scale, 0.0)
        } else {
            Ok(loss.clone())
        }
    }

    /// Divides the gradients of `vars` by the scale in place and reports
    /// whether all of them are finite.
    pub fn unscale(&self, grads: &mut GradStore, vars: &[Var]) -> Result<bool> {
        let inv = 1.0 / self.scale();
        let mut finite = true;
        for var in vars {
            if let Some(g) = grads.remove(var.as_tensor()) {
                let g = if self.enabled { g.affine(inv, 0.0)? } else { g };
                let total = g.sum_all()?.to_dtype(DType::F32)?.to_scalar::<f32>()?;
                finite &= total.is_finite();
                grads.insert(var.as_tensor(), g);
            }
        }
        Ok(finite)
    }

    pub fn update(&mut self, found_inf: bool) {
        if !self.enabled {
            return;
        }
        if found_inf {
            self.scale *= self.backoff_factor;
            self.growth_tracker = 0;
        } else {
            self.growth_tracker += 1;
            if self.growth_tracker == self.growth_interval {
                self.scale *= self.growth_factor;
                self.growth_tracker = 0;
            }
        }
    }

    /// Unscales, steps the optimizer unless an overflow was found, and
    /// updates the scale. Returns whether the step was applied.
    pub fn step(&mut self, optimizer: &mut TrainOptimizer, grads: &mut GradStore, vars: &[Var]) -> Result<bool> {
        if !self.enabled {
            optimizer.step(grads)?;
            return Ok(true);
        }
        let finite = self.unscale(grads, vars)?;
        if finite {
            optimizer.step(grads)?;
        } else {
            log::debug!(
                "[GradScaler] Non-finite gradients at scale {}, skipping step",
                self.scale
            );
        }
        self.update(!finite);
        Ok(finite)
    }
}
