use anyhow::{anyhow, Result};
use candle_core::backprop::GradStore;
use candle_core::{Device, IndexOp, ModuleT, Tensor, Var};
use candle_nn::{batch_norm, BatchNorm, BatchNormConfig, Init, VarBuilder};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::building_blocks::nn::{xavier_uniform, Autocast};
use crate::error::AniaError;

/// Name under which the concatenated, weighted output is captured.
pub const OUTPUT_CAPTURE: &str = "output";

const GRADCAM_EPS: f64 = 1e-8;

/// The four parallel branches of an Inception block, in concatenation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Branch {
    OneByOne,
    ThreeByThree,
    DoubleThreeByThree,
    Pool,
}

impl Branch {
    pub const ALL: [Branch; 4] = [
        Branch::OneByOne,
        Branch::ThreeByThree,
        Branch::DoubleThreeByThree,
        Branch::Pool,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Branch::OneByOne => "branch1x1",
            Branch::ThreeByThree => "branch3x3",
            Branch::DoubleThreeByThree => "branch3x3dbl",
            Branch::Pool => "branch_pool",
        }
    }
}

/// Spatial layout handled by an Inception block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvLayout {
    /// `(N, C, H, W)` inputs.
    Image,
    /// `(N, C, L)` inputs.
    Sequence,
}

/// Convolution (no bias) -> BatchNorm -> ReLU.
#[derive(Debug, Clone)]
struct BasicConv {
    weight: Tensor,
    bn: BatchNorm,
    padding: usize,
    layout: ConvLayout,
}

impl BasicConv {
    fn new(
        vb: &VarBuilder,
        layout: ConvLayout,
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        padding: usize,
    ) -> Result<Self> {
        let (shape, receptive) = match layout {
            ConvLayout::Image => (vec![out_channels, in_channels, kernel, kernel], kernel * kernel),
            ConvLayout::Sequence => (vec![out_channels, in_channels, kernel], kernel),
        };
        let weight = vb.get_with_hints(
            shape,
            "conv.weight",
            xavier_uniform(in_channels * receptive, out_channels * receptive),
        )?;
        let bn_config = BatchNormConfig {
            eps: 1e-3,
            remove_mean: true,
            affine: true,
            momentum: 0.1,
        };
        let bn = batch_norm(out_channels, bn_config, vb.pp("bn"))?;
        Ok(Self {
            weight,
            bn,
            padding,
            layout,
        })
    }

    fn forward(&self, x: &Tensor, train: bool, autocast: &Autocast) -> candle_core::Result<Tensor> {
        let x = match self.layout {
            ConvLayout::Image => autocast.conv2d(x, &self.weight, self.padding)?,
            ConvLayout::Sequence => autocast.conv1d(x, &self.weight, self.padding)?,
        };
        self.bn.forward_t(&x, train)?.relu()
    }
}

/// Detached copies of captured activations and gradients, keyed by branch name.
#[derive(Debug, Clone, Default)]
pub struct BranchCapture {
    pub features: BTreeMap<String, Tensor>,
    pub gradients: BTreeMap<String, Tensor>,
}

impl BranchCapture {
    pub fn is_empty(&self) -> bool {
        self.features.is_empty() && self.gradients.is_empty()
    }

    /// Grad-CAM heatmap of the first sample for `branch` (or `"output"`).
    pub fn grad_cam(&self, branch: &str) -> Result<Tensor> {
        compute_grad_cam(&self.features, &self.gradients, branch)
    }
}

/// Activation/gradient capture owned by one Inception block.
///
/// Populated only by training-mode forward passes. Each such pass clears the
/// previous capture; the gradient half is filled in by `capture_gradients`
/// once the backward pass of that forward has run.
#[derive(Debug, Clone, Default)]
pub struct ExplainabilityState {
    features: BTreeMap<String, Tensor>,
    gradients: BTreeMap<String, Tensor>,
    probe: Option<Var>,
}

impl ExplainabilityState {
    pub fn features(&self) -> &BTreeMap<String, Tensor> {
        &self.features
    }

    pub fn gradients(&self) -> &BTreeMap<String, Tensor> {
        &self.gradients
    }

    pub fn has_gradients(&self) -> bool {
        !self.gradients.is_empty()
    }

    fn begin_capture(&mut self) {
        self.features.clear();
        self.gradients.clear();
        self.probe = None;
    }

    fn record_feature(&mut self, name: &str, t: &Tensor) {
        self.features.insert(name.to_string(), t.detach());
    }

    /// Routes `output` through a zero-valued variable so the backward pass
    /// keeps the gradient arriving at it.
    fn attach_probe(&mut self, output: &Tensor) -> candle_core::Result<Tensor> {
        let probe = Var::zeros(output.shape(), output.dtype(), output.device())?;
        let probed = output.add(probe.as_tensor())?;
        self.probe = Some(probe);
        Ok(probed)
    }

    /// Deep copy on the CPU, independent of the live model.
    pub fn snapshot(&self) -> Result<BranchCapture> {
        let copy = |map: &BTreeMap<String, Tensor>| -> Result<BTreeMap<String, Tensor>> {
            map.iter()
                .map(|(k, v)| Ok((k.clone(), v.to_device(&Device::Cpu)?.copy()?)))
                .collect()
        };
        Ok(BranchCapture {
            features: copy(&self.features)?,
            gradients: copy(&self.gradients)?,
        })
    }
}

/// Four-branch multi-scale convolution block with learnable branch mixing.
#[derive(Debug, Clone)]
pub struct InceptionModule {
    layout: ConvLayout,
    branch1x1: BasicConv,
    branch3x3_1: BasicConv,
    branch3x3_2: BasicConv,
    branch3x3dbl_1: BasicConv,
    branch3x3dbl_2: BasicConv,
    branch_pool: BasicConv,
    branch_weights: Tensor,
    branch_channels: usize,
    explain: ExplainabilityState,
}

impl InceptionModule {
    pub fn new_2d(vb: &VarBuilder, in_channels: usize, out_channels: usize) -> Result<Self> {
        Self::new(vb, ConvLayout::Image, in_channels, out_channels)
    }

    pub fn new_1d(vb: &VarBuilder, in_channels: usize, out_channels: usize) -> Result<Self> {
        Self::new(vb, ConvLayout::Sequence, in_channels, out_channels)
    }

    pub fn new(
        vb: &VarBuilder,
        layout: ConvLayout,
        in_channels: usize,
        out_channels: usize,
    ) -> Result<Self> {
        if out_channels == 0 || out_channels % 4 != 0 {
            return Err(AniaError::InvalidHyperparameter(format!(
                "inception out_channels ({}) must be a positive multiple of 4",
                out_channels
            ))
            .into());
        }
        let bc = out_channels / 4;
        let mid = (bc / 2).max(1);

        let conv = |name: &str, cin: usize, cout: usize, k: usize, p: usize| {
            BasicConv::new(&vb.pp(name), layout, cin, cout, k, p)
        };

        Ok(Self {
            layout,
            branch1x1: conv("branch1x1", in_channels, bc, 1, 0)?,
            branch3x3_1: conv("branch3x3_1", in_channels, mid, 1, 0)?,
            branch3x3_2: conv("branch3x3_2", mid, bc, 3, 1)?,
            branch3x3dbl_1: conv("branch3x3dbl_1", in_channels, mid, 1, 0)?,
            branch3x3dbl_2: conv("branch3x3dbl_2", mid, bc, 3, 1)?,
            branch_pool: conv("branch_pool", in_channels, bc, 1, 0)?,
            branch_weights: vb.get_with_hints(4, "branch_weights", Init::Const(0.25))?,
            branch_channels: bc,
            explain: ExplainabilityState::default(),
        })
    }

    pub fn layout(&self) -> ConvLayout {
        self.layout
    }

    pub fn out_channels(&self) -> usize {
        self.branch_channels * 4
    }

    pub fn branch_weights(&self) -> candle_core::Result<Vec<f32>> {
        self.branch_weights.to_vec1::<f32>()
    }

    pub fn explainability(&self) -> &ExplainabilityState {
        &self.explain
    }

    /// Returns the weighted concatenation `(N, out_channels, ...)`.
    ///
    /// In training mode the pre-weighting branch activations and the output
    /// are captured, and the output is wired for gradient capture.
    pub fn forward(&mut self, x: &Tensor, train: bool, autocast: &Autocast) -> candle_core::Result<Tensor> {
        let b1 = self.branch1x1.forward(x, train, autocast)?;
        let b3 = self.branch3x3_1.forward(x, train, autocast)?;
        let b3 = self.branch3x3_2.forward(&b3, train, autocast)?;
        let bd = self.branch3x3dbl_1.forward(x, train, autocast)?;
        let bd = self.branch3x3dbl_2.forward(&bd, train, autocast)?;
        let bp = self.branch_pool.forward(x, train, autocast)?;
        let branches = [b1, b3, bd, bp];

        let weighted = branches
            .iter()
            .enumerate()
            .map(|(i, b)| b.broadcast_mul(&self.branch_weights.i(i)?))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let output = Tensor::cat(&weighted, 1)?;

        if !train {
            return Ok(output);
        }

        self.explain.begin_capture();
        for (branch, activation) in Branch::ALL.iter().zip(branches.iter()) {
            self.explain.record_feature(branch.as_str(), activation);
        }
        self.explain.record_feature(OUTPUT_CAPTURE, &output);
        self.explain.attach_probe(&output)
    }

    /// Stores the gradient that reached the concatenated output during the
    /// backward pass of the latest training forward.
    ///
    /// `grad_scale` is the loss scale the backward pass ran under; the stored
    /// gradients are unscaled. Per-branch gradients are the matching channel
    /// slice multiplied by that branch's mixing weight. Returns false when no
    /// gradient is available for the current capture.
    pub fn capture_gradients(&mut self, grads: &GradStore, grad_scale: f64) -> Result<bool> {
        let probe = match &self.explain.probe {
            Some(p) => p,
            None => return Ok(false),
        };
        let grad = match grads.get(probe.as_tensor()) {
            Some(g) => g.detach(),
            None => return Ok(false),
        };
        let grad = if grad_scale != 1.0 {
            grad.affine(1.0 / grad_scale, 0.0)?
        } else {
            grad
        };

        let weights = self.branch_weights()?;
        let bc = self.branch_channels;
        let mut gradients = BTreeMap::new();
        for (i, branch) in Branch::ALL.iter().enumerate() {
            let slice = grad.narrow(1, i * bc, bc)?.affine(weights[i] as f64, 0.0)?;
            gradients.insert(branch.as_str().to_string(), slice);
        }
        gradients.insert(OUTPUT_CAPTURE.to_string(), grad);
        self.explain.gradients = gradients;
        Ok(true)
    }

    /// Grad-CAM heatmap for the first sample of the latest captured batch.
    pub fn compute_gradcam(&self, branch: &str) -> Result<Tensor> {
        compute_grad_cam(&self.explain.features, &self.explain.gradients, branch)
    }
}

/// Gradient-weighted class activation map for sample 0.
///
/// Gradients are averaged over the spatial (image) or sequence axis, used as
/// per-channel weights on the activation, summed over channels, floored at
/// zero and divided by the batch maximum plus a small epsilon.
pub fn compute_grad_cam(
    features: &BTreeMap<String, Tensor>,
    gradients: &BTreeMap<String, Tensor>,
    branch: &str,
) -> Result<Tensor> {
    let activation = features.get(branch).ok_or_else(|| {
        AniaError::GradientNotCaptured(format!(
            "no cached activation for '{}'; run a training-mode forward pass first",
            branch
        ))
    })?;
    let gradient = gradients.get(branch).ok_or_else(|| {
        AniaError::GradientNotCaptured(format!(
            "no gradient for '{}'; run the backward pass for the current forward pass first",
            branch
        ))
    })?;

    if activation.dims() != gradient.dims() {
        return Err(AniaError::shape_mismatch(activation.dims(), gradient.dims()).into());
    }

    let channel_weights = match activation.rank() {
        4 => gradient.mean_keepdim(3)?.mean_keepdim(2)?,
        3 => gradient.mean_keepdim(2)?,
        _ => {
            return Err(anyhow!(AniaError::shape_mismatch(
                "(N, C, H, W) or (N, C, L)",
                activation.dims()
            )))
        }
    };

    let cam = channel_weights.broadcast_mul(activation)?.sum(1)?.relu()?;
    let max = cam.flatten_all()?.max(0)?.to_scalar::<f32>()? as f64;
    let cam = cam.affine(1.0 / (max + GRADCAM_EPS), 0.0)?;
    Ok(cam.get(0)?)
}
