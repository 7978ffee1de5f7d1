use anyhow::{Context, Result};
use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use std::collections::BTreeMap;

use crate::building_blocks::inception::InceptionModule;
use crate::building_blocks::nn::Autocast;
use crate::error::AniaError;
use crate::models::head::AttentionRegressionHead;
use crate::models::model_interface::{
    check_modality, require_input, AniaModel, ExplainabilityRecord, Modality, ModelKind, ModelOutput,
};
use crate::training::hyperparams::Hyperparameters;
use crate::utils::data_handling::ModelInput;

/// FCGR-only ANIA.
///
/// The 2D Inception output is read as a sequence of `H*W` spatial tokens of
/// `inception_out_channels` features; attention runs across all positions and
/// the attended tokens are averaged before the dense regressor.
pub struct FcgrAnia {
    varmap: VarMap,
    inception: InceptionModule,
    head: AttentionRegressionHead,
    input_shape: [usize; 3],
    hp: Hyperparameters,
    device: Device,
    training: bool,
    autocast: Autocast,
    attn_weights: Option<Tensor>,
}

impl FcgrAnia {
    pub fn new(input_shape: [usize; 3], hp: &Hyperparameters, device: &Device) -> Result<Self> {
        let out_channels = hp.inception_out_channels.ok_or_else(|| {
            AniaError::InvalidHyperparameter("'inception_out_channels' is required".to_string())
        })?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

        let inception = InceptionModule::new_2d(&vb.pp("inception"), input_shape[0], out_channels)?;
        let head = AttentionRegressionHead::new(&vb, out_channels, hp)?;

        Ok(Self {
            varmap,
            inception,
            head,
            input_shape,
            hp: hp.clone(),
            device: device.clone(),
            training: true,
            autocast: Autocast::disabled(),
            attn_weights: None,
        })
    }
}

impl AniaModel for FcgrAnia {
    fn kind(&self) -> ModelKind {
        ModelKind::Fcgr {
            input_shape: self.input_shape,
        }
    }

    fn hyperparams(&self) -> &Hyperparameters {
        &self.hp
    }

    fn forward(&mut self, input: &ModelInput) -> Result<ModelOutput> {
        let x = require_input(input, Modality::Fcgr, &self.input_shape)?;
        let x = self.inception.forward(x, self.training, &self.autocast)?;

        let (b, c, h, w) = x.dims4()?;
        let tokens = x.reshape((b, c, h * w))?.transpose(1, 2)?.contiguous()?;
        let (prediction, attn_weights) = self.head.forward_tokens(&tokens, self.training, &self.autocast)?;

        if self.training {
            self.attn_weights = Some(attn_weights.detach());
        }
        Ok(ModelOutput {
            prediction,
            attn_weights,
        })
    }

    fn set_evaluation_mode(&mut self) {
        self.training = false;
    }

    fn set_training_mode(&mut self) {
        self.training = true;
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn set_autocast(&mut self, autocast: Autocast) {
        self.autocast = autocast;
    }

    fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn inception_prefixes(&self) -> Vec<&'static str> {
        vec!["inception"]
    }

    fn capture_gradients(&mut self, grads: &GradStore, grad_scale: f64) -> Result<bool> {
        self.inception.capture_gradients(grads, grad_scale)
    }

    fn explainability(&self) -> Result<ExplainabilityRecord> {
        let mut captures = BTreeMap::new();
        captures.insert(Modality::Fcgr, self.inception.explainability().snapshot()?);
        Ok(ExplainabilityRecord {
            captures,
            attn_weights: self
                .attn_weights
                .as_ref()
                .map(|a| a.to_device(&Device::Cpu).and_then(|a| a.copy()))
                .transpose()?,
        })
    }

    fn compute_gradcam(&self, branch: &str, modality: Option<Modality>) -> Result<Tensor> {
        check_modality(Modality::Fcgr, modality)?;
        self.inception
            .compute_gradcam(branch)
            .with_context(|| format!("Grad-CAM for fcgr_ania branch '{}'", branch))
    }

    fn attn_weights(&self) -> Option<&Tensor> {
        self.attn_weights.as_ref()
    }
}
