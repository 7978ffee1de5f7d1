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

/// Word-embedding ANIA: 1D Inception over `(N, embedding_dim, max_len)`,
/// flattened into a single attention token.
pub struct WordEmbeddingAnia {
    varmap: VarMap,
    inception: InceptionModule,
    head: AttentionRegressionHead,
    input_shape: [usize; 2],
    hp: Hyperparameters,
    device: Device,
    training: bool,
    autocast: Autocast,
    attn_weights: Option<Tensor>,
}

impl WordEmbeddingAnia {
    pub fn new(input_shape: [usize; 2], hp: &Hyperparameters, device: &Device) -> Result<Self> {
        let out_channels = hp.inception_out_channels.ok_or_else(|| {
            AniaError::InvalidHyperparameter("'inception_out_channels' is required".to_string())
        })?;
        let [in_channels, seq_len] = input_shape;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

        let inception = InceptionModule::new_1d(&vb.pp("inception"), in_channels, out_channels)?;
        let head = AttentionRegressionHead::new(&vb, out_channels * seq_len, hp)?;

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

impl AniaModel for WordEmbeddingAnia {
    fn kind(&self) -> ModelKind {
        ModelKind::WordEmbedding {
            input_shape: self.input_shape,
        }
    }

    fn hyperparams(&self) -> &Hyperparameters {
        &self.hp
    }

    fn forward(&mut self, input: &ModelInput) -> Result<ModelOutput> {
        let x = require_input(input, Modality::Word, &self.input_shape)?;
        let x = self.inception.forward(x, self.training, &self.autocast)?;
        let flat = x.flatten_from(1)?;
        let (prediction, attn_weights) = self.head.forward_flat(&flat, self.training, &self.autocast)?;

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
        captures.insert(Modality::Word, self.inception.explainability().snapshot()?);
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
        check_modality(Modality::Word, modality)?;
        self.inception
            .compute_gradcam(branch)
            .with_context(|| format!("Grad-CAM for word_embedding_ania branch '{}'", branch))
    }

    fn attn_weights(&self) -> Option<&Tensor> {
        self.attn_weights.as_ref()
    }
}
