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
    require_input, AniaModel, ExplainabilityRecord, Modality, ModelKind, ModelOutput,
};
use crate::training::hyperparams::Hyperparameters;
use crate::utils::data_handling::ModelInput;

/// Composite ANIA over both modalities.
///
/// A 2D extractor on the FCGR image and a 1D extractor on the word
/// embedding are flattened independently, concatenated, and projected
/// jointly into one attention token.
pub struct AniaModelComposite {
    varmap: VarMap,
    fcgr_inception: InceptionModule,
    word_inception: InceptionModule,
    head: AttentionRegressionHead,
    fcgr_shape: [usize; 3],
    word_shape: [usize; 2],
    hp: Hyperparameters,
    device: Device,
    training: bool,
    autocast: Autocast,
    attn_weights: Option<Tensor>,
}

impl AniaModelComposite {
    pub fn new(
        fcgr_shape: [usize; 3],
        word_shape: [usize; 2],
        hp: &Hyperparameters,
        device: &Device,
    ) -> Result<Self> {
        let channels = |v: Option<usize>, name: &str| {
            v.ok_or_else(|| AniaError::InvalidHyperparameter(format!("'{}' is required", name)))
        };
        let fcgr_out = channels(hp.fcgr_inception_out_channels, "fcgr_inception_out_channels")?;
        let word_out = channels(hp.word_inception_out_channels, "word_inception_out_channels")?;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

        let fcgr_inception = InceptionModule::new_2d(&vb.pp("fcgr_inception"), fcgr_shape[0], fcgr_out)?;
        let word_inception = InceptionModule::new_1d(&vb.pp("word_inception"), word_shape[0], word_out)?;
        let fcgr_dim = fcgr_out * fcgr_shape[1] * fcgr_shape[2];
        let word_dim = word_out * word_shape[1];
        let head = AttentionRegressionHead::new(&vb, fcgr_dim + word_dim, hp)?;

        Ok(Self {
            varmap,
            fcgr_inception,
            word_inception,
            head,
            fcgr_shape,
            word_shape,
            hp: hp.clone(),
            device: device.clone(),
            training: true,
            autocast: Autocast::disabled(),
            attn_weights: None,
        })
    }

    fn extractor(&self, modality: Modality) -> &InceptionModule {
        match modality {
            Modality::Fcgr => &self.fcgr_inception,
            Modality::Word => &self.word_inception,
        }
    }
}

impl AniaModel for AniaModelComposite {
    fn kind(&self) -> ModelKind {
        ModelKind::Composite {
            fcgr_shape: self.fcgr_shape,
            word_shape: self.word_shape,
        }
    }

    fn hyperparams(&self) -> &Hyperparameters {
        &self.hp
    }

    fn forward(&mut self, input: &ModelInput) -> Result<ModelOutput> {
        let fcgr = require_input(input, Modality::Fcgr, &self.fcgr_shape)?;
        let word = require_input(input, Modality::Word, &self.word_shape)?;
        if fcgr.dim(0)? != word.dim(0)? {
            return Err(AniaError::shape_mismatch(
                format!("{} fcgr rows", fcgr.dim(0)?),
                format!("{} word rows", word.dim(0)?),
            )
            .into());
        }

        let fcgr = self.fcgr_inception.forward(fcgr, self.training, &self.autocast)?;
        let word = self.word_inception.forward(word, self.training, &self.autocast)?;
        let combined = Tensor::cat(&[fcgr.flatten_from(1)?, word.flatten_from(1)?], 1)?;
        let (prediction, attn_weights) = self.head.forward_flat(&combined, self.training, &self.autocast)?;

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
        vec!["fcgr_inception", "word_inception"]
    }

    fn capture_gradients(&mut self, grads: &GradStore, grad_scale: f64) -> Result<bool> {
        let fcgr = self.fcgr_inception.capture_gradients(grads, grad_scale)?;
        let word = self.word_inception.capture_gradients(grads, grad_scale)?;
        Ok(fcgr && word)
    }

    fn explainability(&self) -> Result<ExplainabilityRecord> {
        let mut captures = BTreeMap::new();
        captures.insert(Modality::Fcgr, self.fcgr_inception.explainability().snapshot()?);
        captures.insert(Modality::Word, self.word_inception.explainability().snapshot()?);
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
        let modality = modality.ok_or_else(|| {
            AniaError::MissingModality(
                "Grad-CAM on the composite model requires a modality selector (fcgr or word)".to_string(),
            )
        })?;
        self.extractor(modality)
            .compute_gradcam(branch)
            .with_context(|| format!("Grad-CAM for ania {} branch '{}'", modality.as_str(), branch))
    }

    fn attn_weights(&self) -> Option<&Tensor> {
        self.attn_weights.as_ref()
    }
}
