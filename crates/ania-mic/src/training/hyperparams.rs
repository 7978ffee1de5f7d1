use anyhow::{Context, Result};
use rand::seq::index::sample;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::Path;

use crate::error::AniaError;
use crate::models::model_interface::ModelType;

/// Optimizer family selected by a trial's `optimizer` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum OptimizerKind {
    Adam,
    AdamW,
    Sgd,
}

impl OptimizerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptimizerKind::Adam => "adam",
            OptimizerKind::AdamW => "adamw",
            OptimizerKind::Sgd => "sgd",
        }
    }
}

impl From<String> for OptimizerKind {
    fn from(name: String) -> Self {
        match name.trim().to_lowercase().as_str() {
            "adam" => OptimizerKind::Adam,
            "adamw" => OptimizerKind::AdamW,
            "sgd" => OptimizerKind::Sgd,
            other => {
                log::warn!("Unknown optimizer '{}', falling back to adam", other);
                OptimizerKind::Adam
            }
        }
    }
}

impl From<OptimizerKind> for String {
    fn from(kind: OptimizerKind) -> Self {
        kind.as_str().to_string()
    }
}

/// Regression criterion selected by a trial's `loss_function` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum LossKind {
    Mse,
    L1,
    SmoothL1,
}

impl LossKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LossKind::Mse => "mse",
            LossKind::L1 => "l1",
            LossKind::SmoothL1 => "smooth_l1",
        }
    }
}

impl From<String> for LossKind {
    fn from(name: String) -> Self {
        match name.trim().to_lowercase().as_str() {
            "mse" => LossKind::Mse,
            "l1" | "mae" => LossKind::L1,
            "smooth_l1" => LossKind::SmoothL1,
            other => {
                log::warn!("Unknown loss function '{}', falling back to mse", other);
                LossKind::Mse
            }
        }
    }
}

impl From<LossKind> for String {
    fn from(kind: LossKind) -> Self {
        kind.as_str().to_string()
    }
}

fn default_dense_hidden_dim() -> usize {
    256
}

/// One concrete hyperparameter configuration.
///
/// Single-modality models read `inception_out_channels`; the composite model
/// reads `fcgr_inception_out_channels` and `word_inception_out_channels`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hyperparameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inception_out_channels: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fcgr_inception_out_channels: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub word_inception_out_channels: Option<usize>,
    pub num_heads: usize,
    pub d_model: usize,
    #[serde(default = "default_dense_hidden_dim")]
    pub dense_hidden_dim: usize,
    pub dropout_rate: f64,
    pub optimizer: OptimizerKind,
    pub learning_rate: f64,
    #[serde(default)]
    pub weight_decay: f64,
    pub batch_size: usize,
    pub epochs: usize,
    pub loss_function: LossKind,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Self {
            inception_out_channels: Some(128),
            fcgr_inception_out_channels: None,
            word_inception_out_channels: None,
            num_heads: 8,
            d_model: 512,
            dense_hidden_dim: default_dense_hidden_dim(),
            dropout_rate: 0.3,
            optimizer: OptimizerKind::Adam,
            learning_rate: 1e-3,
            weight_decay: 0.0,
            batch_size: 32,
            epochs: 100,
            loss_function: LossKind::Mse,
        }
    }
}

fn invalid(msg: String) -> anyhow::Error {
    AniaError::InvalidHyperparameter(msg).into()
}

fn check_channels(name: &str, value: Option<usize>) -> Result<usize> {
    match value {
        None => Err(invalid(format!("'{}' is required", name))),
        Some(c) if c == 0 || c % 4 != 0 => Err(invalid(format!(
            "'{}' ({}) must be a positive multiple of 4",
            name, c
        ))),
        Some(c) => Ok(c),
    }
}

impl Hyperparameters {
    /// Checks every structural invariant for `model_type` without touching any tensor.
    pub fn validate_for(&self, model_type: ModelType) -> Result<()> {
        if self.num_heads == 0 || self.d_model % self.num_heads != 0 {
            return Err(invalid(format!(
                "d_model ({}) must be divisible by num_heads ({})",
                self.d_model, self.num_heads
            )));
        }
        match model_type {
            ModelType::FcgrAnia | ModelType::WordEmbeddingAnia => {
                check_channels("inception_out_channels", self.inception_out_channels)?;
            }
            ModelType::Ania => {
                check_channels("fcgr_inception_out_channels", self.fcgr_inception_out_channels)?;
                check_channels("word_inception_out_channels", self.word_inception_out_channels)?;
            }
        }
        if self.dense_hidden_dim == 0 {
            return Err(invalid("dense_hidden_dim must be positive".to_string()));
        }
        if !(0.0..1.0).contains(&self.dropout_rate) {
            return Err(invalid(format!(
                "dropout_rate ({}) must be in [0, 1)",
                self.dropout_rate
            )));
        }
        if self.batch_size == 0 {
            return Err(invalid("batch_size must be positive".to_string()));
        }
        if self.epochs == 0 {
            return Err(invalid("epochs must be positive".to_string()));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(invalid(format!(
                "learning_rate ({}) must be a positive number",
                self.learning_rate
            )));
        }
        Ok(())
    }

    /// Parses one grid combination.
    pub fn from_combination(combination: &Map<String, Value>) -> Result<Self> {
        serde_json::from_value(Value::Object(combination.clone())).map_err(|e| {
            invalid(format!(
                "cannot build a configuration from {}: {}",
                Value::Object(combination.clone()),
                e
            ))
        })
    }
}

impl fmt::Display for Hyperparameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(s) => write!(f, "{}", s),
            Err(_) => write!(f, "{:?}", self),
        }
    }
}

/// Candidate values per hyperparameter, in file order.
#[derive(Debug, Clone, PartialEq)]
pub struct HyperparameterGrid {
    params: Map<String, Value>,
}

impl HyperparameterGrid {
    pub fn new(params: Map<String, Value>) -> Result<Self> {
        for (name, values) in &params {
            match values.as_array() {
                Some(list) if !list.is_empty() => {}
                _ => {
                    return Err(invalid(format!(
                        "grid entry '{}' must be a non-empty list of candidates",
                        name
                    )))
                }
            }
        }
        if params.is_empty() {
            return Err(invalid("hyperparameter grid is empty".to_string()));
        }
        Ok(Self { params })
    }

    /// Picks the section for `model_type` out of a `{ "<model_type>": { ... } }` document.
    pub fn from_document(document: &Value, model_type: ModelType) -> Result<Self> {
        let section = document
            .get(model_type.as_str())
            .ok_or_else(|| {
                AniaError::UnsupportedModelType(format!(
                    "{} (not present in the hyperparameter grid)",
                    model_type
                ))
            })?
            .as_object()
            .ok_or_else(|| invalid(format!("grid section '{}' must be an object", model_type)))?;
        log::info!(
            "[HyperparameterGrid] Loaded hyperparameter configuration for '{}'",
            model_type
        );
        Self::new(section.clone())
    }

    pub fn load<P: AsRef<Path>>(path: P, model_type: ModelType) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read hyperparameter grid {:?}", path))?;
        let document: Value = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse hyperparameter grid {:?}", path))?;
        Self::from_document(&document, model_type)
    }

    pub fn params(&self) -> &Map<String, Value> {
        &self.params
    }

    pub fn num_params(&self) -> usize {
        self.params.len()
    }

    fn radices(&self) -> Vec<usize> {
        self.params
            .values()
            .map(|v| v.as_array().map(|a| a.len()).unwrap_or(1))
            .collect()
    }

    pub fn total_combinations(&self) -> usize {
        self.radices().iter().product()
    }

    /// Decodes the `index`-th element of the Cartesian product.
    ///
    /// The last parameter varies fastest.
    fn combination_at(&self, mut index: usize) -> Map<String, Value> {
        let radices = self.radices();
        let mut picks = vec![0usize; radices.len()];
        for (slot, radix) in picks.iter_mut().zip(radices.iter()).rev() {
            *slot = index % radix;
            index /= radix;
        }
        self.params
            .iter()
            .zip(picks)
            .map(|((name, values), pick)| {
                let value = values
                    .as_array()
                    .and_then(|a| a.get(pick))
                    .cloned()
                    .unwrap_or(Value::Null);
                (name.clone(), value)
            })
            .collect()
    }

    /// Every combination, in product order.
    pub fn combinations(&self) -> Vec<Map<String, Value>> {
        (0..self.total_combinations())
            .map(|i| self.combination_at(i))
            .collect()
    }

    /// Uniform sample of `min(n, total)` distinct combinations.
    pub fn sample<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Vec<Map<String, Value>> {
        let total = self.total_combinations();
        sample(rng, total, n.min(total))
            .into_iter()
            .map(|i| self.combination_at(i))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::root_ania_error;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::json;
    use std::collections::HashSet;

    fn grid() -> HyperparameterGrid {
        let doc = json!({
            "fcgr_ania": {
                "inception_out_channels": [8, 16],
                "num_heads": [2],
                "d_model": [8, 16, 32],
                "dropout_rate": [0.1],
                "optimizer": ["adam"],
                "learning_rate": [0.001],
                "weight_decay": [0.0],
                "batch_size": [2],
                "epochs": [1],
                "loss_function": ["mse"]
            }
        });
        HyperparameterGrid::from_document(&doc, ModelType::FcgrAnia).unwrap()
    }

    #[test]
    fn product_order_last_key_fastest() {
        let g = grid();
        assert_eq!(g.total_combinations(), 6);
        let combos = g.combinations();
        let pairs: Vec<(u64, u64)> = combos
            .iter()
            .map(|c| {
                (
                    c["inception_out_channels"].as_u64().unwrap(),
                    c["d_model"].as_u64().unwrap(),
                )
            })
            .collect();
        assert_eq!(
            pairs,
            vec![(8, 8), (8, 16), (8, 32), (16, 8), (16, 16), (16, 32)]
        );
        let keys: Vec<&String> = combos[0].keys().collect();
        assert_eq!(keys[0], "inception_out_channels");
        assert_eq!(keys[2], "d_model");
    }

    #[test]
    fn random_sample_is_capped_and_distinct() {
        let g = grid();
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(g.sample(4, &mut rng).len(), 4);
        let all = g.sample(50, &mut rng);
        assert_eq!(all.len(), 6);
        let distinct: HashSet<String> = all.iter().map(|c| Value::Object(c.clone()).to_string()).collect();
        assert_eq!(distinct.len(), 6);
    }

    #[test]
    fn missing_model_type_in_grid() {
        let doc = json!({ "fcgr_ania": { "d_model": [8] } });
        let err = HyperparameterGrid::from_document(&doc, ModelType::Ania).unwrap_err();
        assert!(matches!(
            root_ania_error(&err),
            Some(AniaError::UnsupportedModelType(_))
        ));
        let doc = json!({ "ania": { "d_model": 8 } });
        assert!(HyperparameterGrid::from_document(&doc, ModelType::Ania).is_err());
    }

    #[test]
    fn unknown_optimizer_and_loss_fall_back() {
        let combo = grid().combinations().remove(0);
        let mut combo = combo;
        combo.insert("optimizer".to_string(), json!("rmsprop"));
        combo.insert("loss_function".to_string(), json!("huber"));
        let hp = Hyperparameters::from_combination(&combo).unwrap();
        assert_eq!(hp.optimizer, OptimizerKind::Adam);
        assert_eq!(hp.loss_function, LossKind::Mse);
        assert_eq!(hp.dense_hidden_dim, 256);
    }

    #[test]
    fn validation_rules() {
        let hp = Hyperparameters {
            inception_out_channels: Some(8),
            num_heads: 3,
            d_model: 8,
            ..Default::default()
        };
        let err = hp.validate_for(ModelType::FcgrAnia).unwrap_err();
        assert!(matches!(
            root_ania_error(&err),
            Some(AniaError::InvalidHyperparameter(_))
        ));

        let hp = Hyperparameters {
            inception_out_channels: Some(10),
            num_heads: 2,
            d_model: 8,
            ..Default::default()
        };
        assert!(hp.validate_for(ModelType::WordEmbeddingAnia).is_err());

        let hp = Hyperparameters {
            inception_out_channels: Some(8),
            num_heads: 2,
            d_model: 8,
            ..Default::default()
        };
        assert!(hp.validate_for(ModelType::FcgrAnia).is_ok());
        // the composite model needs its own channel fields
        assert!(hp.validate_for(ModelType::Ania).is_err());

        let hp = Hyperparameters {
            dropout_rate: 1.0,
            ..hp
        };
        assert!(hp.validate_for(ModelType::FcgrAnia).is_err());
    }

    #[test]
    fn serialises_lowercase_tags() {
        let hp = Hyperparameters {
            optimizer: OptimizerKind::AdamW,
            loss_function: LossKind::SmoothL1,
            ..Default::default()
        };
        let v = serde_json::to_value(&hp).unwrap();
        assert_eq!(v["optimizer"], json!("adamw"));
        assert_eq!(v["loss_function"], json!("smooth_l1"));
        assert!(v.get("fcgr_inception_out_channels").is_none());
        let back: Hyperparameters = serde_json::from_value(v).unwrap();
        assert_eq!(back, hp);
    }
}
