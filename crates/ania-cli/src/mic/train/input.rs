use anyhow::{Context, Result};
use clap::ArgMatches;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::mic::load_data::DataConfig;
use crate::mic::util::validate_existing_file;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct MicTrainConfig {
    pub version: String,
    /// `fcgr_ania`, `word_embedding_ania` or `ania`.
    pub model_type: String,
    pub data: DataConfig,
    /// JSON grid keyed by model type.
    pub hyperparameter_grid: String,
    /// Base path of the saved model; `_full.safetensors`/`_full.json` are appended.
    pub output_path: String,
    pub device: String,
    pub train_split: f64,
    pub early_stopping_patience: usize,
    pub random_search: bool,
    pub num_random_samples: usize,
    pub mixed_precision: bool,
    pub seed: u64,
    pub report_file: Option<String>,
}

impl Default for MicTrainConfig {
    fn default() -> Self {
        MicTrainConfig {
            version: clap::crate_version!().to_string(),
            model_type: String::from("fcgr_ania"),
            data: DataConfig::default(),
            hyperparameter_grid: String::from("hyperparameters.json"),
            output_path: String::from("models/fcgr_ania"),
            device: String::from("cuda:0"),
            train_split: 0.8,
            early_stopping_patience: 10,
            random_search: false,
            num_random_samples: 50,
            mixed_precision: true,
            seed: 42,
            report_file: Some(String::from("ania_trainer_report.html")),
        }
    }
}

impl MicTrainConfig {
    pub fn from_arguments(config_path: &PathBuf, matches: &ArgMatches) -> Result<Self> {
        let config_json = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        let partial: serde_json::Value = serde_json::from_str(&config_json)
            .with_context(|| format!("Failed to parse config file: {:?}", config_path))?;
        let mut config = MicTrainConfig::default();

        macro_rules! load_or_default {
            ($field:ident) => {
                if let Some(val) = partial.get(stringify!($field)) {
                    if let Ok(parsed) = serde_json::from_value(val.clone()) {
                        config.$field = parsed;
                    } else {
                        log::warn!(
                            "Config Invalid value for '{}', using default: {:?}",
                            stringify!($field),
                            config.$field
                        );
                    }
                } else {
                    log::warn!(
                        "Config Missing field '{}', using default: {:?}",
                        stringify!($field),
                        config.$field
                    );
                }
            };
        }

        load_or_default!(model_type);
        load_or_default!(data);
        load_or_default!(hyperparameter_grid);
        load_or_default!(output_path);
        load_or_default!(device);
        load_or_default!(train_split);
        load_or_default!(early_stopping_patience);
        load_or_default!(random_search);
        load_or_default!(num_random_samples);
        load_or_default!(mixed_precision);
        load_or_default!(seed);
        load_or_default!(report_file);

        // Apply CLI overrides
        if let Some(model_type) = matches.get_one::<String>("model_type") {
            config.model_type = model_type.clone();
        }
        if let Some(grid) = matches.get_one::<String>("hyperparameter_grid") {
            config.hyperparameter_grid = grid.clone();
        }
        if let Some(output_path) = matches.get_one::<String>("output_path") {
            config.output_path = output_path.clone();
        }
        if let Some(device) = matches.get_one::<String>("device") {
            config.device = device.clone();
        }

        validate_existing_file(&config.hyperparameter_grid)?;
        Ok(config)
    }
}
