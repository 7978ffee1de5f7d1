use anyhow::{Context, Result};
use clap::ArgMatches;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::mic::load_data::DataConfig;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct MicFineTuneConfig {
    pub version: String,
    /// Sidecar (`.json`) or weights (`.safetensors`) of a trained model.
    pub model_path: String,
    pub data: DataConfig,
    /// Base path of the fine-tuned model; `_finetuned_full.*` is appended.
    pub output_path: String,
    pub device: String,
    pub epochs: usize,
    pub batch_size: usize,
    pub freeze_inception: bool,
    pub mixed_precision: bool,
    pub seed: u64,
    pub report_file: Option<String>,
}

impl Default for MicFineTuneConfig {
    fn default() -> Self {
        MicFineTuneConfig {
            version: clap::crate_version!().to_string(),
            model_path: String::new(),
            data: DataConfig::default(),
            output_path: String::from("models/fcgr_ania"),
            device: String::from("cuda:0"),
            epochs: 10,
            batch_size: 128,
            freeze_inception: true,
            mixed_precision: true,
            seed: 42,
            report_file: Some(String::from("ania_finetune_report.html")),
        }
    }
}

impl MicFineTuneConfig {
    pub fn from_arguments(config_path: &PathBuf, matches: &ArgMatches) -> Result<Self> {
        let config_json = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        let partial: serde_json::Value = serde_json::from_str(&config_json)
            .with_context(|| format!("Failed to parse config file: {:?}", config_path))?;
        let mut config = MicFineTuneConfig::default();

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

        load_or_default!(model_path);
        load_or_default!(data);
        load_or_default!(output_path);
        load_or_default!(device);
        load_or_default!(epochs);
        load_or_default!(batch_size);
        load_or_default!(freeze_inception);
        load_or_default!(mixed_precision);
        load_or_default!(seed);
        load_or_default!(report_file);

        // Apply CLI overrides
        if let Some(model_path) = matches.get_one::<String>("model_path") {
            config.model_path = model_path.clone();
        }
        if let Some(output_path) = matches.get_one::<String>("output_path") {
            config.output_path = output_path.clone();
        }
        if let Some(epochs) = matches.get_one::<usize>("epochs") {
            config.epochs = *epochs;
        }
        if matches.get_flag("unfreeze_inception") {
            config.freeze_inception = false;
        }
        if let Some(device) = matches.get_one::<String>("device") {
            config.device = device.clone();
        }

        Ok(config)
    }
}
