use anyhow::{Context, Result};
use candle_core::Device;
use serde::{Deserialize, Serialize};

use ania_mic::error::AniaError;
use ania_mic::models::model_interface::ModelType;
use ania_mic::utils::data_handling::{
    align_modalities, default_metadata_columns, extract_cgr_features, extract_word_embedding_features,
    CgrFeatureOptions, FeatureTensor, MetadataTable, MicDataset, WordFeatureOptions,
    DEFAULT_ID_COLUMN, DEFAULT_TARGET_COLUMN,
};

use crate::mic::util::{validate_existing_file, validate_tsv_or_csv_file};

/// Input files and column layout shared by every subcommand.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct DataConfig {
    /// CSV/TSV with CGR feature columns, used by `fcgr_ania` and `ania`.
    pub fcgr_data: Option<String>,
    /// `.npz`, `.npy` or `.safetensors` archive of `(N, max_len, embedding_dim)` embeddings.
    pub word_embedding_archive: Option<String>,
    /// One sequence ID per line, in archive order.
    pub word_embedding_ids: Option<String>,
    /// CSV/TSV with the IDs, metadata and targets of the embedded sequences.
    pub word_metadata: Option<String>,
    pub metadata_columns: Vec<String>,
    pub target_column: String,
    pub id_column: String,
    pub feature_start_idx: usize,
    pub feature_end_idx: usize,
    pub fcgr_height: usize,
    pub fcgr_width: usize,
    pub max_len: usize,
}

impl Default for DataConfig {
    fn default() -> Self {
        let cgr = CgrFeatureOptions::default();
        let word = WordFeatureOptions::default();
        DataConfig {
            fcgr_data: None,
            word_embedding_archive: None,
            word_embedding_ids: None,
            word_metadata: None,
            metadata_columns: default_metadata_columns(),
            target_column: DEFAULT_TARGET_COLUMN.to_string(),
            id_column: DEFAULT_ID_COLUMN.to_string(),
            feature_start_idx: cgr.feature_start_idx,
            feature_end_idx: cgr.feature_end_idx,
            fcgr_height: cgr.height,
            fcgr_width: cgr.width,
            max_len: word.max_len,
        }
    }
}

impl DataConfig {
    pub fn cgr_options(&self) -> CgrFeatureOptions {
        CgrFeatureOptions {
            metadata_columns: self.metadata_columns.clone(),
            target_column: self.target_column.clone(),
            feature_start_idx: self.feature_start_idx,
            feature_end_idx: self.feature_end_idx,
            height: self.fcgr_height,
            width: self.fcgr_width,
        }
    }

    pub fn word_options(&self) -> WordFeatureOptions {
        WordFeatureOptions {
            metadata_columns: self.metadata_columns.clone(),
            target_column: self.target_column.clone(),
            id_column: self.id_column.clone(),
            max_len: self.max_len,
        }
    }

    /// Checks that every file `model_type` needs is configured and present.
    pub fn validate_for(&self, model_type: ModelType) -> Result<()> {
        if model_type.needs_fcgr() {
            let path = required(&self.fcgr_data, "fcgr_data", model_type)?;
            validate_tsv_or_csv_file(path)?;
        }
        if model_type.needs_word() {
            validate_existing_file(required(&self.word_embedding_archive, "word_embedding_archive", model_type)?)?;
            validate_existing_file(required(&self.word_embedding_ids, "word_embedding_ids", model_type)?)?;
            validate_tsv_or_csv_file(required(&self.word_metadata, "word_metadata", model_type)?)?;
        }
        Ok(())
    }
}

fn required<'a>(value: &'a Option<String>, field: &str, model_type: ModelType) -> Result<&'a str> {
    value.as_deref().ok_or_else(|| {
        AniaError::MissingModality(format!("'{}' must be set for {}", field, model_type)).into()
    })
}

/// Builds the dataset `model_type` consumes, plus the metadata rows used in
/// prediction tables.
pub fn load_dataset(model_type: ModelType, config: &DataConfig) -> Result<(MicDataset, MetadataTable)> {
    config.validate_for(model_type)?;
    let device = Device::Cpu;

    let fcgr: Option<FeatureTensor> = match (model_type.needs_fcgr(), &config.fcgr_data) {
        (true, Some(path)) => Some(
            extract_cgr_features(path, &config.cgr_options(), &device)
                .with_context(|| format!("Failed to build CGR features from {}", path))?,
        ),
        _ => None,
    };
    let word: Option<FeatureTensor> = match (
        model_type.needs_word(),
        &config.word_embedding_archive,
        &config.word_embedding_ids,
        &config.word_metadata,
    ) {
        (true, Some(archive), Some(ids), Some(table)) => Some(
            extract_word_embedding_features(
                archive.as_str(),
                ids.as_str(),
                table.as_str(),
                &config.word_options(),
                &device,
            )
            .with_context(|| format!("Failed to build word embedding features from {}", archive))?,
        ),
        _ => None,
    };

    let fcgr = match (fcgr, &word) {
        (Some(fcgr), Some(word)) => Some(
            align_modalities(&fcgr, word, &config.id_column)
                .context("Failed to pair CGR rows with word embedding rows")?,
        ),
        (fcgr, _) => fcgr,
    };

    let metadata = fcgr
        .as_ref()
        .or(word.as_ref())
        .map(|f| f.metadata().clone())
        .unwrap_or_default();
    let dataset = MicDataset::from_features(fcgr.as_ref(), word.as_ref())?;
    log::info!(
        "[ANIA::Data] Loaded {} rows for {} (fcgr: {:?}, word: {:?})",
        dataset.len(),
        model_type,
        dataset.fcgr_shape(),
        dataset.word_shape()
    );
    Ok((dataset, metadata))
}
