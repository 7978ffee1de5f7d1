use anyhow::{anyhow, Context, Result};
use candle_core::{DType, Device, Tensor};
use csv::{ReaderBuilder, StringRecord};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::error::AniaError;

pub const DEFAULT_TARGET_COLUMN: &str = "Log MIC Value";
pub const DEFAULT_ID_COLUMN: &str = "ID";

pub fn default_metadata_columns() -> Vec<String> {
    vec!["ID".to_string(), "Sequence".to_string(), "Targets".to_string()]
}

/// Row-aligned metadata carried next to a feature tensor.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MetadataTable {
    columns: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl MetadataTable {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<String>>) -> Result<Self> {
        if let Some((i, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != columns.len()) {
            return Err(AniaError::shape_mismatch(
                format!("{} metadata fields", columns.len()),
                format!("{} fields in row {}", row.len(), i),
            )
            .into());
        }
        Ok(Self { columns, rows })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn column(&self, name: &str) -> Result<Vec<&str>> {
        let idx = self
            .column_index(name)
            .ok_or_else(|| AniaError::MissingColumn(name.to_string()))?;
        Ok(self.rows.iter().map(|r| r[idx].as_str()).collect())
    }
}

/// Immutable feature tensor with its `(N, 1)` targets and `N` metadata rows.
#[derive(Debug, Clone)]
pub struct FeatureTensor {
    features: Tensor,
    targets: Tensor,
    metadata: MetadataTable,
}

impl FeatureTensor {
    pub fn new(features: Tensor, targets: Tensor, metadata: MetadataTable) -> Result<Self> {
        let n = features.dim(0)?;
        let rank = features.rank();
        if rank != 3 && rank != 4 {
            return Err(AniaError::shape_mismatch(
                "(N, C, L) or (N, 1, H, W)",
                features.dims(),
            )
            .into());
        }
        if targets.dims() != [n, 1] {
            return Err(AniaError::shape_mismatch([n, 1], targets.dims()).into());
        }
        if metadata.len() != n {
            return Err(AniaError::shape_mismatch(
                format!("{} metadata rows", n),
                format!("{} metadata rows", metadata.len()),
            )
            .into());
        }
        Ok(Self {
            features,
            targets,
            metadata,
        })
    }

    pub fn features(&self) -> &Tensor {
        &self.features
    }

    pub fn targets(&self) -> &Tensor {
        &self.targets
    }

    pub fn metadata(&self) -> &MetadataTable {
        &self.metadata
    }

    pub fn len(&self) -> usize {
        self.metadata.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metadata.is_empty()
    }

    /// Per-sample shape, i.e. the dims after the batch axis.
    pub fn sample_shape(&self) -> Vec<usize> {
        self.features.dims()[1..].to_vec()
    }

    /// Gathers the rows at `indices`, keeping features, targets and metadata together.
    pub fn select_rows(&self, indices: &[usize]) -> Result<FeatureTensor> {
        let idx: Vec<u32> = indices.iter().map(|&i| i as u32).collect();
        let idx = Tensor::from_vec(idx, indices.len(), self.features.device())?;
        let rows = indices
            .iter()
            .map(|&i| self.metadata.rows[i].clone())
            .collect();
        FeatureTensor::new(
            self.features.index_select(&idx, 0)?,
            self.targets.index_select(&idx, 0)?,
            MetadataTable::new(self.metadata.columns.clone(), rows)?,
        )
    }
}

/// Reorders the CGR rows so that row `i` of both modalities is the same sequence.
///
/// The word side keeps its archive order. Both tables must carry `id_column`
/// and list the same identifiers, otherwise the pairing fails.
pub fn align_modalities(
    fcgr: &FeatureTensor,
    word: &FeatureTensor,
    id_column: &str,
) -> Result<FeatureTensor> {
    let fcgr_ids = fcgr.metadata().column(id_column).context("CGR table")?;
    let word_ids = word.metadata().column(id_column).context("word embedding table")?;
    if fcgr_ids == word_ids {
        return Ok(fcgr.clone());
    }
    if fcgr_ids.len() != word_ids.len() {
        return Err(AniaError::shape_mismatch(
            format!("{} word embedding rows", word_ids.len()),
            format!("{} fcgr rows", fcgr_ids.len()),
        )
        .into());
    }

    log::warn!("[FeatureBuilder] CGR rows and word embedding rows are in a different order. Pairing by {}.", id_column);
    let lookup: HashMap<&str, usize> = fcgr_ids
        .iter()
        .enumerate()
        .map(|(i, id)| (id.trim(), i))
        .collect();
    let indices = word_ids
        .iter()
        .map(|id| {
            lookup.get(id.trim()).copied().ok_or_else(|| {
                anyhow!(AniaError::MissingTarget(format!(
                    "no CGR row for identifier '{}'",
                    id
                )))
            })
        })
        .collect::<Result<Vec<_>>>()?;
    fcgr.select_rows(&indices)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CgrFeatureOptions {
    pub metadata_columns: Vec<String>,
    pub target_column: String,
    /// First feature column (0-based, inclusive).
    pub feature_start_idx: usize,
    /// Last feature column (0-based, inclusive).
    pub feature_end_idx: usize,
    pub height: usize,
    pub width: usize,
}

impl Default for CgrFeatureOptions {
    fn default() -> Self {
        Self {
            metadata_columns: default_metadata_columns(),
            target_column: DEFAULT_TARGET_COLUMN.to_string(),
            feature_start_idx: 315,
            feature_end_idx: 570,
            height: 16,
            width: 16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WordFeatureOptions {
    pub metadata_columns: Vec<String>,
    pub target_column: String,
    pub id_column: String,
    pub max_len: usize,
}

impl Default for WordFeatureOptions {
    fn default() -> Self {
        Self {
            metadata_columns: default_metadata_columns(),
            target_column: DEFAULT_TARGET_COLUMN.to_string(),
            id_column: DEFAULT_ID_COLUMN.to_string(),
            max_len: 64,
        }
    }
}

/// Header row plus string records of a CSV/TSV file.
#[derive(Debug, Clone)]
pub struct RawTable {
    pub headers: Vec<String>,
    pub records: Vec<StringRecord>,
}

impl RawTable {
    fn position(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }
}

/// Reads a delimited table; `.tsv` files are tab separated, anything else comma separated.
pub fn read_table<P: AsRef<Path>>(path: P) -> Result<RawTable> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("Failed to open file: {:?}", path))?;

    let is_tsv = path.extension().map(|e| e == "tsv").unwrap_or(false);
    let delimiter = if is_tsv { b'\t' } else { b',' };

    let mut rdr = ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .from_reader(BufReader::new(file));

    let headers = rdr.headers()?.iter().map(|h| h.trim().to_string()).collect();
    let records = rdr
        .records()
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to parse records in {:?}", path))?;

    Ok(RawTable { headers, records })
}

fn is_missing(cell: &str) -> bool {
    matches!(
        cell.trim().to_lowercase().as_str(),
        "" | "na" | "nan" | "null" | "none"
    )
}

fn extract_metadata(table: &RawTable, columns: &[String]) -> Result<MetadataTable> {
    let indices = columns
        .iter()
        .map(|c| {
            table
                .position(c)
                .ok_or_else(|| anyhow!(AniaError::MissingColumn(c.clone())))
        })
        .collect::<Result<Vec<_>>>()?;

    let rows = table
        .records
        .iter()
        .map(|rec| {
            indices
                .iter()
                .map(|&i| rec.get(i).unwrap_or("").to_string())
                .collect()
        })
        .collect();
    MetadataTable::new(columns.to_vec(), rows)
}

fn extract_targets(table: &RawTable, target_column: &str) -> Result<Vec<f32>> {
    let idx = table
        .position(target_column)
        .ok_or_else(|| AniaError::MissingTarget(format!("column '{}' is absent", target_column)))?;

    table
        .records
        .iter()
        .enumerate()
        .map(|(row, rec)| {
            let cell = rec.get(idx).unwrap_or("");
            if is_missing(cell) {
                return Err(AniaError::MissingTarget(format!(
                    "'{}' contains missing values (row {})",
                    target_column, row
                ))
                .into());
            }
            cell.trim().parse::<f32>().map_err(|_| {
                anyhow!(AniaError::MissingTarget(format!(
                    "'{}' holds non-numeric value '{}' (row {})",
                    target_column, cell, row
                )))
            })
        })
        .collect()
}

fn ensure_not_empty(table: &RawTable, source: &str) -> Result<()> {
    if table.records.is_empty() {
        return Err(AniaError::EmptyDataset(format!("'{}' is empty", source)).into());
    }
    Ok(())
}

/// Builds an `(N, 1, height, width)` CGR feature tensor from an already-read table.
pub fn build_cgr_features(
    table: &RawTable,
    options: &CgrFeatureOptions,
    source: &str,
    device: &Device,
) -> Result<FeatureTensor> {
    ensure_not_empty(table, source)?;
    let targets = extract_targets(table, &options.target_column)?;
    let metadata = extract_metadata(table, &options.metadata_columns)?;

    let n_cols = table.headers.len();
    let start = options.feature_start_idx.min(n_cols);
    let end = options.feature_end_idx.saturating_add(1).min(n_cols).max(start);
    let feature_columns = &table.headers[start..end];
    log::info!(
        "[FeatureBuilder] Extracted {} features and {} targets from '{}' (first: {:?}, last: {:?})",
        feature_columns.len(),
        targets.len(),
        source,
        feature_columns.first(),
        feature_columns.last()
    );

    let expected = options.height * options.width;
    if feature_columns.len() != expected {
        return Err(AniaError::shape_mismatch(
            format!("{} columns for a {}x{} map", expected, options.height, options.width),
            format!("{} columns", feature_columns.len()),
        )
        .into());
    }

    let rows: Vec<Vec<f32>> = table
        .records
        .par_iter()
        .enumerate()
        .map(|(row, rec)| {
            (start..end)
                .map(|col| {
                    let cell = rec.get(col).unwrap_or("");
                    cell.trim().parse::<f32>().map_err(|_| {
                        anyhow!(
                            "Non-numeric value '{}' in feature column '{}' (row {})",
                            cell,
                            table.headers[col],
                            row
                        )
                    })
                })
                .collect::<Result<Vec<f32>>>()
        })
        .collect::<Result<Vec<_>>>()?;

    let n = rows.len();
    let flat: Vec<f32> = rows.into_iter().flatten().collect();
    let features = Tensor::from_vec(flat, (n, 1, options.height, options.width), device)?;
    let targets = Tensor::from_vec(targets, (n, 1), device)?;
    log::debug!(
        "[FeatureBuilder] Feature shape after reshape: {:?}, target shape: {:?}",
        features.dims(),
        targets.dims()
    );

    FeatureTensor::new(features, targets, metadata)
}

/// Reads CGR features, targets and metadata from a CSV/TSV file.
pub fn extract_cgr_features<P: AsRef<Path>>(
    path: P,
    options: &CgrFeatureOptions,
    device: &Device,
) -> Result<FeatureTensor> {
    let path = path.as_ref();
    log::info!("[FeatureBuilder] Loading CGR data from {:?}", path);
    let table = read_table(path)?;
    build_cgr_features(&table, options, &path.display().to_string(), device)
}

/// Loads the `(N, max_len, embedding_dim)` array of a precomputed embedding archive.
///
/// `.safetensors` and `.npz` archives must hold an `encoded_matrices` entry;
/// a bare `.npy` file is taken as the array itself.
pub fn load_embedding_archive<P: AsRef<Path>>(path: P) -> Result<Tensor> {
    let path = path.as_ref();
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();

    let tensor = match ext.as_str() {
        "safetensors" => {
            let mut tensors = candle_core::safetensors::load(path, &Device::Cpu)
                .with_context(|| format!("Failed to read {:?}", path))?;
            tensors
                .remove("encoded_matrices")
                .ok_or_else(|| AniaError::MissingColumn("encoded_matrices".to_string()))?
        }
        "npz" => Tensor::read_npz_by_name(path, &["encoded_matrices"])
            .with_context(|| format!("Failed to read {:?}", path))?
            .pop()
            .ok_or_else(|| AniaError::MissingColumn("encoded_matrices".to_string()))?,
        "npy" => Tensor::read_npy(path).with_context(|| format!("Failed to read {:?}", path))?,
        other => anyhow::bail!("Unsupported embedding archive extension '{}': {:?}", other, path),
    };

    if tensor.rank() != 3 {
        return Err(AniaError::shape_mismatch("(N, max_len, embedding_dim)", tensor.dims()).into());
    }
    Ok(tensor.to_dtype(DType::F32)?)
}

/// Reads one identifier per line, skipping blank lines.
pub fn read_identifiers<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("Failed to open file: {:?}", path))?;
    let mut ids = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        let id = line.trim();
        if !id.is_empty() {
            ids.push(id.to_string());
        }
    }
    Ok(ids)
}

/// Reorders table records so that the `id_column` follows `identifiers`.
///
/// Identical order is a no-op. Otherwise the table is re-indexed with a
/// warning; an identifier with no matching row is a missing target.
pub fn align_table_to_identifiers(
    table: &RawTable,
    id_column: &str,
    identifiers: &[String],
) -> Result<RawTable> {
    let id_idx = table
        .position(id_column)
        .ok_or_else(|| AniaError::MissingColumn(id_column.to_string()))?;

    let table_ids: Vec<&str> = table
        .records
        .iter()
        .map(|r| r.get(id_idx).unwrap_or("").trim())
        .collect();
    if table_ids.len() == identifiers.len()
        && table_ids.iter().zip(identifiers).all(|(a, b)| *a == b.as_str())
    {
        return Ok(table.clone());
    }

    log::warn!("[FeatureBuilder] Sequence IDs in the embedding archive and the table do not fully match. Aligning by ID.");
    let lookup: HashMap<&str, usize> = table_ids
        .iter()
        .enumerate()
        .map(|(i, id)| (*id, i))
        .collect();

    let records = identifiers
        .iter()
        .map(|id| {
            lookup
                .get(id.as_str())
                .map(|&i| table.records[i].clone())
                .ok_or_else(|| {
                    anyhow!(AniaError::MissingTarget(format!(
                        "no table row for identifier '{}'",
                        id
                    )))
                })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(RawTable {
        headers: table.headers.clone(),
        records,
    })
}

/// Builds an `(N, embedding_dim, max_len)` feature tensor from an embedding
/// array `(N, max_len, embedding_dim)`, its identifiers and the metadata table.
pub fn build_word_embedding_features(
    encoded: &Tensor,
    identifiers: &[String],
    table: &RawTable,
    options: &WordFeatureOptions,
    source: &str,
    device: &Device,
) -> Result<FeatureTensor> {
    ensure_not_empty(table, source)?;
    // validate before alignment so absent columns are reported against the raw table
    extract_targets(table, &options.target_column)?;
    extract_metadata(table, &options.metadata_columns)?;

    let (n, max_len, embedding_dim) = encoded.dims3()?;
    if identifiers.len() != n {
        return Err(AniaError::shape_mismatch(
            format!("{} identifiers", n),
            format!("{} identifiers", identifiers.len()),
        )
        .into());
    }

    let aligned = align_table_to_identifiers(table, &options.id_column, identifiers)?;
    let targets = extract_targets(&aligned, &options.target_column)?;
    let metadata = extract_metadata(&aligned, &options.metadata_columns)?;

    if max_len != options.max_len {
        return Err(AniaError::shape_mismatch(
            format!("max_len={}", options.max_len),
            format!("max_len={}", max_len),
        )
        .into());
    }

    let features = encoded
        .to_device(device)?
        .permute((0, 2, 1))?
        .contiguous()?;
    let targets = Tensor::from_vec(targets, (n, 1), device)?;
    log::info!(
        "[FeatureBuilder] Word embedding features {:?} (embedding_dim={}, max_len={}) from '{}'",
        features.dims(),
        embedding_dim,
        max_len,
        source
    );

    FeatureTensor::new(features, targets, metadata)
}

/// Reads an embedding archive, its identifier list and the metadata/target table.
pub fn extract_word_embedding_features<P: AsRef<Path>>(
    archive_path: P,
    identifiers_path: P,
    table_path: P,
    options: &WordFeatureOptions,
    device: &Device,
) -> Result<FeatureTensor> {
    let table_path = table_path.as_ref();
    log::info!(
        "[FeatureBuilder] Loading embedding data from {:?} and metadata from {:?}",
        archive_path.as_ref(),
        table_path
    );
    let encoded = load_embedding_archive(archive_path)?;
    let identifiers = read_identifiers(identifiers_path)?;
    let table = read_table(table_path)?;
    build_word_embedding_features(
        &encoded,
        &identifiers,
        &table,
        options,
        &table_path.display().to_string(),
        device,
    )
}

/// Model inputs of one batch, keyed by modality.
#[derive(Debug, Clone, Default)]
pub struct ModelInput {
    pub fcgr: Option<Tensor>,
    pub word: Option<Tensor>,
}

impl ModelInput {
    pub fn fcgr(fcgr: Tensor) -> Self {
        Self {
            fcgr: Some(fcgr),
            word: None,
        }
    }

    pub fn word(word: Tensor) -> Self {
        Self {
            fcgr: None,
            word: Some(word),
        }
    }

    pub fn batch_size(&self) -> Result<usize> {
        match (&self.fcgr, &self.word) {
            (Some(t), _) | (None, Some(t)) => Ok(t.dim(0)?),
            (None, None) => Err(AniaError::MissingModality("no input tensor".to_string()).into()),
        }
    }
}

/// Co-indexed model inputs and targets used by the training, fine-tuning
/// and inference engines.
#[derive(Debug, Clone)]
pub struct MicDataset {
    fcgr: Option<Tensor>,
    word: Option<Tensor>,
    targets: Tensor,
}

impl MicDataset {
    pub fn new(fcgr: Option<Tensor>, word: Option<Tensor>, targets: Tensor) -> Result<Self> {
        let n = targets.dim(0)?;
        for (name, t) in [("fcgr", &fcgr), ("word", &word)] {
            if let Some(t) = t {
                if t.dim(0)? != n {
                    return Err(AniaError::shape_mismatch(
                        format!("{} rows of {} features", n, name),
                        format!("{} rows", t.dim(0)?),
                    )
                    .into());
                }
            }
        }
        if fcgr.is_none() && word.is_none() {
            return Err(AniaError::MissingModality("dataset has no feature tensor".to_string()).into());
        }
        Ok(Self {
            fcgr,
            word,
            targets,
        })
    }

    /// Combines one or two feature tensors; targets come from the first present one.
    pub fn from_features(fcgr: Option<&FeatureTensor>, word: Option<&FeatureTensor>) -> Result<Self> {
        let targets = fcgr
            .or(word)
            .map(|f| f.targets().clone())
            .ok_or_else(|| AniaError::MissingModality("no feature tensor supplied".to_string()))?;
        Self::new(
            fcgr.map(|f| f.features().clone()),
            word.map(|f| f.features().clone()),
            targets,
        )
    }

    pub fn len(&self) -> usize {
        self.targets.dims().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn fcgr(&self) -> Option<&Tensor> {
        self.fcgr.as_ref()
    }

    pub fn word(&self) -> Option<&Tensor> {
        self.word.as_ref()
    }

    pub fn targets(&self) -> &Tensor {
        &self.targets
    }

    pub fn fcgr_shape(&self) -> Option<Vec<usize>> {
        self.fcgr.as_ref().map(|t| t.dims()[1..].to_vec())
    }

    pub fn word_shape(&self) -> Option<Vec<usize>> {
        self.word.as_ref().map(|t| t.dims()[1..].to_vec())
    }

    /// Sequential split: the first `floor(train_split * N)` rows train, the rest validate.
    pub fn split(&self, train_split: f64) -> Result<(MicDataset, MicDataset)> {
        let n = self.len();
        let train_size = ((train_split * n as f64).floor() as usize).min(n);
        let val_size = n - train_size;
        let part = |start: usize, len: usize| -> Result<MicDataset> {
            Ok(MicDataset {
                fcgr: self.fcgr.as_ref().map(|t| t.narrow(0, start, len)).transpose()?,
                word: self.word.as_ref().map(|t| t.narrow(0, start, len)).transpose()?,
                targets: self.targets.narrow(0, start, len)?,
            })
        };
        Ok((part(0, train_size)?, part(train_size, val_size)?))
    }

    /// Gathers the rows at `indices` into one batch.
    pub fn select(&self, indices: &[usize]) -> Result<(ModelInput, Tensor)> {
        let idx: Vec<u32> = indices.iter().map(|&i| i as u32).collect();
        let idx = Tensor::from_vec(idx, indices.len(), self.targets.device())?;
        let input = ModelInput {
            fcgr: self.fcgr.as_ref().map(|t| t.index_select(&idx, 0)).transpose()?,
            word: self.word.as_ref().map(|t| t.index_select(&idx, 0)).transpose()?,
        };
        Ok((input, self.targets.index_select(&idx, 0)?))
    }

    pub fn to_device(&self, device: &Device) -> Result<MicDataset> {
        Ok(MicDataset {
            fcgr: self.fcgr.as_ref().map(|t| t.to_device(device)).transpose()?,
            word: self.word.as_ref().map(|t| t.to_device(device)).transpose()?,
            targets: self.targets.to_device(device)?,
        })
    }
}

/// Number of mini-batches of `batch_size` needed to cover `len` rows.
pub fn num_batches(len: usize, batch_size: usize) -> usize {
    if len == 0 {
        return 0;
    }
    len.div_ceil(batch_size.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::root_ania_error;

    fn table(headers: &[&str], rows: &[&[&str]]) -> RawTable {
        RawTable {
            headers: headers.iter().map(|h| h.to_string()).collect(),
            records: rows.iter().map(|r| StringRecord::from(r.to_vec())).collect(),
        }
    }

    fn cgr_table(n_features: usize, rows: usize) -> RawTable {
        let mut headers = vec!["ID".to_string(), "Sequence".to_string(), "Targets".to_string(), "Log MIC Value".to_string()];
        headers.extend((0..n_features).map(|i| format!("f{}", i)));
        let records = (0..rows)
            .map(|r| {
                let mut rec = vec![format!("AMP{}", r), "KKLL".to_string(), "EC".to_string(), format!("{}.5", r)];
                rec.extend((0..n_features).map(|i| format!("{}", (r * n_features + i) as f32)));
                StringRecord::from(rec)
            })
            .collect();
        RawTable { headers, records }
    }

    fn options(n_features: usize, h: usize, w: usize) -> CgrFeatureOptions {
        CgrFeatureOptions {
            feature_start_idx: 4,
            feature_end_idx: 3 + n_features,
            height: h,
            width: w,
            ..Default::default()
        }
    }

    #[test]
    fn cgr_features_reshape_row_major() -> Result<()> {
        let t = cgr_table(16, 3);
        let ft = build_cgr_features(&t, &options(16, 4, 4), "mem", &Device::Cpu)?;
        assert_eq!(ft.features().dims(), &[3, 1, 4, 4]);
        assert_eq!(ft.targets().dims(), &[3, 1]);
        assert_eq!(ft.metadata().len(), 3);
        // row 1, cell (0, 1) is feature index 1 of row 1
        let v = ft.features().get(1)?.get(0)?.get(0)?.get(1)?.to_scalar::<f32>()?;
        assert_eq!(v, 17.0);
        Ok(())
    }

    #[test]
    fn cgr_feature_count_off_by_one_is_shape_mismatch() {
        for n in [15, 17] {
            let t = cgr_table(n, 2);
            let err = build_cgr_features(&t, &options(n, 4, 4), "mem", &Device::Cpu).unwrap_err();
            assert!(matches!(
                root_ania_error(&err),
                Some(AniaError::ShapeMismatch { .. })
            ));
        }
    }

    #[test]
    fn empty_and_missing_target() {
        let empty = cgr_table(4, 0);
        let err = build_cgr_features(&empty, &options(4, 2, 2), "mem", &Device::Cpu).unwrap_err();
        assert!(matches!(root_ania_error(&err), Some(AniaError::EmptyDataset(_))));

        let t = table(&["ID", "Sequence", "Targets", "a", "b"], &[&["x", "K", "EC", "1", "2"]]);
        let opts = CgrFeatureOptions {
            feature_start_idx: 3,
            feature_end_idx: 4,
            height: 1,
            width: 2,
            ..Default::default()
        };
        let err = build_cgr_features(&t, &opts, "mem", &Device::Cpu).unwrap_err();
        assert!(matches!(root_ania_error(&err), Some(AniaError::MissingTarget(_))));

        let t = table(
            &["ID", "Sequence", "Targets", "Log MIC Value", "a", "b"],
            &[&["x", "K", "EC", "", "1", "2"]],
        );
        let opts = CgrFeatureOptions {
            feature_start_idx: 4,
            feature_end_idx: 5,
            ..opts
        };
        let err = build_cgr_features(&t, &opts, "mem", &Device::Cpu).unwrap_err();
        assert!(matches!(root_ania_error(&err), Some(AniaError::MissingTarget(_))));
    }

    #[test]
    fn non_numeric_feature_fails() {
        let t = table(
            &["ID", "Sequence", "Targets", "Log MIC Value", "a", "b"],
            &[&["x", "K", "EC", "1.0", "1", "abc"]],
        );
        let opts = CgrFeatureOptions {
            feature_start_idx: 4,
            feature_end_idx: 5,
            height: 1,
            width: 2,
            ..Default::default()
        };
        assert!(build_cgr_features(&t, &opts, "mem", &Device::Cpu).is_err());
    }

    #[test]
    fn word_features_realign_and_permute() -> Result<()> {
        // 2 samples, max_len 3, embedding_dim 2
        let encoded = Tensor::arange(0f32, 12., &Device::Cpu)?.reshape((2, 3, 2))?;
        let ids = vec!["b".to_string(), "a".to_string()];
        let t = table(
            &["ID", "Sequence", "Targets", "Log MIC Value"],
            &[&["a", "KK", "EC", "1.0"], &["b", "LL", "EC", "2.0"]],
        );
        let opts = WordFeatureOptions {
            max_len: 3,
            ..Default::default()
        };
        let ft = build_word_embedding_features(&encoded, &ids, &t, &opts, "mem", &Device::Cpu)?;
        assert_eq!(ft.features().dims(), &[2, 2, 3]);
        assert_eq!(ft.metadata().column("ID")?, vec!["b", "a"]);
        assert_eq!(ft.targets().flatten_all()?.to_vec1::<f32>()?, vec![2.0, 1.0]);
        // features[0, 1, 2] == encoded[0, 2, 1]
        let v = ft.features().get(0)?.get(1)?.get(2)?.to_scalar::<f32>()?;
        assert_eq!(v, 5.0);

        let bad = WordFeatureOptions {
            max_len: 4,
            ..Default::default()
        };
        let err = build_word_embedding_features(&encoded, &ids, &t, &bad, "mem", &Device::Cpu).unwrap_err();
        assert!(matches!(
            root_ania_error(&err),
            Some(AniaError::ShapeMismatch { .. })
        ));
        Ok(())
    }

    fn keyed_features(ids: &[&str], targets: &[f32], sample: &[usize]) -> Result<FeatureTensor> {
        let n = ids.len();
        let per: usize = sample.iter().product();
        let mut dims = vec![n];
        dims.extend_from_slice(sample);
        // every value of row i equals its target so pairing is visible in the tensor
        let values: Vec<f32> = targets.iter().flat_map(|&t| vec![t; per]).collect();
        let features = Tensor::from_vec(values, dims, &Device::Cpu)?;
        let metadata = MetadataTable::new(
            vec!["ID".to_string()],
            ids.iter().map(|id| vec![id.to_string()]).collect(),
        )?;
        FeatureTensor::new(features, Tensor::from_vec(targets.to_vec(), (n, 1), &Device::Cpu)?, metadata)
    }

    #[test]
    fn modalities_are_paired_by_id() -> Result<()> {
        let fcgr = keyed_features(&["A", "B", "C"], &[1.0, 9.0, 4.0], &[1, 2, 2])?;
        let word = keyed_features(&["C", "A", "B"], &[4.0, 1.0, 9.0], &[2, 3])?;

        let aligned = align_modalities(&fcgr, &word, "ID")?;
        assert_eq!(aligned.metadata().column("ID")?, vec!["C", "A", "B"]);
        assert_eq!(aligned.targets().flatten_all()?.to_vec1::<f32>()?, vec![4.0, 1.0, 9.0]);
        let first = aligned.features().get(0)?.flatten_all()?.to_vec1::<f32>()?;
        assert!(first.iter().all(|&v| v == 4.0));

        let same = align_modalities(&fcgr, &fcgr, "ID")?;
        assert_eq!(same.metadata(), fcgr.metadata());
        Ok(())
    }

    #[test]
    fn unpaired_modalities_are_rejected() -> Result<()> {
        let fcgr = keyed_features(&["A", "B"], &[1.0, 9.0], &[1, 1, 1])?;
        let word = keyed_features(&["B", "Z"], &[9.0, 0.0], &[1, 1])?;
        let err = align_modalities(&fcgr, &word, "ID").unwrap_err();
        assert!(matches!(root_ania_error(&err), Some(AniaError::MissingTarget(_))));

        let short = keyed_features(&["A"], &[1.0], &[1, 1])?;
        let err = align_modalities(&fcgr, &short, "ID").unwrap_err();
        assert!(matches!(root_ania_error(&err), Some(AniaError::ShapeMismatch { .. })));

        let err = align_modalities(&fcgr, &word, "Accession").unwrap_err();
        assert!(matches!(root_ania_error(&err), Some(AniaError::MissingColumn(_))));
        Ok(())
    }

    #[test]
    fn dataset_split_is_sequential() -> Result<()> {
        let x = Tensor::arange(0f32, 4., &Device::Cpu)?.reshape((4, 1, 1, 1))?;
        let y = Tensor::new(&[[1.0f32], [2.0], [3.0], [1.5]], &Device::Cpu)?;
        let ds = MicDataset::new(Some(x), None, y)?;
        let (train, val) = ds.split(0.5)?;
        assert_eq!(train.len(), 2);
        assert_eq!(val.len(), 2);
        assert_eq!(val.targets().flatten_all()?.to_vec1::<f32>()?, vec![3.0, 1.5]);

        let (input, targets) = ds.select(&[3, 0])?;
        assert_eq!(input.batch_size()?, 2);
        assert_eq!(targets.flatten_all()?.to_vec1::<f32>()?, vec![1.5, 1.0]);
        Ok(())
    }

    #[test]
    fn batch_count() {
        assert_eq!(num_batches(10, 4), 3);
        assert_eq!(num_batches(8, 4), 2);
        assert_eq!(num_batches(2, 64), 1);
        assert_eq!(num_batches(0, 4), 0);
    }
}
