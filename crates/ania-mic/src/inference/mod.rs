use anyhow::{anyhow, Context, Result};
use candle_core::Device;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::error::AniaError;
use crate::models::model_interface::{AniaModel, ModelKind};
use crate::training::checkpoint::load_checkpoint;
use crate::utils::data_handling::{num_batches, read_table, MetadataTable, MicDataset};
use crate::utils::logging::MemoryStats;
use crate::utils::stats::RegressionMetrics;
use crate::utils::utils::resolve_execution_device;

pub const TRUE_COLUMN: &str = "Log MIC Value";
pub const PREDICTED_COLUMN: &str = "Predicted Log MIC Value";

/// Loads a checkpoint and switches the model to evaluation mode.
pub fn load_trained_model(path: &Path, device: &Device) -> Result<Box<dyn AniaModel>> {
    let mut model = load_checkpoint(path, device)?.model;
    model.set_evaluation_mode();
    Ok(model)
}

/// Forward-only pass over `dataset` in sequential batches.
pub fn predict(model: &mut dyn AniaModel, dataset: &MicDataset, batch_size: usize) -> Result<Vec<f32>> {
    let expected = model.kind();
    let actual = ModelKind::from_dataset(expected.model_type(), dataset)?;
    if actual != expected {
        return Err(AniaError::shape_mismatch(
            expected.input_shape().to_string(),
            actual.input_shape().to_string(),
        )
        .into());
    }

    let data = dataset.to_device(model.device())?;
    let indices: Vec<usize> = (0..data.len()).collect();
    let mut predictions = Vec::with_capacity(data.len());
    for chunk in indices.chunks(batch_size.max(1)) {
        let (input, _) = data.select(chunk)?;
        let batch = model.predict(&input)?;
        predictions.extend(batch.flatten_all()?.to_vec1::<f32>()?);
    }
    log::debug!(
        "[Inference] {} predictions in {} batches",
        predictions.len(),
        num_batches(data.len(), batch_size)
    );
    Ok(predictions)
}

/// Metadata columns followed by the true and the predicted target.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PredictionTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl PredictionTable {
    pub fn from_predictions(metadata: &MetadataTable, targets: &[f32], predictions: &[f32]) -> Result<Self> {
        if metadata.len() != targets.len() || targets.len() != predictions.len() {
            return Err(AniaError::shape_mismatch(
                format!("{} metadata rows", metadata.len()),
                format!("{} targets and {} predictions", targets.len(), predictions.len()),
            )
            .into());
        }
        let mut columns = metadata.columns().to_vec();
        columns.push(TRUE_COLUMN.to_string());
        columns.push(PREDICTED_COLUMN.to_string());

        let rows = metadata
            .rows()
            .iter()
            .zip(targets.iter().zip(predictions))
            .map(|(meta, (t, p))| {
                let mut row = meta.clone();
                row.push(t.to_string());
                row.push(p.to_string());
                row
            })
            .collect();
        Ok(Self { columns, rows })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Parses every cell of `name` as a float.
    pub fn numeric_column(&self, name: &str) -> Result<Vec<f32>> {
        let idx = self
            .columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| anyhow!(AniaError::MissingColumn(name.to_string())))?;
        self.rows
            .iter()
            .enumerate()
            .map(|(i, row)| {
                let cell = row.get(idx).map(String::as_str).unwrap_or("");
                cell.trim()
                    .parse::<f32>()
                    .with_context(|| format!("Row {}: '{}' in column '{}' is not a number", i + 1, cell, name))
            })
            .collect()
    }
}

/// Writes a CSV, or TSV when the extension is `.tsv`.
pub fn write_prediction_table<P: AsRef<Path>>(table: &PredictionTable, path: P) -> Result<()> {
    let path = path.as_ref();
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
    }
    let delimiter = match path.extension().and_then(|ext| ext.to_str()) {
        Some("tsv") => b'\t',
        _ => b',',
    };
    let file = File::create(path).with_context(|| format!("Failed to create output file: {:?}", path))?;
    let mut writer = csv::WriterBuilder::new()
        .delimiter(delimiter)
        .from_writer(BufWriter::new(file));

    writer.write_record(&table.columns)?;
    for row in &table.rows {
        writer.write_record(row)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn read_prediction_table<P: AsRef<Path>>(path: P) -> Result<PredictionTable> {
    let raw = read_table(path)?;
    Ok(PredictionTable {
        columns: raw.headers,
        rows: raw
            .records
            .iter()
            .map(|r| r.iter().map(str::to_string).collect())
            .collect(),
    })
}

/// MAE, MSE, RMSE, R² and Pearson correlation between two table columns.
pub fn evaluate_predictions(table: &PredictionTable, true_col: &str, pred_col: &str) -> Result<RegressionMetrics> {
    let truth = table.numeric_column(true_col)?;
    let predicted = table.numeric_column(pred_col)?;
    if truth.is_empty() {
        return Err(AniaError::EmptyDataset("prediction table has no rows".to_string()).into());
    }
    Ok(RegressionMetrics::compute(&predicted, &truth))
}

#[derive(Debug, Clone)]
pub struct TestOptions {
    pub batch_size: usize,
    pub device: String,
    /// Prediction table path; `.tsv` selects tab separation.
    pub output_file: PathBuf,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            batch_size: 32,
            device: "cuda:0".to_string(),
            output_file: PathBuf::from("predictions.csv"),
        }
    }
}

pub struct TestOutcome {
    pub table: PredictionTable,
    pub metrics: RegressionMetrics,
}

/// Predicts a held-out set with a saved model, writes the prediction table
/// and reports its metrics.
pub fn test_model(
    checkpoint_path: &Path,
    dataset: &MicDataset,
    metadata: &MetadataTable,
    options: &TestOptions,
) -> Result<TestOutcome> {
    let start_time = Instant::now();
    let resolved = resolve_execution_device(&options.device)?;
    let mut memory = MemoryStats::reset();
    memory.log("Before testing");

    let mut model = load_trained_model(checkpoint_path, &resolved.device)?;
    let predictions = predict(model.as_mut(), dataset, options.batch_size)?;
    let targets = dataset.targets().flatten_all()?.to_vec1::<f32>()?;

    let table = PredictionTable::from_predictions(metadata, &targets, &predictions)?;
    write_prediction_table(&table, &options.output_file)?;
    let metrics = evaluate_predictions(&table, TRUE_COLUMN, PREDICTED_COLUMN)?;

    log::info!(
        "[Inference] {} rows in {:.2}s, predictions saved to {:?}",
        table.len(),
        start_time.elapsed().as_secs_f64(),
        options.output_file
    );
    log::info!("[Inference] {}", metrics);
    memory.record();
    memory.log("After testing");

    Ok(TestOutcome { table, metrics })
}
