use anyhow::{Context, Result};
use maud::html;
use std::path::PathBuf;

use ania_mic::models::model_interface::ModelType;
use ania_mic::training::hyperparams::HyperparameterGrid;
use ania_mic::training::search::{train_model, SearchOptions};
use ania_mic::utils::plot::plot_loss_curve;
use ania_mic::utils::stats::LossHistory;

use crate::mic::load_data::load_dataset;
use crate::mic::report::{config_section, Report, ReportSection};
use crate::mic::train::input::MicTrainConfig;

pub fn run_training(config: &MicTrainConfig) -> Result<()> {
    let model_type: ModelType = config.model_type.parse()?;
    let (dataset, _) = load_dataset(model_type, &config.data).context("Failed to load training data")?;
    let grid = HyperparameterGrid::load(&config.hyperparameter_grid, model_type)?;

    let options = SearchOptions {
        train_split: config.train_split,
        patience: config.early_stopping_patience,
        random_search: config.random_search,
        num_random_samples: config.num_random_samples,
        mixed_precision: config.mixed_precision,
        seed: config.seed,
        device: config.device.clone(),
        output_path: PathBuf::from(&config.output_path),
    };

    let start_time = std::time::Instant::now();
    let outcome = train_model(&dataset, model_type, &grid, &options)?;
    log::info!(
        "[ANIA::Train] Search finished in {:?}; model saved to {:?}",
        start_time.elapsed(),
        outcome.checkpoint.weights
    );

    let Some(report_path) = &config.report_file else {
        return Ok(());
    };

    let record = &outcome.state.record;
    let mut report = Report::new(
        "ANIA",
        &config.version,
        &format!("ANIA {} Trainer Report", model_type),
    );

    /* Section 1: Overview */
    {
        let mut overview_section = ReportSection::new("Overview");
        overview_section.add_content(html! {
            p { "Hyperparameter search over " (outcome.trials_run) " combination(s); the trial with the lowest validation loss was kept." }
            ul {
                li { "Best trial: " (outcome.best_trial + 1) }
                @if let Some(metrics) = &record.val_metrics {
                    li { "Best validation loss: " (format!("{:.6}", metrics.best_val_loss)) }
                }
                @if let Some(time) = record.training_time {
                    li { "Training time: " (format!("{:.1} s", time)) }
                }
                li { "Input shape: " (record.input_shape.to_string()) }
                li { "Checkpoint: " (outcome.checkpoint.weights.display().to_string()) }
            }
            pre { code { (serde_json::to_string_pretty(&record.hyperparams)?) } }
        });

        if let Some(stats) = &record.train_stats {
            let history = LossHistory {
                train_losses: stats.train_losses.clone(),
                val_losses: stats.val_losses.clone(),
            };
            overview_section.add_plot(plot_loss_curve(&history, "Best combination loss"));
        }
        report.add_section(overview_section);
    }

    /* Section 2: Configuration */
    report.add_section(config_section(config)?);

    report.save_to_file(report_path)?;
    Ok(())
}
