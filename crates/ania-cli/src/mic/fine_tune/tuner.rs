use anyhow::{Context, Result};
use maud::html;
use std::path::{Path, PathBuf};

use ania_mic::training::checkpoint::read_checkpoint_record;
use ania_mic::training::fine_tune::{fine_tune_model, FineTuneOptions};
use ania_mic::utils::plot::plot_loss_curve;
use ania_mic::utils::stats::LossHistory;

use crate::mic::fine_tune::input::MicFineTuneConfig;
use crate::mic::load_data::load_dataset;
use crate::mic::report::{config_section, Report, ReportSection};

pub fn run_fine_tuning(config: &MicFineTuneConfig) -> Result<()> {
    let model_path = Path::new(&config.model_path);
    let record = read_checkpoint_record(model_path)
        .with_context(|| format!("Failed to read model {}", config.model_path))?;
    let (dataset, _) =
        load_dataset(record.model_type, &config.data).context("Failed to load fine-tuning data")?;

    let options = FineTuneOptions {
        epochs: config.epochs,
        batch_size: config.batch_size,
        freeze_inception: config.freeze_inception,
        mixed_precision: config.mixed_precision,
        device: config.device.clone(),
        seed: config.seed,
        output_path: PathBuf::from(&config.output_path),
    };
    let outcome = fine_tune_model(model_path, &dataset, &options)?;
    log::info!(
        "[ANIA::FineTune] Fine-tuned model saved to {:?}",
        outcome.checkpoint.weights
    );

    let Some(report_path) = &config.report_file else {
        return Ok(());
    };

    let mut report = Report::new(
        "ANIA",
        &config.version,
        &format!("ANIA {} Fine-Tuning Report", record.model_type),
    );

    {
        let mut overview_section = ReportSection::new("Overview");
        overview_section.add_content(html! {
            p {
                "Fine-tuned " (config.model_path) " on " (dataset.len()) " rows with the Inception extractor "
                @if config.freeze_inception { "frozen." } @else { "trainable." }
            }
        });
        if let Some(stats) = &outcome.state.record.fine_tune_stats {
            overview_section.add_content(html! {
                ul {
                    li { "Epochs: " (stats.epochs) }
                    li { "Fine-tuning time: " (format!("{:.1} s", stats.fine_tune_time)) }
                    @if let Some(last) = stats.train_losses.last() {
                        li { "Final training loss: " (format!("{:.6}", last)) }
                    }
                }
            });
            let history = LossHistory {
                train_losses: stats.train_losses.clone(),
                val_losses: Vec::new(),
            };
            overview_section.add_plot(plot_loss_curve(&history, "Fine-tuning loss"));
        }
        report.add_section(overview_section);
    }

    report.add_section(config_section(config)?);
    report.save_to_file(report_path)?;
    Ok(())
}
