use anyhow::{Context, Result};
use plotly::common::{Line, Mode};
use plotly::layout::Axis;
use plotly::{Layout, Plot, Scatter};
use std::path::{Path, PathBuf};

use crate::utils::stats::LossHistory;

/// Per-epoch train (and, when present, validation) loss lines.
pub fn plot_loss_curve(history: &LossHistory, title: &str) -> Plot {
    let epochs: Vec<f64> = (1..=history.train_losses.len()).map(|e| e as f64).collect();

    let mut plot = Plot::new();
    plot.add_trace(
        Scatter::new(epochs.clone(), history.train_losses.clone())
            .name("Train Loss")
            .mode(Mode::LinesMarkers)
            .line(Line::new().color("rgba(31, 119, 180, 1.0)")),
    );

    if !history.val_losses.is_empty() {
        let val_epochs: Vec<f64> = (1..=history.val_losses.len()).map(|e| e as f64).collect();
        plot.add_trace(
            Scatter::new(val_epochs, history.val_losses.clone())
                .name("Val Loss")
                .mode(Mode::LinesMarkers)
                .line(Line::new().color("rgba(255, 127, 14, 1.0)")),
        );
    }

    plot.set_layout(
        Layout::new()
            .title(title)
            .x_axis(Axis::new().title("Epoch"))
            .y_axis(Axis::new().title("Loss")),
    );
    plot
}

/// Writes the loss curve as a standalone HTML file next to `model_output_path`.
///
/// Returns the path written: `<dir of model_output_path>/<model_type>_loss_curve_<tag>.html`.
pub fn write_loss_curve(
    history: &LossHistory,
    model_output_path: &Path,
    model_type: &str,
    tag: &str,
) -> Result<PathBuf> {
    let dir = model_output_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    std::fs::create_dir_all(&dir).with_context(|| format!("Failed to create {:?}", dir))?;

    let path = dir.join(format!("{}_loss_curve_{}.html", model_type, tag));
    let title = format!("{} loss curve ({})", model_type, tag.replace('_', " "));
    plot_loss_curve(history, &title).write_html(&path);
    log::info!("[Plot] Loss curve written to {:?}", path);
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_html_next_to_model() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let history = LossHistory {
            train_losses: vec![1.0, 0.5],
            val_losses: vec![1.2, 0.7],
        };
        let model_path = dir.path().join("fcgr_ania_EC");
        let path = write_loss_curve(&history, &model_path, "fcgr_ania", "best_combination")?;
        assert_eq!(path, dir.path().join("fcgr_ania_loss_curve_best_combination.html"));
        assert!(path.exists());
        Ok(())
    }
}
