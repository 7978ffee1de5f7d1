use anyhow::{Context, Result};
use maud::{html, Markup, PreEscaped, DOCTYPE};
use plotly::common::Mode;
use plotly::layout::Axis;
use plotly::{Layout, Plot, Scatter};
use serde::Serialize;

use ania_mic::utils::stats::RegressionMetrics;

use crate::mic::util::write_bytes_to_file;

const PLOTLY_CDN: &str = "https://cdn.plot.ly/plotly-2.12.1.min.js";

pub struct ReportSection {
    title: String,
    content: Vec<Markup>,
}

impl ReportSection {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            content: Vec::new(),
        }
    }

    pub fn add_content(&mut self, content: Markup) {
        self.content.push(content);
    }

    pub fn add_plot(&mut self, plot: Plot) {
        let div_id = format!(
            "plot-{}-{}",
            self.title.to_lowercase().replace(' ', "-"),
            self.content.len()
        );
        self.content.push(PreEscaped(plot.to_inline_html(Some(&div_id))));
    }

    fn render(&self) -> Markup {
        html! {
            section {
                h2 { (self.title) }
                @for block in &self.content {
                    div class="block" { (block) }
                }
            }
        }
    }
}

/// Standalone HTML report of one CLI run.
pub struct Report {
    tool: String,
    version: String,
    title: String,
    sections: Vec<ReportSection>,
}

impl Report {
    pub fn new(tool: &str, version: &str, title: &str) -> Self {
        Self {
            tool: tool.to_string(),
            version: version.to_string(),
            title: title.to_string(),
            sections: Vec::new(),
        }
    }

    pub fn add_section(&mut self, section: ReportSection) {
        self.sections.push(section);
    }

    pub fn render(&self) -> Markup {
        let generated = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        html! {
            (DOCTYPE)
            html {
                head {
                    meta charset="utf-8";
                    title { (self.title) }
                    script src=(PLOTLY_CDN) {}
                    style {
                        "body { font-family: sans-serif; margin: 2em auto; max-width: 1100px; }
                         table { border-collapse: collapse; }
                         td, th { border: 1px solid #ddd; padding: 4px 10px; text-align: left; }
                         .block { margin-bottom: 1.5em; }"
                    }
                }
                body {
                    h1 { (self.title) }
                    p { (self.tool) " v" (self.version) " | generated " (generated) }
                    @for section in &self.sections {
                        (section.render())
                    }
                }
            }
        }
    }

    pub fn save_to_file(&self, path: &str) -> Result<()> {
        write_bytes_to_file(path, self.render().into_string().as_bytes())
            .with_context(|| format!("Failed to write report {}", path))?;
        log::info!("[ANIA::Report] Report saved to {}", path);
        Ok(())
    }
}

/// Pretty-printed JSON of a run configuration.
pub fn config_section<T: Serialize>(config: &T) -> Result<ReportSection> {
    let mut section = ReportSection::new("Configuration");
    section.add_content(html! {
        style {
            ".code-container {
                background-color: #f5f5f5;
                padding: 10px;
                border-radius: 5px;
                overflow-x: auto;
                font-family: monospace;
                white-space: pre-wrap;
            }"
        }
        div class="code-container" {
            pre {
                code { (serde_json::to_string_pretty(config)?) }
            }
        }
    });
    Ok(section)
}

pub fn metrics_table(metrics: &RegressionMetrics) -> Markup {
    html! {
        table {
            tr { th { "MAE" } th { "MSE" } th { "RMSE" } th { "R²" } th { "PCC" } }
            tr {
                td { (format!("{:.4}", metrics.mae)) }
                td { (format!("{:.4}", metrics.mse)) }
                td { (format!("{:.4}", metrics.rmse)) }
                td { (format!("{:.4}", metrics.r2)) }
                td { (format!("{:.4}", metrics.pcc)) }
            }
        }
    }
}

pub fn plot_predicted_vs_true(truth: &[f32], predicted: &[f32], title: &str) -> Plot {
    let x: Vec<f64> = truth.iter().map(|&v| v as f64).collect();
    let y: Vec<f64> = predicted.iter().map(|&v| v as f64).collect();
    let mut plot = Plot::new();
    plot.add_trace(Scatter::new(x, y).name("Prediction").mode(Mode::Markers));
    plot.set_layout(
        Layout::new()
            .title(title)
            .x_axis(Axis::new().title("True Log MIC"))
            .y_axis(Axis::new().title("Predicted Log MIC")),
    );
    plot
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_sections_in_order() {
        let mut report = Report::new("ANIA", "0.1.0", "ANIA Test Report");
        let mut first = ReportSection::new("Overview");
        first.add_content(html! { p { "first" } });
        report.add_section(first);
        report.add_section(ReportSection::new("Metrics"));

        let page = report.render().into_string();
        assert!(page.starts_with("<!DOCTYPE html>"));
        let overview = page.find("Overview").unwrap();
        let metrics = page.find("<h2>Metrics</h2>").unwrap();
        assert!(overview < metrics);
    }
}
