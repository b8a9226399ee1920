//! Per-metric bar charts of the grouped leaderboard

use anyhow::{Context, Result};
use plotters::prelude::*;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::leaderboard::LeaderboardRow;
use crate::metrics::Metric;

const CHART_SIZE: (u32, u32) = (1200, 700);

/// File name of a metric's chart, without extension
pub fn chart_stem(metric: Metric) -> String {
    format!("mean_{}_chart", metric.slug())
}

/// Chart title for a metric
pub fn chart_title(metric: Metric) -> String {
    format!("Mean {} by Evaluated on and Model", metric.label())
}

/// Draw one SVG bar chart per metric into `dir`
///
/// Bars are `dataset / model` entries sorted by descending score. Metrics
/// with no present values get no chart.
pub fn render_metric_charts(rows: &[LeaderboardRow], dir: &Path) -> Result<Vec<(Metric, PathBuf)>> {
    let mut written = Vec::new();

    for metric in Metric::ALL {
        let mut bars: Vec<(String, f64)> = rows
            .iter()
            .filter_map(|row| {
                row.score(metric)
                    .map(|v| (format!("{} / {}", row.evaluated_on, row.model_name), v))
            })
            .collect();

        if bars.is_empty() {
            debug!("No values for {}, skipping chart", metric);
            continue;
        }
        bars.sort_by(|a, b| b.1.total_cmp(&a.1));

        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create chart directory: {}", dir.display()))?;
        let path = dir.join(format!("{}.svg", chart_stem(metric)));
        draw_bar_chart(&path, metric, &bars)
            .with_context(|| format!("Failed to draw chart {}", path.display()))?;
        debug!("Chart written: {}", path.display());

        written.push((metric, path));
    }

    Ok(written)
}

fn draw_bar_chart(path: &Path, metric: Metric, bars: &[(String, f64)]) -> Result<()> {
    let root = SVGBackend::new(path, CHART_SIZE).into_drawing_area();
    root.fill(&WHITE)?;

    let max = bars.iter().map(|(_, v)| *v).fold(0.0, f64::max);
    let min = bars.iter().map(|(_, v)| *v).fold(0.0, f64::min);
    let top = if max > 0.0 { max * 1.1 } else { 1.0 };
    let bottom = if min < 0.0 { min * 1.1 } else { 0.0 };

    let title = chart_title(metric);
    let mut chart = ChartBuilder::on(&root)
        .caption(&title, ("sans-serif", 24))
        .margin(20)
        .x_label_area_size(180)
        .y_label_area_size(70)
        .build_cartesian_2d((0..bars.len()).into_segmented(), bottom..top)?;

    chart
        .configure_mesh()
        .disable_x_mesh()
        .x_labels(bars.len())
        .x_label_formatter(&|x: &SegmentValue<usize>| match x {
            SegmentValue::CenterOf(i) => bars.get(*i).map(|b| b.0.clone()).unwrap_or_default(),
            _ => String::new(),
        })
        .x_label_style(
            ("sans-serif", 12)
                .into_font()
                .transform(FontTransform::Rotate90),
        )
        .x_desc("Evaluated on / Model")
        .y_desc(format!("Mean {}", metric.label()))
        .draw()?;

    chart.draw_series(
        Histogram::vertical(&chart)
            .style(BLUE.mix(0.6).filled())
            .margin(10)
            .data(bars.iter().enumerate().map(|(i, (_, v))| (i, *v))),
    )?;

    root.present()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::collections::BTreeMap;

    fn row(dataset: &str, model: &str, f1: f64) -> LeaderboardRow {
        let mut scores: BTreeMap<Metric, Option<f64>> =
            Metric::ALL.into_iter().map(|m| (m, None)).collect();
        scores.insert(Metric::F1, Some(f1));
        LeaderboardRow {
            model_name: model.to_string(),
            evaluated_on: dataset.to_string(),
            retriever: None,
            experiment_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            count: 3.0,
            model_size: None,
            scores,
        }
    }

    #[test]
    fn test_chart_naming() {
        assert_eq!(chart_stem(Metric::Bleu), "mean_bleu_score_chart");
        assert_eq!(chart_title(Metric::F1), "Mean F1 Score by Evaluated on and Model");
    }

    #[test]
    fn test_only_metrics_with_values_are_drawn() {
        let dir = tempfile::tempdir().unwrap();
        let rows = vec![row("CoQA", "Bloom", 42.0), row("CoQA", "Coga", 12.5)];

        let written = render_metric_charts(&rows, dir.path()).unwrap();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].0, Metric::F1);

        let svg = std::fs::read_to_string(&written[0].1).unwrap();
        assert!(svg.contains("Mean F1 Score by Evaluated on and Model"));
    }

    #[test]
    fn test_no_rows_no_charts() {
        let dir = tempfile::tempdir().unwrap();
        let charts_dir = dir.path().join("charts");
        let written = render_metric_charts(&[], &charts_dir).unwrap();
        assert!(written.is_empty());
        assert!(!charts_dir.exists());
    }
}
