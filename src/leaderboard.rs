//! Leaderboard aggregation over per-dataset, per-model score files

use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::metrics::Metric;
use crate::{charts, mean_present, EvalConfig, HyperparameterRow};

pub const LEADERBOARD_FILE: &str = "leaderboard.csv";
pub const PARAMETERS_FILE: &str = "leaderboard_Parameters.csv";

const IDENTITY_COLUMNS: [&str; 6] = [
    "Model Name",
    "Evaluated on",
    "Retriever",
    "Experiment Date",
    "Count",
    "Model Size",
];

const PARAMETER_COLUMNS: [&str; 7] = [
    "Temperature",
    "Top P",
    "Top K",
    "Decoding Method",
    "Min New Tokens",
    "Max New Tokens",
    "Stop Sequences",
];

/// What to do with a score file that cannot be used
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Fail the whole run
    #[default]
    Abort,
    /// Log the file and continue without it
    Skip,
}

/// Means of one score file
#[derive(Debug, Clone)]
pub struct ScoreFileSummary {
    pub dataset: String,
    pub model: String,
    pub scores: BTreeMap<Metric, Option<f64>>,
    pub experiment_date: NaiveDate,
    pub count: usize,
}

/// One `(dataset, model)` entry of the leaderboard
#[derive(Debug, Clone, PartialEq)]
pub struct LeaderboardRow {
    pub model_name: String,
    pub evaluated_on: String,
    pub retriever: Option<String>,
    pub experiment_date: NaiveDate,
    /// Mean row count of the group's score files
    pub count: f64,
    pub model_size: Option<String>,
    pub scores: BTreeMap<Metric, Option<f64>>,
}

impl LeaderboardRow {
    pub fn score(&self, metric: Metric) -> Option<f64> {
        self.scores.get(&metric).copied().flatten()
    }

    fn csv_fields(&self) -> Vec<String> {
        let mut fields = vec![
            self.model_name.clone(),
            self.evaluated_on.clone(),
            self.retriever.clone().unwrap_or_default(),
            self.experiment_date.format("%Y-%m-%d").to_string(),
            self.count.to_string(),
            self.model_size.clone().unwrap_or_default(),
        ];
        fields.extend(Metric::ALL.iter().map(|&m| format_cell(self.score(m))));
        fields
    }
}

/// A leaderboard row joined with its model's generation settings
#[derive(Debug, Clone, PartialEq)]
pub struct MergedRow {
    pub model_name: String,
    pub leaderboard: Option<LeaderboardRow>,
    pub hyperparameters: Option<HyperparameterRow>,
}

impl MergedRow {
    fn csv_fields(&self) -> Result<Vec<String>> {
        let mut fields = match &self.leaderboard {
            Some(row) => row.csv_fields(),
            None => {
                let mut empty = vec![String::new(); IDENTITY_COLUMNS.len() + Metric::ALL.len()];
                empty[0] = self.model_name.clone();
                empty
            }
        };

        match &self.hyperparameters {
            Some(h) => {
                fields.push(format_cell(h.temperature));
                fields.push(format_cell(h.top_p));
                fields.push(h.top_k.map(|v| v.to_string()).unwrap_or_default());
                fields.push(h.decoding_method.clone().unwrap_or_default());
                fields.push(h.min_new_tokens.map(|v| v.to_string()).unwrap_or_default());
                fields.push(h.max_new_tokens.map(|v| v.to_string()).unwrap_or_default());
                fields.push(serde_json::to_string(&h.stop_sequences)?);
            }
            None => fields.extend(std::iter::repeat_n(String::new(), PARAMETER_COLUMNS.len())),
        }

        Ok(fields)
    }
}

/// Result of a leaderboard build
#[derive(Debug, Clone, Default)]
pub struct LeaderboardReport {
    /// Every `(dataset, model)` group, before the F1 filter
    pub grouped: Vec<LeaderboardRow>,
    /// Groups passing the F1 filter, sorted by dataset then model
    pub leaderboard: Vec<LeaderboardRow>,
    pub merged: Vec<MergedRow>,
    /// Files left out under [`FailurePolicy::Skip`], with the reason
    pub skipped: Vec<(PathBuf, String)>,
}

/// Files written by [`write_outputs`]
#[derive(Debug, Clone)]
pub struct ReportArtifacts {
    pub leaderboard_csv: PathBuf,
    pub parameters_csv: PathBuf,
    pub charts: Vec<(Metric, PathBuf)>,
}

fn format_cell(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

// ============================================================================
// Score files
// ============================================================================

/// CSV files directly inside `dir`, sorted by path
pub fn list_score_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read scores directory: {}", dir.display()))?;

    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let is_csv = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));
        if path.is_file() && is_csv {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Split `<dataset>_<model>.csv` at the first underscore
pub fn parse_score_file_name(path: &Path) -> Result<(String, String)> {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| anyhow!("Invalid score file name: {}", path.display()))?;

    match stem.split_once('_') {
        Some((dataset, model)) if !dataset.is_empty() && !model.is_empty() => {
            Ok((dataset.to_string(), model.to_string()))
        }
        _ => Err(anyhow!(
            "Score file name must look like <dataset>_<model>.csv: {}",
            path.display()
        )),
    }
}

fn file_date(path: &Path) -> Result<NaiveDate> {
    let meta = std::fs::metadata(path)
        .with_context(|| format!("Failed to stat {}", path.display()))?;
    let time = meta
        .created()
        .or_else(|_| meta.modified())
        .with_context(|| format!("No timestamp available for {}", path.display()))?;
    Ok(chrono::DateTime::<chrono::Local>::from(time).date_naive())
}

/// Per-metric scaled means, creation date and row count of one score file
///
/// Empty and non-numeric cells are skipped; a metric whose column is missing
/// or holds no numbers is absent.
pub fn summarize_score_file(path: &Path) -> Result<ScoreFileSummary> {
    let (dataset, model) = parse_score_file_name(path)?;

    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open score file: {}", path.display()))?;
    let headers = reader
        .headers()
        .with_context(|| format!("Failed to read header of {}", path.display()))?
        .clone();

    let columns: Vec<(Metric, Option<usize>)> = Metric::ALL
        .into_iter()
        .map(|metric| (metric, metric.find_column(headers.iter())))
        .collect();

    let mut values: BTreeMap<Metric, Vec<Option<f64>>> = BTreeMap::new();
    let mut count = 0;
    for record in reader.records() {
        let record = record.with_context(|| format!("Failed to read row of {}", path.display()))?;
        count += 1;
        for (metric, idx) in &columns {
            let cell = idx
                .and_then(|i| record.get(i))
                .and_then(|cell| cell.trim().parse::<f64>().ok())
                .filter(|v| v.is_finite());
            values.entry(*metric).or_default().push(cell);
        }
    }

    let scores = Metric::ALL
        .into_iter()
        .map(|metric| {
            let mean = values
                .remove(&metric)
                .and_then(mean_present)
                .map(|m| metric.scaling().apply(m));
            (metric, mean)
        })
        .collect();

    debug!("{}: {} rows for {} / {}", path.display(), count, dataset, model);

    Ok(ScoreFileSummary {
        dataset,
        model,
        scores,
        experiment_date: file_date(path)?,
        count,
    })
}

// ============================================================================
// Aggregation
// ============================================================================

fn cmp_nulls_last(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.total_cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn cmp_scores(a: &BTreeMap<Metric, Option<f64>>, b: &BTreeMap<Metric, Option<f64>>) -> Ordering {
    Metric::ALL
        .iter()
        .map(|m| {
            cmp_nulls_last(
                a.get(m).copied().flatten(),
                b.get(m).copied().flatten(),
            )
        })
        .find(|ord| ord.is_ne())
        .unwrap_or(Ordering::Equal)
}

/// Collapse file summaries into one row per `(dataset, model)`
///
/// Scores are averaged over the files that have them, counts averaged over
/// all files and the latest date kept. Retriever and model size come from the config lookups.
pub fn group_summaries(summaries: &[ScoreFileSummary], config: &EvalConfig) -> Vec<LeaderboardRow> {
    let mut sorted: Vec<&ScoreFileSummary> = summaries.iter().collect();
    sorted.sort_by(|a, b| cmp_scores(&a.scores, &b.scores));

    let mut groups: BTreeMap<(&str, &str), Vec<&ScoreFileSummary>> = BTreeMap::new();
    for summary in sorted {
        groups
            .entry((summary.dataset.as_str(), summary.model.as_str()))
            .or_default()
            .push(summary);
    }

    groups
        .into_iter()
        .filter_map(|((dataset, model), members)| {
            let experiment_date = members.iter().map(|s| s.experiment_date).max()?;
            let scores = Metric::ALL
                .into_iter()
                .map(|metric| {
                    let mean =
                        mean_present(members.iter().map(|s| s.scores.get(&metric).copied().flatten()));
                    (metric, mean)
                })
                .collect();

            Some(LeaderboardRow {
                model_name: model.to_string(),
                evaluated_on: dataset.to_string(),
                retriever: config.retrievers.get(dataset).cloned(),
                experiment_date,
                count: members.iter().map(|s| s.count as f64).sum::<f64>()
                    / members.len() as f64,
                model_size: config.model_sizes.get(model).cloned(),
                scores,
            })
        })
        .collect()
}

/// Rows whose F1 is strictly above `threshold`, sorted by dataset then model
pub fn filter_by_f1(rows: &[LeaderboardRow], threshold: f64) -> Vec<LeaderboardRow> {
    let mut kept: Vec<LeaderboardRow> = rows
        .iter()
        .filter(|row| row.score(Metric::F1).is_some_and(|f1| f1 > threshold))
        .cloned()
        .collect();
    kept.sort_by(|a, b| {
        (a.evaluated_on.as_str(), a.model_name.as_str())
            .cmp(&(b.evaluated_on.as_str(), b.model_name.as_str()))
    });
    kept
}

/// Outer join on model name
///
/// Every leaderboard row appears once per matching hyperparameter row (or
/// once with none); hyperparameter rows matching no leaderboard row follow in
/// table order.
pub fn merge_with_hyperparameters(
    rows: &[LeaderboardRow],
    hyperparameters: &[HyperparameterRow],
) -> Vec<MergedRow> {
    let mut merged = Vec::new();

    for row in rows {
        let matching: Vec<&HyperparameterRow> = hyperparameters
            .iter()
            .filter(|h| h.model_name == row.model_name)
            .collect();

        if matching.is_empty() {
            merged.push(MergedRow {
                model_name: row.model_name.clone(),
                leaderboard: Some(row.clone()),
                hyperparameters: None,
            });
        }
        for h in matching {
            merged.push(MergedRow {
                model_name: row.model_name.clone(),
                leaderboard: Some(row.clone()),
                hyperparameters: Some(h.clone()),
            });
        }
    }

    for h in hyperparameters {
        if !rows.iter().any(|row| row.model_name == h.model_name) {
            merged.push(MergedRow {
                model_name: h.model_name.clone(),
                leaderboard: None,
                hyperparameters: Some(h.clone()),
            });
        }
    }

    merged
}

/// Summarize every score file in `dir` and build the leaderboard
pub fn build_leaderboard(
    dir: &Path,
    config: &EvalConfig,
    policy: FailurePolicy,
) -> Result<LeaderboardReport> {
    let files = list_score_files(dir)?;
    info!("Found {} score files in {}", files.len(), dir.display());

    let mut summaries = Vec::new();
    let mut skipped = Vec::new();
    for path in files {
        match summarize_score_file(&path) {
            Ok(summary) => summaries.push(summary),
            Err(e) => match policy {
                FailurePolicy::Abort => {
                    return Err(e.context(format!("Unusable score file: {}", path.display())))
                }
                FailurePolicy::Skip => {
                    warn!("Skipping {}: {:#}", path.display(), e);
                    skipped.push((path, format!("{:#}", e)));
                }
            },
        }
    }

    let grouped = group_summaries(&summaries, config);
    let leaderboard = filter_by_f1(&grouped, config.f1_threshold);
    let merged = merge_with_hyperparameters(&leaderboard, &config.hyperparameters);

    info!(
        "Leaderboard: {} of {} groups above F1 {}",
        leaderboard.len(),
        grouped.len(),
        config.f1_threshold
    );

    Ok(LeaderboardReport {
        grouped,
        leaderboard,
        merged,
        skipped,
    })
}

// ============================================================================
// Output
// ============================================================================

fn leaderboard_header() -> Vec<&'static str> {
    IDENTITY_COLUMNS
        .iter()
        .copied()
        .chain(Metric::ALL.iter().map(|m| m.label()))
        .collect()
}

/// Write the leaderboard CSV
pub fn write_leaderboard_csv(rows: &[LeaderboardRow], path: &Path) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    writer.write_record(leaderboard_header())?;
    for row in rows {
        writer.write_record(row.csv_fields())?;
    }
    writer.flush()?;
    Ok(())
}

/// Write the leaderboard joined with hyperparameters
pub fn write_parameters_csv(rows: &[MergedRow], path: &Path) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    let mut header = leaderboard_header();
    header.extend(PARAMETER_COLUMNS);
    writer.write_record(header)?;
    for row in rows {
        writer.write_record(row.csv_fields()?)?;
    }
    writer.flush()?;
    Ok(())
}

/// Write both CSVs and the charts under `output_dir`
pub fn write_outputs(report: &LeaderboardReport, output_dir: &Path) -> Result<ReportArtifacts> {
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create output directory: {}", output_dir.display()))?;

    let leaderboard_csv = output_dir.join(LEADERBOARD_FILE);
    write_leaderboard_csv(&report.leaderboard, &leaderboard_csv)?;

    let parameters_csv = output_dir.join(PARAMETERS_FILE);
    write_parameters_csv(&report.merged, &parameters_csv)?;

    let charts = charts::render_metric_charts(&report.grouped, &output_dir.join("charts"))?;

    info!("Leaderboard saved to: {}", output_dir.display());

    Ok(ReportArtifacts {
        leaderboard_csv,
        parameters_csv,
        charts,
    })
}

/// Index of the best present value
fn find_winner(values: &[Option<f64>], lower_is_better: bool) -> Option<usize> {
    let present = values
        .iter()
        .enumerate()
        .filter_map(|(i, v)| v.map(|v| (i, v)));
    if lower_is_better {
        present.min_by(|(_, a), (_, b)| a.total_cmp(b)).map(|(i, _)| i)
    } else {
        present.max_by(|(_, a), (_, b)| a.total_cmp(b)).map(|(i, _)| i)
    }
}

fn entry_name(row: &LeaderboardRow) -> String {
    format!("{} / {}", row.evaluated_on, row.model_name)
}

/// Print the leaderboard and the best entry per metric
pub fn print_leaderboard(report: &LeaderboardReport) {
    let mut out = Vec::new();
    if write_report(&mut out, report).is_ok() {
        print!("{}", String::from_utf8_lossy(&out));
    }
}

/// Save the console report to a text file
pub fn save_report_to_file(report: &LeaderboardReport, output_path: &Path) -> Result<()> {
    if let Some(parent) = output_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::File::create(output_path)
        .with_context(|| format!("Failed to create {}", output_path.display()))?;
    write_report(&mut file, report)?;
    info!("Report saved to: {}", output_path.display());
    Ok(())
}

/// Timestamped report path inside `output_dir`
pub fn generate_report_filename(output_dir: &Path) -> PathBuf {
    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    output_dir.join(format!("leaderboard_{}.txt", timestamp))
}

fn write_report<W: std::io::Write>(file: &mut W, report: &LeaderboardReport) -> Result<()> {
    let separator = "=".repeat(100);
    let name_width = 36;
    let col_width = 10;

    writeln!(file)?;
    writeln!(file, "{}", separator)?;
    writeln!(
        file,
        "Leaderboard: {} entries ({} groups before F1 filter)",
        report.leaderboard.len(),
        report.grouped.len()
    )?;
    writeln!(file, "{}", separator)?;

    if report.leaderboard.is_empty() {
        writeln!(file, "\n(No entries above the F1 threshold)")?;
    } else {
        writeln!(file)?;
        write!(file, "{:<width$}", "Dataset / Model", width = name_width)?;
        write!(file, " | {:>6}", "Count")?;
        for metric in Metric::ALL {
            write!(file, " | {:>width$}", metric.key(), width = col_width)?;
        }
        writeln!(file)?;
        let total_width = name_width + 9 + (col_width + 3) * Metric::ALL.len();
        writeln!(file, "{}", "-".repeat(total_width))?;

        for row in &report.leaderboard {
            write!(file, "{:<width$}", entry_name(row), width = name_width)?;
            write!(file, " | {:>6}", row.count)?;
            for metric in Metric::ALL {
                let shown = match row.score(metric) {
                    Some(v) => format!("{:.2}", v),
                    None => "-".to_string(),
                };
                write!(file, " | {:>width$}", shown, width = col_width)?;
            }
            writeln!(file)?;
        }

        writeln!(file, "\n## Best per Metric\n")?;
        for metric in Metric::ALL {
            let values: Vec<Option<f64>> =
                report.leaderboard.iter().map(|r| r.score(metric)).collect();
            match find_winner(&values, metric.lower_is_better()) {
                Some(idx) => writeln!(
                    file,
                    "{:<20} {} ({:.2})",
                    metric.label(),
                    entry_name(&report.leaderboard[idx]),
                    values[idx].unwrap_or_default()
                )?,
                None => writeln!(file, "{:<20} -", metric.label())?,
            }
        }
    }

    if !report.skipped.is_empty() {
        writeln!(file, "\n## Skipped Files\n")?;
        for (path, reason) in &report.skipped {
            writeln!(file, "{}: {}", path.display(), reason)?;
        }
    }

    writeln!(file, "{}", separator)?;
    Ok(())
}
