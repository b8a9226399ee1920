//! Per-example and dataset scoring

use anyhow::{anyhow, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::embedding::{
    bert_similarity, sentence_similarity, BertEncoder, BleurtRegressor, LearnedScorer,
    SentenceEncoder, TokenEncoder,
};
use crate::metrics::Metric;
use crate::quality_metrics::{bleu_score, f1_score, meteor_score, perplexity, rouge_scores};
use crate::simhash::simhash_distance;
use crate::{mean_present, ModelConfig};

/// Scores of one answer pair; `None` means the metric could not be computed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScoreRow {
    values: BTreeMap<Metric, Option<f64>>,
}

impl ScoreRow {
    /// Record a value; non-finite values are stored as absent
    pub fn set(&mut self, metric: Metric, value: Option<f64>) {
        self.values
            .insert(metric, value.filter(|v| v.is_finite()));
    }

    pub fn get(&self, metric: Metric) -> Option<f64> {
        self.values.get(&metric).copied().flatten()
    }

    /// All metrics in report order, absent ones included
    pub fn iter(&self) -> impl Iterator<Item = (Metric, Option<f64>)> + '_ {
        Metric::ALL.into_iter().map(move |m| (m, self.get(m)))
    }
}

/// Names of the answer columns in a dataset file
#[derive(Debug, Clone)]
pub struct AnswerColumns {
    pub reference: String,
    pub candidate: String,
}

impl Default for AnswerColumns {
    fn default() -> Self {
        Self {
            reference: "ideal_answer".to_string(),
            candidate: "answer".to_string(),
        }
    }
}

/// Outcome of scoring a dataset file
#[derive(Debug, Clone)]
pub struct DatasetSummary {
    pub rows: usize,
    pub means: BTreeMap<Metric, Option<f64>>,
}

/// Computes every metric for answer pairs
///
/// The lexical metrics are always available; the model-backed ones are
/// computed only when their oracle is attached.
#[derive(Default)]
pub struct Scorer {
    sentence: Option<Box<dyn SentenceEncoder>>,
    token: Option<Box<dyn TokenEncoder>>,
    learned: Option<Box<dyn LearnedScorer>>,
}

impl Scorer {
    /// A scorer with no models attached
    pub fn lexical() -> Self {
        Self::default()
    }

    pub fn with_sentence_encoder(mut self, encoder: Box<dyn SentenceEncoder>) -> Self {
        self.sentence = Some(encoder);
        self
    }

    pub fn with_token_encoder(mut self, encoder: Box<dyn TokenEncoder>) -> Self {
        self.token = Some(encoder);
        self
    }

    pub fn with_learned_scorer(mut self, scorer: Box<dyn LearnedScorer>) -> Self {
        self.learned = Some(scorer);
        self
    }

    /// Load every configured model once
    pub fn from_config(models: &ModelConfig) -> Result<Self> {
        let mut scorer = Self::lexical();

        if let Some(source) = &models.sentence {
            let encoder = BertEncoder::load(source, None)
                .with_context(|| format!("Failed to load sentence model {}", source))?;
            scorer = scorer.with_sentence_encoder(Box::new(encoder));
        }
        if let Some(source) = &models.token {
            let encoder = BertEncoder::load(source, None)
                .with_context(|| format!("Failed to load token model {}", source))?;
            scorer = scorer.with_token_encoder(Box::new(encoder));
        }
        if let Some(source) = &models.bleurt {
            let regressor = BleurtRegressor::load(source, models.bleurt_tokenizer.as_deref())
                .with_context(|| format!("Failed to load BLEURT model {}", source))?;
            scorer = scorer.with_learned_scorer(Box::new(regressor));
        }

        Ok(scorer)
    }

    /// Score one answer pair
    ///
    /// A failing model-backed metric is logged and left absent; the other
    /// metrics are unaffected.
    pub fn score_pair(&self, reference: &str, candidate: &str) -> ScoreRow {
        let mut row = ScoreRow::default();

        row.set(Metric::F1, Some(f1_score(reference, candidate)));
        row.set(Metric::Bleu, Some(bleu_score(reference, candidate)));
        row.set(Metric::Meteor, Some(meteor_score(reference, candidate)));
        row.set(
            Metric::Rouge,
            Some(rouge_scores(reference, candidate).rouge1.fmeasure),
        );
        row.set(
            Metric::SimHash,
            Some(simhash_distance(reference, candidate) as f64),
        );
        row.set(Metric::Perplexity, Some(perplexity(reference, candidate)));

        let sentence = self
            .sentence
            .as_deref()
            .map(|encoder| sentence_similarity(encoder, reference, candidate));
        row.set(Metric::SentenceSim, recover(Metric::SentenceSim, sentence));

        let bert = self
            .token
            .as_deref()
            .map(|encoder| bert_similarity(encoder, reference, candidate));
        row.set(Metric::Bert, recover(Metric::Bert, bert));

        let bleurt = self
            .learned
            .as_deref()
            .map(|scorer| scorer.score(reference, candidate));
        row.set(Metric::Bleurt, recover(Metric::Bleurt, bleurt));

        row
    }

    /// Score every row of a CSV file and write it back out with one column per metric
    pub fn score_dataset(
        &self,
        input: &Path,
        output: &Path,
        columns: &AnswerColumns,
    ) -> Result<DatasetSummary> {
        let mut reader = csv::Reader::from_path(input)
            .with_context(|| format!("Failed to open dataset: {}", input.display()))?;
        let headers = reader
            .headers()
            .with_context(|| format!("Failed to read header of {}", input.display()))?
            .clone();

        let column_index = |name: &str| {
            headers
                .iter()
                .position(|h| h == name)
                .ok_or_else(|| anyhow!("Column '{}' not found in {}", name, input.display()))
        };
        let reference_idx = column_index(&columns.reference)?;
        let candidate_idx = column_index(&columns.candidate)?;

        let records = reader
            .records()
            .collect::<std::result::Result<Vec<_>, _>>()
            .with_context(|| format!("Failed to read rows of {}", input.display()))?;

        info!("Scoring {} rows from {}", records.len(), input.display());

        if let Some(parent) = output.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create output directory: {}", parent.display())
                })?;
            }
        }

        let mut writer = csv::Writer::from_path(output)
            .with_context(|| format!("Failed to create {}", output.display()))?;
        let mut out_headers = headers.clone();
        for metric in Metric::ALL {
            out_headers.push_field(metric.score_column());
        }
        writer.write_record(&out_headers)?;

        let progress = ProgressBar::new(records.len() as u64);
        progress.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec})",
                )?
                .progress_chars("#>-"),
        );

        let mut rows = Vec::with_capacity(records.len());
        for (i, record) in records.iter().enumerate() {
            let reference = record.get(reference_idx).unwrap_or_default();
            let candidate = record.get(candidate_idx).unwrap_or_default();
            let row = self.score_pair(reference, candidate);
            debug!("Row {}: F1 {:?}", i, row.get(Metric::F1));

            let mut out = record.clone();
            for (_, value) in row.iter() {
                out.push_field(&value.map(|v| v.to_string()).unwrap_or_default());
            }
            writer.write_record(&out)?;

            rows.push(row);
            progress.inc(1);
        }

        progress.finish_and_clear();
        writer
            .flush()
            .with_context(|| format!("Failed to write {}", output.display()))?;

        let means = Metric::ALL
            .into_iter()
            .map(|metric| (metric, mean_present(rows.iter().map(|r| r.get(metric)))))
            .collect();

        info!("Scores written to: {}", output.display());

        Ok(DatasetSummary {
            rows: rows.len(),
            means,
        })
    }
}

fn recover(metric: Metric, outcome: Option<Result<f64>>) -> Option<f64> {
    match outcome {
        Some(Ok(value)) => Some(value),
        Some(Err(e)) => {
            warn!("{} failed: {:#}", metric, e);
            None
        }
        None => None,
    }
}

/// Print a dataset summary
pub fn print_summary(summary: &DatasetSummary) {
    println!();
    println!("============ Dataset Scores ============");
    println!("Rows scored:                             {}", summary.rows);
    for metric in Metric::ALL {
        let value = summary.means.get(&metric).copied().flatten();
        let shown = match value {
            Some(v) => format!("{:.4}", v),
            None => "-".to_string(),
        };
        println!("{:<40} {}", format!("Mean {}:", metric.score_column()), shown);
    }
    println!("========================================");
}
