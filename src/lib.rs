//! LLM Eval - answer-quality scoring and leaderboard reporting for LLM runs

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

pub mod charts;
pub mod embedding;
pub mod leaderboard;
pub mod metrics;
pub mod normalize;
pub mod quality_metrics;
pub mod scorer;
pub mod simhash;
pub mod tracking;

pub use leaderboard::{
    build_leaderboard, merge_with_hyperparameters, print_leaderboard, save_report_to_file,
    write_outputs, FailurePolicy, LeaderboardReport, LeaderboardRow, MergedRow, ReportArtifacts,
};
pub use metrics::{Metric, Scaling};
pub use normalize::{get_tokens, normalize_answer};
pub use quality_metrics::{
    bleu_score, f1_score, meteor_score, perplexity, rouge_scores, RougeScore, RougeScores,
};
pub use scorer::{print_summary, AnswerColumns, DatasetSummary, ScoreRow, Scorer};
pub use simhash::simhash_distance;
pub use tracking::{publish_leaderboard, LocalSink, MlflowClient, RunStatus, TrackingSink};

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for scoring and leaderboard runs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalConfig {
    /// Leaderboard rows need an F1 above this (0-100 scale)
    #[serde(default = "default_f1_threshold")]
    pub f1_threshold: f64,
    /// Model name -> parameter count label
    #[serde(default = "default_model_sizes")]
    pub model_sizes: BTreeMap<String, String>,
    /// Dataset name -> retriever kind
    #[serde(default = "default_retrievers")]
    pub retrievers: BTreeMap<String, String>,
    /// Generation settings per model, joined into the merged report
    #[serde(default = "default_hyperparameters")]
    pub hyperparameters: Vec<HyperparameterRow>,
    /// Checkpoints for the model-backed metrics
    #[serde(default)]
    pub models: ModelConfig,
    /// Experiment tracking
    #[serde(default)]
    pub tracking: TrackingConfig,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            f1_threshold: default_f1_threshold(),
            model_sizes: default_model_sizes(),
            retrievers: default_retrievers(),
            hyperparameters: default_hyperparameters(),
            models: ModelConfig::default(),
            tracking: TrackingConfig::default(),
        }
    }
}

/// Generation settings used for one model's answers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HyperparameterRow {
    pub model_name: String,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub top_k: Option<u32>,
    #[serde(default)]
    pub decoding_method: Option<String>,
    #[serde(default)]
    pub min_new_tokens: Option<u32>,
    #[serde(default)]
    pub max_new_tokens: Option<u32>,
    #[serde(default)]
    pub stop_sequences: Vec<String>,
}

/// Model sources: a Hugging Face Hub id or a local checkpoint directory.
/// `None` turns the metric off.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_sentence_model")]
    pub sentence: Option<String>,
    #[serde(default = "default_token_model")]
    pub token: Option<String>,
    #[serde(default = "default_bleurt_model")]
    pub bleurt: Option<String>,
    /// Tokenizer to use when the BLEURT checkpoint ships without one
    #[serde(default = "default_bleurt_tokenizer")]
    pub bleurt_tokenizer: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            sentence: default_sentence_model(),
            token: default_token_model(),
            bleurt: default_bleurt_model(),
            bleurt_tokenizer: default_bleurt_tokenizer(),
        }
    }
}

impl ModelConfig {
    /// No model-backed metrics
    pub fn disabled() -> Self {
        Self {
            sentence: None,
            token: None,
            bleurt: None,
            bleurt_tokenizer: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingConfig {
    /// MLflow tracking server URL; runs are written locally when unset
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default = "default_experiment")]
    pub experiment: String,
    /// Prefix of the timestamped run name
    #[serde(default = "default_run_prefix")]
    pub run_prefix: String,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            uri: None,
            experiment: default_experiment(),
            run_prefix: default_run_prefix(),
        }
    }
}

fn default_f1_threshold() -> f64 {
    4.0
}
fn default_experiment() -> String {
    "Model_Evaluation".to_string()
}
fn default_run_prefix() -> String {
    "SuperKnowa_Evaluation".to_string()
}
fn default_sentence_model() -> Option<String> {
    Some("sentence-transformers/all-MiniLM-L6-v2".to_string())
}
fn default_token_model() -> Option<String> {
    Some("bert-base-uncased".to_string())
}
fn default_bleurt_model() -> Option<String> {
    Some("Elron/bleurt-base-128".to_string())
}
fn default_bleurt_tokenizer() -> Option<String> {
    Some("bert-base-uncased".to_string())
}

fn default_model_sizes() -> BTreeMap<String, String> {
    [
        ("Bloom", "176B"),
        ("Bloom_internal", "176B"),
        ("FlanT5-XXL", "11B"),
        ("FlanT5-XL", "3B"),
        ("FlanT5", "3B"),
        ("Coga", "3B"),
        ("Flan_ul2", "20B"),
    ]
    .into_iter()
    .map(|(model, size)| (model.to_string(), size.to_string()))
    .collect()
}

fn default_retrievers() -> BTreeMap<String, String> {
    [
        ("CoQA", "passage"),
        ("IBM-Test", "Solr"),
        ("IBM-Test-Product-Wise", "Solr"),
        ("Manually-Curated", "WD"),
        ("QuAC", "passage"),
        ("QuAC-Random", "passage"),
        ("SAP-Doc-Solr", "Solr"),
        ("SAP-passages", "passage"),
        ("TechQA", "passage"),
        ("TidyQA", "passage"),
        ("IBM-Test-ES", "ElasticSearch"),
    ]
    .into_iter()
    .map(|(dataset, retriever)| (dataset.to_string(), retriever.to_string()))
    .collect()
}

fn default_hyperparameters() -> Vec<HyperparameterRow> {
    let greedy = |model: &str| HyperparameterRow {
        model_name: model.to_string(),
        temperature: Some(0.7),
        top_p: Some(1.0),
        top_k: Some(50),
        decoding_method: Some("Greedy".to_string()),
        min_new_tokens: Some(10),
        max_new_tokens: Some(200),
        stop_sequences: Vec::new(),
    };

    vec![
        HyperparameterRow {
            model_name: "Bloom".to_string(),
            temperature: Some(0.3),
            top_p: None,
            top_k: None,
            decoding_method: Some("sample".to_string()),
            min_new_tokens: Some(10),
            max_new_tokens: Some(200),
            stop_sequences: vec!["Question".to_string()],
        },
        greedy("FlanT5-XXL"),
        greedy("FlanT5-XL"),
        greedy("FlanT5"),
        greedy("Coga"),
        greedy("Flan_ul2"),
    ]
}

/// Expand environment variables in a string
/// Replaces ${VAR_NAME} with the value of the environment variable
fn expand_env_vars(s: &str) -> Result<String> {
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}")?;
    let mut result = s.to_string();
    let mut missing_vars = Vec::new();

    for caps in re.captures_iter(s) {
        if let Some(var_name) = caps.get(1) {
            let var_name_str = var_name.as_str();
            match std::env::var(var_name_str) {
                Ok(value) => {
                    let pattern = format!("${{{}}}", var_name_str);
                    result = result.replace(&pattern, &value);
                }
                Err(_) => {
                    missing_vars.push(var_name_str.to_string());
                }
            }
        }
    }

    if !missing_vars.is_empty() {
        return Err(anyhow!(
            "Missing required environment variables: {}",
            missing_vars.join(", ")
        ));
    }

    Ok(result)
}

fn expand_optional(value: &mut Option<String>) -> Result<()> {
    if let Some(v) = value.as_mut() {
        *v = expand_env_vars(v)?;
    }
    Ok(())
}

/// Expand environment variables in the tracking URI and model sources
pub fn expand_config_env_vars(mut config: EvalConfig) -> Result<EvalConfig> {
    expand_optional(&mut config.tracking.uri)?;
    expand_optional(&mut config.models.sentence)?;
    expand_optional(&mut config.models.token)?;
    expand_optional(&mut config.models.bleurt)?;
    expand_optional(&mut config.models.bleurt_tokenizer)?;
    Ok(config)
}

/// Load a configuration from a YAML file
pub fn load_config_from_file(path: impl AsRef<Path>) -> Result<EvalConfig> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config: EvalConfig = serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    expand_config_env_vars(config)
}

// ============================================================================
// Statistics
// ============================================================================

/// Mean of the present values; `None` when there are none
pub fn mean_present<I>(values: I) -> Option<f64>
where
    I: IntoIterator<Item = Option<f64>>,
{
    let (sum, count) = values
        .into_iter()
        .flatten()
        .fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    if count == 0 {
        return None;
    }
    Some(sum / count as f64)
}

/// Run name with a local timestamp suffix, e.g. `SuperKnowa_Evaluation_20240131093000`
pub fn generate_run_name(prefix: &str, at: chrono::DateTime<chrono::Local>) -> String {
    format!("{}_{}", prefix, at.format("%Y%m%d%H%M%S"))
}
