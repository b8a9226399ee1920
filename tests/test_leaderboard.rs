use llm_eval::leaderboard::{summarize_score_file, LEADERBOARD_FILE, PARAMETERS_FILE};
use llm_eval::{
    build_leaderboard, write_outputs, EvalConfig, FailurePolicy, HyperparameterRow, Metric,
};
use std::collections::BTreeMap;
use std::path::Path;

fn approx(a: Option<f64>, b: f64) -> bool {
    a.is_some_and(|a| (a - b).abs() < 1e-9)
}

fn write_scores(dir: &Path, name: &str, f1: &[f64], rouge: &[f64]) {
    let mut content = String::from("question,ideal_answer,answer,F1 score,rouge score\n");
    for (i, (f, r)) in f1.iter().zip(rouge).enumerate() {
        content.push_str(&format!("q{},ref,ans,{},{}\n", i, f, r));
    }
    std::fs::write(dir.join(name), content).unwrap();
}

fn test_config() -> EvalConfig {
    EvalConfig {
        model_sizes: BTreeMap::from([("Model1".to_string(), "3B".to_string())]),
        retrievers: BTreeMap::from([("DatasetA".to_string(), "Solr".to_string())]),
        hyperparameters: vec![HyperparameterRow {
            model_name: "Model1".to_string(),
            temperature: Some(0.7),
            top_p: Some(1.0),
            top_k: Some(50),
            decoding_method: Some("Greedy".to_string()),
            min_new_tokens: Some(10),
            max_new_tokens: Some(200),
            stop_sequences: Vec::new(),
        }],
        ..EvalConfig::default()
    }
}

/// Two score files for one dataset give one leaderboard row per model
#[test]
fn test_two_models_one_dataset() {
    let dir = tempfile::tempdir().unwrap();
    write_scores(dir.path(), "DatasetA_Model1.csv", &[0.5, 0.25, 0.75], &[0.1, 0.2, 0.3]);
    write_scores(dir.path(), "DatasetA_Model2.csv", &[0.75, 0.75, 0.75], &[0.5, 0.5, 0.5]);

    let report = build_leaderboard(dir.path(), &test_config(), FailurePolicy::Abort).unwrap();
    assert_eq!(report.leaderboard.len(), 2);

    let first = &report.leaderboard[0];
    assert_eq!(first.model_name, "Model1");
    assert_eq!(first.evaluated_on, "DatasetA");
    assert_eq!(first.count, 3.0);
    assert!(approx(first.score(Metric::F1), 50.0));
    assert!(approx(first.score(Metric::Rouge), 20.0));
    assert_eq!(first.score(Metric::Bleurt), None);
    assert_eq!(first.retriever.as_deref(), Some("Solr"));
    assert_eq!(first.model_size.as_deref(), Some("3B"));

    let second = &report.leaderboard[1];
    assert_eq!(second.model_name, "Model2");
    assert!(approx(second.score(Metric::F1), 75.0));
    assert_eq!(second.retriever.as_deref(), Some("Solr"));
    assert_eq!(second.model_size, None);
}

/// Rows at or below the F1 threshold are dropped
#[test]
fn test_f1_threshold_is_strict() {
    let dir = tempfile::tempdir().unwrap();
    write_scores(dir.path(), "DatasetA_AtThreshold.csv", &[0.04, 0.04, 0.04], &[0.1, 0.1, 0.1]);
    write_scores(dir.path(), "DatasetA_Below.csv", &[0.01, 0.02, 0.03], &[0.1, 0.1, 0.1]);
    write_scores(dir.path(), "DatasetA_Above.csv", &[0.05, 0.05, 0.05], &[0.1, 0.1, 0.1]);

    let report = build_leaderboard(dir.path(), &test_config(), FailurePolicy::Abort).unwrap();
    assert_eq!(report.grouped.len(), 3);
    let models: Vec<&str> = report
        .leaderboard
        .iter()
        .map(|r| r.model_name.as_str())
        .collect();
    assert_eq!(models, vec!["Above"]);
}

/// The parameters table keeps unmatched rows from both sides
#[test]
fn test_parameters_outer_join() {
    let dir = tempfile::tempdir().unwrap();
    write_scores(dir.path(), "DatasetA_Model2.csv", &[0.5, 0.5, 0.5], &[0.5, 0.5, 0.5]);

    let report = build_leaderboard(dir.path(), &test_config(), FailurePolicy::Abort).unwrap();
    assert_eq!(report.merged.len(), 2);
    assert_eq!(report.merged[0].model_name, "Model2");
    assert!(report.merged[0].hyperparameters.is_none());
    assert_eq!(report.merged[1].model_name, "Model1");
    assert!(report.merged[1].leaderboard.is_none());
}

#[test]
fn test_unparsable_file_name_policy() {
    let dir = tempfile::tempdir().unwrap();
    write_scores(dir.path(), "DatasetA_Model1.csv", &[0.5], &[0.5]);
    write_scores(dir.path(), "nounderscore.csv", &[0.5], &[0.5]);

    let err = build_leaderboard(dir.path(), &test_config(), FailurePolicy::Abort).unwrap_err();
    assert!(format!("{:#}", err).contains("nounderscore.csv"));

    let report = build_leaderboard(dir.path(), &test_config(), FailurePolicy::Skip).unwrap();
    assert_eq!(report.leaderboard.len(), 1);
    assert_eq!(report.skipped.len(), 1);
}

#[test]
fn test_non_csv_files_are_ignored() {
    let dir = tempfile::tempdir().unwrap();
    write_scores(dir.path(), "DatasetA_Model1.csv", &[0.5], &[0.5]);
    std::fs::write(dir.path().join("notes.txt"), "not a score file").unwrap();

    let report = build_leaderboard(dir.path(), &test_config(), FailurePolicy::Abort).unwrap();
    assert_eq!(report.grouped.len(), 1);
}

#[test]
fn test_summary_uses_today_for_fresh_files() {
    let dir = tempfile::tempdir().unwrap();
    write_scores(dir.path(), "DatasetA_Model1.csv", &[0.5], &[0.5]);

    let summary = summarize_score_file(&dir.path().join("DatasetA_Model1.csv")).unwrap();
    assert_eq!(summary.experiment_date, chrono::Local::now().date_naive());
}

#[test]
fn test_outputs_written() {
    let dir = tempfile::tempdir().unwrap();
    let scores = dir.path().join("scores");
    std::fs::create_dir(&scores).unwrap();
    write_scores(&scores, "DatasetA_Model1.csv", &[0.5, 0.25, 0.75], &[0.1, 0.2, 0.3]);

    let report = build_leaderboard(&scores, &test_config(), FailurePolicy::Abort).unwrap();
    let out = dir.path().join("Result");
    let artifacts = write_outputs(&report, &out).unwrap();

    assert_eq!(artifacts.leaderboard_csv, out.join(LEADERBOARD_FILE));
    assert_eq!(artifacts.parameters_csv, out.join(PARAMETERS_FILE));
    // F1 and Rouge have values, everything else is absent
    assert_eq!(artifacts.charts.len(), 2);
    assert!(out.join("charts/mean_f1_score_chart.svg").exists());
    assert!(out.join("charts/mean_rouge_score_chart.svg").exists());

    let mut reader = csv::Reader::from_path(&artifacts.leaderboard_csv).unwrap();
    let headers: Vec<String> = reader.headers().unwrap().iter().map(String::from).collect();
    assert_eq!(
        &headers[..7],
        ["Model Name", "Evaluated on", "Retriever", "Experiment Date", "Count", "Model Size", "F1 Score"]
    );
    let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
    assert_eq!(rows.len(), 1);
    assert_eq!(&rows[0][0], "Model1");
    assert_eq!(&rows[0][2], "Solr");
    assert_eq!(&rows[0][4], "3");

    let mut reader = csv::Reader::from_path(&artifacts.parameters_csv).unwrap();
    let headers = reader.headers().unwrap().clone();
    assert_eq!(headers.iter().last(), Some("Stop Sequences"));
    let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].iter().last(), Some("[]"));
}
