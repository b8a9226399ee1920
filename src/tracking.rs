//! Experiment tracking for leaderboard runs
//!
//! [`MlflowClient`] talks to an MLflow tracking server over its REST API;
//! [`LocalSink`] records runs as plain files.

use anyhow::{anyhow, Context, Result};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::charts::chart_stem;
use crate::leaderboard::{LeaderboardReport, ReportArtifacts};
use crate::metrics::Metric;
use crate::{generate_run_name, EvalConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Finished,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Finished => "FINISHED",
            RunStatus::Failed => "FAILED",
        }
    }
}

/// Destination for run parameters, metrics and artifacts
///
/// One run is active at a time, between `start_run` and `end_run`.
pub trait TrackingSink {
    fn start_run(&mut self, name: &str) -> impl Future<Output = Result<()>> + Send;

    fn log_param(&mut self, key: &str, value: &str) -> impl Future<Output = Result<()>> + Send;

    fn log_metric(&mut self, key: &str, value: f64) -> impl Future<Output = Result<()>> + Send;

    /// Upload a file, optionally under a directory of the run's artifact tree
    fn log_artifact(
        &mut self,
        local_path: &Path,
        artifact_dir: Option<&str>,
    ) -> impl Future<Output = Result<()>> + Send;

    fn end_run(&mut self, status: RunStatus) -> impl Future<Output = Result<()>> + Send;
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn file_name(path: &Path) -> Result<&str> {
    path.file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow!("Artifact path has no file name: {}", path.display()))
}

// ============================================================================
// MLflow
// ============================================================================

#[derive(Debug, Clone)]
enum Auth {
    None,
    Bearer(String),
    Basic { username: String, password: String },
}

#[derive(Debug, Clone)]
struct ActiveRun {
    run_id: String,
    artifact_root: String,
}

#[derive(Deserialize)]
struct GetExperimentResponse {
    experiment: ExperimentInfo,
}

#[derive(Deserialize)]
struct ExperimentInfo {
    experiment_id: String,
}

#[derive(Deserialize)]
struct CreateExperimentResponse {
    experiment_id: String,
}

#[derive(Deserialize)]
struct CreateRunResponse {
    run: RunData,
}

#[derive(Deserialize)]
struct RunData {
    info: RunInfo,
}

#[derive(Deserialize)]
struct RunInfo {
    run_id: String,
    artifact_uri: String,
}

/// MLflow REST API 2.0 client
pub struct MlflowClient {
    client: Client,
    base_url: String,
    experiment: String,
    auth: Auth,
    run: Option<ActiveRun>,
}

impl MlflowClient {
    pub fn new(base_url: &str, experiment: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            experiment: experiment.to_string(),
            auth: Auth::None,
            run: None,
        })
    }

    /// Client with credentials from `MLFLOW_TRACKING_TOKEN` or
    /// `MLFLOW_TRACKING_USERNAME` / `MLFLOW_TRACKING_PASSWORD`
    pub fn from_env(base_url: &str, experiment: &str) -> Result<Self> {
        let mut client = Self::new(base_url, experiment)?;
        if let Ok(token) = std::env::var("MLFLOW_TRACKING_TOKEN") {
            client.auth = Auth::Bearer(token);
        } else if let (Ok(username), Ok(password)) = (
            std::env::var("MLFLOW_TRACKING_USERNAME"),
            std::env::var("MLFLOW_TRACKING_PASSWORD"),
        ) {
            client.auth = Auth::Basic { username, password };
        }
        Ok(client)
    }

    fn with_auth(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.auth {
            Auth::None => req,
            Auth::Bearer(token) => req.bearer_auth(token),
            Auth::Basic { username, password } => req.basic_auth(username, Some(password)),
        }
    }

    fn api_url(&self, endpoint: &str) -> String {
        format!("{}/api/2.0/mlflow/{}", self.base_url, endpoint)
    }

    async fn post(&self, endpoint: &str, body: serde_json::Value) -> Result<reqwest::Response> {
        let response = self
            .with_auth(self.client.post(self.api_url(endpoint)))
            .json(&body)
            .send()
            .await
            .with_context(|| format!("MLflow request to {} failed", endpoint))?;
        check_status(endpoint, response).await
    }

    fn active_run(&self) -> Result<&ActiveRun> {
        self.run
            .as_ref()
            .ok_or_else(|| anyhow!("No active MLflow run"))
    }

    async fn experiment_id(&self) -> Result<String> {
        let endpoint = "experiments/get-by-name";
        let response = self
            .with_auth(self.client.get(self.api_url(endpoint)))
            .query(&[("experiment_name", self.experiment.as_str())])
            .send()
            .await
            .with_context(|| format!("MLflow request to {} failed", endpoint))?;

        if response.status() == StatusCode::NOT_FOUND {
            info!("Creating MLflow experiment: {}", self.experiment);
            let created: CreateExperimentResponse = self
                .post("experiments/create", json!({ "name": self.experiment }))
                .await?
                .json()
                .await
                .context("Failed to parse experiments/create response")?;
            return Ok(created.experiment_id);
        }

        let found: GetExperimentResponse = check_status(endpoint, response)
            .await?
            .json()
            .await
            .context("Failed to parse experiments/get-by-name response")?;
        Ok(found.experiment.experiment_id)
    }
}

async fn check_status(endpoint: &str, response: reqwest::Response) -> Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Err(anyhow!("MLflow {} failed: HTTP {}: {}", endpoint, status, body))
}

/// Path of an `mlflow-artifacts:` URI below the artifact proxy root
fn artifact_root(artifact_uri: &str) -> Result<String> {
    let rest = artifact_uri
        .strip_prefix("mlflow-artifacts:")
        .ok_or_else(|| {
            anyhow!(
                "Unsupported artifact URI (only mlflow-artifacts is supported): {}",
                artifact_uri
            )
        })?;

    // mlflow-artifacts://host:port/path carries an authority before the path
    let path = match rest.strip_prefix("//") {
        Some(with_host) => with_host.split_once('/').map(|(_, p)| p).unwrap_or(""),
        None => rest,
    };
    Ok(path.trim_matches('/').to_string())
}

impl TrackingSink for MlflowClient {
    async fn start_run(&mut self, name: &str) -> Result<()> {
        let experiment_id = self.experiment_id().await?;
        let created: CreateRunResponse = self
            .post(
                "runs/create",
                json!({
                    "experiment_id": experiment_id,
                    "run_name": name,
                    "start_time": now_millis(),
                    "tags": [{ "key": "mlflow.runName", "value": name }],
                }),
            )
            .await?
            .json()
            .await
            .context("Failed to parse runs/create response")?;

        info!(
            "Started MLflow run {} ({}) in experiment {}",
            name, created.run.info.run_id, self.experiment
        );
        self.run = Some(ActiveRun {
            artifact_root: artifact_root(&created.run.info.artifact_uri)?,
            run_id: created.run.info.run_id,
        });
        Ok(())
    }

    async fn log_param(&mut self, key: &str, value: &str) -> Result<()> {
        let run_id = self.active_run()?.run_id.clone();
        self.post(
            "runs/log-parameter",
            json!({ "run_id": run_id, "key": key, "value": value }),
        )
        .await?;
        Ok(())
    }

    async fn log_metric(&mut self, key: &str, value: f64) -> Result<()> {
        let run_id = self.active_run()?.run_id.clone();
        self.post(
            "runs/log-metric",
            json!({
                "run_id": run_id,
                "key": key,
                "value": value,
                "timestamp": now_millis(),
                "step": 0,
            }),
        )
        .await?;
        Ok(())
    }

    async fn log_artifact(&mut self, local_path: &Path, artifact_dir: Option<&str>) -> Result<()> {
        let root = self.active_run()?.artifact_root.clone();
        let name = file_name(local_path)?;
        let target = match artifact_dir {
            Some(dir) => format!("{}/{}/{}", root, dir.trim_matches('/'), name),
            None => format!("{}/{}", root, name),
        };
        let url = format!(
            "{}/api/2.0/mlflow-artifacts/artifacts/{}",
            self.base_url, target
        );

        let content = tokio::fs::read(local_path)
            .await
            .with_context(|| format!("Failed to read artifact {}", local_path.display()))?;

        debug!("Uploading {} to {}", local_path.display(), url);
        let response = self
            .with_auth(self.client.put(&url))
            .body(content)
            .send()
            .await
            .with_context(|| format!("Failed to upload artifact {}", local_path.display()))?;
        check_status("artifact upload", response).await?;
        Ok(())
    }

    async fn end_run(&mut self, status: RunStatus) -> Result<()> {
        let run = self
            .run
            .take()
            .ok_or_else(|| anyhow!("No active MLflow run"))?;
        self.post(
            "runs/update",
            json!({
                "run_id": run.run_id,
                "status": status.as_str(),
                "end_time": now_millis(),
            }),
        )
        .await?;
        info!("Ended MLflow run {} ({})", run.run_id, status.as_str());
        Ok(())
    }
}

// ============================================================================
// Local directory
// ============================================================================

/// What `LocalSink` writes to `run.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalRun {
    pub name: String,
    pub params: BTreeMap<String, String>,
    pub metrics: BTreeMap<String, f64>,
    pub status: Option<RunStatus>,
    pub start_time: i64,
    pub end_time: Option<i64>,
}

/// Records runs under `<root>/<run name>/`
pub struct LocalSink {
    root: PathBuf,
    run: Option<LocalRun>,
}

impl LocalSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            run: None,
        }
    }

    fn active_run(&mut self) -> Result<&mut LocalRun> {
        self.run
            .as_mut()
            .ok_or_else(|| anyhow!("No active local run"))
    }

    fn run_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

impl TrackingSink for LocalSink {
    async fn start_run(&mut self, name: &str) -> Result<()> {
        let dir = self.run_dir(name);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create run directory: {}", dir.display()))?;
        self.run = Some(LocalRun {
            name: name.to_string(),
            params: BTreeMap::new(),
            metrics: BTreeMap::new(),
            status: None,
            start_time: now_millis(),
            end_time: None,
        });
        info!("Recording run {} in {}", name, dir.display());
        Ok(())
    }

    async fn log_param(&mut self, key: &str, value: &str) -> Result<()> {
        self.active_run()?
            .params
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn log_metric(&mut self, key: &str, value: f64) -> Result<()> {
        self.active_run()?.metrics.insert(key.to_string(), value);
        Ok(())
    }

    async fn log_artifact(&mut self, local_path: &Path, artifact_dir: Option<&str>) -> Result<()> {
        let name = self.active_run()?.name.clone();
        let mut target_dir = self.run_dir(&name).join("artifacts");
        if let Some(dir) = artifact_dir {
            target_dir = target_dir.join(dir.trim_matches('/'));
        }
        tokio::fs::create_dir_all(&target_dir)
            .await
            .with_context(|| format!("Failed to create {}", target_dir.display()))?;

        let target = target_dir.join(file_name(local_path)?);
        tokio::fs::copy(local_path, &target)
            .await
            .with_context(|| format!("Failed to copy artifact {}", local_path.display()))?;
        Ok(())
    }

    async fn end_run(&mut self, status: RunStatus) -> Result<()> {
        let mut run = self
            .run
            .take()
            .ok_or_else(|| anyhow!("No active local run"))?;
        run.status = Some(status);
        run.end_time = Some(now_millis());

        let path = self.run_dir(&run.name).join("run.json");
        let content = serde_json::to_string_pretty(&run)?;
        tokio::fs::write(&path, content)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }
}

// ============================================================================
// Publishing
// ============================================================================

async fn log_leaderboard<S: TrackingSink>(
    sink: &mut S,
    report: &LeaderboardReport,
    artifacts: &ReportArtifacts,
    config: &EvalConfig,
) -> Result<()> {
    sink.log_param("model_size_mapping", &serde_json::to_string(&config.model_sizes)?)
        .await?;
    sink.log_param("Parameters", &serde_json::to_string(&config.hyperparameters)?)
        .await?;

    for row in &report.leaderboard {
        if let Some(f1) = row.score(Metric::F1) {
            let key = format!("{}_{}", row.model_name, row.evaluated_on);
            sink.log_metric(&key, f1).await?;
        }
    }

    for (metric, path) in &artifacts.charts {
        let dir = format!("charts/{}", chart_stem(*metric));
        sink.log_artifact(path, Some(&dir)).await?;
    }
    sink.log_artifact(&artifacts.leaderboard_csv, None).await?;
    sink.log_artifact(&artifacts.parameters_csv, None).await?;

    Ok(())
}

/// Record a leaderboard as one tracking run and return the run name
///
/// The run is always ended: `FINISHED` when everything was logged, `FAILED`
/// otherwise, in which case the first error is returned.
pub async fn publish_leaderboard<S: TrackingSink>(
    sink: &mut S,
    report: &LeaderboardReport,
    artifacts: &ReportArtifacts,
    config: &EvalConfig,
) -> Result<String> {
    let run_name = generate_run_name(&config.tracking.run_prefix, chrono::Local::now());
    sink.start_run(&run_name).await?;

    let outcome = log_leaderboard(sink, report, artifacts, config).await;
    let status = if outcome.is_ok() {
        RunStatus::Finished
    } else {
        RunStatus::Failed
    };
    if let Err(e) = &outcome {
        warn!("Logging run {} failed: {:#}", run_name, e);
    }

    let ended = sink.end_run(status).await;
    outcome?;
    ended?;

    info!("Published leaderboard run: {}", run_name);
    Ok(run_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_root() {
        assert_eq!(
            artifact_root("mlflow-artifacts:/3/abc/artifacts").unwrap(),
            "3/abc/artifacts"
        );
        assert_eq!(
            artifact_root("mlflow-artifacts://tracking:5000/3/abc/artifacts").unwrap(),
            "3/abc/artifacts"
        );
        assert!(artifact_root("s3://bucket/3/abc/artifacts").is_err());
    }

    #[test]
    fn test_run_status_serialization() {
        assert_eq!(serde_json::to_string(&RunStatus::Failed).unwrap(), "\"FAILED\"");
        assert_eq!(RunStatus::Finished.as_str(), "FINISHED");
    }

    #[tokio::test]
    async fn test_local_sink_requires_active_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = LocalSink::new(dir.path());
        assert!(sink.log_metric("x", 1.0).await.is_err());
        assert!(sink.end_run(RunStatus::Finished).await.is_err());
    }

    #[tokio::test]
    async fn test_local_sink_records_run() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("chart.svg");
        std::fs::write(&artifact, "<svg/>").unwrap();

        let mut sink = LocalSink::new(dir.path().join("runs"));
        sink.start_run("run_1").await.unwrap();
        sink.log_param("k", "v").await.unwrap();
        sink.log_metric("Bloom_CoQA", 42.5).await.unwrap();
        sink.log_artifact(&artifact, Some("charts/mean_f1_score_chart"))
            .await
            .unwrap();
        sink.end_run(RunStatus::Finished).await.unwrap();

        let run_dir = dir.path().join("runs").join("run_1");
        assert!(run_dir
            .join("artifacts/charts/mean_f1_score_chart/chart.svg")
            .exists());

        let run: LocalRun =
            serde_json::from_str(&std::fs::read_to_string(run_dir.join("run.json")).unwrap())
                .unwrap();
        assert_eq!(run.params.get("k").map(String::as_str), Some("v"));
        assert_eq!(run.metrics.get("Bloom_CoQA"), Some(&42.5));
        assert_eq!(run.status, Some(RunStatus::Finished));
        assert!(run.end_time.is_some());
    }

    #[tokio::test]
    async fn test_mlflow_client_run_lifecycle() {
        let server = httpmock::MockServer::start_async().await;

        let get_experiment = server.mock_async(|when, then| {
            when.method(httpmock::Method::GET)
                .path("/api/2.0/mlflow/experiments/get-by-name")
                .query_param("experiment_name", "Model_Evaluation");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({
                    "experiment": { "experiment_id": "7", "name": "Model_Evaluation" }
                }));
        }).await;
        let create_run = server.mock_async(|when, then| {
            when.method(httpmock::Method::POST)
                .path("/api/2.0/mlflow/runs/create")
                .header("Authorization", "Bearer TEST");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({
                    "run": { "info": {
                        "run_id": "run123",
                        "artifact_uri": "mlflow-artifacts:/7/run123/artifacts"
                    } }
                }));
        }).await;
        let log_param = server.mock_async(|when, then| {
            when.method(httpmock::Method::POST)
                .path("/api/2.0/mlflow/runs/log-parameter")
                .json_body(json!({ "run_id": "run123", "key": "k", "value": "v" }));
            then.status(200).json_body(json!({}));
        }).await;
        let upload = server.mock_async(|when, then| {
            when.method(httpmock::Method::PUT)
                .path("/api/2.0/mlflow-artifacts/artifacts/7/run123/artifacts/charts/leaderboard.csv");
            then.status(200).json_body(json!({}));
        }).await;
        let update = server.mock_async(|when, then| {
            when.method(httpmock::Method::POST)
                .path("/api/2.0/mlflow/runs/update");
            then.status(200).json_body(json!({}));
        }).await;

        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("leaderboard.csv");
        std::fs::write(&artifact, "Model Name\n").unwrap();

        let mut client = MlflowClient::new(&server.base_url(), "Model_Evaluation").unwrap();
        client.auth = Auth::Bearer("TEST".to_string());

        client.start_run("run").await.unwrap();
        client.log_param("k", "v").await.unwrap();
        client.log_artifact(&artifact, Some("charts")).await.unwrap();
        client.end_run(RunStatus::Finished).await.unwrap();

        get_experiment.assert_async().await;
        create_run.assert_async().await;
        log_param.assert_async().await;
        upload.assert_async().await;
        update.assert_async().await;
        assert!(client.run.is_none());
    }

    #[tokio::test]
    async fn test_mlflow_creates_missing_experiment() {
        let server = httpmock::MockServer::start_async().await;

        server.mock_async(|when, then| {
            when.method(httpmock::Method::GET)
                .path("/api/2.0/mlflow/experiments/get-by-name");
            then.status(404).json_body(json!({
                "error_code": "RESOURCE_DOES_NOT_EXIST",
                "message": "Could not find experiment"
            }));
        }).await;
        let create = server.mock_async(|when, then| {
            when.method(httpmock::Method::POST)
                .path("/api/2.0/mlflow/experiments/create")
                .json_body(json!({ "name": "Fresh" }));
            then.status(200).json_body(json!({ "experiment_id": "12" }));
        }).await;

        let client = MlflowClient::new(&server.base_url(), "Fresh").unwrap();
        assert_eq!(client.experiment_id().await.unwrap(), "12");
        create.assert_async().await;
    }

    #[tokio::test]
    async fn test_mlflow_error_status_is_reported() {
        let server = httpmock::MockServer::start_async().await;
        server.mock_async(|when, then| {
            when.method(httpmock::Method::GET)
                .path("/api/2.0/mlflow/experiments/get-by-name");
            then.status(500).body("boom");
        }).await;

        let mut client = MlflowClient::new(&server.base_url(), "Model_Evaluation").unwrap();
        let err = client.start_run("run").await.unwrap_err();
        assert!(err.to_string().contains("HTTP 500"));
        assert!(client.run.is_none());
    }
}
