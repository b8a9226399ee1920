use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use llm_eval::leaderboard::generate_report_filename;
use llm_eval::{
    build_leaderboard, load_config_from_file, print_leaderboard, print_summary,
    publish_leaderboard, save_report_to_file, write_outputs, AnswerColumns, EvalConfig,
    FailurePolicy, LocalSink, MlflowClient, Scorer,
};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "llm-eval")]
#[command(about = "Answer-quality scoring and leaderboards for LLM evaluation runs")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// YAML configuration file (defaults to the built-in tables)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Score every answer pair of a CSV file
    Score {
        /// Input CSV with reference and candidate answer columns
        #[arg(long, short)]
        input: PathBuf,

        /// Output CSV (input columns plus one column per metric)
        #[arg(long, short)]
        output: PathBuf,

        /// Column holding the reference answer
        #[arg(long, default_value = "ideal_answer")]
        reference_column: String,

        /// Column holding the model answer
        #[arg(long, default_value = "answer")]
        candidate_column: String,

        /// Skip the model-backed metrics (no downloads)
        #[arg(long)]
        lexical_only: bool,
    },
    /// Aggregate score files into a leaderboard and record it
    Leaderboard {
        /// Directory of <dataset>_<model>.csv score files
        #[arg(long, short)]
        scores_dir: PathBuf,

        /// Output directory for CSVs, charts and the text report
        #[arg(long, short, default_value = "Result")]
        output_dir: PathBuf,

        /// Skip unusable score files instead of failing
        #[arg(long)]
        skip_invalid: bool,

        /// Do not record a tracking run
        #[arg(long)]
        no_track: bool,

        /// Skip saving the text report
        #[arg(long)]
        no_save: bool,

        /// MLflow tracking server URL
        #[arg(long, env = "MLFLOW_TRACKING_URI")]
        tracking_uri: Option<String>,

        /// Where runs are recorded when no tracking server is configured
        #[arg(long, default_value = "mlruns_local")]
        local_runs_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    // Use RUST_LOG env var if set, otherwise use --verbose flag or default to "warn"
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if args.verbose {
            "debug".to_string()
        } else {
            "warn".to_string()
        }
    });
    tracing_subscriber::fmt().with_env_filter(&filter).init();

    let config = match &args.config {
        Some(path) => {
            info!("Loading config from: {}", path.display());
            load_config_from_file(path)?
        }
        None => EvalConfig::default(),
    };

    match args.command {
        Commands::Score {
            input,
            output,
            reference_column,
            candidate_column,
            lexical_only,
        } => {
            let columns = AnswerColumns {
                reference: reference_column,
                candidate: candidate_column,
            };
            run_score_command(config, input, output, columns, lexical_only).await
        }
        Commands::Leaderboard {
            scores_dir,
            output_dir,
            skip_invalid,
            no_track,
            no_save,
            tracking_uri,
            local_runs_dir,
        } => {
            let policy = if skip_invalid {
                FailurePolicy::Skip
            } else {
                FailurePolicy::Abort
            };
            let tracking_uri = tracking_uri.or_else(|| config.tracking.uri.clone());
            run_leaderboard_command(
                &config,
                &scores_dir,
                &output_dir,
                policy,
                (!no_track).then_some(TrackingTarget {
                    uri: tracking_uri,
                    local_dir: local_runs_dir,
                }),
                no_save,
            )
            .await
        }
    }
}

async fn run_score_command(
    config: EvalConfig,
    input: PathBuf,
    output: PathBuf,
    columns: AnswerColumns,
    lexical_only: bool,
) -> Result<()> {
    info!("Scoring {} -> {}", input.display(), output.display());

    // Model loading and inference are blocking
    let summary = tokio::task::spawn_blocking(move || {
        let scorer = if lexical_only {
            Scorer::lexical()
        } else {
            Scorer::from_config(&config.models)?
        };
        scorer.score_dataset(&input, &output, &columns)
    })
    .await
    .context("Scoring task panicked")??;

    print_summary(&summary);
    Ok(())
}

struct TrackingTarget {
    uri: Option<String>,
    local_dir: PathBuf,
}

async fn run_leaderboard_command(
    config: &EvalConfig,
    scores_dir: &Path,
    output_dir: &Path,
    policy: FailurePolicy,
    tracking: Option<TrackingTarget>,
    no_save: bool,
) -> Result<()> {
    info!("Building leaderboard from: {}", scores_dir.display());
    let report = build_leaderboard(scores_dir, config, policy)?;
    let artifacts = write_outputs(&report, output_dir)?;

    print_leaderboard(&report);

    if !no_save {
        save_report_to_file(&report, &generate_report_filename(output_dir))?;
    }

    let Some(target) = tracking else {
        return Ok(());
    };

    let run_name = match target.uri {
        Some(uri) => {
            info!("Recording run on MLflow server: {}", uri);
            let mut sink = MlflowClient::from_env(&uri, &config.tracking.experiment)?;
            publish_leaderboard(&mut sink, &report, &artifacts, config).await?
        }
        None => {
            let mut sink = LocalSink::new(&target.local_dir);
            publish_leaderboard(&mut sink, &report, &artifacts, config).await?
        }
    };
    println!("Recorded run: {}", run_name);

    Ok(())
}
