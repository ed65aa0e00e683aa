use std::fs::File;
use std::io::BufWriter;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{ArgGroup, Parser, Subcommand};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod artifacts;
mod balance;
mod db;
mod error;
mod explain;
mod features;
mod forest;
mod ingest;
mod metrics;
mod models;
mod predict;
mod report;
mod risk;
mod sample;
mod scaler;
mod server;
mod stats;
mod train;

use artifacts::ArtifactPaths;
use features::FeatureTable;
use models::{FeatureVector, SurveyResponse};
use predict::InferenceService;

#[derive(Parser)]
#[command(name = "turnover-risk")]
#[command(about = "Employee turnover risk pipeline: survey features, model training and scoring", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Write a synthetic survey batch to CSV
    Sample {
        #[arg(long, default_value = "data/sample_data.csv")]
        out: PathBuf,
        #[arg(long, default_value_t = 300)]
        active: usize,
        #[arg(long, default_value_t = 50)]
        exits: usize,
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
    /// Insert a synthetic survey batch into the database
    Seed {
        #[arg(long, default_value_t = 300)]
        active: usize,
        #[arg(long, default_value_t = 50)]
        exits: usize,
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
    /// Import raw survey responses from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Derive the feature table from raw responses
    Transform {
        /// Read raw responses from CSV instead of the database
        #[arg(long)]
        csv: Option<PathBuf>,
        #[arg(long, default_value = "data")]
        out: PathBuf,
    },
    /// Train, evaluate and publish a model bundle
    #[command(group(
        ArgGroup::new("source")
            .args(["features_csv", "run_id"])
            .multiple(false)
    ))]
    Train {
        #[arg(long)]
        features_csv: Option<PathBuf>,
        /// Transform run to train on; defaults to the latest
        #[arg(long)]
        run_id: Option<Uuid>,
        /// JSON hyperparameter grid overriding the default
        #[arg(long)]
        grid: Option<PathBuf>,
        #[arg(long, default_value_t = 5)]
        folds: usize,
        #[arg(long, default_value_t = 42)]
        seed: u64,
        #[arg(long, default_value = "reports/model_report.md")]
        report: PathBuf,
        #[arg(long, default_value = "reports/roc_curve.csv")]
        roc_out: PathBuf,
        #[command(flatten)]
        artifacts: ArtifactPaths,
    },
    /// Score one feature record from a JSON file
    Predict {
        #[arg(long)]
        input: PathBuf,
        #[command(flatten)]
        artifacts: ArtifactPaths,
    },
    /// Run the HTTP inference service
    Serve {
        #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:8000")]
        addr: SocketAddr,
        #[command(flatten)]
        artifacts: ArtifactPaths,
    },
}

async fn connect() -> anyhow::Result<PgPool> {
    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set to a production Postgres instance")?;

    PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")
}

fn create_parent(path: &Path) -> anyhow::Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    Ok(())
}

fn read_responses(path: &Path) -> anyhow::Result<Vec<SurveyResponse>> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    ingest::read_responses_csv(file).with_context(|| format!("failed to parse {}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("turnover_risk=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::InitDb => {
            db::init_db(&connect().await?).await?;
            println!("Schema ready.");
        }
        Commands::Sample {
            out,
            active,
            exits,
            seed,
        } => {
            let responses = sample::generate(&sample::SampleConfig {
                active,
                exits,
                seed,
            })?;
            create_parent(&out)?;
            let file = File::create(&out).with_context(|| format!("failed to create {}", out.display()))?;
            ingest::write_responses_csv(BufWriter::new(file), &responses)?;
            println!(
                "Generated {} sample records ({active} active, {exits} exits) in {}.",
                responses.len(),
                out.display()
            );
        }
        Commands::Seed {
            active,
            exits,
            seed,
        } => {
            let responses = sample::generate(&sample::SampleConfig {
                active,
                exits,
                seed,
            })?;
            let (responses, _warnings) = ingest::screen(&responses)?;
            let written = db::insert_responses(&connect().await?, &responses).await?;
            println!("Seeded {written} synthetic responses.");
        }
        Commands::Import { csv } => {
            let responses = read_responses(&csv)?;
            let (responses, warnings) = ingest::screen(&responses)
                .with_context(|| format!("rejected {}", csv.display()))?;
            let written = db::insert_responses(&connect().await?, &responses).await?;
            println!(
                "Imported {written} responses from {} ({} flagged suspicious).",
                csv.display(),
                warnings.len()
            );
        }
        Commands::Transform { csv, out } => {
            let (table, run_id) = match csv {
                Some(path) => {
                    let responses = read_responses(&path)?;
                    let (responses, _warnings) = ingest::screen(&responses)
                        .with_context(|| format!("rejected {}", path.display()))?;
                    (features::derive_features(&responses), None)
                }
                None => {
                    let pool = connect().await?;
                    let responses = db::fetch_responses(&pool).await?;
                    if responses.is_empty() {
                        anyhow::bail!("no raw responses stored; run `import` or `seed` first");
                    }
                    let (responses, _warnings) = ingest::screen(&responses)
                        .context("stored raw responses failed validation")?;
                    let table = features::derive_features(&responses);
                    let run_id = db::save_features(&pool, &table).await?;
                    (table, Some(run_id))
                }
            };

            std::fs::create_dir_all(&out)
                .with_context(|| format!("failed to create {}", out.display()))?;
            let path = out.join(format!(
                "processed_features_{}.csv",
                chrono::Local::now().format("%Y%m%d_%H%M%S")
            ));
            table.write_csv(BufWriter::new(File::create(&path)?))?;
            info!(rows = table.len(), columns = table.columns().len(), "feature table derived");
            match run_id {
                Some(id) => println!("Stored run {id}; exported {}.", path.display()),
                None => println!("Exported {}.", path.display()),
            }
        }
        Commands::Train {
            features_csv,
            run_id,
            grid,
            folds,
            seed,
            report,
            roc_out,
            artifacts,
        } => {
            let table: FeatureTable = match features_csv {
                Some(path) => {
                    let file = File::open(&path)
                        .with_context(|| format!("failed to open {}", path.display()))?;
                    FeatureTable::read_csv(file)
                        .with_context(|| format!("failed to parse {}", path.display()))?
                }
                None => db::fetch_features(&connect().await?, run_id).await?,
            };
            let grid = match grid {
                Some(path) => train::ParamGrid::from_json_file(&path)
                    .with_context(|| format!("failed to load grid {}", path.display()))?,
                None => train::ParamGrid::default(),
            };
            let config = train::TrainConfig {
                seed,
                folds,
                grid,
                ..train::TrainConfig::default()
            };

            let outcome = tokio::task::spawn_blocking(move || train::train(&table, &config))
                .await
                .context("training task panicked")??;

            outcome
                .bundle
                .save(&artifacts)
                .context("failed to publish model artifacts")?;

            create_parent(&report)?;
            std::fs::write(&report, report::build_report(&outcome))?;
            create_parent(&roc_out)?;
            metrics::write_roc_csv(
                BufWriter::new(File::create(&roc_out)?),
                &outcome.evaluation.roc_curve,
            )?;

            println!("Model bundle {} published.", outcome.bundle.bundle_id);
            println!(
                "CV F1 {:.3}; held-out accuracy {:.3}, ROC-AUC {}",
                outcome.search.best.mean_f1,
                outcome.evaluation.accuracy,
                outcome
                    .evaluation
                    .roc_auc
                    .map_or_else(|| "n/a".to_string(), |auc| format!("{auc:.3}"))
            );
            println!("Report written to {}.", report.display());
        }
        Commands::Predict { input, artifacts } => {
            let raw = std::fs::read(&input)
                .with_context(|| format!("failed to read {}", input.display()))?;
            let features: FeatureVector = serde_json::from_slice(&raw)
                .with_context(|| format!("invalid feature record in {}", input.display()))?;
            let service = InferenceService::load(&artifacts);
            let result = service.predict(&features)?;
            info!(%result, "scored record");
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Serve { addr, artifacts } => {
            server::serve(InferenceService::load(&artifacts), addr).await?;
        }
    }

    Ok(())
}
