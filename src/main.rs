use std::{fs, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use burn::{
    backend::{ndarray::NdArrayDevice, wgpu::WgpuDevice, Autodiff, NdArray, Wgpu},
    config::Config,
    optim::AdaGradConfig,
    tensor::backend::AutodiffBackend,
};
use clap::{Parser, ValueEnum};
use colored::Colorize;
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use acquire::{download_and_load_datasets, DatasetArchive};
use embedding::{EmbeddingConfig, EmbeddingRegistry, DEFAULT_EMBEDDING};
use model::ModelConfig;
use report::{accuracy_lines, comparison_table, render_heatmap, ConfusionMatrix, LABELS};
use sweep::{run_sweep, SweepEntry};
use training::{ClassifierRunner, ExperimentConfig, ExperimentResult};

pub mod acquire;
pub mod data;
pub mod embedding;
pub mod error;
pub mod model;
pub mod module;
pub mod report;
pub mod sweep;
pub mod training;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendKind {
    Wgpu,
    Ndarray,
}

/// Sentiment classification of IMDB reviews on top of a text embedding.
///
/// Trains a baseline classifier, then compares pretrained and random
/// embeddings, frozen and trainable.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Where the review archive and downloaded word vectors are cached
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    /// Where config.json, baseline.json and sweep.json are written
    #[arg(long, default_value = "artifact")]
    artifact_dir: PathBuf,

    /// Download the archive again even if it is cached
    #[arg(long)]
    force_download: bool,

    /// Embedding identifier: a path, a file:// or http(s):// URL
    #[arg(long, default_value = DEFAULT_EMBEDDING)]
    embedding: String,

    /// Experiment config in JSON; defaults are used when absent
    #[arg(long)]
    config: Option<PathBuf>,

    /// Seed for the order of the loaded tables. Unseeded when absent
    #[arg(long)]
    shuffle_seed: Option<u64>,

    /// Log filter, e.g. `info` or `imdb_sentiment=debug`
    #[arg(long, default_value = "info")]
    log_level: String,

    #[arg(long, value_enum, default_value_t = BackendKind::Wgpu)]
    backend: BackendKind,

    /// Only train and report the baseline
    #[arg(long)]
    skip_sweep: bool,
}

#[derive(Serialize)]
struct BaselineArtifact<'a> {
    embedding: &'a str,

    #[serde(flatten)]
    result: ExperimentResult,

    confusion: Vec<Vec<u64>>,
}

fn write_json<T: Serialize>(path: PathBuf, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    fs::write(&path, json).with_context(|| format!("failed to write {}", path.display()))
}

fn run<B: AutodiffBackend>(cli: &Cli, device: B::Device) -> Result<()> {
    let config = match &cli.config {
        Some(path) => ExperimentConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => ExperimentConfig::new(ModelConfig::new(), AdaGradConfig::new(), EmbeddingConfig::new()),
    };

    fs::create_dir_all(&cli.artifact_dir)
        .with_context(|| format!("failed to create {}", cli.artifact_dir.display()))?;
    config
        .save(cli.artifact_dir.join("config.json"))
        .context("failed to save config")?;

    let (train, test) = download_and_load_datasets(
        &DatasetArchive::imdb(),
        &cli.data_dir,
        cli.force_download,
        cli.shuffle_seed,
    )
    .context("failed to prepare the review tables")?;

    let registry = EmbeddingRegistry::new(cli.data_dir.join("embeddings"), config.embedding.clone());
    let mut runner = ClassifierRunner::<B> {
        config: &config,
        registry: &registry,
        train: Arc::new(train),
        test: Arc::new(test),
        device,
    };

    let trained = runner
        .train_and_evaluate(&cli.embedding, false)
        .context("baseline experiment failed")?;
    let result = trained.result();

    println!("{}", accuracy_lines(&result));

    let confusion = ConfusionMatrix::from_labels(&trained.train.targets, &trained.train.predictions);
    println!("\n{}", "Confusion matrix on training data".bold());
    println!("{}", render_heatmap(&confusion.normalized(), &LABELS));

    write_json(
        cli.artifact_dir.join("baseline.json"),
        &BaselineArtifact {
            embedding: &cli.embedding,
            result,
            confusion: confusion.rows(),
        },
    )?;

    if cli.skip_sweep {
        return Ok(());
    }

    let entries = SweepEntry::matrix(&cli.embedding)?;
    let results = run_sweep(&mut runner, &entries).context("sweep failed")?;

    println!("{}", "Embedding comparison".bold());
    println!("{}", comparison_table(&results));

    write_json(cli.artifact_dir.join("sweep.json"), &results)?;
    info!(artifact_dir = %cli.artifact_dir.display(), "artifacts written");

    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cli.log_level))
        .with_target(false)
        .init();

    match cli.backend {
        BackendKind::Wgpu => run::<Autodiff<Wgpu<f32, i32>>>(&cli, WgpuDevice::default()),
        BackendKind::Ndarray => run::<Autodiff<NdArray<f32>>>(&cli, NdArrayDevice::Cpu),
    }
}
