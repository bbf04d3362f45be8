// THEORY:
// Command-line runner for the attack. It parses arguments, loads the frozen classifier
// and the dataset, then walks the videos one by one through `AttackPipeline`. The
// optimization itself stays on the calling thread; only the PNG encoding of a finished
// video is fanned out to blocking workers, and every write of a video completes before
// the next video starts.

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, ValueHint};
use futures::future::try_join_all;
use sparse_adv::core_modules::utils::image_helper::{render_video, RenderedFrame};
use sparse_adv::{
    load_targets, AttackConfig, AttackPipeline, ModelKind, PerceptualMetric, PerceptualTerm, RunSummary,
    VideoDataset,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Temporally-sparse adversarial perturbations for video classifiers"
)]
struct Cli {
    /// Dataset root laid out as <class>/<video>/<frame>.png
    #[arg(short, long, value_hint = ValueHint::DirPath)]
    input_dir: PathBuf,

    /// Where adversarial/, noise/ and summary.json are written
    #[arg(short, long, value_hint = ValueHint::DirPath)]
    output_dir: PathBuf,

    /// Classifier to attack: GoogleNet or Inception2
    #[arg(short, long, default_value = "Inception2")]
    model: ModelKind,

    /// JSON weights of the classifier head
    #[arg(short, long, value_hint = ValueHint::FilePath)]
    weights: PathBuf,

    /// Optional list of <class>/<video> lines restricting the run
    #[arg(short, long, value_hint = ValueHint::FilePath)]
    file_list: Option<PathBuf>,

    /// Attack at most this many videos
    #[arg(short, long)]
    num_images: Option<usize>,

    /// Iteration budget per video
    #[arg(long, default_value_t = 100)]
    num_iter: usize,

    /// Checkpoint period; must divide num_iter
    #[arg(long, default_value_t = 100)]
    save_freq: usize,

    /// Adam learning rate for a 0..255 pixel range
    #[arg(long, default_value_t = 0.001 * 255.0)]
    learning_rate: f32,

    /// Target file of `<video> <label>` lines; switches to a targeted attack
    #[arg(short, long, value_hint = ValueHint::FilePath)]
    target: Option<PathBuf>,

    /// Weight of the perceptual term
    #[arg(long, default_value_t = 1.0)]
    weight_loss2: f32,

    /// Resize frames straight to the crop size instead of resize-then-centre-crop
    #[arg(long = "not-crop", action = ArgAction::SetFalse, default_value_t = true)]
    crop: bool,

    /// Perceptual metric: ssim or ms-ssim. Pair ms-ssim with --dissimilarity: the plain
    /// similarity term drives its contrast-structure factors negative and the run diverges
    #[arg(long, default_value = "ssim")]
    metric: PerceptualMetric,

    /// Penalise 1 - SSIM instead of SSIM
    #[arg(long)]
    dissimilarity: bool,

    /// Concurrent PNG writers (defaults to the number of CPUs)
    #[arg(long)]
    jobs: Option<usize>,
}

impl Cli {
    fn attack_config(&self) -> AttackConfig {
        AttackConfig {
            max_iter: self.num_iter,
            save_freq: self.save_freq,
            learning_rate: self.learning_rate,
            weight_loss2: self.weight_loss2,
            metric: self.metric,
            perceptual_term: if self.dissimilarity {
                PerceptualTerm::Dissimilarity
            } else {
                PerceptualTerm::Similarity
            },
            ..AttackConfig::default()
        }
    }
}

/// Encodes rendered frames on blocking workers, at most `permits` at a time.
struct FrameWriter {
    permits: Arc<Semaphore>,
}

impl FrameWriter {
    fn new(workers: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    async fn write_all(&self, frames: Vec<RenderedFrame>) -> Result<usize> {
        let tasks = frames.into_iter().map(|frame| {
            let permits = Arc::clone(&self.permits);
            async move {
                let _permit = permits.acquire_owned().await?;
                let path = frame.path.clone();
                tokio::task::spawn_blocking(move || frame.save())
                    .await?
                    .with_context(|| format!("writing {}", path.display()))?;
                Ok::<_, anyhow::Error>(())
            }
        });
        Ok(try_join_all(tasks).await?.len())
    }
}

fn write_summary(output_dir: &Path, summary: &RunSummary) -> Result<()> {
    let path = output_dir.join("summary.json");
    let file = std::fs::File::create(&path).with_context(|| format!("creating {}", path.display()))?;
    serde_json::to_writer_pretty(std::io::BufWriter::new(file), summary)?;
    info!(path = %path.display(), "wrote run summary");
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let config = cli.attack_config();
    config.validate().context("invalid attack configuration")?;

    let targets = cli
        .target
        .as_deref()
        .map(load_targets)
        .transpose()
        .context("reading target file")?;

    let mut dataset = VideoDataset::open(&cli.input_dir, cli.file_list.as_deref())
        .with_context(|| format!("opening dataset {}", cli.input_dir.display()))?;
    if let Some(limit) = cli.num_images {
        dataset.truncate(limit);
    }

    let classifier = cli
        .model
        .load(&cli.weights, config.seq_len)
        .with_context(|| format!("loading {} weights from {}", cli.model, cli.weights.display()))?;

    let mut pipeline = AttackPipeline::new(classifier, cli.model.data_spec(), config)?.with_crop(cli.crop);
    if let Some(targets) = targets {
        pipeline = pipeline.with_targets(targets);
    }

    std::fs::create_dir_all(&cli.output_dir)
        .with_context(|| format!("creating {}", cli.output_dir.display()))?;
    let writer = FrameWriter::new(cli.jobs.unwrap_or_else(num_cpus::get));

    let mut summary = RunSummary::default();
    for sample in dataset.samples() {
        let attempt = tokio::task::block_in_place(|| pipeline.attack_and_record(&dataset, sample, &mut summary))
            .with_context(|| format!("attacking {}", sample.name))?;
        let Some(result) = attempt else {
            continue;
        };
        let frames = render_video(&result, pipeline.data_spec(), pipeline.indicator(), &cli.output_dir)?;
        let written = writer.write_all(frames).await?;
        info!(
            video = %sample.name,
            termination = ?result.outcome.termination,
            clean_label = result.outcome.initial_prediction.label,
            final_label = result.outcome.final_prediction.label,
            written,
            "video done"
        );
    }

    info!(
        videos = summary.total_videos,
        attacked = summary.attacked,
        skipped = summary.skipped,
        failed = summary.failed.len(),
        correct_clean = summary.correct_clean,
        correct_adversarial = summary.correct_adversarial,
        "run finished"
    );
    write_summary(&cli.output_dir, &summary)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    run(Cli::parse()).await
}
