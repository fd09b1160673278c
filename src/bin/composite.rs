//! One-shot local runner: composite a product image into a video file
//! without the HTTP server.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use placement_compositor::config::policy::PolicyConfig;
use placement_compositor::models::job::{JobInputs, JobStatus, TrimRange};
use placement_compositor::models::placement::{Platform, ProductCategory};
use placement_compositor::models::requests::JobResult;
use placement_compositor::services::{
    job_manager::JobManager,
    media::FfmpegCodec,
    pipeline::{Pipeline, PipelineDeps},
    retry::RetryConfig,
    storage::{MediaStore, MemoryStore},
    stylist::{HttpStyleClient, LocalStyler, StyleCapability},
    vision::{HeuristicConfig, HeuristicDetector, VisionClient, ZoneDetector},
};

#[derive(Parser, Debug)]
#[command(name = "composite", version)]
struct Cli {
    /// Source video.
    #[arg(long)]
    video: PathBuf,

    /// Product image (PNG, JPEG or WebP).
    #[arg(long)]
    image: PathBuf,

    /// Product category, e.g. `beverage`, `phone`, `poster`.
    #[arg(long)]
    category: ProductCategory,

    /// Target platform for engagement scoring.
    #[arg(long, default_value_t = Platform::Generic)]
    platform: Platform,

    /// Trim the output to start at this many seconds.
    #[arg(long, requires = "trim_end")]
    trim_start: Option<f64>,

    /// Trim the output to end at this many seconds.
    #[arg(long, requires = "trim_start")]
    trim_end: Option<f64>,

    /// Output video path.
    #[arg(long)]
    out: PathBuf,

    /// Write the job result as JSON here.
    #[arg(long)]
    summary: Option<PathBuf>,

    /// JSON file with scoring policy overrides.
    #[arg(long)]
    policy: Option<PathBuf>,

    /// Remote detection service; local heuristics when omitted.
    #[arg(long, env = "VISION_SERVICE_URL")]
    vision_url: Option<String>,

    /// Remote stylization service; local styling when omitted.
    #[arg(long, env = "STYLE_SERVICE_URL")]
    style_url: Option<String>,

    #[arg(long, default_value = "ffmpeg")]
    ffmpeg: PathBuf,

    #[arg(long, default_value = "ffprobe")]
    ffprobe: PathBuf,

    /// Per-stage budget in seconds.
    #[arg(long, default_value_t = 600)]
    stage_timeout: u64,
}

fn load_policy(path: Option<&PathBuf>) -> anyhow::Result<PolicyConfig> {
    use garde::Validate;

    let Some(path) = path else {
        return Ok(PolicyConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read policy '{}'", path.display()))?;
    let policy: PolicyConfig = serde_json::from_str(&raw)
        .with_context(|| format!("parse policy '{}'", path.display()))?;
    policy
        .validate()
        .map_err(|report| anyhow::anyhow!("invalid policy: {}", report))?;
    Ok(policy)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .json()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let policy = load_policy(cli.policy.as_ref())?;

    let store = Arc::new(MemoryStore::new());
    let video = std::fs::read(&cli.video)
        .with_context(|| format!("read video '{}'", cli.video.display()))?;
    let image = std::fs::read(&cli.image)
        .with_context(|| format!("read image '{}'", cli.image.display()))?;
    let source_video = store.insert("source-video", video);
    let product_image = store.insert("product-image", image);

    let detector: Arc<dyn ZoneDetector> = match &cli.vision_url {
        Some(url) => Arc::new(VisionClient::new(url, None)),
        None => Arc::new(HeuristicDetector::new(HeuristicConfig::default())),
    };
    let styler: Arc<dyn StyleCapability> = match &cli.style_url {
        Some(url) => Arc::new(HttpStyleClient::new(url, None)),
        None => Arc::new(LocalStyler),
    };

    let pipeline = Pipeline::new(PipelineDeps {
        store: store.clone(),
        codec: Arc::new(FfmpegCodec::new(&cli.ffmpeg, &cli.ffprobe)),
        detector,
        styler: Some(styler),
        policy,
        retry: RetryConfig::default(),
        stage_timeout: Duration::from_secs(cli.stage_timeout),
        capability_timeout: Duration::from_secs(30),
    });
    let jobs = JobManager::start(pipeline, 1, 1);

    let trim = match (cli.trim_start, cli.trim_end) {
        (Some(start), Some(end)) if end > start => Some(TrimRange { start, end }),
        (Some(start), Some(end)) => {
            anyhow::bail!("--trim-end ({end}) must be after --trim-start ({start})")
        }
        _ => None,
    };

    let id = jobs
        .submit(JobInputs {
            source_video,
            product_image,
            product_category: cli.category,
            platform: cli.platform,
            trim,
        })
        .await?;

    let mut last_message = String::new();
    let job = loop {
        let job = jobs.get_status(id)?;
        if job.stage_message != last_message {
            eprintln!("[{:>3.0}%] {}", job.progress * 100.0, job.stage_message);
            last_message = job.stage_message.clone();
        }
        if job.is_terminal() {
            break job;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    };
    jobs.shutdown().await;

    if job.status != JobStatus::Completed {
        match &job.error {
            Some(error) => anyhow::bail!(
                "job {} during {}: {} ({})",
                job.status,
                error.stage.map(|s| s.to_string()).unwrap_or_default(),
                error.detail,
                error.kind
            ),
            None => anyhow::bail!("job {}", job.status),
        }
    }

    let result: JobResult = jobs.result(id)?;
    let output = store.get(&result.output_video_ref).await?;
    if let Some(parent) = cli.out.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create output dir '{}'", parent.display()))?;
    }
    std::fs::write(&cli.out, output)
        .with_context(|| format!("write video '{}'", cli.out.display()))?;
    eprintln!("wrote {}", cli.out.display());

    let summary = serde_json::to_string_pretty(&result)?;
    match &cli.summary {
        Some(path) => {
            std::fs::write(path, summary)
                .with_context(|| format!("write summary '{}'", path.display()))?;
            eprintln!("wrote {}", path.display());
        }
        None => println!("{}", summary),
    }
    Ok(())
}
