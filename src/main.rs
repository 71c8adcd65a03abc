use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::TimeDelta;
use clap::Parser;
use color_eyre::eyre::{Result, WrapErr, eyre};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use imagepipe::domain::entities::{
    ContentMode, FetchOptions, ImageId, ImageRequest, LoadSource, LoadedImage, LoadingSources,
};
use imagepipe::domain::ports::{
    FetchDelegate, LogRecord, PipelineLogger, PreviewDecision, ProgressiveQuery, Severity,
};
use imagepipe::domain::FetchError;
use imagepipe::infrastructure::{
    CliArgs, Command, ConfigStorage, GlobalConfiguration, ImagePipeline, PipelineConfig,
    PlaceholderSchemeCache,
};

fn init_logging(config: &PipelineConfig, global: &Arc<GlobalConfiguration>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_string()));

    if let Some(log_path) = config.effective_log_path() {
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        let file_layer = fmt::layer()
            .with_writer(file)
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(false);

        tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .with(global.logging_layer())
            .init();

        info!(path = %log_path.display(), "Logging initialized");
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(global.logging_layer())
            .init();
    }

    Ok(())
}

/// Surfaces pipeline warnings on stderr.
struct StderrLogger;

impl PipelineLogger for StderrLogger {
    fn can_log(&self, severity: Severity) -> bool {
        severity <= Severity::Warning
    }

    fn log(&self, record: &LogRecord) {
        eprintln!("{:?}: {}", record.severity, record.message);
    }
}

type Outcome = (String, Result<Arc<LoadedImage>, FetchError>);

/// Prints callbacks for one URL.
struct ConsoleDelegate {
    label: String,
    progressive: bool,
    done: mpsc::UnboundedSender<Outcome>,
}

#[async_trait]
impl FetchDelegate for ConsoleDelegate {
    async fn will_attempt_source(&self, _request: &ImageRequest, source: LoadSource) {
        println!("{}: trying {source}", self.label);
    }

    async fn did_load_preview(
        &self,
        _request: &ImageRequest,
        preview: Arc<LoadedImage>,
    ) -> PreviewDecision {
        println!(
            "{}: preview {} from {}",
            self.label,
            preview.image.dimensions(),
            preview.source
        );
        PreviewDecision::Continue
    }

    async fn should_load_progressively(
        &self,
        _request: &ImageRequest,
        query: &ProgressiveQuery,
    ) -> bool {
        println!(
            "{}: progressive {} {} available",
            self.label, query.image_type, query.dimensions
        );
        self.progressive
    }

    async fn did_update_progressive(
        &self,
        _request: &ImageRequest,
        _partial: Arc<LoadedImage>,
        progress: f32,
    ) {
        println!("{}: partial image at {:.0}%", self.label, progress * 100.0);
    }

    async fn did_load_first_animated_frame(
        &self,
        _request: &ImageRequest,
        frame: Arc<LoadedImage>,
        _progress: f32,
    ) {
        println!("{}: first frame {}", self.label, frame.image.dimensions());
    }

    async fn did_update_progress(&self, _request: &ImageRequest, progress: f32) {
        println!("{}: {:.0}%", self.label, progress * 100.0);
    }

    async fn did_load_final(&self, _request: &ImageRequest, result: Arc<LoadedImage>) {
        let _ = self.done.send((self.label.clone(), Ok(result)));
    }

    async fn did_fail(&self, _request: &ImageRequest, error: FetchError) {
        let _ = self.done.send((self.label.clone(), Err(error)));
    }
}

struct FetchArgs {
    urls: Vec<String>,
    target: Option<(u32, u32)>,
    mode: ContentMode,
    options: FetchOptions,
    time_to_live: Option<TimeDelta>,
    sources: LoadingSources,
    progressive: bool,
    output: Option<PathBuf>,
}

async fn run_fetch(pipeline: &ImagePipeline, args: FetchArgs) -> Result<()> {
    if let Some(dir) = &args.output {
        std::fs::create_dir_all(dir).wrap_err("Failed to create output directory")?;
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut delegates = Vec::with_capacity(args.urls.len());
    for url in &args.urls {
        let mut request = ImageRequest::new(url.clone())
            .with_content_mode(args.mode)
            .with_options(args.options)
            .with_sources(args.sources);
        if let Some(time_to_live) = args.time_to_live {
            request = request.with_time_to_live(time_to_live);
        }
        if let Some((width, height)) = args.target {
            request = request.with_target(width, height);
        }
        let delegate = Arc::new(ConsoleDelegate {
            label: url.clone(),
            progressive: args.progressive,
            done: tx.clone(),
        });
        pipeline.fetch(request, &delegate)?;
        delegates.push(delegate);
    }
    drop(tx);

    let mut failures = 0;
    for _ in 0..delegates.len() {
        let Some((label, outcome)) = rx.recv().await else {
            break;
        };
        match outcome {
            Ok(result) => {
                println!(
                    "{label}: {} from {} ({} bytes)",
                    result.image.dimensions(),
                    result.source,
                    result.byte_size
                );
                if let Some(dir) = &args.output {
                    let path = save_png(dir, result).await?;
                    println!("{label}: saved {}", path.display());
                }
            }
            Err(error) => {
                failures += 1;
                eprintln!("{label}: {error}");
            }
        }
    }

    if failures > 0 {
        return Err(eyre!("{failures} of {} fetches failed", delegates.len()));
    }
    Ok(())
}

async fn save_png(dir: &Path, result: Arc<LoadedImage>) -> Result<PathBuf> {
    let path = dir.join(format!("{}.png", result.id.storage_key()));
    let target = path.clone();
    tokio::task::spawn_blocking(move || {
        result
            .image
            .image()
            .save_with_format(&target, image::ImageFormat::Png)
    })
    .await?
    .wrap_err("Failed to write image")?;
    Ok(path)
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = CliArgs::parse();
    let storage = ConfigStorage::new()?;
    let mut config = storage.load_config(args.config.as_deref())?;
    config.merge_with_args(&args);

    let global = Arc::new(GlobalConfiguration::from_config(&config));
    init_logging(&config, &global)?;
    let logger: Arc<dyn PipelineLogger> = Arc::new(StderrLogger);
    global.set_logger(Some(logger));
    global.add_additional_cache(Arc::new(PlaceholderSchemeCache));

    info!(version = imagepipe::VERSION, "Starting imagepipe");
    let pipeline = ImagePipeline::with_defaults(global, &config).await?;

    match args.command {
        Command::Fetch {
            urls,
            width,
            height,
            mode,
            placeholder,
            progressive,
            no_reset_expiry,
            ttl_hours,
            offline,
            output,
        } => {
            let mut options = FetchOptions::empty();
            options.set(FetchOptions::PLACEHOLDER, placeholder);
            options.set(FetchOptions::DO_NOT_RESET_EXPIRY, no_reset_expiry);
            let args = FetchArgs {
                urls,
                target: width.zip(height),
                mode,
                options,
                time_to_live: ttl_hours.map(|hours| TimeDelta::hours(i64::from(hours))),
                sources: if offline {
                    LoadingSources::all() - LoadingSources::NETWORK
                } else {
                    LoadingSources::all()
                },
                progressive,
                output,
            };
            let outcome = run_fetch(&pipeline, args).await;
            if let Err(e) = pipeline.flush().await {
                warn!(error = %e, "Failed to write cache recency");
            }
            outcome?;
        }
        Command::Stats => println!("{}", pipeline.stats()),
        Command::Clear { urls } => {
            if urls.is_empty() {
                pipeline.clear_disk_cache().await?;
                println!("Disk cache cleared");
            } else {
                for url in &urls {
                    pipeline.clear_image(&ImageId::from_url(url)).await;
                }
                println!("Removed {} images", urls.len());
            }
        }
    }

    Ok(())
}
