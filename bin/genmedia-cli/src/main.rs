//! genmedia-cli – generate or resize media through the artifact cache.
//!
//! Startup order:
//! 1. Parse arguments and layer them over the environment configuration.
//! 2. Initialise tracing on stderr (stdout carries the JSON result).
//! 3. Wire the orchestrator and run one request per source.
//! 4. Print the result document; exit 1 if anything failed.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use genmedia_core::{Config, FsArtifactStore, Orchestrator};
use genmedia_types::{ErrorRecord, GenerationRequest, shape};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "genmedia-cli", version, about = "Cached image/video generation and resizing")]
struct Cli {
    /// Provider API key (overrides GEMINI_API_KEY).
    #[arg(long, global = true)]
    api_key: Option<String>,

    /// Provider API base URL (overrides GOOGLE_API_DOMAIN).
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// Directory holding cached artifacts.
    #[arg(long, global = true)]
    store_root: Option<PathBuf>,

    /// Directory relative source paths resolve against.
    #[arg(long, global = true)]
    media_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Animate each source image into a short video.
    Video(VideoArgs),
    /// Edit or combine one or two source images.
    Image(ImageArgs),
    /// Resize a source image locally.
    Resize(ResizeArgs),
}

#[derive(Debug, Args)]
struct VideoArgs {
    /// Source image; repeat for several independent videos.
    #[arg(long = "image-path", required = true)]
    image_paths: Vec<String>,

    #[arg(long)]
    prompt: String,

    #[arg(long, default_value = "16:9")]
    aspect_ratio: String,

    /// Ask for a video without an audio track.
    #[arg(long)]
    silent_video: bool,
}

#[derive(Debug, Args)]
struct ImageArgs {
    #[arg(long = "image-1")]
    image_1: String,

    #[arg(long = "image-2")]
    image_2: Option<String>,

    #[arg(long)]
    prompt: String,

    #[arg(long, default_value = "16:9")]
    aspect_ratio: String,
}

#[derive(Debug, Args)]
struct ResizeArgs {
    #[arg(long = "image-path")]
    image_path: String,

    #[arg(long)]
    width: Option<u32>,

    #[arg(long)]
    height: Option<u32>,

    /// `jpeg` or `png`; defaults to the source format.
    #[arg(long)]
    format: Option<String>,

    /// JPEG quality, 1-100.
    #[arg(long)]
    quality: Option<u32>,

    /// `contain` or `exact`.
    #[arg(long)]
    fit: Option<String>,
}

impl Command {
    /// One `(label, request)` pair per independent job.
    fn requests(&self) -> Vec<(String, GenerationRequest)> {
        match self {
            Command::Video(args) => args
                .image_paths
                .iter()
                .map(|path| {
                    let mut request = GenerationRequest::video(path.as_str(), args.prompt.as_str())
                        .with_shape(shape::ASPECT_RATIO, args.aspect_ratio.as_str());
                    if args.silent_video {
                        request = request.with_shape(shape::SILENT, true);
                    }
                    (path.clone(), request.authorized(true))
                })
                .collect(),
            Command::Image(args) => {
                let mut request = GenerationRequest::image(args.image_1.as_str(), args.prompt.as_str())
                    .with_shape(shape::ASPECT_RATIO, args.aspect_ratio.as_str());
                if let Some(second) = &args.image_2 {
                    request = request.with_source(second.as_str());
                }
                vec![(args.image_1.clone(), request.authorized(true))]
            }
            Command::Resize(args) => {
                let mut request = GenerationRequest::resize(args.image_path.as_str());
                if let Some(width) = args.width {
                    request = request.with_shape(shape::WIDTH, width);
                }
                if let Some(height) = args.height {
                    request = request.with_shape(shape::HEIGHT, height);
                }
                if let Some(format) = &args.format {
                    request = request.with_shape(shape::FORMAT, format.as_str());
                }
                if let Some(quality) = args.quality {
                    request = request.with_shape(shape::QUALITY, quality);
                }
                if let Some(fit) = &args.fit {
                    request = request.with_shape(shape::FIT, fit.as_str());
                }
                vec![(args.image_path.clone(), request.authorized(true))]
            }
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SourceResult {
    source_path: String,
    success: bool,
    cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorRecord>,
}

#[derive(Debug, Serialize)]
struct Summary {
    success: bool,
    total: usize,
    succeeded: usize,
    failed: usize,
    results: Vec<SourceResult>,
    errors: Vec<ErrorRecord>,
}

fn configure(cli: &Cli) -> Config {
    let mut cfg = Config::from_env();
    if let Some(api_key) = &cli.api_key {
        cfg.api_key = Some(api_key.clone());
    }
    if let Some(base_url) = &cli.base_url {
        cfg.base_url = base_url.trim_end_matches('/').to_owned();
    }
    if let Some(store_root) = &cli.store_root {
        if std::env::var_os("GENMEDIA_LOCK_DIR").is_none() {
            cfg.lock_dir = store_root.join(".locks");
        }
        cfg.store_root = store_root.clone();
    }
    if let Some(media_root) = &cli.media_root {
        cfg.media_root = media_root.clone();
    }
    cfg
}

fn init_tracing(cfg: &Config) {
    let env_filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => match cfg.log_level.parse::<tracing_subscriber::EnvFilter>() {
            Ok(f) => f,
            Err(e) => {
                eprintln!(
                    "WARN: GENMEDIA_LOG='{}' is not a valid tracing filter ({}); \
                     falling back to 'info'",
                    cfg.log_level, e
                );
                tracing_subscriber::EnvFilter::new("info")
            }
        },
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    if cfg.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // ── 1. Configuration ───────────────────────────────────────────────────────
    let cli = Cli::parse();
    let cfg = configure(&cli);

    // ── 2. Tracing ─────────────────────────────────────────────────────────────
    init_tracing(&cfg);
    info!(version = env!("CARGO_PKG_VERSION"), "genmedia-cli starting");

    // ── 3. Orchestrator ────────────────────────────────────────────────────────
    let orchestrator = Orchestrator::from_config(&cfg)?;
    let store = FsArtifactStore::new(&cfg.store_root);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    warn!("interrupt received, cancelling");
                    cancel.cancel();
                }
                Err(e) => warn!(error = %e, "failed to install CTRL+C signal handler"),
            }
        });
    }

    // ── 4. Requests ────────────────────────────────────────────────────────────
    let mut results = Vec::new();
    for (source_path, request) in cli.command.requests() {
        let result = match orchestrator.handle(&request, &cancel).await {
            Ok(delivered) => SourceResult {
                source_path,
                success: true,
                cached: delivered.cached,
                path: Some(store.path_for(&delivered.key, delivered.artifact.extension())),
                mime_type: Some(delivered.artifact.mime_type),
                key: Some(delivered.key.to_string()),
                error: None,
            },
            Err(e) => {
                warn!(source = %source_path, kind = %e.kind(), error = %e, "request failed");
                SourceResult {
                    source_path,
                    success: false,
                    cached: false,
                    path: None,
                    mime_type: None,
                    key: None,
                    error: Some(e.record()),
                }
            }
        };
        results.push(result);
        if cancel.is_cancelled() {
            break;
        }
    }

    // ── 5. Report ──────────────────────────────────────────────────────────────
    let success = results.iter().all(|r| r.success);
    let rendered = if results.len() == 1 {
        serde_json::to_string_pretty(&results[0])?
    } else {
        let succeeded = results.iter().filter(|r| r.success).count();
        let errors = results.iter().filter_map(|r| r.error.clone()).collect();
        serde_json::to_string_pretty(&Summary {
            success,
            total: results.len(),
            succeeded,
            failed: results.len() - succeeded,
            results,
            errors,
        })?
    };
    println!("{rendered}");

    Ok(if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use genmedia_types::{MediaKind, ShapeValue};

    #[test]
    fn video_makes_one_request_per_image_path() {
        let cli = Cli::parse_from([
            "genmedia-cli",
            "video",
            "--image-path",
            "a.jpg",
            "--image-path",
            "b.jpg",
            "--prompt",
            "make it summer",
            "--silent-video",
        ]);
        let requests = cli.command.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].0, "b.jpg");
        let request = &requests[0].1;
        assert_eq!(request.kind, MediaKind::Video);
        assert!(request.shape_bool(shape::SILENT));
        assert_eq!(request.shape_text(shape::ASPECT_RATIO).as_deref(), Some("16:9"));
        assert!(request.validate().is_ok());
    }

    #[test]
    fn image_combines_both_sources() {
        let cli = Cli::parse_from([
            "genmedia-cli",
            "image",
            "--image-1",
            "a.png",
            "--image-2",
            "b.png",
            "--prompt",
            "put them together",
            "--aspect-ratio",
            "1:1",
        ]);
        let requests = cli.command.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].1.sources.len(), 2);
    }

    #[test]
    fn resize_carries_shape_and_global_flags() {
        let cli = Cli::parse_from([
            "genmedia-cli",
            "resize",
            "--image-path",
            "a.png",
            "--width",
            "320",
            "--format",
            "png",
            "--store-root",
            "/tmp/genmedia-test-store",
        ]);
        let cfg = configure(&cli);
        assert_eq!(cfg.store_root, PathBuf::from("/tmp/genmedia-test-store"));

        let requests = cli.command.requests();
        let request = &requests[0].1;
        assert_eq!(request.kind, MediaKind::Resize);
        assert_eq!(request.shape_value(shape::WIDTH), Some(&ShapeValue::Int(320)));
        assert!(request.shape_value(shape::HEIGHT).is_none());
    }
}
