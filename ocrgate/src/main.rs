use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ocrgate::config::ConfigLayer;
use ocrgate::ocr::{ImageInput, OcrOptions, OcrOrchestrator, OutputFormat};

#[derive(Parser)]
#[command(name = "ocrgate")]
#[command(about = "Extract text from images through local or hosted OCR backends")]
struct Args {
    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Probe every registered backend and print the descriptors
    Providers,

    /// Run OCR over one or more image files
    Recognize {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Backend to try first ("auto" uses the priority order)
        #[arg(long)]
        provider: Option<String>,

        /// Language tag, e.g. "eng" or "eng+jpn"
        #[arg(long)]
        language: Option<String>,

        /// Drop detections scored below this value (0-100)
        #[arg(long)]
        min_confidence: Option<f32>,

        /// Include per-detection results in the output
        #[arg(long)]
        structured: bool,

        /// Per-attempt timeout
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Upscale and clean small images before recognition
        #[arg(long)]
        enhance: bool,

        /// Fail instead of trying other backends
        #[arg(long)]
        no_fallback: bool,
    },
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "ocrgate=info".into());
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    dotenvy::dotenv().ok();
    init_tracing(args.log_json);

    let orchestrator = OcrOrchestrator::from_env(ConfigLayer::default());

    let outcome = run(&orchestrator, args.command).await;
    orchestrator.cleanup().await;
    outcome
}

async fn run(orchestrator: &OcrOrchestrator, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Providers => {
            let descriptors = orchestrator.list_providers().await;
            println!("{}", serde_json::to_string_pretty(&descriptors)?);
        }
        Command::Recognize {
            files,
            provider,
            language,
            min_confidence,
            structured,
            timeout_ms,
            enhance,
            no_fallback,
        } => {
            let mut images = Vec::with_capacity(files.len());
            for path in &files {
                let bytes = tokio::fs::read(path)
                    .await
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                images.push(
                    ImageInput::from_bytes(bytes)
                        .with_metadata("path", serde_json::json!(path.display().to_string())),
                );
            }

            let options = OcrOptions {
                provider,
                allow_fallback: no_fallback.then_some(false),
                language,
                min_confidence,
                output: structured.then_some(OutputFormat::Structured),
                timeout: timeout_ms.map(Duration::from_millis),
                enhance_resolution: enhance.then_some(true),
            };

            tracing::info!(files = files.len(), "Running OCR...");
            let result = orchestrator.perform_ocr(&images, &options).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }
    Ok(())
}
