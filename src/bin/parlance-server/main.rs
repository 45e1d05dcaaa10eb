use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use clap::{Args, Parser, Subcommand};
use tokio::net::TcpListener;
use tower_http::trace::{DefaultMakeSpan, DefaultOnFailure, DefaultOnResponse, TraceLayer};
use tracing::{Level, error, info};

mod metrics;
mod rest;
mod ws;

use parlance::providers::{HttpTranscriber, Transcriber};
use parlance::{SessionManager, Settings};

#[derive(Parser, Debug)]
#[command(name = "parlance-server")]
#[command(about = "Streaming speech-recognition gateway")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the gateway.
    Serve(ServeArgs),
    /// Verify connectivity to the configured transcription provider.
    Check,
    /// Print the effective configuration (credentials masked).
    Config,
    /// Write a commented environment template.
    Init(InitArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Host interface to bind to (overrides PARLANCE_HOST).
    #[arg(long)]
    host: Option<String>,

    /// TCP port to listen on (overrides PARLANCE_PORT).
    #[arg(long)]
    port: Option<u16>,

    /// Maximum request body size (bytes).
    #[arg(long = "max-bytes", default_value_t = 100 * 1024 * 1024)]
    max_bytes: usize,
}

#[derive(Args, Debug)]
struct InitArgs {
    /// Where to write the template.
    #[arg(long, default_value = ".env")]
    path: PathBuf,
}

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SessionManager>,
    pub settings: Arc<Settings>,
}

#[tokio::main]
async fn main() {
    parlance::init_logging();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Check => check().await,
        Command::Config => print_config(),
        Command::Init(args) => init_env(args),
    };

    if let Err(err) = result {
        error!(error = ?err, "parlance-server failed");
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let mut settings = Settings::from_env().context("failed to load configuration")?;
    if let Some(host) = args.host {
        settings.host = host;
    }
    if let Some(port) = args.port {
        settings.port = port;
    }
    settings.validate().map_err(|err| anyhow::anyhow!("{err}"))?;

    if let Err(err) = metrics::init() {
        tracing::warn!(error = ?err, "metrics disabled (init failed)");
    }

    let addr: SocketAddr = format!("{}:{}", settings.host, settings.port)
        .parse()
        .context("invalid host/port bind address")?;

    let settings = Arc::new(settings);
    let manager = Arc::new(SessionManager::new(Arc::clone(&settings)));
    let state = AppState {
        manager: Arc::clone(&manager),
        settings,
    };

    let app = Router::new()
        .route("/", get(rest::root))
        .route("/healthz", get(rest::healthz))
        .route("/metrics", get(metrics::prometheus_metrics))
        .route("/v1/stream", get(ws::stream_json))
        .route("/v1/stream/binary", get(ws::stream_binary))
        .route("/v1/vad/detect", post(rest::vad_detect))
        .route("/v1/transcribe", post(rest::transcribe_file))
        .route("/v1/streaming-stats", get(rest::streaming_stats))
        .with_state(state)
        .layer(DefaultBodyLimit::max(args.max_bytes))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(
                    DefaultMakeSpan::new()
                        .level(Level::INFO)
                        .include_headers(false),
                )
                .on_response(DefaultOnResponse::new().level(Level::INFO))
                .on_failure(DefaultOnFailure::new().level(Level::ERROR)),
        );

    let listener = TcpListener::bind(addr).await.context("bind failed")?;
    info!(%addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(manager))
        .await
        .context("server error")?;

    Ok(())
}

async fn shutdown_signal(manager: Arc<SessionManager>) {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutting down, closing sessions");
    manager.shutdown();
}

async fn check() -> Result<()> {
    let settings = Settings::from_env().context("failed to load configuration")?;
    let api_key = settings
        .asr_api_key
        .clone()
        .context("PARLANCE_ASR_API_KEY is not set")?;

    println!(
        "checking transcription provider at {} (model {})...",
        settings.asr_api_url, settings.asr_model
    );

    let transcriber = HttpTranscriber::new(
        settings.asr_api_url.clone(),
        api_key,
        settings.asr_model.clone(),
        settings.asr_timeout(),
        1,
    )
    .map_err(|err| anyhow::anyhow!("{err}"))?;

    transcriber
        .self_test()
        .await
        .map_err(|err| anyhow::anyhow!("provider self-test failed: {err}"))?;

    println!("ok: provider round-trip succeeded");
    Ok(())
}

fn print_config() -> Result<()> {
    let settings = Settings::from_env().context("failed to load configuration")?;
    let rendered = serde_json::to_string_pretty(&settings.redacted())
        .context("failed to render configuration")?;
    println!("{rendered}");
    Ok(())
}

fn init_env(args: InitArgs) -> Result<()> {
    if args.path.exists() {
        anyhow::bail!("refusing to overwrite existing {}", args.path.display());
    }

    std::fs::write(&args.path, ENV_TEMPLATE)
        .with_context(|| format!("failed to write {}", args.path.display()))?;
    println!("wrote {}", args.path.display());
    Ok(())
}

const ENV_TEMPLATE: &str = "\
# parlance-server configuration
# Every key is optional; defaults shown.

# Listen address
#PARLANCE_HOST=0.0.0.0
#PARLANCE_PORT=8000
#PARLANCE_MAX_SESSIONS=100

# Transcription provider
#PARLANCE_ASR_URL=https://api.openai.com/v1/audio/transcriptions
#PARLANCE_ASR_MODEL=whisper-1
#PARLANCE_ASR_API_KEY=
#PARLANCE_ASR_TIMEOUT_SECS=30
#PARLANCE_ASR_MAX_CONCURRENCY=8

# Corrector provider
#PARLANCE_LLM_URL=https://api.fireworks.ai/inference/v1/chat/completions
#PARLANCE_LLM_MODEL=accounts/fireworks/models/kimi-k2-instruct
#PARLANCE_LLM_API_KEY=

# VAD
#PARLANCE_VAD_THRESHOLD=0.5
#PARLANCE_VAD_SILENCE_DURATION=0.8
#PARLANCE_VAD_HOP_SIZE=256

# Audio / segmentation
#PARLANCE_SAMPLE_RATE=16000
#PARLANCE_CHUNK_DURATION=3.0
#PARLANCE_LOOKBACK_DURATION=9.0
#PARLANCE_PRE_ROLL=0.5
#PARLANCE_MIN_DURATION=0.1
#PARLANCE_MAX_DURATION=300.0

# Sessions
#PARLANCE_IDLE_TIMEOUT_SECS=300

# Advisory capture of per-segment audio + request records
#PARLANCE_CAPTURE_DIR=

# Logging (filter syntax like RUST_LOG)
#PARLANCE_LOG=info
#PARLANCE_LOG_FORMAT=json
";
