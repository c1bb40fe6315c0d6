use anyhow::Context;
use clap::Parser;
use drumlift_server::{AppState, ServerConfig, create_router};
use drumlift_core::{
    ArtifactStore, OverflowPolicy, PipelineConfig, PipelineOrchestrator, ProgressChannels,
    TaskRegistry, sweep::run_sweeper,
};
use std::{net::SocketAddr, path::PathBuf, time::Duration};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "drumlift-server", about = "Drum extraction and transcription service")]
struct Cli {
    #[arg(long, env = "DRUMLIFT_HOST", default_value = "0.0.0.0")]
    host: String,

    #[arg(long, env = "DRUMLIFT_PORT", default_value_t = 8000)]
    port: u16,

    /// Root directory for uploads, outputs and per-task scratch space.
    #[arg(long, env = "DRUMLIFT_DATA_DIR", default_value = "/tmp/drumlift")]
    data_dir: PathBuf,

    /// Comma-separated list of allowed CORS origins; "*" allows any.
    #[arg(
        long,
        env = "DRUMLIFT_CORS_ORIGINS",
        value_delimiter = ',',
        default_value = "http://localhost:3000,http://localhost:5173"
    )]
    cors_origins: Vec<String>,

    #[arg(long, env = "DRUMLIFT_MAX_UPLOAD_MB", default_value_t = 100)]
    max_upload_mb: usize,

    /// Maximum pipelines running at once.
    #[arg(long, env = "DRUMLIFT_MAX_CONCURRENT", default_value_t = 2)]
    max_concurrent: usize,

    /// What to do with a start past the ceiling: "queue" or "reject".
    #[arg(long, env = "DRUMLIFT_OVERFLOW", default_value = "queue")]
    overflow: String,

    #[arg(long, env = "DRUMLIFT_RETENTION", value_parser = humantime::parse_duration, default_value = "1h")]
    retention: Duration,

    #[arg(long, env = "DRUMLIFT_SWEEP_INTERVAL", value_parser = humantime::parse_duration, default_value = "5m")]
    sweep_interval: Duration,

    #[arg(long, env = "DRUMLIFT_SEPARATION_TIMEOUT", value_parser = humantime::parse_duration, default_value = "10m")]
    separation_timeout: Duration,

    #[arg(long, env = "DRUMLIFT_TRANSCRIPTION_TIMEOUT", value_parser = humantime::parse_duration, default_value = "5m")]
    transcription_timeout: Duration,

    #[arg(long, env = "DRUMLIFT_VALIDATION_TIMEOUT", value_parser = humantime::parse_duration, default_value = "30s")]
    validation_timeout: Duration,

    /// How long a cancelled pipeline gets to acknowledge before it is
    /// force-marked cancelled.
    #[arg(long, env = "DRUMLIFT_CANCEL_GRACE", value_parser = humantime::parse_duration, default_value = "3s")]
    cancel_grace: Duration,

    /// Source-separation command line; input and scratch dir are appended.
    #[arg(long, env = "DRUMLIFT_SEPARATOR_CMD", default_value = "demucs --two-stems=drums")]
    separator_cmd: String,

    /// Audio-to-MIDI command line; input and scratch dir are appended.
    #[arg(long, env = "DRUMLIFT_TRANSCRIBER_CMD", default_value = "basic-pitch")]
    transcriber_cmd: String,
}

impl Cli {
    fn pipeline_config(&self) -> anyhow::Result<PipelineConfig> {
        let overflow = match self.overflow.as_str() {
            "queue" => OverflowPolicy::Queue,
            "reject" => OverflowPolicy::Reject,
            other => anyhow::bail!("unknown overflow policy {other:?}, expected queue or reject"),
        };
        Ok(PipelineConfig {
            max_concurrent: self.max_concurrent,
            overflow,
            separation_timeout: self.separation_timeout,
            transcription_timeout: self.transcription_timeout,
            validation_timeout: self.validation_timeout,
            cancel_grace: self.cancel_grace,
            retention: self.retention,
            sweep_interval: self.sweep_interval,
            separator_cmd: split_cmd(&self.separator_cmd)?,
            transcriber_cmd: split_cmd(&self.transcriber_cmd)?,
        })
    }

    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.host.clone(),
            port: self.port,
            data_dir: self.data_dir.clone(),
            cors_allowed_origins: self.cors_origins.clone(),
            max_upload_bytes: self.max_upload_mb * 1024 * 1024,
            ..ServerConfig::default()
        }
    }
}

fn split_cmd(raw: &str) -> anyhow::Result<Vec<String>> {
    let argv: Vec<String> = raw.split_whitespace().map(str::to_string).collect();
    if argv.is_empty() {
        anyhow::bail!("model command must not be empty");
    }
    Ok(argv)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| {
                    EnvFilter::new("drumlift_core=info,drumlift_server=info,tower_http=warn")
                }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let pipeline = cli.pipeline_config()?;
    let server_config = cli.server_config();

    let store = ArtifactStore::open(&server_config.data_dir)
        .await
        .with_context(|| format!("opening artifact store at {:?}", server_config.data_dir))?;
    let registry = TaskRegistry::new();
    let channels = ProgressChannels::new();
    let orchestrator = PipelineOrchestrator::new(
        registry.clone(),
        store.clone(),
        channels.clone(),
        pipeline.clone(),
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(run_sweeper(
        registry.clone(),
        store.clone(),
        channels.clone(),
        pipeline.retention,
        pipeline.sweep_interval,
        shutdown.clone(),
    ));

    let addr: SocketAddr = format!("{}:{}", server_config.host, server_config.port)
        .parse()
        .context("invalid bind address")?;
    let state = AppState::new(registry, store, channels, orchestrator, server_config);
    let app = create_router(state);

    let listener = TcpListener::bind(addr).await.context("binding listener")?;
    info!("drumlift-server listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await
        .context("server error")?;

    Ok(())
}

async fn shutdown_signal(sweeper: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {e}");
        return;
    }
    info!("shutdown signal received");
    sweeper.cancel();
}
