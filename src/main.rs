use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use sentient_space::agent::simulator::SimulatedModel;
use sentient_space::agent::tools::ToolRegistry;
use sentient_space::analysis::Mode;
use sentient_space::events::{EventSink, MemoryLog, TracingSink};
use sentient_space::media::{AudioInput, FileMediaProvider};
use sentient_space::models::VisionModel;
use sentient_space::monitor::Monitor;
use sentient_space::server;
use sentient_space::settings::{GlobalConfigDefaults, ProviderKind, SessionSettings, resolve_provider};

#[derive(Debug, Parser)]
#[command(name = "sentient_space")]
#[command(about = "Camera and microphone safety monitor backed by a vision model", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP control surface.
    Serve {
        #[arg(long, default_value = "127.0.0.1:7171")]
        listen: String,
        #[command(flatten)]
        source: SourceArgs,
    },
    /// Run one session in the foreground until Ctrl-C.
    Watch {
        #[arg(long, value_enum, default_value_t = Mode::Health)]
        mode: Mode,
        #[command(flatten)]
        source: SourceArgs,
    },
}

#[derive(Debug, Args)]
struct SourceArgs {
    /// JSON file with provider, model and sampling defaults.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Image file standing in for the camera; re-read on every tick.
    #[arg(long, default_value = "frame.jpg")]
    frame: PathBuf,
    /// Raw s16le mono 16 kHz stream standing in for the microphone.
    #[arg(long)]
    audio_pcm: Option<PathBuf>,
    #[arg(long, value_enum)]
    provider: Option<ProviderKind>,
    /// Expose Prometheus metrics on this address.
    #[arg(long)]
    metrics_listen: Option<SocketAddr>,
}

struct Wiring {
    defaults: GlobalConfigDefaults,
    model: Arc<dyn VisionModel>,
    simulator: Option<Arc<SimulatedModel>>,
    media: Arc<FileMediaProvider>,
}

fn wire(source: SourceArgs) -> anyhow::Result<Wiring> {
    if let Some(addr) = source.metrics_listen {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("failed to install prometheus exporter")?;
        info!(%addr, "metrics exporter listening");
    }

    let defaults = match &source.config {
        Some(path) => GlobalConfigDefaults::load(path)?,
        None => GlobalConfigDefaults::default(),
    };
    let provider = resolve_provider(&defaults, source.provider, |var| std::env::var(var).ok())?;
    let (model, simulator): (Arc<dyn VisionModel>, _) = match provider.network_model() {
        Some(model) => {
            if provider.api_key.is_none() {
                warn!(provider = ?provider.kind, "no api key configured; requests will likely be rejected");
            }
            (model, None)
        }
        None => {
            let sim = Arc::new(SimulatedModel::new());
            let model: Arc<dyn VisionModel> = sim.clone();
            (model, Some(sim))
        }
    };
    info!(provider = ?provider.kind, model = %provider.model, base_url = %provider.base_url, "model provider resolved");

    let audio = source.audio_pcm.map(AudioInput::Pcm).unwrap_or(AudioInput::Silence);
    Ok(Wiring {
        defaults,
        model,
        simulator,
        media: Arc::new(FileMediaProvider { frame_path: source.frame, audio }),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { listen, source } => {
            let addr: SocketAddr = listen.parse()?;
            let wiring = wire(source)?;
            let log = Arc::new(MemoryLog::new());
            let sink: Arc<dyn EventSink> = log.clone();
            let monitor = Monitor::new(
                wiring.model,
                wiring.media,
                sink,
                Arc::new(ToolRegistry::with_default_tools()),
                wiring.defaults,
            );
            let state = server::AppState {
                monitor: Arc::new(Mutex::new(monitor)),
                log,
                simulator: wiring.simulator,
            };
            server::serve(addr, state).await?;
        }
        Commands::Watch { mode, source } => {
            let wiring = wire(source)?;
            let mut monitor = Monitor::new(
                wiring.model,
                wiring.media,
                Arc::new(TracingSink),
                Arc::new(ToolRegistry::with_default_tools()),
                wiring.defaults,
            );
            monitor
                .start(SessionSettings { mode, ..Default::default() })
                .await?;

            let ctrl_c = tokio::signal::ctrl_c();
            tokio::pin!(ctrl_c);
            let mut check = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = &mut ctrl_c => break,
                    _ = check.tick() => {
                        if !monitor.is_running() {
                            break;
                        }
                    }
                }
            }
            monitor.stop().await?;
        }
    }
    Ok(())
}
