use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ipcam_core::config::Config;
use ipcam_core::control::{ControlPlane, NoSignaling};
use ipcam_core::detect::DetectorKind;
use ipcam_core::hw::session::MpiSystem;
use ipcam_core::hw::sim::SimCore;
use ipcam_core::hw::VideoCore;
use ipcam_core::pipeline::manager::{PipelineManager, PipelineMode};
use ipcam_core::web;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Path to the TOML configuration file.
    #[arg(long, short)]
    config: Option<String>,

    /// Override the UDP command port.
    #[arg(long)]
    udp_port: Option<u16>,

    /// Override the HTTP control port.
    #[arg(long)]
    http_port: Option<u16>,

    /// Override the initial pipeline mode ("parallel" or "serial").
    #[arg(long)]
    mode: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = CliArgs::parse();
    let mut config = match &args.config {
        Some(path) => Config::load(path).with_context(|| format!("loading {}", path))?,
        None => Config::default(),
    };
    if let Some(port) = args.udp_port {
        config.control.udp_port = port;
    }
    if let Some(port) = args.http_port {
        config.control.http_port = port;
    }
    if let Some(mode) = &args.mode {
        config.pipeline.initial_mode = PipelineMode::parse(mode)
            .with_context(|| format!("unknown mode: {}", mode))?;
    }

    // The software media core stands in for the vendor SDK; the rest of
    // the system only ever sees the VideoCore surface.
    let core: Arc<dyn VideoCore> = Arc::new(SimCore::new(config.video.fps));
    let _mpi = MpiSystem::new(Arc::clone(&core)).context("media core init")?;

    let default_model = config.detect.default_model.clone();
    let initial_mode = config.pipeline.initial_mode;
    let udp_port = config.control.udp_port;
    let http_port = config.control.http_port;

    let manager = Arc::new(PipelineManager::new(Arc::clone(&core), config));
    manager.start().await.context("initial pipeline start")?;

    if initial_mode == PipelineMode::Serial {
        if let Some(model) = default_model.and_then(|m| DetectorKind::parse(&m)) {
            if let Err(e) = manager.switch_detector(Some(model)).await {
                warn!(error = %e, "default detector load failed, continuing without");
            }
        }
    }

    let control = ControlPlane::bind(udp_port, Arc::clone(&manager), Arc::new(NoSignaling))
        .await
        .context("control listener")?;
    let control_task = tokio::spawn(control.run());

    let web_manager = Arc::clone(&manager);
    let web_task = tokio::spawn(async move {
        if let Err(e) = web::serve(http_port, web_manager).await {
            warn!(error = %e, "http control surface failed");
        }
    });

    info!("camera core running; ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("signal handler")?;
    info!("shutting down");

    control_task.abort();
    web_task.abort();
    manager.record_stop().await.ok();
    manager.stop().await;

    Ok(())
}
