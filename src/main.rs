//! CLI entry point for scope-acq
//!
//! Provides command-line interface for:
//! - Running an acquisition session over a list of tile directories
//! - Probing the stage position and camera field of view
//! - Serving the mock microscope server for bench testing
//!
//! # Usage
//!
//! ```bash
//! scope-acq --config config/scope.toml run --modality bf_10x \
//!     --target /data/projects/slide_1/bf_10x_1/region_1 \
//!     --target /data/projects/slide_1/bf_10x_1/region_2
//! scope-acq stage
//! scope-acq serve-mock --port 5000
//! ```

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use scope_acq::device::MockMicroscopeServer;
use scope_acq::{
    logging, AcquisitionOrchestrator, AcquisitionTarget, ConnectionConfig, DeviceConnection,
    ScopeConfig,
};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "scope-acq")]
#[command(about = "Microscope acquisition client", long_about = None)]
struct Cli {
    /// Configuration file (defaults to config/scope.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Acquire every target in order, then wait for stitching
    Run {
        /// Tile directory of one target; the folder name is the target name
        #[arg(long = "target", required = true)]
        targets: Vec<PathBuf>,

        /// Modality whose hardware profile applies to all targets
        #[arg(long)]
        modality: String,
    },

    /// Print stage position and field of view
    Stage,

    /// Run the mock microscope server
    ServeMock {
        /// Listening port
        #[arg(long, default_value = "5000")]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ScopeConfig::load_from(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => ScopeConfig::load().context("Failed to load configuration")?,
    };
    config.validate()?;
    logging::init_from_config(&config)?;

    match cli.command {
        Commands::Run { targets, modality } => run_session(&config, targets, modality).await,
        Commands::Stage => stage(&config).await,
        Commands::ServeMock { port } => serve_mock(port).await,
    }
}

async fn run_session(config: &ScopeConfig, dirs: Vec<PathBuf>, modality: String) -> Result<()> {
    let targets = dirs
        .into_iter()
        .map(|dir| {
            let name = dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .with_context(|| format!("Cannot name target from {}", dir.display()))?;
            Ok(AcquisitionTarget::new(name, dir, modality.as_str()))
        })
        .collect::<Result<Vec<_>>>()?;

    let connection = DeviceConnection::new(ConnectionConfig::from(&config.server));
    let orchestrator = AcquisitionOrchestrator::from_config(connection.clone(), config);

    let handle = orchestrator.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted: cancelling current acquisition and stopping");
            handle.cancel_current();
            handle.stop();
        }
    });

    let mut progress = orchestrator.progress().subscribe();
    tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let p = *progress.borrow();
            if let Some(fraction) = p.fraction() {
                info!("Progress: {}/{} files ({:.0}%)", p.current, p.total, fraction * 100.0);
            }
        }
    });

    let result = orchestrator.run(targets).await;
    connection.close().await;
    let result = result?;

    println!("{}", result.summary());
    for target in &result.targets {
        println!("  {:<24} {}", target.target, target.status);
    }
    for stitch in &result.stitches {
        match &stitch.result {
            Ok(files) => println!("  stitched {:<15} {} file(s)", stitch.target, files.len()),
            Err(e) => println!("  stitched {:<15} FAILED: {}", stitch.target, e),
        }
    }

    if !result.is_success() {
        bail!("Session finished with failures: {}", result.summary());
    }
    Ok(())
}

async fn stage(config: &ScopeConfig) -> Result<()> {
    let connection = DeviceConnection::new(ConnectionConfig::from(&config.server));
    connection.connect().await?;

    let (x, y) = connection.get_stage_xy().await?;
    let z = connection.get_stage_z().await?;
    let r = connection.get_rotation().await?;
    let (fov_w, fov_h) = connection.get_field_of_view().await?;
    println!("Stage XY:       ({x:.2}, {y:.2}) um");
    println!("Stage Z:        {z:.2} um");
    println!("Rotation:       {r:.2} ticks");
    println!("Field of view:  {fov_w:.1} x {fov_h:.1} um");

    connection.close().await;
    Ok(())
}

async fn serve_mock(port: u16) -> Result<()> {
    let server = MockMicroscopeServer::start_on(&format!("127.0.0.1:{port}")).await?;
    println!("Mock microscope server listening on {}", server.addr());
    println!("Press Ctrl+C to stop");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => server.stop(),
        () = server.wait_for_shutdown() => info!("Shutdown command received"),
    }
    Ok(())
}
