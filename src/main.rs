// SPDX-License-Identifier: GPL-3.0-only

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use wscam::config::{CameraFacing, ContentScale, FpsRange, Resolution};

mod cli;

#[derive(Parser)]
#[command(name = "wscam")]
#[command(about = "Stream camera frames to local network clients over WebSocket")]
#[command(version = env!("GIT_VERSION"))]
struct Cli {
    /// Settings directory (default: platform config dir)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the broadcast server and stream until interrupted
    Serve {
        /// Port to listen on (saved to settings)
        #[arg(short, long)]
        port: Option<u16>,

        /// Listen on all interfaces (saved to settings)
        #[arg(long)]
        all_interfaces: Option<bool>,

        /// Replay an image file instead of the test pattern
        #[arg(short, long)]
        image: Option<PathBuf>,
    },

    /// Show or change persisted settings
    Settings {
        #[command(subcommand)]
        command: SettingsCommand,
    },

    /// Connect to a server and report received frames
    Receive {
        /// Server URL
        #[arg(default_value = "ws://127.0.0.1:8080")]
        url: String,

        /// Stop after this many frames
        #[arg(short, long)]
        count: Option<u64>,

        /// Save each received frame into this directory
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum SettingsCommand {
    /// Print both settings records
    Show,

    /// Change server settings
    Server {
        #[arg(short, long)]
        port: Option<u16>,

        #[arg(long)]
        all_interfaces: Option<bool>,
    },

    /// Change camera settings
    Camera {
        /// Capture resolution, e.g. 1280x720
        #[arg(short, long)]
        resolution: Option<Resolution>,

        /// Front camera fps range, e.g. 15-30 or 30
        #[arg(long)]
        fps_front: Option<FpsRange>,

        /// Back camera fps range
        #[arg(long)]
        fps_back: Option<FpsRange>,

        /// JPEG quality (1-100)
        #[arg(short, long)]
        quality: Option<u8>,

        #[arg(short, long)]
        facing: Option<FacingArg>,

        /// Rotate frames to match the sensor orientation
        #[arg(long)]
        rotate: Option<bool>,

        #[arg(long)]
        scale: Option<ScaleArg>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum FacingArg {
    Front,
    Back,
}

impl From<FacingArg> for CameraFacing {
    fn from(arg: FacingArg) -> Self {
        match arg {
            FacingArg::Front => CameraFacing::Front,
            FacingArg::Back => CameraFacing::Back,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ScaleArg {
    Crop,
    Fit,
}

impl From<ScaleArg> for ContentScale {
    fn from(arg: ScaleArg) -> Self {
        match arg {
            ScaleArg::Crop => ContentScale::Crop,
            ScaleArg::Fit => ContentScale::Fit,
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // RUST_LOG overrides, e.g. RUST_LOG=wscam=debug
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn,wscam=info")),
        )
        .with_target(true)
        .with_level(true)
        .init();

    let cli = Cli::parse();
    let dir = cli.config_dir;

    match cli.command {
        Commands::Serve {
            port,
            all_interfaces,
            image,
        } => cli::serve(dir, port, all_interfaces, image),
        Commands::Settings { command } => match command {
            SettingsCommand::Show => cli::show_settings(dir),
            SettingsCommand::Server {
                port,
                all_interfaces,
            } => cli::update_server_settings(dir, port, all_interfaces),
            SettingsCommand::Camera {
                resolution,
                fps_front,
                fps_back,
                quality,
                facing,
                rotate,
                scale,
            } => cli::update_camera_settings(
                dir,
                cli::CameraChanges {
                    resolution,
                    fps_front,
                    fps_back,
                    quality,
                    facing: facing.map(Into::into),
                    rotate,
                    scale: scale.map(Into::into),
                },
            ),
        },
        Commands::Receive { url, count, output } => cli::receive(&url, count, output),
    }
}
