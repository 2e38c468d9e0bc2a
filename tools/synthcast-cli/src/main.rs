//! Synthcast CLI: record a synthetic session, burn in overlays, transcode uploads.
//!
//! Usage:
//!   synthcast record [OPTIONS]           Record the synthetic surface and synth
//!   synthcast compose <INPUT> <OVERLAY>  Recompose a recording with an overlay
//!   synthcast transcode <INPUT>          Server-side transcode to web MP4
//!   synthcast check                      Check recorder and ffmpeg availability

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use synthcast_common::config::AppConfig;

mod commands;

#[derive(Parser)]
#[command(
    name = "synthcast",
    about = "Capture generative audio-visual sessions as shareable clips",
    version,
    author
)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record the synthetic surface together with the synth output
    Record {
        /// Output file; the extension is replaced by the negotiated container's
        #[arg(short, long, default_value = "recording")]
        output: PathBuf,

        /// Recording length in seconds (Ctrl+C stops early)
        #[arg(short, long, default_value = "5.0")]
        duration: f64,

        /// Surface width
        #[arg(long, default_value = "1280")]
        width: u32,

        /// Surface height
        #[arg(long, default_value = "720")]
        height: u32,

        /// Target FPS (defaults to the configured value)
        #[arg(long)]
        fps: Option<u32>,

        /// Overlay image burned in after recording
        #[arg(long)]
        overlay: Option<PathBuf>,
    },

    /// Recompose an existing recording with an overlay
    Compose {
        /// Recorded container (webm or mp4)
        input: PathBuf,

        /// Overlay image (png or jpeg)
        overlay: PathBuf,

        /// Output file
        #[arg(short, long, default_value = "composed.mp4")]
        output: PathBuf,
    },

    /// Transcode an upload the way the share service does
    Transcode {
        /// Uploaded container
        input: PathBuf,

        /// Overlay path relative to the public directory, e.g. /frames/a.png
        #[arg(long)]
        overlay: Option<String>,

        /// Public directory overlays are resolved against
        #[arg(long)]
        public_dir: Option<PathBuf>,

        /// Output file
        #[arg(short, long, default_value = "transcoded.mp4")]
        output: PathBuf,
    },

    /// Check recorder formats and ffmpeg availability
    Check {
        /// Write the effective configuration to the config file
        #[arg(long)]
        write_config: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load();

    let mut logging = config.logging.clone();
    if cli.verbose {
        logging.level = "debug".to_string();
    }
    logging.json |= cli.json_logs;
    synthcast_common::logging::init_logging(&logging);
    config.validate()?;

    match cli.command {
        Commands::Record {
            output,
            duration,
            width,
            height,
            fps,
            overlay,
        } => {
            commands::record::run(&config, output, duration, width, height, fps, overlay).await
        }
        Commands::Compose {
            input,
            overlay,
            output,
        } => commands::compose::run(&config, input, overlay, output).await,
        Commands::Transcode {
            input,
            overlay,
            public_dir,
            output,
        } => commands::transcode::run(&config, input, overlay, public_dir, output).await,
        Commands::Check { write_config } => commands::check::run(&config, write_config),
    }
}
