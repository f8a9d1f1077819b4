use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "sdr-pipeline", about = "Spectrum display and audio output core of a software radio receiver")]
pub struct Cli {
    /// Settings file (JSON). Defaults to sdr-pipeline.json in the working directory
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Play into a hand-driven virtual device instead of the sound card
    #[arg(long, global = true)]
    pub dry_run: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List audio output devices
    Devices {
        /// Print the device list as JSON
        #[arg(long)]
        json: bool,
    },

    /// Stream a WAV file to an output device
    Play {
        /// WAV file to play
        input: PathBuf,

        /// Output device id or exact name (see `devices`)
        #[arg(short, long)]
        device: Option<String>,

        /// Output gain
        #[arg(short, long)]
        gain: Option<f32>,

        /// Frames per submitted block
        #[arg(long, default_value_t = 4096)]
        block_frames: usize,
    },

    /// Play a sine tone
    Tone {
        /// Tone frequency in Hz
        #[arg(long, default_value_t = 1000.0)]
        freq: f32,

        /// Duration in seconds
        #[arg(long, default_value_t = 2.0)]
        seconds: f32,

        /// Output device id or exact name (see `devices`)
        #[arg(short, long)]
        device: Option<String>,
    },

    /// Run the spectrum pipeline on a synthetic IQ source
    Spectrum {
        /// Transform size (overrides the settings file)
        #[arg(long)]
        fft_size: Option<usize>,

        /// IQ sample rate in Hz
        #[arg(long, default_value_t = 48_000)]
        rate: u32,

        /// Tone offset from the center frequency in Hz
        #[arg(long, default_value_t = 12_000.0, allow_hyphen_values = true)]
        tone: f32,

        /// Noise amplitude added to every sample
        #[arg(long, default_value_t = 0.01)]
        noise: f32,

        /// Frames to render before exiting
        #[arg(long, default_value_t = 200)]
        frames: usize,

        /// Center frequency of the capture in Hz
        #[arg(long, default_value_t = 100_000_000)]
        center: i64,

        /// Zoom onto a sub-band centered here (Hz)
        #[arg(long, requires = "view_bandwidth")]
        view_center: Option<i64>,

        /// Width of the zoomed sub-band in Hz
        #[arg(long, requires = "view_center")]
        view_bandwidth: Option<i64>,
    },
}
