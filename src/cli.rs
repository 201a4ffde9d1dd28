//! Command-line interface for Raitha Voice
//!
//! Handles argument parsing and logging configuration.

use clap::Parser;
use log::LevelFilter;
use std::path::PathBuf;

/// Raitha Voice - talk to a live voice assistant from the terminal
#[derive(Parser, Debug)]
#[command(name = "raitha-voice")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Increase logging verbosity
    /// -v = info, -vv = debug, -vvv = trace, -vvvv = all deps
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long)]
    pub quiet: bool,

    /// Live model (overrides the saved setting)
    #[arg(long)]
    pub model: Option<String>,

    /// Prebuilt voice name (overrides the saved setting)
    #[arg(long)]
    pub voice: Option<String>,

    /// System instruction sent when the session opens
    #[arg(long)]
    pub instruction: Option<String>,

    /// Stream a WAV file instead of the microphone
    #[arg(long, value_name = "WAV")]
    pub input: Option<PathBuf>,

    /// Frames kept while connecting; 0 drops speech until the session opens
    #[arg(long)]
    pub preopen_frames: Option<usize>,

    /// API key for the live endpoint
    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true)]
    pub api_key: String,

    /// Save --model, --voice and --preopen-frames as the new defaults
    #[arg(long)]
    pub save: bool,
}

impl Args {
    /// Get the log level filter based on verbosity flags
    pub fn log_level(&self) -> LevelFilter {
        if self.quiet {
            LevelFilter::Error
        } else {
            match self.verbose {
                0 => LevelFilter::Warn,
                1 => LevelFilter::Info,
                2 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }
}

/// Initialize the logging system based on CLI arguments
pub fn init_logging(args: &Args) {
    let mut builder = env_logger::Builder::new();

    // Base level for all modules - keep at warn to suppress noisy deps
    builder.filter_level(LevelFilter::Warn);

    builder.filter_module("raitha_voice", args.log_level());

    // WebSocket and PipeWire internals only at -vvvv
    if args.verbose >= 4 {
        builder.filter_module("tungstenite", args.log_level());
        builder.filter_module("tokio_tungstenite", args.log_level());
        builder.filter_module("pipewire", args.log_level());
    }

    builder.format_timestamp_millis().init();
}
