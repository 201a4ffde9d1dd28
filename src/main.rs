//! Raitha Voice - duplex voice assistant session for Linux
//!
//! This is the main entry point. It stands in for the UI layer: it starts one
//! session, shows whether the assistant is active, and stops on Ctrl-C or
//! when the remote side ends the conversation.

mod audio;
mod cli;
mod codec;
mod config;
mod error;
mod models;
mod remote;
mod scheduler;
mod session;
mod settings;
#[cfg(test)]
mod testing;

use anyhow::{bail, Context, Result};
use audio::{Microphone, PipeWireMicrophone, PipeWireOutput, WavMicrophone};
use clap::Parser;
use config::{LiveConfig, SessionConfig, DEFAULT_MODEL, DEFAULT_PREOPEN_QUEUE_FRAMES};
use log::{debug, error, info};
use models::SessionState;
use remote::GeminiLive;
use session::VoiceSession;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments and initialize logging
    let args = cli::Args::parse();
    cli::init_logging(&args);

    info!("Starting Raitha voice assistant");

    let config = build_config(&args);
    debug!("Session config: {:?}", config);
    if args.save {
        save_settings(&args);
    }

    let microphone: Arc<dyn Microphone> = match &args.input {
        Some(path) => Arc::new(WavMicrophone::new(path)),
        None => Arc::new(PipeWireMicrophone::new()),
    };
    let session = VoiceSession::new(
        config,
        microphone,
        Arc::new(PipeWireOutput::new()),
        Arc::new(GeminiLive::new()),
    );

    if let Err(e) = session.start().await {
        error!("{}", e.user_message());
        return Err(e).context("Failed to start voice session");
    }
    println!("Listening... press Ctrl-C to stop");

    let mut states = session.subscribe();
    let mut status = tokio::time::interval(Duration::from_secs(1));
    let ended = loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl-C")?;
                info!("Stopping on Ctrl-C");
                break None;
            }
            state = wait_for_end(&mut states) => break Some(state),
            _ = status.tick() => log_status(&session),
        }
    };

    let lasted = session.activation().map(|a| a.elapsed_seconds());
    session.stop().await;
    if let Some(seconds) = lasted {
        info!("Session lasted {:.1}s", seconds);
    }

    match ended {
        Some(SessionState::Error(reason)) => {
            error!("voice assistant unavailable");
            bail!("Voice session ended with an error: {}", reason)
        }
        Some(_) => println!("Voice assistant stopped"),
        None => {}
    }
    Ok(())
}

/// Command-line flags win over saved settings, which win over defaults
fn build_config(args: &cli::Args) -> SessionConfig {
    let live = LiveConfig {
        api_key: args.api_key.clone(),
        model: args
            .model
            .clone()
            .or_else(settings::get_model)
            .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        voice: args.voice.clone().or_else(settings::get_voice),
        instruction: args.instruction.clone(),
        ..Default::default()
    };
    let preopen_frames = args
        .preopen_frames
        .or_else(settings::get_preopen_queue_frames)
        .unwrap_or(DEFAULT_PREOPEN_QUEUE_FRAMES);

    SessionConfig::default()
        .with_live(live)
        .with_preopen_queue_frames(preopen_frames)
}

fn save_settings(args: &cli::Args) {
    if let Some(model) = &args.model {
        settings::set_model(model);
    }
    if let Some(voice) = &args.voice {
        settings::set_voice(voice);
    }
    if let Some(frames) = args.preopen_frames {
        settings::set_preopen_queue_frames(frames);
    }
    info!("Saved settings");
}

/// Resolve with the first terminal state
async fn wait_for_end(states: &mut watch::Receiver<SessionState>) -> SessionState {
    loop {
        {
            let state = states.borrow_and_update();
            if state.is_terminal() {
                return state.clone();
            }
        }
        if states.changed().await.is_err() {
            return SessionState::Closed;
        }
    }
}

fn log_status(session: &VoiceSession) {
    let levels = session.levels();
    debug!(
        "state={:?} active={} mic={:.2} peak={:.2} playing={} queued={}",
        session.state(),
        session.is_active(),
        levels.volume,
        levels.peak,
        session.live_sources(),
        session.queued_frames()
    );
}
