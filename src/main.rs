//! J.A.R.V.I.S live assistant
//!
//! Streams the microphone and a video source to the Gemini Live API and plays
//! the spoken replies. Type `s` + Enter to switch camera, `q` + Enter (or
//! Ctrl-C) to end the conversation.

#![forbid(unsafe_code)]

use anyhow::{bail, Context};
use jarvis_live::audio::PulseDevices;
use jarvis_live::devices::{AudioDevices, VideoDevices};
use jarvis_live::screen::ScreenCameras;
use jarvis_live::{
    GeminiConnector, LiveConfig, LiveSession, SessionCommand, SessionOutcome, SessionView, Status,
};
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    info!("Starting J.A.R.V.I.S live session");

    let mut config = LiveConfig::from_env().context("Failed to load configuration")?;
    let audio: Arc<dyn AudioDevices> = Arc::new(PulseDevices::new("jarvis-live"));
    let video: Arc<dyn VideoDevices> = Arc::new(ScreenCameras::new());
    let mut lines = spawn_stdin_lines();
    let mut retried = false;

    loop {
        let outcome = run_session(config.clone(), audio.clone(), video.clone(), &mut lines).await;

        if outcome.needs_new_credential() && !retried {
            retried = true;
            if let Some(err) = &outcome.error {
                eprintln!("{}", err);
            }
            print!("Enter a new Gemini API key: ");
            std::io::stdout().flush().context("Failed to flush stdout")?;
            let key = lines.recv().await.unwrap_or_default();
            if key.trim().is_empty() {
                bail!("no API key provided");
            }
            config = config.with_api_key(key);
            continue;
        }

        print_history(&outcome);
        match (outcome.status, outcome.error) {
            (Status::Error, Some(err)) => bail!(err),
            (Status::Error, None) => bail!("session ended with an error"),
            _ => {
                info!("Conversation ended");
                return Ok(());
            }
        }
    }
}

async fn run_session(
    config: LiveConfig,
    audio: Arc<dyn AudioDevices>,
    video: Arc<dyn VideoDevices>,
    lines: &mut mpsc::Receiver<String>,
) -> SessionOutcome {
    let connector = Arc::new(GeminiConnector::new(config.clone()));
    let mut session = LiveSession::new(config, audio, video, connector);
    let view_task = tokio::spawn(log_view(session.view()));

    if let Err(e) = session.start() {
        warn!("Session failed to start: {}", e);
    }

    let (cmd_tx, cmd_rx) = mpsc::channel(8);
    let mut stdin_open = true;

    let outcome = {
        let run = session.run(cmd_rx);
        tokio::pin!(run);

        loop {
            tokio::select! {
                outcome = &mut run => break outcome,
                line = lines.recv(), if stdin_open => {
                    let command = match line.as_deref().map(str::trim) {
                        Some("s") => Some(SessionCommand::SwitchCamera),
                        Some("q") => Some(SessionCommand::Close),
                        Some("") => None,
                        Some(other) => {
                            println!("Unknown command '{}' (s = switch camera, q = end conversation)", other);
                            None
                        }
                        None => {
                            stdin_open = false;
                            None
                        }
                    };
                    if let Some(command) = command {
                        let _ = cmd_tx.send(command).await;
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    let _ = cmd_tx.send(SessionCommand::Close).await;
                }
            }
        }
    };

    drop(session);
    let _ = view_task.await;
    outcome
}

/// Log status changes and print completed turns as they land.
async fn log_view(mut view: watch::Receiver<SessionView>) {
    let mut last_status = None;
    let mut last_error = None;
    let mut shown_turns = 0;

    while view.changed().await.is_ok() {
        let current = view.borrow_and_update().clone();

        if last_status != Some(current.status) {
            info!("Status: {} (camera: {})", current.status, current.facing);
            last_status = Some(current.status);
        }
        if current.error != last_error {
            if let Some(message) = &current.error {
                error!("{}", message);
            }
            last_error = current.error.clone();
        }
        for turn in current.history.iter().skip(shown_turns) {
            println!("You: {}", turn.user.trim());
            println!("J.A.R.V.I.S: {}", turn.ai.trim());
        }
        shown_turns = current.history.len();
    }
}

fn print_history(outcome: &SessionOutcome) {
    if outcome.history.is_empty() {
        return;
    }
    println!("\n--- Transcript ({} turns) ---", outcome.history.len());
    for turn in &outcome.history {
        println!("You: {}", turn.user.trim());
        println!("J.A.R.V.I.S: {}", turn.ai.trim());
    }
}

fn spawn_stdin_lines() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).await.is_err() {
                break;
            }
        }
    });
    rx
}
