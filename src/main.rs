//! unispeech - drive a speech session controller from the terminal.
//!
//! Requests permission, listens via the microphone and shows the live
//! transcript. Press Enter to finish; the final transcript is printed to
//! stdout or piped into the command given after `--`.

use std::{
    io::{stderr, stdin, BufRead, Write},
    path::PathBuf,
    process::{Command, Stdio},
    sync::Arc,
    thread,
    time::Duration,
};

use anyhow::{bail, Context, Result};
use clap::Parser;
use crossbeam_channel::{select, unbounded, Receiver};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use unispeech::{
    controller::LEGACY_COMPLETION_DESCRIPTION,
    speech::MockBackend,
    BridgeConfig, ChannelRelay, CompletionPolicy, RecognitionEvent, RelayedMessage,
    SessionController, SpeechBackend, SpeechError,
};

const AUTHORIZATION_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[command(name = "unispeech", version, about = "Voice-to-text through the native speech bridge")]
struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Target object name for relayed messages
    #[arg(short, long)]
    target: Option<String>,

    /// Recognizer locale, e.g. ja-JP
    #[arg(short, long)]
    locale: Option<String>,

    /// Replay a demo phrase instead of using the microphone
    #[arg(long)]
    demo: bool,

    /// Report clean completion as OnError("nil")
    #[arg(long)]
    legacy_completion: bool,

    /// Command that receives the transcript on stdin
    #[arg(last = true)]
    command: Vec<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(stderr)
        .init();

    let cli = Cli::parse();

    let mut config = BridgeConfig::load(cli.config.as_deref())?;
    if let Some(target) = cli.target.clone() {
        config.target_object = target;
    }
    if cli.locale.is_some() {
        config.locale = cli.locale.clone();
    }
    if cli.legacy_completion {
        config.completion = CompletionPolicy::LegacyError;
    }
    let completion = config.completion;

    let (relay, messages) = ChannelRelay::new();
    let relay = Arc::new(relay);
    let controller = if cli.demo {
        SessionController::spawn(config, relay, |_| {
            Ok(Box::new(MockBackend::demo()) as Box<dyn SpeechBackend>)
        })
    } else {
        SessionController::with_platform_backend(config, relay)
    }
    .context("Failed to start speech recognition")?;

    controller.request_authorization()?;
    wait_for_authorization(&messages)?;

    controller.start()?;
    info!("recording started");

    let transcription = run_session(&controller, &messages, completion)?;
    drop(controller);

    // Finish the live line
    eprintln!();

    if transcription.is_empty() {
        return Ok(());
    }

    if let Some((program, args)) = cli.command.split_first() {
        // Execute the command with transcription as stdin
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to run {program}"))?;

        if let Some(mut child_stdin) = child.stdin.take() {
            child_stdin.write_all(transcription.as_bytes())?;
        }

        let status = child.wait()?;
        std::process::exit(status.code().unwrap_or(1));
    }

    println!("{}", transcription);
    Ok(())
}

fn wait_for_authorization(messages: &Receiver<RelayedMessage>) -> Result<()> {
    loop {
        let message = messages
            .recv_timeout(AUTHORIZATION_TIMEOUT)
            .context("Timed out waiting for speech recognition permission")?;

        match message.event() {
            Some(RecognitionEvent::Authorized) => return Ok(()),
            Some(RecognitionEvent::Unauthorized) => bail!(
                "Speech recognition permission denied. Please grant microphone and speech recognition access."
            ),
            other => debug!(?other, "message before authorization"),
        }
    }
}

fn spawn_enter_listener() -> Receiver<()> {
    let (tx, rx) = unbounded();
    thread::spawn(move || {
        let mut line = String::new();
        while stdin().lock().read_line(&mut line).unwrap_or(0) > 0 {
            if tx.send(()).is_err() {
                break;
            }
            line.clear();
        }
    });
    rx
}

fn show_live(text: &str) -> Result<()> {
    let mut err = stderr();
    write!(err, "\r\x1b[2K● {}", text)?;
    err.flush()?;
    Ok(())
}

/// Relays events to the terminal until the session completes.
fn run_session(
    controller: &SessionController,
    messages: &Receiver<RelayedMessage>,
    completion: CompletionPolicy,
) -> Result<String> {
    let enter = spawn_enter_listener();
    let mut transcription = String::new();

    show_live("Speak now... (Enter to finish)")?;

    loop {
        select! {
            recv(messages) -> message => {
                let message = message.context("speech controller stopped unexpectedly")?;
                match message.event() {
                    Some(RecognitionEvent::Recognized { text }) => {
                        show_live(&text)?;
                        transcription = text;
                    }
                    Some(RecognitionEvent::Completed) => return Ok(transcription),
                    Some(RecognitionEvent::Error { description })
                        if completion == CompletionPolicy::LegacyError
                            && description == LEGACY_COMPLETION_DESCRIPTION =>
                    {
                        return Ok(transcription);
                    }
                    Some(RecognitionEvent::Error { description }) => {
                        bail!("Speech recognition error: {}", description)
                    }
                    Some(RecognitionEvent::Unavailable) => {
                        info!("speech recognizer became unavailable");
                    }
                    other => debug!(?other, "ignored message"),
                }
            }
            recv(enter) -> _ => {
                match controller.stop() {
                    Ok(()) => info!("recording stopped"),
                    Err(SpeechError::NotRunning) => debug!("already stopping"),
                    Err(err) => return Err(err.into()),
                }
            }
        }
    }
}
