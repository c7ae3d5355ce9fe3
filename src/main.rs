use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

use parley::voice::{
    AudioFrame, CapturePipeline, CpalInput, CpalOutput, FRAME_SIZE, PlaybackScheduler, SAMPLE_RATE,
    SampleRate,
};
use parley::{Config, GeminiLiveTransport, Language, SessionEvent, VoiceSession};

/// parley - talk to a remote AI tutor in real time
#[derive(Parser)]
#[command(name = "parley", version, about)]
struct Cli {
    /// Language the assistant replies in (pt, en, es)
    #[arg(short, long, env = "PARLEY_LANGUAGE")]
    language: Option<String>,

    /// Model identifier
    #[arg(short, long)]
    model: Option<String>,

    /// System instruction, replacing the default tutor prompt
    #[arg(long)]
    instruction: Option<String>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Hold a live voice conversation (default)
    Talk,
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
        /// Save the captured audio as a 16 kHz WAV file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Test speaker output
    TestSpeaker,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "warn,parley=info",
        1 => "info,parley=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Some(Command::TestMic { duration, output }) => test_mic(duration, output).await,
        Some(Command::TestSpeaker) => test_speaker().await,
        Some(Command::Talk) | None => {
            let config = load_config(cli.language.as_deref(), cli.model, cli.instruction)?;
            talk(config).await
        }
    }
}

/// Load configuration and apply command-line overrides
fn load_config(
    language: Option<&str>,
    model: Option<String>,
    instruction: Option<String>,
) -> anyhow::Result<Config> {
    let mut config = Config::load()?;

    if let Some(language) = language {
        let language: Language = language.parse()?;
        if language != config.live.language {
            config.live.language = language;
            config.live.system_instruction = parley::config::default_system_instruction(language);
        }
    }
    if let Some(model) = model {
        config.live.model = model;
    }
    if let Some(instruction) = instruction {
        config.live.system_instruction = instruction;
    }

    tracing::debug!(?config, "loaded configuration");
    Ok(config)
}

/// Run a live session until Ctrl-C or the remote side closes
async fn talk(config: Config) -> anyhow::Result<()> {
    let api_key = config
        .live
        .api_key
        .clone()
        .context("no API key: set GEMINI_API_KEY or api_keys.gemini in config.toml")?;

    let transport = Arc::new(GeminiLiveTransport::new(api_key));
    let output = CpalOutput::open()?;
    let mut session = VoiceSession::new(
        config.live,
        &config.audio,
        transport,
        Box::new(CpalInput::new()),
        Box::new(output),
    );

    let printer = tokio::spawn(print_events(session.subscribe()));

    println!("Connecting...");
    session.start().await?;
    println!("Listening - speak now, Ctrl-C to stop\n");

    let stop_requested = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break true,
            active = session.process_next() => {
                if !active {
                    break false;
                }
            }
        }
    };

    if stop_requested {
        tracing::info!("shutdown requested");
        session.stop();
    }

    drop(session);
    match printer.await {
        Ok(Some(reason)) => anyhow::bail!("session ended with an error: {reason}"),
        Ok(None) => Ok(()),
        Err(e) => Err(e).context("event printer failed"),
    }
}

/// Print transcript lines until the session goes away
///
/// Returns the reason if the session ended with an error.
async fn print_events(mut events: broadcast::Receiver<SessionEvent>) -> Option<String> {
    let mut failure = None;
    loop {
        match events.recv().await {
            Ok(SessionEvent::Transcript(entry)) => println!("{}: {}", entry.role, entry.text),
            Ok(SessionEvent::Interrupted) => println!("[interrupted]"),
            Ok(SessionEvent::Error(reason)) => {
                eprintln!("session error: {reason}");
                failure = Some(reason);
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "transcript printer lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return failure,
        }
    }
}

/// Test microphone input through the capture pipeline
async fn test_mic(duration: u64, output: Option<PathBuf>) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let captured = Arc::new(Mutex::new(Vec::<AudioFrame>::new()));
    let sink = Arc::clone(&captured);

    let mut capture = CapturePipeline::new(Box::new(CpalInput::new()), FRAME_SIZE);
    capture.start(move |frame| {
        if let Ok(mut frames) = sink.lock() {
            frames.push(frame);
        }
    })?;

    println!("Sample rate: {SAMPLE_RATE} Hz, frame size: {FRAME_SIZE} samples");
    println!("---");

    let mut recording: Vec<i16> = Vec::new();
    for i in 0..duration {
        tokio::time::sleep(Duration::from_secs(1)).await;

        let frames = captured
            .lock()
            .map(|mut f| std::mem::take(&mut *f))
            .unwrap_or_default();
        let samples: Vec<f32> = frames.iter().flat_map(AudioFrame::to_f32).collect();
        let energy = calculate_rms(&samples);
        let peak = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!(
            "[{:2}s] frames: {:2} | RMS: {:.4} | Peak: {:.4} | [{}]",
            i + 1,
            frames.len(),
            energy,
            peak,
            meter
        );

        if output.is_some() {
            recording.extend(frames.iter().flat_map(|f| f.samples().to_vec()));
        }
    }

    capture.stop();

    if let Some(path) = output {
        write_wav(&path, &recording)?;
        println!("\nSaved {} samples to {}", recording.len(), path.display());
    }

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");

    Ok(())
}

/// Write 16 kHz mono PCM to a WAV file
fn write_wav(path: &std::path::Path, samples: &[i16]) -> anyhow::Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut writer = hound::WavWriter::create(path, spec)
        .with_context(|| format!("failed to create {}", path.display()))?;
    for &sample in samples {
        writer.write_sample(sample)?;
    }
    writer.finalize()?;
    Ok(())
}

/// Calculate RMS energy
#[allow(clippy::cast_precision_loss)]
fn calculate_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Test speaker output with a sine wave scheduled as back-to-back frames
async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let mut playback = PlaybackScheduler::new(Box::new(CpalOutput::open()?));

    let sample_rate = SampleRate::Playback.hz();
    let frequency = 440.0_f32;
    let chunk = 2400; // 100ms
    let chunks = 20;

    for c in 0..chunks {
        #[allow(clippy::cast_precision_loss)]
        let samples: Vec<f32> = (c * chunk..(c + 1) * chunk)
            .map(|i| {
                let t = i as f32 / sample_rate as f32;
                (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3 // 30% volume
            })
            .collect();
        playback.enqueue(AudioFrame::from_f32(&samples, SampleRate::Playback))?;
    }

    println!(
        "Scheduled {chunks} frames of {chunk} samples at {sample_rate} Hz (ends at {:?})",
        playback.next_free_time()
    );

    let remaining = playback
        .next_free_time()
        .saturating_sub(playback.current_time());
    tokio::time::sleep(remaining + Duration::from_millis(200)).await;
    playback.reset();

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Try: speaker-test -t sine -f 440 -l 1");

    Ok(())
}
