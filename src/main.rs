use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use harken::daemon::Daemon;
use harken::session::{FrameOutcome, SessionMachine, SessionTiming};
use harken::voice::{
    AudioClip, CpalFrameSource, CpalPlayback, EnergyClassifier, Frame, FrameSource,
    PlaybackSink, RingBuffer, VoiceActivityDetector, Volume, WakeWordDetector, f32_to_i16,
    i16_to_f32, list_input_devices, list_output_devices, read_wav_mono, rms_i16,
    write_wav_file,
};
use harken::{Config, SessionState, SharedSession, StopSignal};

/// Harken - hands-free voice assistant
#[derive(Parser)]
#[command(name = "harken", version, about)]
struct Cli {
    /// Configuration file (TOML or JSON)
    #[arg(short, long, env = "HARKEN_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the voice pipeline (default)
    Run {
        /// Skip the wake word, answer one command and exit
        #[arg(long)]
        once: bool,
    },
    /// List audio input and output devices
    Devices {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
    /// Load, validate and print the resolved configuration
    CheckConfig,
    /// Record a reference clip for a wake word
    RecordKeyword {
        /// Output WAV path
        output: PathBuf,
        /// Recording length in seconds
        #[arg(short, long, default_value = "2")]
        duration: u64,
    },
    /// Run wake word and utterance segmentation over a WAV file
    Replay {
        /// Input WAV (any rate, mixed down to mono)
        input: PathBuf,
        /// Directory to save each utterance as WAV
        #[arg(long)]
        save: Option<PathBuf>,
        /// Segment without wake words: every utterance counts
        #[arg(long)]
        no_wake_word: bool,
        /// Use the RMS energy classifier instead of WebRTC VAD
        #[arg(long)]
        energy: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,harken=info",
        1 => "info,harken=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

#[allow(clippy::future_not_send)]
async fn run(cli: Cli) -> anyhow::Result<()> {
    let config_path = cli.config.as_deref();

    match cli.command.unwrap_or(Command::Run { once: false }) {
        Command::Run { once } => run_daemon(config_path, once).await,
        Command::Devices { json } => devices(json),
        Command::TestMic { duration } => test_mic(config_path, duration).await,
        Command::TestSpeaker => test_speaker(config_path).await,
        Command::CheckConfig => check_config(config_path),
        Command::RecordKeyword { output, duration } => {
            record_keyword(config_path, &output, duration).await
        }
        Command::Replay {
            input,
            save,
            no_wake_word,
            energy,
        } => replay(config_path, &input, save.as_deref(), no_wake_word, energy),
    }
}

#[allow(clippy::future_not_send)]
async fn run_daemon(config_path: Option<&Path>, once: bool) -> anyhow::Result<()> {
    let config = Config::load(config_path)?;
    tracing::info!(
        config = ?config.source,
        once,
        keywords = config.wake_word.keywords.len(),
        "starting harken"
    );

    let summary = Daemon::new(config).once(once).run().await?;
    tracing::info!(
        turns = summary.turns,
        wake_words = summary.wake_words,
        false_triggers = summary.false_triggers,
        cancelled = summary.cancelled,
        frames_dropped = summary.frames_dropped,
        "harken stopped"
    );
    Ok(())
}

/// List audio devices
fn devices(json: bool) -> anyhow::Result<()> {
    let inputs = list_input_devices()?;
    let outputs = list_output_devices()?;

    if json {
        let value = serde_json::json!({ "input": inputs, "output": outputs });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    for (title, devices) in [("Input devices", &inputs), ("Output devices", &outputs)] {
        println!("{title}:");
        if devices.is_empty() {
            println!("  (none)");
        }
        for device in devices {
            let marker = if device.is_default { "*" } else { " " };
            println!(
                "  {marker} {} ({} ch, {} Hz)",
                device.name, device.channels, device.default_sample_rate
            );
        }
        println!();
    }
    println!("* system default");
    Ok(())
}

/// Test microphone input
#[allow(clippy::future_not_send)]
async fn test_mic(config_path: Option<&Path>, duration: u64) -> anyhow::Result<()> {
    let config = Config::load(config_path)?;
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let spec = config.frame_spec();
    let buffer = Arc::new(RingBuffer::new(spec, config.audio.buffer)?);
    let mut source = CpalFrameSource::new(
        config.audio.input_device.as_deref(),
        Arc::clone(&buffer),
        SharedSession::new(),
    )?;
    source.start()?;

    println!("Pipeline format: {} Hz, {} ms frames", spec.sample_rate(), spec.frame_duration_ms());
    println!("---");

    for i in 0..duration {
        tokio::time::sleep(Duration::from_secs(1)).await;

        let samples = buffer.read_last(Duration::from_secs(1));
        let energy = rms_i16(&samples);
        let peak = samples
            .iter()
            .map(|&s| i16_to_f32(s).abs())
            .fold(0.0f32, f32::max);

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!(
            "[{:2}s] RMS: {:.4} | Peak: {:.4} | [{}]",
            i + 1,
            energy,
            peak,
            meter
        );
    }

    source.stop();

    println!("\n---");
    println!("Frames captured: {}", buffer.frames_written());
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: harken devices");
    println!("  3. Set audio.input_device in the config file");

    Ok(())
}

/// Test speaker output with a sine wave
#[allow(clippy::future_not_send)]
async fn test_speaker(config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = Config::load(config_path)?;
    println!("Testing speaker output...");
    println!(
        "You should hear a 440Hz tone for 2 seconds at volume {}\n",
        config.audio.output_volume
    );

    let mut playback = CpalPlayback::new(
        config.audio.output_device.as_deref(),
        Volume::new(i64::from(config.audio.output_volume)),
    )?;
    let tone = AudioClip::tone(440.0, Duration::from_secs(2), 24_000, 0.3);
    println!("Playing {} samples at {} Hz...", tone.samples.len(), tone.sample_rate);

    playback.play(&tone, &StopSignal::new()).await?;

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: harken devices");
    println!("  2. Set audio.output_device or raise audio.output_volume");

    Ok(())
}

/// Print the resolved configuration
fn check_config(config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = Config::load(config_path)?;
    match &config.source {
        Some(path) => println!("# loaded from {}", path.display()),
        None => println!("# no config file, using defaults"),
    }
    println!("{}", serde_json::to_string_pretty(&config)?);

    let keys = &config.api_keys;
    println!(
        "# api keys: openai={} deepgram={} elevenlabs={}",
        keys.openai.is_some(),
        keys.deepgram.is_some(),
        keys.elevenlabs.is_some()
    );
    if config.wake_word.keywords.is_empty() {
        println!("# warning: no wake word keywords; only `run --once` will work");
    }
    Ok(())
}

/// Record a wake word reference clip
#[allow(clippy::future_not_send)]
async fn record_keyword(
    config_path: Option<&Path>,
    output: &Path,
    duration: u64,
) -> anyhow::Result<()> {
    let config = Config::load(config_path)?;
    let spec = config.frame_spec();
    let length = Duration::from_secs(duration.max(1));

    let buffer = Arc::new(RingBuffer::new(spec, length)?);
    let mut source = CpalFrameSource::new(
        config.audio.input_device.as_deref(),
        Arc::clone(&buffer),
        SharedSession::new(),
    )?;

    println!("Say the wake word once, clearly.");
    println!("Recording for {} seconds...", length.as_secs());
    source.start()?;
    tokio::time::sleep(length).await;
    source.stop();

    let samples: Vec<f32> = buffer
        .read_last(length)
        .into_iter()
        .map(i16_to_f32)
        .collect();
    if samples.is_empty() {
        anyhow::bail!("no audio captured; check the input device");
    }

    write_wav_file(output, &samples, spec.sample_rate())
        .with_context(|| format!("cannot write {}", output.display()))?;
    println!(
        "Saved {} samples ({:.1} s) to {}",
        samples.len(),
        length.as_secs_f32(),
        output.display()
    );
    println!("Reference it from wake_word.keywords[].model; a directory of clips also works.");
    Ok(())
}

/// Segment a WAV file into utterances
#[allow(clippy::cast_precision_loss)]
fn replay(
    config_path: Option<&Path>,
    input: &Path,
    save: Option<&Path>,
    no_wake_word: bool,
    energy: bool,
) -> anyhow::Result<()> {
    let config = Config::load(config_path)?;
    let spec = config.frame_spec();

    let detector = WakeWordDetector::from_config(&config.wake_word, spec)?;
    if !no_wake_word && detector.is_empty() {
        anyhow::bail!("no wake word keywords configured; pass --no-wake-word");
    }
    let vad = if energy {
        VoiceActivityDetector::new(
            Box::new(EnergyClassifier::with_aggressiveness(config.vad.aggressiveness)?),
            spec,
        )
    } else {
        VoiceActivityDetector::webrtc(spec, config.vad.aggressiveness)?
    };
    // No cue is played offline, so nothing needs muting
    let timing = SessionTiming {
        cue_frames: 0,
        ..SessionTiming::from_config(&config)
    };
    let mut machine = SessionMachine::new(
        detector,
        vad,
        timing,
        SharedSession::new(),
        StopSignal::new(),
    )?;

    let audio = read_wav_mono(input, spec.sample_rate())
        .with_context(|| format!("cannot read {}", input.display()))?;
    if let Some(dir) = save {
        std::fs::create_dir_all(dir)?;
    }

    println!(
        "Replaying {} ({:.1} s at {} Hz, {} ms frames)",
        input.display(),
        audio.len() as f64 / f64::from(spec.sample_rate()),
        spec.sample_rate(),
        spec.frame_duration_ms()
    );

    let mut utterances = 0u32;
    for (index, chunk) in (0u64..).zip(audio.chunks(spec.frame_len())) {
        let mut samples: Vec<i16> = chunk.iter().copied().map(f32_to_i16).collect();
        samples.resize(spec.frame_len(), 0);

        if no_wake_word && machine.state() == SessionState::Idle {
            machine.begin_capture();
        }

        match machine.on_frame(Frame::new(index, samples))? {
            FrameOutcome::WakeWord { keyword, frame_index } => {
                println!(
                    "  wake word '{}' at frame {frame_index} ({:.2} s)",
                    machine.detector().keyword_name(keyword).unwrap_or("?"),
                    spec.duration_of(frame_index).as_secs_f32()
                );
            }
            FrameOutcome::Finalized(utterance) => {
                utterances += 1;
                let (first, last) = utterance.span().unwrap_or((index, index));
                println!(
                    "  utterance {utterances}: frames {first}..={last} ({:.2} s - {:.2} s, {:.2} s, {})",
                    spec.duration_of(first).as_secs_f32(),
                    spec.duration_of(last + 1).as_secs_f32(),
                    utterance.duration().as_secs_f32(),
                    utterance.end_reason()
                );
                if let Some(dir) = save {
                    let path = dir.join(format!("utterance-{utterances:03}.wav"));
                    let samples: Vec<f32> =
                        utterance.samples().into_iter().map(i16_to_f32).collect();
                    write_wav_file(&path, &samples, spec.sample_rate())?;
                    println!("    saved {}", path.display());
                }
                machine.finish_turn();
            }
            FrameOutcome::FalseTrigger => {
                println!("  no speech after wake word at frame {index}");
            }
            FrameOutcome::Idle
            | FrameOutcome::Capturing
            | FrameOutcome::Cancelled
            | FrameOutcome::Ignored => {}
        }
    }

    let stats = machine.detector().stats();
    println!("---");
    println!(
        "{utterances} utterance(s), {} wake word detection(s) over {} frames",
        stats.total_detections(),
        stats.frames_processed
    );
    Ok(())
}
