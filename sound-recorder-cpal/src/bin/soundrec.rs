//! `soundrec`: record an input device to a sound file.
//!
//! ```text
//! soundrec devices
//! soundrec default-format
//! soundrec record take.wav --rate 44100 --channels 1 --seconds 10
//! soundrec record memo.caf --codec ulaw --virtual
//! ```

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use parking_lot::Mutex;

use sound_recorder_core::{
    default_output_format, string_to_format_tag, AudioHost, DelegateCapabilities, FileType, FormatTag, OutputFormat,
    PropertyMap, RecorderConfiguration, RecorderDelegate, RecorderError, SoundFileRecorder, StreamFormatDescriptor,
    VirtualDeviceSpec, VirtualHost,
};
use sound_recorder_core::processing::levels::level_to_dbfs;
use sound_recorder_cpal::CpalHost;

#[derive(Parser)]
#[command(name = "soundrec", version, about = "Record an audio input device to a sound file")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List input devices; the default is marked with `*`.
    Devices {
        /// Use the synthetic test device instead of the sound system.
        #[arg(long = "virtual")]
        virtual_host: bool,
    },
    /// Print the default output format as JSON.
    DefaultFormat,
    /// Record until `--seconds` elapse or Enter is pressed.
    Record(RecordArgs),
}

#[derive(Args)]
struct RecordArgs {
    /// Output file; its extension picks the container unless --file-type is given.
    path: PathBuf,

    /// Input device id (see `soundrec devices`).
    #[arg(long)]
    device: Option<String>,

    /// Output format as a JSON property map (see `soundrec default-format`).
    #[arg(long, value_name = "FILE", conflicts_with = "codec")]
    format_json: Option<PathBuf>,

    #[arg(long, value_enum)]
    codec: Option<Codec>,

    /// Output sample rate; defaults to the device rate.
    #[arg(long, value_name = "HZ")]
    rate: Option<f64>,

    /// Output channel count; defaults to the device channel count.
    #[arg(long)]
    channels: Option<u32>,

    /// Bits per sample for linear PCM.
    #[arg(long)]
    bits: Option<u32>,

    /// Floating-point linear PCM.
    #[arg(long)]
    float: bool,

    /// Four-character container tag, e.g. WAVE, AIFF, AIFC, caff, NeXT, adts.
    #[arg(long, value_name = "TAG")]
    file_type: Option<String>,

    #[arg(long, value_name = "S")]
    seconds: Option<f64>,

    /// Write <path>.metadata.json next to the recording.
    #[arg(long)]
    metadata: bool,

    /// Record a 440 Hz tone from the synthetic test device.
    #[arg(long = "virtual")]
    virtual_host: bool,

    /// No level meter.
    #[arg(long)]
    quiet: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Codec {
    Lpcm,
    Aac,
    Ulaw,
    Alaw,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command {
        Command::Devices { virtual_host } => {
            if virtual_host {
                list_devices(&virtual_host_with_tone())
            } else {
                list_devices(&CpalHost::new())
            }
        }
        Command::DefaultFormat => {
            let map = default_output_format().to_property_map();
            println!("{}", serde_json::to_string_pretty(&map)?);
            Ok(())
        }
        Command::Record(args) => {
            if args.virtual_host {
                record(virtual_host_with_tone(), &args)
            } else {
                record(CpalHost::new(), &args)
            }
        }
    }
}

fn virtual_host_with_tone() -> VirtualHost {
    VirtualHost::single(
        VirtualDeviceSpec::new("virtual-tone", 48000.0, 2)
            .sine(440.0, 0.5)
            .clocked(),
    )
}

fn list_devices(host: &dyn AudioHost) -> Result<()> {
    let devices = host.input_devices().context("failed to list input devices")?;
    if devices.is_empty() {
        println!("no input devices");
    }
    for device in devices {
        println!(
            "{} {} ({} ch)",
            if device.is_default { "*" } else { " " },
            device.id,
            device.input_channels
        );
    }
    Ok(())
}

/// The output format asked for on the command line, or None for the
/// recorder's default.
fn requested_output(args: &RecordArgs) -> Result<Option<OutputFormat>> {
    let rate = args.rate.unwrap_or(0.0);
    let channels = args.channels.unwrap_or(0);
    let pcm_options = args.bits.is_some() || args.float;
    let file_type = args
        .file_type
        .as_deref()
        .map(|tag| string_to_format_tag(tag).map(FileType::from_tag))
        .transpose()
        .context("--file-type must be four characters")?;
    let container = file_type.or_else(|| {
        args.path
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(FileType::from_extension)
    });

    let mut format = if let Some(file) = &args.format_json {
        let text = std::fs::read_to_string(file).with_context(|| format!("failed to read {}", file.display()))?;
        let map: PropertyMap =
            serde_json::from_str(&text).with_context(|| format!("{} is not a JSON object", file.display()))?;
        OutputFormat::from_property_map(&map).with_context(|| format!("bad format in {}", file.display()))?
    } else {
        let codec = match args.codec {
            Some(codec) => codec,
            None if pcm_options || holds_pcm(container) => Codec::Lpcm,
            None if args.rate.is_some() || args.channels.is_some() => Codec::Aac,
            None if file_type.is_none() => return Ok(None),
            None => Codec::Aac,
        };
        if pcm_options && !matches!(codec, Codec::Lpcm) {
            bail!("--bits and --float only apply to --codec lpcm");
        }
        let stream = match codec {
            Codec::Lpcm => StreamFormatDescriptor::linear_pcm(rate, channels, args.bits.unwrap_or(0), args.float, false),
            Codec::Aac => {
                let default = default_output_format().stream;
                StreamFormatDescriptor::aac(
                    args.rate.unwrap_or(default.sample_rate),
                    args.channels.unwrap_or(default.channels_per_frame),
                )
            }
            Codec::Ulaw => StreamFormatDescriptor::g711(FormatTag::ULAW, rate, channels),
            Codec::Alaw => StreamFormatDescriptor::g711(FormatTag::ALAW, rate, channels),
        };
        OutputFormat::new(stream, None)
    };

    if file_type.is_some() {
        format.file_type = file_type;
    }
    Ok(Some(format))
}

/// Containers that cannot carry AAC.
fn holds_pcm(container: Option<FileType>) -> bool {
    matches!(
        container,
        Some(FileType::Wave | FileType::Aiff | FileType::Aifc | FileType::Next)
    )
}

/// Level meter and stop watcher.
struct Console {
    quiet: bool,
    level: Mutex<f32>,
    last_print: Mutex<f64>,
    stopped: Mutex<Option<Option<RecorderError>>>,
}

impl Console {
    fn new(quiet: bool) -> Self {
        Self {
            quiet,
            level: Mutex::new(0.0),
            last_print: Mutex::new(-1.0),
            stopped: Mutex::new(None),
        }
    }

    fn failure(&self) -> Option<RecorderError> {
        self.stopped.lock().clone().flatten()
    }
}

impl RecorderDelegate for Console {
    fn capabilities(&self) -> DelegateCapabilities {
        if self.quiet {
            DelegateCapabilities::NONE
        } else {
            DelegateCapabilities::ALL
        }
    }

    fn on_started(&self) {
        eprintln!("recording, press Enter to stop");
    }

    fn on_duration_reached(&self, seconds: f64) {
        let mut last = self.last_print.lock();
        if seconds - *last < 0.1 {
            return;
        }
        *last = seconds;
        let level = *self.level.lock();
        let bars = (level.clamp(0.0, 1.0) * 40.0).round() as usize;
        let mut stderr = io::stderr().lock();
        let _ = write!(
            stderr,
            "\r{:7.1}s [{:<40}] {:6.1} dBFS",
            seconds,
            "#".repeat(bars),
            level_to_dbfs(level)
        );
        let _ = stderr.flush();
    }

    fn on_amplitude(&self, level: f32) {
        *self.level.lock() = level;
    }

    fn on_stopped(&self, error: Option<&RecorderError>) {
        if !self.quiet {
            eprintln!();
        }
        *self.stopped.lock() = Some(error.cloned());
    }
}

/// Fires once for each line read from stdin. Disconnects at end of input.
fn enter_presses() -> Receiver<()> {
    let (tx, rx) = bounded(1);
    let spawned = thread::Builder::new()
        .name("soundrec-stdin".into())
        .spawn(move || {
            let stdin = io::stdin();
            let mut line = String::new();
            while matches!(stdin.lock().read_line(&mut line), Ok(n) if n > 0) {
                line.clear();
                if tx.send(()).is_err() {
                    break;
                }
            }
        });
    if let Err(e) = spawned {
        log::warn!("no stdin watcher, stop with --seconds: {}", e);
    }
    rx
}

fn record<H: AudioHost>(host: H, args: &RecordArgs) -> Result<()> {
    let config = RecorderConfiguration {
        device_id: args.device.clone(),
        write_metadata: args.metadata,
        ..Default::default()
    };
    let mut recorder = SoundFileRecorder::new(host, config);
    recorder.set_output_file_path(&args.path)?;
    if let Some(format) = requested_output(args)? {
        recorder.set_requested_output(format)?;
    }
    let console = Arc::new(Console::new(args.quiet));
    recorder.set_delegate(Some(console.clone()));

    recorder
        .prepare()
        .with_context(|| format!("cannot record to {}", args.path.display()))?;
    if let Some(actual) = recorder.actual_output_format() {
        log::info!("output format: {}", serde_json::to_string(&actual)?);
    }
    recorder.start().context("failed to start recording")?;

    let enter = enter_presses();
    let mut stdin_open = true;
    let started = Instant::now();
    loop {
        if stdin_open {
            match enter.recv_timeout(Duration::from_millis(50)) {
                Ok(()) => break,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => stdin_open = false,
            }
        } else {
            thread::sleep(Duration::from_millis(50));
        }

        recorder.pump_notifications();
        if !recorder.is_recording() {
            break;
        }
        if args
            .seconds
            .is_some_and(|limit| started.elapsed().as_secs_f64() >= limit)
        {
            break;
        }
    }

    let summary = recorder.stop().context("failed to finish recording")?;
    let Some(summary) = summary else {
        return Err(match console.failure() {
            Some(error) => anyhow!(error).context("recording ended early"),
            None => anyhow!("recording ended without a result"),
        });
    };

    let diagnostics = recorder.diagnostics();
    if diagnostics.blocks_skipped > 0 || diagnostics.events_dropped > 0 {
        log::warn!(
            "{} blocks skipped, {} notifications dropped",
            diagnostics.blocks_skipped,
            diagnostics.events_dropped
        );
    }
    println!(
        "{}: {:.2}s, {} frames, {} bytes, sha256 {}",
        summary.file_path.display(),
        summary.duration_secs,
        summary.frames_written,
        summary.bytes_written,
        summary.checksum
    );
    Ok(())
}
