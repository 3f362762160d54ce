use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::models::audio_models::RecorderDiagnostics;
use crate::models::config::RecorderConfiguration;
use crate::models::error::RecorderError;
use crate::models::format::{OutputFormat, PropertyMap};
use crate::models::recording_result::{RecordingMetadata, RecordingSummary};
use crate::models::state::RecorderState;
use crate::processing::capture_buffer::CaptureBuffer;
use crate::session::bridge::{
    LifecycleEvent, LifecyclePoster, NotificationBridge, Position, PositionSample, SamplePoster,
};
use crate::session::resolver::{client_format, default_output_format, negotiate_output_format, resolve_input_format};
use crate::storage::file_writer::EncodedFileWriter;
use crate::storage::metadata;
use crate::traits::audio_host::AudioHost;
use crate::traits::input_device::{HostClock, InputBlock, InputDevice, RenderCallback};
use crate::traits::recorder_delegate::{DelegateCapabilities, RecorderDelegate};

/// Records one input device into one encoded file.
///
/// Generic over the [`AudioHost`] so the same engine runs on real hardware
/// (`CpalHost`) and on the in-process [`VirtualHost`](crate::devices::VirtualHost).
///
/// ## Lifecycle
///
/// ```text
/// Idle ──prepare──▶ Prepared ──start──▶ Recording ──stop──▶ Stopped ──▶ Idle
///   ▲                  │
///   └──path/device change (file removed)
/// ```
///
/// ## Threads
///
/// The render callback owns the capture buffer and file writer through a
/// render context it only ever `try_lock`s. The control thread (whoever owns
/// this value) touches the context only after the device has been closed,
/// or before it has been started. The writer hands encoded bytes to its own
/// `file-writer` thread, so the render callback never waits on the disk.
/// Notifications reach the delegate from
/// [`pump_notifications`](Self::pump_notifications), which `start` and `stop`
/// call before returning.
pub struct SoundFileRecorder<H: AudioHost> {
    host: H,
    config: RecorderConfiguration,
    state: RecorderState,
    output_path: Option<PathBuf>,
    requested_format: OutputFormat,
    actual_format: Option<OutputFormat>,
    delegate: Option<Arc<dyn RecorderDelegate>>,
    subscriptions: Arc<Subscriptions>,
    bridge: NotificationBridge,
    lifecycle: LifecyclePoster,
    sample_poster: Option<SamplePoster>,
    session: Option<Session>,
    last_session: u64,
    counters: Arc<RenderCounters>,
}

/// Cached delegate capabilities, readable from the render thread.
#[derive(Debug, Default)]
struct Subscriptions {
    duration: AtomicBool,
    amplitude: AtomicBool,
}

impl Subscriptions {
    fn set(&self, caps: DelegateCapabilities) {
        self.duration.store(caps.duration_updates, Ordering::Release);
        self.amplitude.store(caps.amplitude_updates, Ordering::Release);
    }
}

#[derive(Debug, Default)]
struct RenderCounters {
    callbacks: AtomicU64,
    frames: AtomicU64,
    skipped: AtomicU64,
}

#[derive(Debug, Default)]
struct SessionFlags {
    /// Set once `start` has stamped the start time; blocks before that are ignored.
    armed: AtomicBool,
    /// Set once by the render thread on a write failure; no further blocks
    /// are processed.
    failed: AtomicBool,
}

struct Session {
    id: u64,
    device: Box<dyn InputDevice>,
    context: Arc<Mutex<RenderContext>>,
    flags: Arc<SessionFlags>,
    clock: Arc<dyn HostClock>,
    output: OutputFormat,
    path: PathBuf,
}

/// State touched by the render callback.
struct RenderContext {
    session: u64,
    buffer: CaptureBuffer,
    writer: EncodedFileWriter,
    poster: Option<SamplePoster>,
    lifecycle: LifecyclePoster,
    flags: Arc<SessionFlags>,
    subscriptions: Arc<Subscriptions>,
    counters: Arc<RenderCounters>,
    ticks_per_second: f64,
    start_host_time: u64,
    elapsed: f64,
}

impl RenderContext {
    fn render(&mut self, block: &InputBlock<'_>) {
        if !self.flags.armed.load(Ordering::Acquire) || self.flags.failed.load(Ordering::Acquire) {
            return;
        }
        let channels = block.channels as usize;
        if channels == 0 || block.samples.len() < channels {
            return;
        }

        // Device blocks larger than one period are processed in period-sized chunks.
        let chunk_len = self.buffer.capacity() * channels;
        let mut peak = 0.0f32;
        for chunk in block.samples.chunks(chunk_len) {
            let frames = self.buffer.load_interleaved(chunk, channels);
            self.counters.frames.fetch_add(frames as u64, Ordering::Relaxed);
            peak = peak.max(self.buffer.peak_level());
            if let Err(error) = self.writer.append(&self.buffer) {
                self.fail(error);
                return;
            }
        }

        let seconds = block.host_time.saturating_sub(self.start_host_time) as f64 / self.ticks_per_second;
        if seconds > self.elapsed {
            self.elapsed = seconds;
        }

        if let Some(poster) = self.poster.as_mut() {
            if self.subscriptions.duration.load(Ordering::Acquire) {
                poster.post(PositionSample {
                    session: self.session,
                    position: Position::Duration(self.elapsed),
                });
            }
            if self.subscriptions.amplitude.load(Ordering::Acquire) {
                poster.post(PositionSample {
                    session: self.session,
                    position: Position::Amplitude(peak),
                });
            }
        }
    }

    fn fail(&mut self, error: RecorderError) {
        if self.flags.failed.swap(true, Ordering::AcqRel) {
            return;
        }
        log::error!("recording session {} failed: {}", self.session, error);
        self.lifecycle.post(LifecycleEvent::Stopped {
            session: self.session,
            error: Some(error),
        });
    }
}

fn render_callback(context: Arc<Mutex<RenderContext>>, counters: Arc<RenderCounters>) -> RenderCallback {
    Box::new(move |block: &InputBlock<'_>| {
        counters.callbacks.fetch_add(1, Ordering::Relaxed);
        match context.try_lock() {
            Some(mut ctx) => ctx.render(block),
            None => {
                counters.skipped.fetch_add(1, Ordering::Relaxed);
            }
        }
    })
}

impl<H: AudioHost> SoundFileRecorder<H> {
    pub fn new(host: H, config: RecorderConfiguration) -> Self {
        let (bridge, sample_poster) = NotificationBridge::new(config.notification_capacity);
        let lifecycle = bridge.lifecycle_poster();
        Self {
            host,
            config,
            state: RecorderState::Idle,
            output_path: None,
            requested_format: default_output_format(),
            actual_format: None,
            delegate: None,
            subscriptions: Arc::new(Subscriptions::default()),
            bridge,
            lifecycle,
            sample_poster: Some(sample_poster),
            session: None,
            last_session: 0,
            counters: Arc::new(RenderCounters::default()),
        }
    }

    /// A recorder with the default configuration, writing to `path`.
    pub fn with_output_file_path(host: H, path: impl AsRef<Path>) -> Self {
        let mut recorder = Self::new(host, RecorderConfiguration::default());
        recorder.output_path = Some(path.as_ref().to_path_buf());
        recorder
    }

    /// The default requested output: AAC, stereo, 44.1 kHz.
    pub fn default_output_format() -> PropertyMap {
        default_output_format().to_property_map()
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn configuration(&self) -> &RecorderConfiguration {
        &self.config
    }

    pub fn state(&self) -> RecorderState {
        self.state
    }

    /// Recording, and no write failure has ended the session.
    pub fn is_recording(&self) -> bool {
        self.state.is_recording()
            && self
                .session
                .as_ref()
                .is_some_and(|s| !s.flags.failed.load(Ordering::Acquire))
    }

    pub fn output_file_path(&self) -> Option<&Path> {
        self.output_path.as_deref()
    }

    /// Set the destination file. Abandons a pending preparation.
    pub fn set_output_file_path(&mut self, path: impl AsRef<Path>) -> Result<(), RecorderError> {
        self.reconfigure()?;
        self.output_path = Some(path.as_ref().to_path_buf());
        Ok(())
    }

    pub fn device_id(&self) -> Option<&str> {
        self.config.device_id.as_deref()
    }

    /// Select an input device, or the host default with None.
    pub fn set_device_id(&mut self, device_id: Option<String>) -> Result<(), RecorderError> {
        self.reconfigure()?;
        self.config.device_id = device_id;
        Ok(())
    }

    /// Requested output format as a property map.
    pub fn output_format(&self) -> PropertyMap {
        self.requested_format.to_property_map()
    }

    pub fn requested_output(&self) -> OutputFormat {
        self.requested_format
    }

    /// Replace the requested output format. Must be called before `prepare`.
    pub fn set_output_format(&mut self, map: &PropertyMap) -> Result<(), RecorderError> {
        let format = OutputFormat::from_property_map(map)?;
        self.set_requested_output(format)
    }

    pub fn set_requested_output(&mut self, format: OutputFormat) -> Result<(), RecorderError> {
        self.reap_failed_session();
        if self.state.is_recording() {
            return Err(RecorderError::AlreadyRecording);
        }
        if self.state.is_prepared() {
            return Err(RecorderError::AlreadyPrepared);
        }
        self.requested_format = format;
        Ok(())
    }

    /// The negotiated format of the prepared or most recent session.
    pub fn actual_output_format(&self) -> Option<PropertyMap> {
        self.actual_format.as_ref().map(OutputFormat::to_property_map)
    }

    pub fn actual_output(&self) -> Option<OutputFormat> {
        self.actual_format
    }

    pub fn delegate(&self) -> Option<Arc<dyn RecorderDelegate>> {
        self.delegate.clone()
    }

    /// Register a listener. Its capabilities are read once, here.
    pub fn set_delegate(&mut self, delegate: Option<Arc<dyn RecorderDelegate>>) {
        let caps = delegate
            .as_ref()
            .map(|d| d.capabilities())
            .unwrap_or(DelegateCapabilities::NONE);
        self.subscriptions.set(caps);
        self.delegate = delegate;
    }

    pub fn diagnostics(&self) -> RecorderDiagnostics {
        RecorderDiagnostics {
            callback_count: self.counters.callbacks.load(Ordering::Relaxed),
            frames_captured: self.counters.frames.load(Ordering::Relaxed),
            blocks_skipped: self.counters.skipped.load(Ordering::Relaxed),
            events_posted: self.bridge.stats().posted(),
            events_dropped: self.bridge.stats().dropped(),
        }
    }

    /// Resolve the device, open the output file and register the render
    /// callback. Does nothing if already prepared or recording.
    pub fn prepare(&mut self) -> Result<(), RecorderError> {
        self.reap_failed_session();
        if self.session.is_some() {
            return Ok(());
        }
        self.config
            .validate()
            .map_err(RecorderError::InvalidConfiguration)?;

        let path = match self.output_path.as_ref() {
            Some(path) if !path.as_os_str().is_empty() => path.clone(),
            _ => return Err(RecorderError::FileOpen("no output path set".into())),
        };

        let resolved = resolve_input_format(&self.host, self.config.device_id.as_deref())?;
        let mut device = resolved.device;
        let client = client_format(&resolved.native);
        let output = negotiate_output_format(&self.requested_format, &client, &path)?;
        let writer = EncodedFileWriter::open(&path, &output, &client, &self.config)?;

        let id = self.last_session + 1;
        let clock = device.clock();
        let ticks_per_second = match clock.ticks_per_second() {
            tps if tps > 0.0 => tps,
            _ => 1.0e9,
        };
        let flags = Arc::new(SessionFlags::default());
        let context = Arc::new(Mutex::new(RenderContext {
            session: id,
            buffer: CaptureBuffer::new(
                client.channels_per_frame as usize,
                self.config.period_frames as usize,
            ),
            writer,
            poster: self.sample_poster.take(),
            lifecycle: self.lifecycle.clone(),
            flags: Arc::clone(&flags),
            subscriptions: Arc::clone(&self.subscriptions),
            counters: Arc::clone(&self.counters),
            ticks_per_second,
            start_host_time: 0,
            elapsed: 0.0,
        }));

        let callback = render_callback(Arc::clone(&context), Arc::clone(&self.counters));
        if let Err(e) = device.open(&client, self.config.period_frames, callback) {
            device.close();
            let mut ctx = context.lock();
            ctx.writer.discard();
            self.sample_poster = ctx.poster.take();
            return Err(e);
        }

        log::info!(
            "prepared session {}: {} -> {} ({} Hz, {} ch, {})",
            id,
            device.id(),
            path.display(),
            output.stream.sample_rate,
            output.stream.channels_per_frame,
            output.stream.format_id
        );

        self.last_session = id;
        self.actual_format = Some(output);
        self.session = Some(Session {
            id,
            device,
            context,
            flags,
            clock,
            output,
            path,
        });
        self.state = RecorderState::Prepared;
        Ok(())
    }

    /// Begin recording. Prepares first if needed. `on_started` has been
    /// delivered by the time this returns.
    pub fn start(&mut self) -> Result<(), RecorderError> {
        self.reap_failed_session();
        if self.state.is_recording() {
            return Err(RecorderError::AlreadyRecording);
        }
        self.prepare()?;

        let Some(session) = self.session.as_mut() else {
            return Err(RecorderError::DeviceUnavailable("session was not prepared".into()));
        };
        {
            let mut ctx = session.context.lock();
            ctx.start_host_time = session.clock.now();
            ctx.elapsed = 0.0;
        }
        session.flags.armed.store(true, Ordering::Release);

        // Posted ahead of the device start: a block rendered before
        // `device.start()` returns may already end the session.
        let id = session.id;
        self.lifecycle.post(LifecycleEvent::Started { session: id });

        if let Err(e) = session.device.start() {
            log::warn!("device {} failed to start: {}", session.device.id(), e);
            self.abandon_session();
            self.bridge.retract(id);
            return Err(match e {
                RecorderError::StartFailed(_) => e,
                other => RecorderError::StartFailed(other.to_string()),
            });
        }

        self.state = RecorderState::Recording;
        log::info!("recording session {} started", id);
        self.pump_notifications();
        Ok(())
    }

    /// Stop recording and finalize the file.
    ///
    /// Returns `Ok(None)` without notifying anyone when not recording, or when
    /// the session had already ended with a write failure (that failure was
    /// reported through `on_stopped`). `on_stopped` has been delivered by the
    /// time this returns.
    pub fn stop(&mut self) -> Result<Option<RecordingSummary>, RecorderError> {
        if !self.state.is_recording() {
            return Ok(None);
        }
        if self.reap_failed_session() {
            self.pump_notifications();
            return Ok(None);
        }
        let Some(session) = self.take_session() else {
            self.state = RecorderState::Idle;
            return Ok(None);
        };
        if session.flags.failed.load(Ordering::Acquire) {
            // Failed between the check above and the device closing.
            self.finish_failed_session(&session);
            self.state = RecorderState::Idle;
            self.pump_notifications();
            return Ok(None);
        }
        self.state = RecorderState::Stopped;

        let result = {
            let mut ctx = session.context.lock();
            ctx.writer.close().map(|checksum| RecordingSummary {
                file_path: session.path.clone(),
                duration_secs: ctx.writer.frames_written() as f64 / session.output.stream.sample_rate,
                frames_written: ctx.writer.frames_written(),
                bytes_written: ctx.writer.bytes_written(),
                format: session.output,
                checksum,
            })
        };

        if let Ok(summary) = &result {
            log::info!(
                "recording session {} stopped: {:.2}s, {} bytes",
                session.id,
                summary.duration_secs,
                summary.bytes_written
            );
            if self.config.write_metadata {
                let sidecar = RecordingMetadata::from_summary(summary);
                if let Err(e) = metadata::write_metadata(&sidecar, &summary.file_path) {
                    log::warn!("failed to write metadata for {}: {}", summary.file_path.display(), e);
                }
            }
        }

        self.state = RecorderState::Idle;
        self.lifecycle.post(LifecycleEvent::Stopped {
            session: session.id,
            error: result.as_ref().err().cloned(),
        });
        self.pump_notifications();
        result.map(Some)
    }

    /// Deliver queued notifications to the delegate on this thread.
    ///
    /// Also tears down a session that ended with a write failure. Returns the
    /// number of delegate calls made.
    pub fn pump_notifications(&mut self) -> usize {
        self.reap_failed_session();
        let delegate = self.delegate.clone();
        self.bridge.pump(delegate.as_deref())
    }

    /// Shared guard for path and device changes.
    fn reconfigure(&mut self) -> Result<(), RecorderError> {
        self.reap_failed_session();
        if self.state.is_recording() {
            return Err(RecorderError::AlreadyRecording);
        }
        if self.state.is_prepared() {
            self.abandon_session();
        }
        Ok(())
    }

    /// Close the device and take the session back from the render side.
    fn take_session(&mut self) -> Option<Session> {
        let mut session = self.session.take()?;
        session.device.close();
        session.flags.armed.store(false, Ordering::Release);
        self.sample_poster = session.context.lock().poster.take();
        Some(session)
    }

    /// Drop a prepared (or failed-to-start) session and remove its file.
    fn abandon_session(&mut self) {
        if let Some(session) = self.take_session() {
            session.context.lock().writer.discard();
            log::info!("abandoned session {} ({})", session.id, session.path.display());
        }
        self.actual_format = None;
        self.state = RecorderState::Idle;
    }

    /// Tear down a session the render thread marked as failed. Its stop event
    /// is already queued, so none is posted here. Returns true if one was reaped.
    fn reap_failed_session(&mut self) -> bool {
        let failed = self.state.is_recording()
            && self
                .session
                .as_ref()
                .is_some_and(|s| s.flags.failed.load(Ordering::Acquire));
        if !failed {
            return false;
        }
        if let Some(session) = self.take_session() {
            self.finish_failed_session(&session);
        }
        self.state = RecorderState::Idle;
        true
    }

    /// Leave the file of a failed session with a header that matches its data.
    fn finish_failed_session(&self, session: &Session) {
        if let Err(e) = session.context.lock().writer.close() {
            log::warn!(
                "could not finalize {} after write failure: {}",
                session.path.display(),
                e
            );
        }
    }
}

impl<H: AudioHost> Drop for SoundFileRecorder<H> {
    fn drop(&mut self) {
        if self.state.is_recording() {
            if let Err(e) = self.stop() {
                log::warn!("stop on drop failed: {}", e);
            }
        } else if self.state.is_prepared() {
            self.abandon_session();
        }
    }
}
