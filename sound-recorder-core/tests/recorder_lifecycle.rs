//! End-to-end recorder scenarios on manually driven virtual devices.

use std::path::Path;
use std::sync::Arc;

use approx::assert_relative_eq;
use parking_lot::Mutex;

use sound_recorder_core::storage::metadata::read_metadata;
use sound_recorder_core::{
    DelegateCapabilities, FileType, OutputFormat, RecorderConfiguration, RecorderDelegate, RecorderError,
    RecorderState, SoundFileRecorder, StreamFormatDescriptor, VirtualDeviceSpec, VirtualHost,
};

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Started,
    Duration(f64),
    Amplitude(f32),
    Stopped(Option<RecorderError>),
}

struct Recording {
    caps: DelegateCapabilities,
    events: Mutex<Vec<Event>>,
}

impl Recording {
    fn new(caps: DelegateCapabilities) -> Arc<Self> {
        Arc::new(Self {
            caps,
            events: Mutex::new(Vec::new()),
        })
    }

    fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.events.lock().iter().filter(|e| pred(e)).count()
    }
}

impl RecorderDelegate for Recording {
    fn capabilities(&self) -> DelegateCapabilities {
        self.caps
    }

    fn on_started(&self) {
        self.events.lock().push(Event::Started);
    }

    fn on_duration_reached(&self, seconds: f64) {
        self.events.lock().push(Event::Duration(seconds));
    }

    fn on_amplitude(&self, level: f32) {
        self.events.lock().push(Event::Amplitude(level));
    }

    fn on_stopped(&self, error: Option<&RecorderError>) {
        self.events.lock().push(Event::Stopped(error.cloned()));
    }
}

fn wave_16() -> OutputFormat {
    OutputFormat::new(
        StreamFormatDescriptor::linear_pcm(0.0, 0, 16, false, false),
        Some(FileType::Wave),
    )
}

fn u32_le(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([bytes[offset], bytes[offset + 1], bytes[offset + 2], bytes[offset + 3]])
}

fn wave_recorder(host: &VirtualHost, path: &Path) -> SoundFileRecorder<VirtualHost> {
    let mut recorder = SoundFileRecorder::with_output_file_path(host.clone(), path);
    recorder.set_requested_output(wave_16()).unwrap();
    recorder
}

#[test]
fn records_wave_with_consistent_header() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("take.wav");
    let host = VirtualHost::single(VirtualDeviceSpec::new("mic", 48000.0, 2).sine(440.0, 0.5));
    let handle = host.handle("mic").unwrap();
    let mut recorder = wave_recorder(&host, &path);

    recorder.start().unwrap();
    assert!(recorder.is_recording());
    for _ in 0..4 {
        assert!(handle.render_period());
    }
    let summary = recorder.stop().unwrap().unwrap();

    assert_eq!(recorder.state(), RecorderState::Idle);
    assert_eq!(summary.frames_written, 4 * 512);
    assert_eq!(summary.bytes_written, 44 + 4 * 512 * 4);
    assert_eq!(summary.checksum.len(), 64);
    assert_relative_eq!(summary.duration_secs, 2048.0 / 48000.0, epsilon = 1e-9);

    let bytes = std::fs::read(&path).unwrap();
    assert_eq!(bytes.len() as u64, summary.bytes_written);
    assert_eq!(&bytes[0..4], b"RIFF");
    assert_eq!(&bytes[8..12], b"WAVE");
    assert_eq!(u32_le(&bytes, 4) as usize, bytes.len() - 8);
    assert_eq!(u32_le(&bytes, 24), 48000);
    assert_eq!(u32_le(&bytes, 40), 4 * 512 * 4);
    assert!(bytes[44..].iter().any(|b| *b != 0));
}

#[test]
fn restart_on_same_path_replaces_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("again.wav");
    let host = VirtualHost::single(VirtualDeviceSpec::new("mic", 48000.0, 2));
    let handle = host.handle("mic").unwrap();
    let mut recorder = wave_recorder(&host, &path);

    recorder.start().unwrap();
    for _ in 0..5 {
        handle.render_period();
    }
    let first = recorder.stop().unwrap().unwrap();

    recorder.start().unwrap();
    for _ in 0..3 {
        handle.render_period();
    }
    let second = recorder.stop().unwrap().unwrap();

    assert_eq!(first.frames_written, 5 * 512);
    assert_eq!(second.frames_written, 3 * 512);
    let bytes = std::fs::read(&path).unwrap();
    assert_eq!(bytes.len(), 44 + 3 * 512 * 4);
    assert_eq!(u32_le(&bytes, 40), 3 * 512 * 4);
}

#[test]
fn second_start_is_rejected_without_disturbing_the_recording() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("busy.wav");
    let host = VirtualHost::single(VirtualDeviceSpec::new("mic", 48000.0, 2));
    let handle = host.handle("mic").unwrap();
    let delegate = Recording::new(DelegateCapabilities::NONE);
    let mut recorder = wave_recorder(&host, &path);
    recorder.set_delegate(Some(delegate.clone()));

    recorder.start().unwrap();
    handle.render_period();
    handle.render_period();
    assert_eq!(recorder.start(), Err(RecorderError::AlreadyRecording));
    assert!(recorder.is_recording());
    assert_eq!(
        recorder.set_output_file_path(dir.path().join("other.wav")),
        Err(RecorderError::AlreadyRecording)
    );
    handle.render_period();
    handle.render_period();

    let summary = recorder.stop().unwrap().unwrap();
    assert_eq!(summary.frames_written, 4 * 512);
    assert_eq!(summary.file_path, path);
    assert_eq!(delegate.events(), vec![Event::Started, Event::Stopped(None)]);
}

#[test]
fn stop_when_not_recording_is_silent() {
    let dir = tempfile::tempdir().unwrap();
    let host = VirtualHost::single(VirtualDeviceSpec::new("mic", 48000.0, 2));
    let delegate = Recording::new(DelegateCapabilities::ALL);
    let mut recorder = wave_recorder(&host, &dir.path().join("idle.wav"));
    recorder.set_delegate(Some(delegate.clone()));

    assert_eq!(recorder.stop(), Ok(None));
    recorder.prepare().unwrap();
    assert_eq!(recorder.stop(), Ok(None));
    assert_eq!(recorder.state(), RecorderState::Prepared);
    assert_eq!(recorder.pump_notifications(), 0);
    assert!(delegate.events().is_empty());
}

#[test]
fn duration_is_monotonic_and_amplitude_bounded() {
    let dir = tempfile::tempdir().unwrap();
    let host = VirtualHost::single(VirtualDeviceSpec::new("mic", 48000.0, 1).sine(1000.0, 0.5));
    let handle = host.handle("mic").unwrap();
    let delegate = Recording::new(DelegateCapabilities::ALL);
    let mut recorder = wave_recorder(&host, &dir.path().join("levels.wav"));
    recorder.set_delegate(Some(delegate.clone()));

    recorder.start().unwrap();
    for _ in 0..10 {
        handle.render_period();
    }
    recorder.pump_notifications();
    for _ in 0..10 {
        handle.render_period();
    }
    recorder.stop().unwrap().unwrap();

    let events = delegate.events();
    assert_eq!(events.first(), Some(&Event::Started));
    assert_eq!(events.last(), Some(&Event::Stopped(None)));

    let durations: Vec<f64> = events
        .iter()
        .filter_map(|e| match e {
            Event::Duration(d) => Some(*d),
            _ => None,
        })
        .collect();
    assert_eq!(durations.len(), 20);
    assert!(durations.windows(2).all(|w| w[1] >= w[0]));
    assert_relative_eq!(durations[0], 0.0);
    assert_relative_eq!(*durations.last().unwrap(), 19.0 * 512.0 / 48000.0, epsilon = 1e-9);

    let amplitudes: Vec<f32> = events
        .iter()
        .filter_map(|e| match e {
            Event::Amplitude(a) => Some(*a),
            _ => None,
        })
        .collect();
    assert_eq!(amplitudes.len(), 20);
    assert!(amplitudes.iter().all(|a| (0.0..=1.0).contains(a)));
    assert!(amplitudes.iter().all(|a| *a > 0.45));
}

#[test]
fn stop_only_delegate_gets_no_position_events() {
    let dir = tempfile::tempdir().unwrap();
    let host = VirtualHost::single(VirtualDeviceSpec::new("mic", 44100.0, 2).sine(220.0, 0.8));
    let handle = host.handle("mic").unwrap();
    let delegate = Recording::new(DelegateCapabilities::NONE);
    let mut recorder = wave_recorder(&host, &dir.path().join("quiet.wav"));
    recorder.set_delegate(Some(delegate.clone()));

    recorder.start().unwrap();
    for _ in 0..8 {
        handle.render_period();
    }
    recorder.stop().unwrap().unwrap();

    assert_eq!(recorder.diagnostics().events_posted, 0);
    assert_eq!(recorder.diagnostics().callback_count, 8);
    assert_eq!(delegate.count(|e| matches!(e, Event::Stopped(_))), 1);
    assert_eq!(
        delegate.count(|e| matches!(e, Event::Duration(_) | Event::Amplitude(_))),
        0
    );
}

#[test]
fn bad_paths_fail_with_file_open() {
    let dir = tempfile::tempdir().unwrap();
    let host = VirtualHost::single(VirtualDeviceSpec::new("mic", 48000.0, 2));
    let handle = host.handle("mic").unwrap();

    let mut recorder = wave_recorder(&host, Path::new(""));
    assert!(matches!(recorder.start(), Err(RecorderError::FileOpen(_))));
    assert_eq!(recorder.state(), RecorderState::Idle);
    assert!(!handle.is_open());

    let missing = dir.path().join("no/such/dir/take.wav");
    recorder.set_output_file_path(&missing).unwrap();
    assert!(matches!(recorder.start(), Err(RecorderError::FileOpen(_))));
    assert_eq!(recorder.state(), RecorderState::Idle);
    assert!(!handle.is_open());
    assert!(!missing.exists());
}

#[test]
fn device_without_inputs_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nothing.wav");
    let host = VirtualHost::single(VirtualDeviceSpec::new("speaker", 48000.0, 0));
    let mut recorder = wave_recorder(&host, &path);

    assert!(matches!(recorder.start(), Err(RecorderError::NoInputDevice(_))));
    assert_eq!(recorder.state(), RecorderState::Idle);
    assert!(!path.exists());
}

#[test]
fn unknown_device_id_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let host = VirtualHost::single(VirtualDeviceSpec::new("mic", 48000.0, 2));
    let mut recorder = wave_recorder(&host, &dir.path().join("x.wav"));
    recorder.set_device_id(Some("usb-interface".into())).unwrap();

    assert!(matches!(recorder.prepare(), Err(RecorderError::NoInputDevice(_))));
}

#[test]
fn start_failure_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("refused.wav");
    let host = VirtualHost::single(VirtualDeviceSpec::new("mic", 48000.0, 2).failing_start());
    let handle = host.handle("mic").unwrap();
    let delegate = Recording::new(DelegateCapabilities::ALL);
    let mut recorder = wave_recorder(&host, &path);
    recorder.set_delegate(Some(delegate.clone()));

    assert!(matches!(recorder.start(), Err(RecorderError::StartFailed(_))));
    assert_eq!(recorder.state(), RecorderState::Idle);
    assert!(!handle.is_open());
    assert!(!path.exists());
    assert!(delegate.events().is_empty());
}

#[cfg(target_os = "linux")]
#[test]
fn write_failure_stops_exactly_once() {
    let host = VirtualHost::single(VirtualDeviceSpec::new("mic", 48000.0, 2).sine(440.0, 0.5));
    let handle = host.handle("mic").unwrap();
    let delegate = Recording::new(DelegateCapabilities::NONE);
    let config = RecorderConfiguration {
        flush_threshold_bytes: 512,
        ..Default::default()
    };
    let mut recorder = SoundFileRecorder::new(host.clone(), config);
    recorder.set_output_file_path("/dev/full").unwrap();
    recorder.set_requested_output(wave_16()).unwrap();
    recorder.set_delegate(Some(delegate.clone()));

    recorder.start().unwrap();
    handle.render_period();
    assert!(!recorder.is_recording());

    recorder.pump_notifications();
    assert_eq!(recorder.state(), RecorderState::Idle);
    assert!(!handle.is_open());

    // Already stopped by the failure: no second notification.
    assert_eq!(recorder.stop(), Ok(None));
    recorder.pump_notifications();

    let stops: Vec<Event> = delegate
        .events()
        .into_iter()
        .filter(|e| matches!(e, Event::Stopped(_)))
        .collect();
    assert_eq!(stops.len(), 1);
    assert!(matches!(stops[0], Event::Stopped(Some(RecorderError::Write(_)))));
    assert!(Path::new("/dev/full").exists());
}

#[cfg(target_os = "linux")]
#[test]
fn failure_on_block_rendered_inside_start_follows_started() {
    let host = VirtualHost::single(
        VirtualDeviceSpec::new("mic", 48000.0, 2)
            .sine(440.0, 0.5)
            .renders_on_start(),
    );
    let handle = host.handle("mic").unwrap();
    let delegate = Recording::new(DelegateCapabilities::ALL);
    let config = RecorderConfiguration {
        flush_threshold_bytes: 512,
        ..Default::default()
    };
    let mut recorder = SoundFileRecorder::new(host.clone(), config);
    recorder.set_output_file_path("/dev/full").unwrap();
    recorder.set_requested_output(wave_16()).unwrap();
    recorder.set_delegate(Some(delegate.clone()));

    assert_eq!(recorder.start(), Ok(()));
    assert_eq!(recorder.state(), RecorderState::Idle);
    assert!(!handle.is_open());

    let events = delegate.events();
    assert_eq!(events.len(), 2, "{:?}", events);
    assert_eq!(events[0], Event::Started);
    assert!(matches!(events[1], Event::Stopped(Some(RecorderError::Write(_)))));

    assert_eq!(recorder.stop(), Ok(None));
    recorder.pump_notifications();
    assert_eq!(delegate.events().len(), 2);
}

#[test]
fn device_rendering_inside_start_records_normally() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("eager.wav");
    let host = VirtualHost::single(
        VirtualDeviceSpec::new("mic", 48000.0, 2)
            .sine(440.0, 0.5)
            .renders_on_start(),
    );
    let handle = host.handle("mic").unwrap();
    let delegate = Recording::new(DelegateCapabilities::ALL);
    let mut recorder = wave_recorder(&host, &path);
    recorder.set_delegate(Some(delegate.clone()));

    recorder.start().unwrap();
    handle.render_period();
    let summary = recorder.stop().unwrap().unwrap();

    assert_eq!(summary.frames_written, handle.frames_rendered());
    let events = delegate.events();
    assert_eq!(events.first(), Some(&Event::Started));
    assert_eq!(events.last(), Some(&Event::Stopped(None)));
    assert_eq!(delegate.count(|e| matches!(e, Event::Started)), 1);
}

#[test]
fn resamples_and_downmixes_to_requested_format() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("narrow.wav");
    let host = VirtualHost::single(VirtualDeviceSpec::new("mic", 48000.0, 2).sine(300.0, 0.25));
    let handle = host.handle("mic").unwrap();
    let mut recorder = SoundFileRecorder::with_output_file_path(host.clone(), &path);
    recorder
        .set_requested_output(OutputFormat::new(
            StreamFormatDescriptor::linear_pcm(16000.0, 1, 16, false, false),
            None,
        ))
        .unwrap();

    recorder.start().unwrap();
    for _ in 0..6 {
        handle.render_period();
    }
    let summary = recorder.stop().unwrap().unwrap();

    let actual = recorder.actual_output().unwrap();
    assert_eq!(actual.file_type, Some(FileType::Wave));
    assert_eq!(actual.stream.sample_rate, 16000.0);
    assert_eq!(actual.stream.channels_per_frame, 1);
    assert!((summary.frames_written as i64 - 1024).abs() <= 2);

    let bytes = std::fs::read(&path).unwrap();
    assert_eq!(u32_le(&bytes, 24), 16000);
    assert_eq!(u32_le(&bytes, 40) as u64, summary.frames_written * 2);
}

#[test]
fn metadata_sidecar_matches_summary() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.aiff");
    let host = VirtualHost::single(VirtualDeviceSpec::new("mic", 44100.0, 1).sine(440.0, 0.3));
    let handle = host.handle("mic").unwrap();
    let config = RecorderConfiguration {
        write_metadata: true,
        ..Default::default()
    };
    let mut recorder = SoundFileRecorder::new(host.clone(), config);
    recorder.set_output_file_path(&path).unwrap();
    recorder
        .set_requested_output(OutputFormat::new(
            StreamFormatDescriptor::linear_pcm(0.0, 0, 24, false, false),
            None,
        ))
        .unwrap();

    recorder.start().unwrap();
    for _ in 0..3 {
        handle.render_period();
    }
    let summary = recorder.stop().unwrap().unwrap();

    let sidecar = read_metadata(&path).unwrap();
    assert_eq!(sidecar.checksum, summary.checksum);
    assert_eq!(sidecar.frames_written, 3 * 512);
    assert_eq!(sidecar.bytes_written, summary.bytes_written);

    let bytes = std::fs::read(&path).unwrap();
    assert_eq!(&bytes[0..4], b"FORM");
    assert_eq!(&bytes[8..12], b"AIFF");
}

#[test]
fn clocked_device_records_in_real_time() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("live.caf");
    let host = VirtualHost::single(VirtualDeviceSpec::new("mic", 48000.0, 2).sine(440.0, 0.5).clocked());
    let delegate = Recording::new(DelegateCapabilities::ALL);
    let mut recorder = SoundFileRecorder::with_output_file_path(host.clone(), &path);
    recorder
        .set_requested_output(OutputFormat::new(
            StreamFormatDescriptor::linear_pcm(0.0, 0, 32, true, false),
            None,
        ))
        .unwrap();
    recorder.set_delegate(Some(delegate.clone()));

    recorder.start().unwrap();
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while recorder.diagnostics().frames_captured < 4 * 512 && std::time::Instant::now() < deadline {
        std::thread::sleep(std::time::Duration::from_millis(5));
        recorder.pump_notifications();
    }
    let summary = recorder.stop().unwrap().unwrap();

    assert!(summary.frames_written >= 4 * 512);
    assert_eq!(recorder.actual_output().unwrap().file_type, Some(FileType::Caf));
    let bytes = std::fs::read(&path).unwrap();
    assert_eq!(&bytes[0..4], b"caff");
    assert_eq!(delegate.count(|e| *e == Event::Started), 1);
    assert_eq!(delegate.count(|e| matches!(e, Event::Stopped(None))), 1);
}

#[cfg(feature = "aac")]
#[test]
fn m4a_request_records_adts_aac() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("memo.m4a");
    let host = VirtualHost::single(VirtualDeviceSpec::new("mic", 44100.0, 2).sine(440.0, 0.5));
    let handle = host.handle("mic").unwrap();
    let mut recorder = SoundFileRecorder::with_output_file_path(host.clone(), &path);

    recorder.start().unwrap();
    for _ in 0..20 {
        handle.render_period();
    }
    let summary = recorder.stop().unwrap().unwrap();

    assert_eq!(summary.format.file_type, Some(FileType::AacAdts));
    let bytes = std::fs::read(&path).unwrap();
    assert_eq!(bytes.len() as u64, summary.bytes_written);

    // Every input frame is in the stream, after the encoder's priming frames.
    let frames = adts_frame_count(&bytes);
    assert!(
        frames as u64 * 1024 >= handle.frames_rendered() + 1024,
        "{} ADTS frames for {} input frames",
        frames,
        handle.frames_rendered()
    );
}

#[cfg(feature = "aac")]
#[test]
fn short_aac_recording_is_not_just_priming() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("blip.aac");
    let host = VirtualHost::single(VirtualDeviceSpec::new("mic", 44100.0, 2).sine(440.0, 0.5));
    let handle = host.handle("mic").unwrap();
    let mut recorder = SoundFileRecorder::with_output_file_path(host.clone(), &path);

    recorder.start().unwrap();
    handle.render(512);
    recorder.stop().unwrap().unwrap();

    let bytes = std::fs::read(&path).unwrap();
    assert!(adts_frame_count(&bytes) >= 2);
}

#[cfg(feature = "aac")]
fn adts_frame_count(mut bytes: &[u8]) -> usize {
    let mut frames = 0;
    while bytes.len() >= 7 {
        assert_eq!(bytes[0], 0xFF);
        assert_eq!(bytes[1] & 0xF0, 0xF0);
        let len = (usize::from(bytes[3] & 0x03) << 11) | (usize::from(bytes[4]) << 3) | usize::from(bytes[5] >> 5);
        assert!(len >= 7 && len <= bytes.len());
        bytes = &bytes[len..];
        frames += 1;
    }
    assert!(bytes.is_empty());
    frames
}
