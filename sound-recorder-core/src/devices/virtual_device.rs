//! In-process input devices that synthesize their signal.
//!
//! A [`VirtualHost`] serves one or more [`VirtualDeviceSpec`]s. Each device
//! runs in one of two modes:
//!
//! - **manual**: nothing happens until the test calls
//!   [`VirtualDeviceHandle::render`]; the host clock advances one tick per
//!   rendered frame, so elapsed time is exact;
//! - **clocked**: a named thread renders one period at a time, sleeping for
//!   the period's duration in between, like a real device.

use std::collections::HashMap;
use std::f64::consts::TAU;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use crate::models::audio_models::InputDeviceInfo;
use crate::models::error::RecorderError;
use crate::models::format::StreamFormatDescriptor;
use crate::traits::audio_host::AudioHost;
use crate::traits::input_device::{HostClock, InputBlock, InputDevice, RenderCallback};

/// What a virtual device "hears".
#[derive(Debug, Clone)]
pub enum Signal {
    Silence,
    /// Same tone on every channel.
    Sine { frequency: f64, amplitude: f32 },
    /// Interleaved samples, looped.
    Samples(Arc<Vec<f32>>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveMode {
    Manual,
    Clocked,
}

#[derive(Debug, Clone)]
pub struct VirtualDeviceSpec {
    pub id: String,
    pub name: String,
    pub sample_rate: f64,
    pub channels: u32,
    pub signal: Signal,
    pub mode: DriveMode,
    /// `start` fails with `StartFailed`.
    pub fail_start: bool,
    /// `start` delivers one period before it returns, as some backends do.
    pub render_on_start: bool,
}

impl VirtualDeviceSpec {
    /// A silent, manually driven device.
    pub fn new(id: impl Into<String>, sample_rate: f64, channels: u32) -> Self {
        let id = id.into();
        Self {
            name: format!("Virtual {}", id),
            id,
            sample_rate,
            channels,
            signal: Signal::Silence,
            mode: DriveMode::Manual,
            fail_start: false,
            render_on_start: false,
        }
    }

    pub fn signal(mut self, signal: Signal) -> Self {
        self.signal = signal;
        self
    }

    pub fn sine(self, frequency: f64, amplitude: f32) -> Self {
        self.signal(Signal::Sine {
            frequency,
            amplitude,
        })
    }

    pub fn clocked(mut self) -> Self {
        self.mode = DriveMode::Clocked;
        self
    }

    pub fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    pub fn renders_on_start(mut self) -> Self {
        self.render_on_start = true;
        self
    }
}

/// Host clock advanced explicitly, one tick per frame.
#[derive(Debug)]
pub struct ManualClock {
    ticks: AtomicU64,
    ticks_per_second: f64,
}

impl ManualClock {
    pub fn new(ticks_per_second: f64) -> Self {
        Self {
            ticks: AtomicU64::new(0),
            ticks_per_second,
        }
    }

    pub fn advance(&self, ticks: u64) {
        self.ticks.fetch_add(ticks, Ordering::AcqRel);
    }
}

impl HostClock for ManualClock {
    fn now(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }

    fn ticks_per_second(&self) -> f64 {
        self.ticks_per_second
    }
}

/// Device state shared between the device, its handle and its render thread.
struct Slot {
    spec: VirtualDeviceSpec,
    clock: Arc<ManualClock>,
    stream: Mutex<StreamState>,
    running: AtomicBool,
    frames_rendered: AtomicU64,
}

#[derive(Default)]
struct StreamState {
    callback: Option<RenderCallback>,
    period_frames: u32,
    cursor: u64,
    scratch: Vec<f32>,
}

impl Slot {
    fn new(spec: VirtualDeviceSpec) -> Self {
        Self {
            clock: Arc::new(ManualClock::new(spec.sample_rate)),
            spec,
            stream: Mutex::new(StreamState::default()),
            running: AtomicBool::new(false),
            frames_rendered: AtomicU64::new(0),
        }
    }

    /// Synthesize `frames` frames and hand them to the callback.
    ///
    /// Holds the stream lock for the whole callback, which is what lets
    /// `close` wait for an in-flight callback.
    fn render(&self, frames: usize) -> bool {
        if !self.running.load(Ordering::Acquire) {
            return false;
        }
        let mut stream = self.stream.lock();
        let StreamState {
            callback,
            cursor,
            scratch,
            ..
        } = &mut *stream;
        let Some(callback) = callback.as_mut() else {
            return false;
        };

        let channels = self.spec.channels as usize;
        scratch.clear();
        for frame in 0..frames as u64 {
            let index = *cursor + frame;
            for c in 0..channels {
                scratch.push(sample_at(&self.spec.signal, self.spec.sample_rate, index, c, channels));
            }
        }
        *cursor += frames as u64;

        let block = InputBlock {
            samples: scratch.as_slice(),
            channels: channels as u16,
            host_time: self.clock.now(),
        };
        callback(&block);
        self.clock.advance(frames as u64);
        self.frames_rendered.fetch_add(frames as u64, Ordering::Relaxed);
        true
    }
}

fn sample_at(signal: &Signal, sample_rate: f64, frame: u64, channel: usize, channels: usize) -> f32 {
    match signal {
        Signal::Silence => 0.0,
        Signal::Sine {
            frequency,
            amplitude,
        } => ((frame as f64 * frequency * TAU / sample_rate).sin() as f32) * amplitude,
        Signal::Samples(samples) if !samples.is_empty() => {
            let index = (frame as usize * channels + channel) % samples.len();
            samples[index]
        }
        Signal::Samples(_) => 0.0,
    }
}

/// An [`AudioHost`] serving virtual devices. Clones share the same devices.
#[derive(Clone, Default)]
pub struct VirtualHost {
    slots: Arc<Mutex<HashMap<String, Arc<Slot>>>>,
    order: Arc<Mutex<Vec<String>>>,
}

impl VirtualHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// A host with one device, which is also the default.
    pub fn single(spec: VirtualDeviceSpec) -> Self {
        let host = Self::new();
        host.add_device(spec);
        host
    }

    /// Add a device. The first device added is the default.
    pub fn add_device(&self, spec: VirtualDeviceSpec) {
        let id = spec.id.clone();
        self.slots.lock().insert(id.clone(), Arc::new(Slot::new(spec)));
        let mut order = self.order.lock();
        if !order.contains(&id) {
            order.push(id);
        }
    }

    /// Test-side handle for driving and inspecting a device.
    pub fn handle(&self, id: &str) -> Option<VirtualDeviceHandle> {
        self.slots
            .lock()
            .get(id)
            .map(|slot| VirtualDeviceHandle { slot: Arc::clone(slot) })
    }
}

impl AudioHost for VirtualHost {
    fn input_devices(&self) -> Result<Vec<InputDeviceInfo>, RecorderError> {
        let slots = self.slots.lock();
        let order = self.order.lock();
        Ok(order
            .iter()
            .enumerate()
            .filter_map(|(i, id)| {
                slots.get(id).map(|slot| InputDeviceInfo {
                    id: slot.spec.id.clone(),
                    name: slot.spec.name.clone(),
                    is_default: i == 0,
                    input_channels: slot.spec.channels,
                })
            })
            .collect())
    }

    fn default_input_device_id(&self) -> Option<String> {
        self.order.lock().first().cloned()
    }

    fn open_input(&self, device_id: Option<&str>) -> Result<Box<dyn InputDevice>, RecorderError> {
        let id = match device_id {
            Some(id) => id.to_string(),
            None => self
                .default_input_device_id()
                .ok_or_else(|| RecorderError::NoInputDevice("no virtual devices".into()))?,
        };
        let slot = self
            .slots
            .lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| RecorderError::NoInputDevice(format!("no virtual device {}", id)))?;
        Ok(Box::new(VirtualInputDevice { slot, worker: None }))
    }
}

/// The [`InputDevice`] end of a virtual device.
pub struct VirtualInputDevice {
    slot: Arc<Slot>,
    worker: Option<JoinHandle<()>>,
}

impl InputDevice for VirtualInputDevice {
    fn id(&self) -> &str {
        &self.slot.spec.id
    }

    fn input_channels(&self) -> Result<u32, RecorderError> {
        Ok(self.slot.spec.channels)
    }

    fn native_format(&self) -> Result<StreamFormatDescriptor, RecorderError> {
        Ok(StreamFormatDescriptor::linear_pcm(
            self.slot.spec.sample_rate,
            self.slot.spec.channels,
            32,
            true,
            false,
        ))
    }

    fn clock(&self) -> Arc<dyn HostClock> {
        self.slot.clock.clone()
    }

    fn open(
        &mut self,
        client_format: &StreamFormatDescriptor,
        period_frames: u32,
        callback: RenderCallback,
    ) -> Result<(), RecorderError> {
        let spec = &self.slot.spec;
        if (client_format.sample_rate - spec.sample_rate).abs() > 0.5
            || client_format.channels_per_frame != spec.channels
        {
            return Err(RecorderError::DeviceUnavailable(format!(
                "{} runs at {} Hz / {} ch, asked for {} Hz / {} ch",
                spec.id,
                spec.sample_rate,
                spec.channels,
                client_format.sample_rate,
                client_format.channels_per_frame
            )));
        }
        let mut stream = self.slot.stream.lock();
        if stream.callback.is_some() {
            return Err(RecorderError::DeviceUnavailable(format!("{} is already open", spec.id)));
        }
        stream.callback = Some(callback);
        stream.period_frames = period_frames.max(1);
        stream.cursor = 0;
        stream.scratch = Vec::with_capacity(period_frames as usize * spec.channels as usize);
        Ok(())
    }

    fn start(&mut self) -> Result<(), RecorderError> {
        if self.slot.spec.fail_start {
            return Err(RecorderError::StartFailed(format!(
                "{} refused to start",
                self.slot.spec.id
            )));
        }
        let period = {
            let stream = self.slot.stream.lock();
            if stream.callback.is_none() {
                return Err(RecorderError::StartFailed("device is not open".into()));
            }
            stream.period_frames
        };
        self.slot.running.store(true, Ordering::Release);
        if self.slot.spec.render_on_start {
            self.slot.render(period as usize);
        }

        if self.slot.spec.mode == DriveMode::Clocked && self.worker.is_none() {
            let slot = Arc::clone(&self.slot);
            let interval = Duration::from_secs_f64(f64::from(period) / slot.spec.sample_rate);
            let worker = thread::Builder::new()
                .name(format!("virtual-input-{}", slot.spec.id))
                .spawn(move || {
                    while slot.render(period as usize) {
                        thread::sleep(interval);
                    }
                })
                .map_err(|e| RecorderError::StartFailed(format!("failed to spawn render thread: {}", e)))?;
            self.worker = Some(worker);
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.slot.running.load(Ordering::Acquire)
    }

    fn close(&mut self) {
        self.slot.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::warn!("virtual render thread for {} panicked", self.slot.spec.id);
            }
        }
        // Waits for an in-flight manual render to finish.
        self.slot.stream.lock().callback = None;
    }
}

impl Drop for VirtualInputDevice {
    fn drop(&mut self) {
        self.close();
    }
}

/// Drives and inspects a virtual device from test code.
#[derive(Clone)]
pub struct VirtualDeviceHandle {
    slot: Arc<Slot>,
}

impl VirtualDeviceHandle {
    /// Deliver `frames` frames to the registered callback. Returns false if
    /// the device is not running.
    pub fn render(&self, frames: usize) -> bool {
        self.slot.render(frames)
    }

    /// Deliver one configured period.
    pub fn render_period(&self) -> bool {
        let period = self.slot.stream.lock().period_frames as usize;
        self.render(period.max(1))
    }

    pub fn is_open(&self) -> bool {
        self.slot.stream.lock().callback.is_some()
    }

    pub fn is_running(&self) -> bool {
        self.slot.running.load(Ordering::Acquire)
    }

    pub fn frames_rendered(&self) -> u64 {
        self.slot.frames_rendered.load(Ordering::Relaxed)
    }

    pub fn clock(&self) -> Arc<ManualClock> {
        Arc::clone(&self.slot.clock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_counting(device: &mut Box<dyn InputDevice>, period: u32) -> Arc<Mutex<Vec<(usize, u64)>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let client = StreamFormatDescriptor::float32_non_interleaved(48000.0, 2);
        device
            .open(
                &client,
                period,
                Box::new(move |block: &InputBlock<'_>| {
                    sink.lock().push((block.frames(), block.host_time));
                }),
            )
            .unwrap();
        seen
    }

    #[test]
    fn lists_default_first() {
        let host = VirtualHost::new();
        host.add_device(VirtualDeviceSpec::new("a", 48000.0, 2));
        host.add_device(VirtualDeviceSpec::new("b", 44100.0, 1));

        let devices = host.input_devices().unwrap();
        assert_eq!(devices.len(), 2);
        assert!(devices[0].is_default);
        assert_eq!(devices[1].id, "b");
        assert_eq!(host.default_input_device_id().as_deref(), Some("a"));
    }

    #[test]
    fn unknown_device_is_no_input_device() {
        let host = VirtualHost::single(VirtualDeviceSpec::new("a", 48000.0, 2));
        assert!(matches!(
            host.open_input(Some("zzz")),
            Err(RecorderError::NoInputDevice(_))
        ));
    }

    #[test]
    fn manual_render_advances_clock() {
        let host = VirtualHost::single(VirtualDeviceSpec::new("mic", 48000.0, 2));
        let handle = host.handle("mic").unwrap();
        let mut device = host.open_input(None).unwrap();
        let seen = open_counting(&mut device, 256);

        assert!(!handle.render_period());
        device.start().unwrap();
        assert!(handle.render_period());
        assert!(handle.render(100));

        assert_eq!(*seen.lock(), vec![(256, 0), (100, 256)]);
        assert_eq!(handle.clock().now(), 356);

        device.close();
        assert!(!handle.render_period());
        assert!(!handle.is_open());
    }

    #[test]
    fn clocked_device_renders_on_its_own() {
        let host = VirtualHost::single(VirtualDeviceSpec::new("mic", 48000.0, 2).clocked());
        let handle = host.handle("mic").unwrap();
        let mut device = host.open_input(None).unwrap();
        let seen = open_counting(&mut device, 480);
        device.start().unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while seen.lock().len() < 3 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        device.close();

        let count = seen.lock().len();
        assert!(count >= 3);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(seen.lock().len(), count);
        assert!(!handle.is_running());
    }

    #[test]
    fn sine_signal_stays_in_range() {
        let signal = Signal::Sine {
            frequency: 1000.0,
            amplitude: 0.5,
        };
        for frame in 0..480 {
            let s = sample_at(&signal, 48000.0, frame, 0, 1);
            assert!(s.abs() <= 0.5 + 1e-6);
        }
        assert!((sample_at(&signal, 48000.0, 12, 0, 1) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn failing_start_reports_start_failed() {
        let host = VirtualHost::single(VirtualDeviceSpec::new("mic", 48000.0, 2).failing_start());
        let mut device = host.open_input(None).unwrap();
        let _seen = open_counting(&mut device, 64);
        assert!(matches!(device.start(), Err(RecorderError::StartFailed(_))));
    }

    #[test]
    fn render_on_start_delivers_before_start_returns() {
        let host = VirtualHost::single(VirtualDeviceSpec::new("mic", 48000.0, 2).renders_on_start());
        let mut device = host.open_input(None).unwrap();
        let seen = open_counting(&mut device, 128);
        device.start().unwrap();
        assert_eq!(*seen.lock(), vec![(128, 0)]);
    }
}
