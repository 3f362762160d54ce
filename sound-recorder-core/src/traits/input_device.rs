use std::sync::Arc;
use std::time::Instant;

use crate::models::error::RecorderError;
use crate::models::format::StreamFormatDescriptor;

/// One block of captured audio as delivered by a device.
#[derive(Debug, Clone, Copy)]
pub struct InputBlock<'a> {
    /// Interleaved f32 samples, `frames * channels` long.
    pub samples: &'a [f32],
    pub channels: u16,
    /// Host-clock time at which the block was captured.
    pub host_time: u64,
}

impl InputBlock<'_> {
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels as usize
        }
    }
}

/// Render callback invoked on the device's real-time thread.
pub type RenderCallback = Box<dyn FnMut(&InputBlock<'_>) + Send + 'static>;

/// Monotonic, hardware-style timestamp source.
pub trait HostClock: Send + Sync {
    fn now(&self) -> u64;
    fn ticks_per_second(&self) -> f64;
}

/// Host clock backed by [`Instant`], ticking in nanoseconds.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl HostClock for MonotonicClock {
    fn now(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }

    fn ticks_per_second(&self) -> f64 {
        1_000_000_000.0
    }
}

/// A platform capture device.
///
/// Implemented by:
/// - `CpalInputDevice` (sound-recorder-cpal)
/// - `VirtualInputDevice` (this crate)
///
/// Lifecycle: `open` registers the callback and configures the stream without
/// running it, `start` begins I/O, `close` halts it.
pub trait InputDevice: Send {
    fn id(&self) -> &str;

    /// Number of input channels; zero means the device cannot capture.
    fn input_channels(&self) -> Result<u32, RecorderError>;

    /// The device's current native stream format.
    fn native_format(&self) -> Result<StreamFormatDescriptor, RecorderError>;

    fn clock(&self) -> Arc<dyn HostClock>;

    /// Configure capture in `client_format` and register `callback`.
    fn open(
        &mut self,
        client_format: &StreamFormatDescriptor,
        period_frames: u32,
        callback: RenderCallback,
    ) -> Result<(), RecorderError>;

    /// Begin device I/O. Returns only once the device reports it is running.
    fn start(&mut self) -> Result<(), RecorderError>;

    fn is_running(&self) -> bool;

    /// Stop I/O and drop the callback.
    ///
    /// Must not return while the callback is still executing, and the callback
    /// must never be invoked afterwards. Idempotent.
    fn close(&mut self);
}
