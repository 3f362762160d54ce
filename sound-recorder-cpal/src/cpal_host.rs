//! cpal input backend.
//!
//! Devices are identified by their cpal name. Every device is captured at
//! its default input configuration; samples of any integer or float format
//! are converted to interleaved f32 before they reach the render callback.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample, StreamConfig, SupportedStreamConfig};

use sound_recorder_core::models::audio_models::InputDeviceInfo;
use sound_recorder_core::models::error::RecorderError;
use sound_recorder_core::models::format::StreamFormatDescriptor;
use sound_recorder_core::traits::audio_host::AudioHost;
use sound_recorder_core::traits::input_device::{
    HostClock, InputBlock, InputDevice, MonotonicClock, RenderCallback,
};

/// An [`AudioHost`] over one cpal host (ALSA, CoreAudio, WASAPI, ...).
#[derive(Debug, Clone, Copy)]
pub struct CpalHost {
    host_id: cpal::HostId,
}

impl CpalHost {
    /// The platform's default cpal host.
    pub fn new() -> Self {
        Self {
            host_id: cpal::default_host().id(),
        }
    }

    pub fn with_host_id(host_id: cpal::HostId) -> Self {
        Self { host_id }
    }

    pub fn host_id(&self) -> cpal::HostId {
        self.host_id
    }

    fn host(&self) -> Result<cpal::Host, RecorderError> {
        cpal::host_from_id(self.host_id)
            .map_err(|e| RecorderError::DeviceUnavailable(format!("audio host unavailable: {}", e)))
    }
}

impl Default for CpalHost {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioHost for CpalHost {
    fn input_devices(&self) -> Result<Vec<InputDeviceInfo>, RecorderError> {
        let host = self.host()?;
        let default_name = host.default_input_device().and_then(|d| d.name().ok());
        let devices = host
            .input_devices()
            .map_err(|e| RecorderError::DeviceUnavailable(format!("failed to list input devices: {}", e)))?;

        let mut infos = Vec::new();
        for device in devices {
            let Ok(name) = device.name() else {
                continue;
            };
            let input_channels = device
                .default_input_config()
                .map(|config| u32::from(config.channels()))
                .unwrap_or(0);
            infos.push(InputDeviceInfo {
                is_default: default_name.as_deref() == Some(name.as_str()),
                id: name.clone(),
                name,
                input_channels,
            });
        }
        Ok(infos)
    }

    fn default_input_device_id(&self) -> Option<String> {
        self.host()
            .ok()?
            .default_input_device()
            .and_then(|d| d.name().ok())
    }

    fn open_input(&self, device_id: Option<&str>) -> Result<Box<dyn InputDevice>, RecorderError> {
        let host = self.host()?;
        let device = match device_id {
            None => host
                .default_input_device()
                .ok_or_else(|| RecorderError::NoInputDevice("no default input device".into()))?,
            Some(id) => host
                .input_devices()
                .map_err(|e| RecorderError::DeviceUnavailable(format!("failed to list input devices: {}", e)))?
                .find(|d| d.name().map(|name| name == id).unwrap_or(false))
                .ok_or_else(|| RecorderError::NoInputDevice(format!("no input device named {}", id)))?,
        };
        let id = device
            .name()
            .map_err(|e| RecorderError::DeviceUnavailable(format!("device has no name: {}", e)))?;
        log::debug!("opened cpal input {}", id);
        Ok(Box::new(CpalInputDevice::new(id, device)))
    }
}

/// One cpal input device.
pub struct CpalInputDevice {
    id: String,
    device: cpal::Device,
    clock: Arc<MonotonicClock>,
    stream: Option<cpal::Stream>,
    running: Arc<AtomicBool>,
}

// SAFETY: the stream is created, played and dropped only through `&mut self`,
// so it is never touched from two threads at once. The audio callback runs on
// cpal's own thread and only shares the `Send` closure and atomics.
unsafe impl Send for CpalInputDevice {}

impl CpalInputDevice {
    fn new(id: String, device: cpal::Device) -> Self {
        Self {
            id,
            device,
            clock: Arc::new(MonotonicClock::new()),
            stream: None,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    fn default_config(&self) -> Result<SupportedStreamConfig, RecorderError> {
        self.device.default_input_config().map_err(|e| {
            RecorderError::DeviceUnavailable(format!("{} has no input configuration: {}", self.id, e))
        })
    }

    fn build_stream<T>(
        &self,
        config: &StreamConfig,
        period_frames: u32,
        mut callback: RenderCallback,
    ) -> Result<cpal::Stream, RecorderError>
    where
        T: SizedSample + Send + 'static,
        f32: FromSample<T>,
    {
        let channels = config.channels;
        let clock = Arc::clone(&self.clock);
        let mut scratch: Vec<f32> = Vec::with_capacity(period_frames as usize * channels as usize * 4);
        let id = self.id.clone();

        self.device
            .build_input_stream(
                config,
                move |data: &[T], _: &cpal::InputCallbackInfo| {
                    scratch.clear();
                    scratch.extend(data.iter().map(|s| s.to_sample::<f32>()));
                    let block = InputBlock {
                        samples: &scratch,
                        channels,
                        host_time: clock.now(),
                    };
                    callback(&block);
                },
                move |err| log::error!("input stream error on {}: {}", id, err),
                None,
            )
            .map_err(|e| RecorderError::DeviceUnavailable(format!("failed to build input stream: {}", e)))
    }
}

impl InputDevice for CpalInputDevice {
    fn id(&self) -> &str {
        &self.id
    }

    fn input_channels(&self) -> Result<u32, RecorderError> {
        Ok(u32::from(self.default_config()?.channels()))
    }

    fn native_format(&self) -> Result<StreamFormatDescriptor, RecorderError> {
        let config = self.default_config()?;
        let format = config.sample_format();
        Ok(StreamFormatDescriptor::linear_pcm(
            f64::from(config.sample_rate().0),
            u32::from(config.channels()),
            (format.sample_size() * 8) as u32,
            format.is_float(),
            false,
        ))
    }

    fn clock(&self) -> Arc<dyn HostClock> {
        self.clock.clone()
    }

    fn open(
        &mut self,
        client_format: &StreamFormatDescriptor,
        period_frames: u32,
        callback: RenderCallback,
    ) -> Result<(), RecorderError> {
        if self.stream.is_some() {
            return Err(RecorderError::DeviceUnavailable(format!("{} is already open", self.id)));
        }
        let supported = self.default_config()?;
        let native_rate = f64::from(supported.sample_rate().0);
        if (client_format.sample_rate - native_rate).abs() > 0.5
            || client_format.channels_per_frame != u32::from(supported.channels())
        {
            return Err(RecorderError::DeviceUnavailable(format!(
                "{} runs at {} Hz / {} ch, asked for {} Hz / {} ch",
                self.id,
                native_rate,
                supported.channels(),
                client_format.sample_rate,
                client_format.channels_per_frame
            )));
        }

        let sample_format = supported.sample_format();
        let config: StreamConfig = supported.into();
        let stream = match sample_format {
            SampleFormat::F32 => self.build_stream::<f32>(&config, period_frames, callback),
            SampleFormat::F64 => self.build_stream::<f64>(&config, period_frames, callback),
            SampleFormat::I8 => self.build_stream::<i8>(&config, period_frames, callback),
            SampleFormat::I16 => self.build_stream::<i16>(&config, period_frames, callback),
            SampleFormat::I32 => self.build_stream::<i32>(&config, period_frames, callback),
            SampleFormat::U8 => self.build_stream::<u8>(&config, period_frames, callback),
            SampleFormat::U16 => self.build_stream::<u16>(&config, period_frames, callback),
            SampleFormat::U32 => self.build_stream::<u32>(&config, period_frames, callback),
            other => Err(RecorderError::UnsupportedConversion(format!(
                "{} delivers unsupported sample format {}",
                self.id, other
            ))),
        }?;

        // Some backends start streams on creation.
        if let Err(e) = stream.pause() {
            log::debug!("could not pause new stream on {}: {}", self.id, e);
        }
        self.stream = Some(stream);
        Ok(())
    }

    fn start(&mut self) -> Result<(), RecorderError> {
        let stream = self
            .stream
            .as_ref()
            .ok_or_else(|| RecorderError::StartFailed("device is not open".into()))?;
        stream
            .play()
            .map_err(|e| RecorderError::StartFailed(format!("{}: {}", self.id, e)))?;
        self.running.store(true, Ordering::Release);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn close(&mut self) {
        self.running.store(false, Ordering::Release);
        // Dropping the stream stops it and releases the callback.
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.pause() {
                log::debug!("pause on close failed for {}: {}", self.id, e);
            }
            drop(stream);
        }
    }
}

impl Drop for CpalInputDevice {
    fn drop(&mut self) {
        self.close();
    }
}
