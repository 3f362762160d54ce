//! # sound-recorder-core
//!
//! Platform-agnostic capture-to-file recording engine.
//!
//! Provides format description and negotiation, real-time capture with
//! on-the-fly conversion and encoding, container writing, and the
//! notification bridge that reports progress without stalling the audio
//! path. Platform backends (cpal, or the in-process virtual host) implement
//! the `AudioHost`/`InputDevice` traits and plug into the generic
//! `SoundFileRecorder`.
//!
//! ## Architecture
//!
//! ```text
//! sound-recorder-core (this crate)
//! ├── traits/       ← AudioHost, InputDevice, HostClock, RecorderDelegate
//! ├── models/       ← RecorderError, RecorderState, RecorderConfiguration, StreamFormatDescriptor, etc.
//! ├── processing/   ← CaptureBuffer, channel mapping, LinearResampler, sample codecs, levels
//! ├── storage/      ← EncodedFileWriter and its disk thread, container headers, packet encoders, metadata
//! ├── session/      ← SoundFileRecorder, format resolver, NotificationBridge
//! └── devices/      ← VirtualHost (synthetic input devices)
//! ```
//!
//! ## Features
//!
//! - `aac` (default): AAC-LC output in ADTS framing, via libfdk-aac. Without
//!   it the default AAC output format cannot be prepared.

pub mod devices;
pub mod models;
pub mod processing;
pub mod session;
pub mod storage;
pub mod traits;

// Re-export key types at crate root for convenience.
pub use devices::{Signal, VirtualDeviceHandle, VirtualDeviceSpec, VirtualHost};
pub use models::audio_models::{InputDeviceInfo, RecorderDiagnostics};
pub use models::config::RecorderConfiguration;
pub use models::error::RecorderError;
pub use models::format::{
    format_tag_to_string, string_to_format_tag, FileType, FormatFlags, FormatTag, OutputFormat, PropertyMap,
    PropertyValue, StreamFormatDescriptor,
};
pub use models::recording_result::{RecordingMetadata, RecordingSummary};
pub use models::state::RecorderState;
pub use session::recorder::SoundFileRecorder;
pub use session::resolver::default_output_format;
pub use storage::file_writer::EncodedFileWriter;
pub use traits::audio_host::AudioHost;
pub use traits::input_device::{HostClock, InputBlock, InputDevice, MonotonicClock, RenderCallback};
pub use traits::recorder_delegate::{DelegateCapabilities, RecorderDelegate};
