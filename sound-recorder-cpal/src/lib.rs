//! # sound-recorder-cpal
//!
//! cpal backend for sound-recorder-core.
//!
//! Provides:
//! - `CpalHost`: lists input devices and opens them by name
//! - `CpalInputDevice`: an input stream at the device's default configuration,
//!   converted to interleaved f32 for the recorder's render callback
//!
//! The `soundrec` binary in this crate is a command-line front end.
//!
//! ## Usage
//! ```ignore
//! use sound_recorder_cpal::CpalHost;
//! use sound_recorder_core::SoundFileRecorder;
//!
//! let mut recorder = SoundFileRecorder::with_output_file_path(CpalHost::new(), "memo.wav");
//! recorder.start()?;
//! // ...
//! let summary = recorder.stop()?;
//! ```

pub mod cpal_host;

pub use cpal_host::{CpalHost, CpalInputDevice};
