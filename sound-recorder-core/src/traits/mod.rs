pub mod audio_host;
pub mod input_device;
pub mod recorder_delegate;
