pub mod capture_buffer;
pub mod channel_map;
pub mod levels;
pub mod resampler;
pub mod sample_codec;
