use std::path::Path;

use crate::models::error::RecorderError;
use crate::models::format::{FileType, FormatFlags, FormatTag, OutputFormat, StreamFormatDescriptor};
use crate::storage::container::Container;
use crate::traits::audio_host::AudioHost;
use crate::traits::input_device::InputDevice;

/// An opened input device together with its native stream format.
pub struct ResolvedInput {
    pub device: Box<dyn InputDevice>,
    pub native: StreamFormatDescriptor,
}

/// Open the selected device and read its native format.
///
/// Fails with `NoInputDevice` when the device is missing or has no input
/// channels. The native sample rate and channel count are authoritative for
/// the capture side.
pub fn resolve_input_format(
    host: &dyn AudioHost,
    device_id: Option<&str>,
) -> Result<ResolvedInput, RecorderError> {
    let device = host.open_input(device_id)?;
    let channels = device.input_channels()?;
    if channels == 0 {
        return Err(RecorderError::NoInputDevice(format!(
            "device {} has no input channels",
            device.id()
        )));
    }

    let mut native = device.native_format()?;
    if native.channels_per_frame == 0 {
        native.channels_per_frame = channels;
    }
    if !(native.sample_rate.is_finite() && native.sample_rate > 0.0) {
        return Err(RecorderError::DeviceUnavailable(format!(
            "device {} reports no usable sample rate",
            device.id()
        )));
    }

    log::debug!(
        "resolved input {}: {} Hz, {} channels",
        device.id(),
        native.sample_rate,
        native.channels_per_frame
    );
    Ok(ResolvedInput { device, native })
}

/// The capture-side format: non-interleaved float32 at the native rate.
pub fn client_format(native: &StreamFormatDescriptor) -> StreamFormatDescriptor {
    StreamFormatDescriptor::float32_non_interleaved(native.sample_rate, native.channels_per_frame)
}

/// AAC, stereo, 44.1 kHz; container chosen from the file extension.
pub fn default_output_format() -> OutputFormat {
    OutputFormat::new(StreamFormatDescriptor::aac(44100.0, 2), None)
}

/// Turn a requested output format into a concrete, writable one.
///
/// Zero fields are filled from `client` (rate, channels) or from codec
/// defaults. The container comes from `requested.file_type`, then the path
/// extension, then the codec (CAF for sample formats, ADTS for AAC). Byte
/// order and signedness are forced to what the container mandates.
pub fn negotiate_output_format(
    requested: &OutputFormat,
    client: &StreamFormatDescriptor,
    path: &Path,
) -> Result<OutputFormat, RecorderError> {
    let mut stream = requested.stream;
    if stream.sample_rate == 0.0 {
        stream.sample_rate = client.sample_rate;
    }
    if stream.channels_per_frame == 0 {
        stream.channels_per_frame = client.channels_per_frame;
    }

    let mut file_type = requested
        .file_type
        .or_else(|| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .and_then(FileType::from_extension)
        })
        .unwrap_or(if stream.format_id == FormatTag::MPEG4_AAC {
            FileType::AacAdts
        } else {
            FileType::Caf
        });

    if stream.format_id == FormatTag::LINEAR_PCM {
        stream = negotiate_pcm(stream, file_type)?;
    } else if stream.format_id == FormatTag::ULAW || stream.format_id == FormatTag::ALAW {
        stream = StreamFormatDescriptor::g711(stream.format_id, stream.sample_rate, stream.channels_per_frame);
    } else if stream.format_id == FormatTag::MPEG4_AAC {
        if !matches!(stream.channels_per_frame, 1 | 2) {
            return Err(RecorderError::FormatNegotiation(format!(
                "AAC output supports 1 or 2 channels, got {}",
                stream.channels_per_frame
            )));
        }
        stream = StreamFormatDescriptor::aac(stream.sample_rate, stream.channels_per_frame);
        if matches!(file_type, FileType::M4a | FileType::Mpeg4) {
            log::warn!(
                "{} holds raw ADTS AAC, not an {} container; see the actual output format",
                path.display(),
                file_type
            );
            file_type = FileType::AacAdts;
        }
    } else {
        return Err(RecorderError::UnsupportedConversion(format!(
            "no encoder for {}",
            stream.format_id
        )));
    }

    stream.validate().map_err(RecorderError::FormatNegotiation)?;
    Container::for_output(file_type, &stream)?;
    Ok(OutputFormat::new(stream, Some(file_type)))
}

fn negotiate_pcm(
    requested: StreamFormatDescriptor,
    file_type: FileType,
) -> Result<StreamFormatDescriptor, RecorderError> {
    let float = requested.is_float();
    let bits = match requested.bits_per_channel {
        0 if float => 32,
        0 => 16,
        bits => bits,
    };
    let valid = if float {
        matches!(bits, 32 | 64)
    } else {
        matches!(bits, 8 | 16 | 24 | 32)
    };
    if !valid {
        return Err(RecorderError::FormatNegotiation(format!(
            "{}-bit {} PCM is not supported",
            bits,
            if float { "float" } else { "integer" }
        )));
    }

    let big_endian = match file_type {
        FileType::Wave => false,
        FileType::Aiff | FileType::Next => true,
        FileType::Aifc => requested.is_big_endian() || float || bits != 16,
        _ => requested.is_big_endian(),
    };

    let mut stream = StreamFormatDescriptor::linear_pcm(
        requested.sample_rate,
        requested.channels_per_frame,
        bits,
        float,
        big_endian,
    );
    if file_type == FileType::Wave && bits == 8 {
        stream.format_flags = stream.format_flags.with(FormatFlags::IS_SIGNED_INTEGER, false);
    }
    Ok(stream)
}
