use crate::models::error::RecorderError;
use crate::models::format::{FormatTag, StreamFormatDescriptor};
use crate::processing::sample_codec::SampleEncoding;

/// Turns interleaved f32 frames into the bytes of an output stream.
///
/// Implemented by:
/// - [`SampleEncoder`]: linear PCM and G.711, one sample at a time
/// - `AacEncoder` (feature `aac`): ADTS-framed AAC-LC via fdk-aac
///
/// `encode` runs on the render thread and must not allocate once `out`
/// has been reserved for [`max_encoded_len`](Self::max_encoded_len) bytes.
pub trait PacketEncoder: Send {
    fn encode(&mut self, samples: &[f32], out: &mut Vec<u8>) -> Result<(), RecorderError>;

    /// Emit whatever is still buffered at end of stream.
    fn finish(&mut self, out: &mut Vec<u8>) -> Result<(), RecorderError>;

    /// Upper bound on bytes produced by one `encode` of `frames` frames.
    fn max_encoded_len(&self, frames: usize) -> usize;
}

/// Build the encoder for a negotiated output stream.
pub fn encoder_for(stream: &StreamFormatDescriptor) -> Result<Box<dyn PacketEncoder>, RecorderError> {
    if stream.format_id == FormatTag::MPEG4_AAC {
        return aac_encoder(stream);
    }
    Ok(Box::new(SampleEncoder::new(stream)?))
}

#[cfg(feature = "aac")]
fn aac_encoder(stream: &StreamFormatDescriptor) -> Result<Box<dyn PacketEncoder>, RecorderError> {
    Ok(Box::new(aac::AacEncoder::new(stream)?))
}

#[cfg(not(feature = "aac"))]
fn aac_encoder(_stream: &StreamFormatDescriptor) -> Result<Box<dyn PacketEncoder>, RecorderError> {
    Err(RecorderError::UnsupportedConversion(
        "AAC encoding requires the `aac` feature".into(),
    ))
}

/// Per-sample encoder for PCM and G.711 streams.
#[derive(Debug, Clone)]
pub struct SampleEncoder {
    encoding: SampleEncoding,
    channels: usize,
}

impl SampleEncoder {
    pub fn new(stream: &StreamFormatDescriptor) -> Result<Self, RecorderError> {
        Ok(Self {
            encoding: SampleEncoding::for_stream(stream)?,
            channels: stream.channels_per_frame.max(1) as usize,
        })
    }

    pub fn encoding(&self) -> SampleEncoding {
        self.encoding
    }
}

impl PacketEncoder for SampleEncoder {
    fn encode(&mut self, samples: &[f32], out: &mut Vec<u8>) -> Result<(), RecorderError> {
        self.encoding.encode(samples, out);
        Ok(())
    }

    fn finish(&mut self, _out: &mut Vec<u8>) -> Result<(), RecorderError> {
        Ok(())
    }

    fn max_encoded_len(&self, frames: usize) -> usize {
        frames * self.channels * self.encoding.bytes_per_sample()
    }
}

#[cfg(feature = "aac")]
pub(crate) mod aac {
    use fdk_aac::enc::{AudioObjectType, BitRate, ChannelMode, Encoder, EncoderParams, Transport};

    use super::PacketEncoder;
    use crate::models::error::RecorderError;
    use crate::models::format::StreamFormatDescriptor;
    use crate::processing::sample_codec::f32_to_i16;

    const FRAMES_PER_PACKET: usize = 1024;
    /// Lookahead assumed when the library does not report one.
    const FALLBACK_DELAY_FRAMES: u64 = 2048;
    /// Generous bound for one ADTS frame per channel.
    const MAX_PACKET_BYTES_PER_CHANNEL: usize = 6144 / 8 + 7;

    /// AAC-LC encoder producing ADTS frames.
    ///
    /// Input is gathered into whole 1024-frame packets before it reaches
    /// fdk-aac. At `finish` the last partial packet is padded with silence,
    /// then silent packets are fed until the encoder's lookahead has come out,
    /// so the stream covers every input frame.
    pub struct AacEncoder {
        inner: Encoder,
        channels: usize,
        pending: Vec<i16>,
        scratch: Vec<u8>,
        delay_frames: u64,
        frames_in: u64,
        packets_out: u64,
    }

    // SAFETY: the fdk-aac handle is only touched through `&mut self`, so it is
    // never used from two threads at once. The library keeps no thread-local
    // state tied to the creating thread.
    unsafe impl Send for AacEncoder {}

    impl AacEncoder {
        pub fn new(stream: &StreamFormatDescriptor) -> Result<Self, RecorderError> {
            let channels = match stream.channels_per_frame {
                1 => ChannelMode::Mono,
                2 => ChannelMode::Stereo,
                n => {
                    return Err(RecorderError::FormatNegotiation(format!(
                        "AAC output supports 1 or 2 channels, got {}",
                        n
                    )))
                }
            };
            let params = EncoderParams {
                bit_rate: BitRate::VbrMedium,
                sample_rate: stream.sample_rate.round() as u32,
                transport: Transport::Adts,
                channels,
                audio_object_type: AudioObjectType::Mpeg4LowComplexity,
            };
            let inner = Encoder::new(params).map_err(|e| {
                RecorderError::FormatNegotiation(format!("AAC encoder rejected format: {:?}", e))
            })?;
            let delay_frames = match inner.info() {
                Ok(info) => u64::from(info.nDelay),
                Err(e) => {
                    log::debug!(
                        "AAC encoder info unavailable ({:?}), assuming {} frames delay",
                        e,
                        FALLBACK_DELAY_FRAMES
                    );
                    FALLBACK_DELAY_FRAMES
                }
            };
            let channels = stream.channels_per_frame as usize;
            Ok(Self {
                inner,
                channels,
                pending: Vec::with_capacity(FRAMES_PER_PACKET * channels),
                scratch: vec![0u8; MAX_PACKET_BYTES_PER_CHANNEL * channels],
                delay_frames,
                frames_in: 0,
                packets_out: 0,
            })
        }

        /// Encoder lookahead in frames.
        pub fn delay_frames(&self) -> u64 {
            self.delay_frames
        }

        fn encode_pending(&mut self, out: &mut Vec<u8>) -> Result<(), RecorderError> {
            let mut offset = 0;
            while offset < self.pending.len() {
                let info = self
                    .inner
                    .encode(&self.pending[offset..], &mut self.scratch)
                    .map_err(|e| RecorderError::Write(format!("AAC encode failed: {:?}", e)))?;
                out.extend_from_slice(&self.scratch[..info.output_size]);
                if info.output_size > 0 {
                    self.packets_out += 1;
                }
                if info.input_consumed == 0 && info.output_size == 0 {
                    break;
                }
                offset += info.input_consumed;
            }
            self.pending.clear();
            Ok(())
        }
    }

    impl PacketEncoder for AacEncoder {
        fn encode(&mut self, samples: &[f32], out: &mut Vec<u8>) -> Result<(), RecorderError> {
            let packet_len = FRAMES_PER_PACKET * self.channels;
            self.frames_in += (samples.len() / self.channels) as u64;
            for &sample in samples {
                self.pending.push(f32_to_i16(sample));
                if self.pending.len() == packet_len {
                    self.encode_pending(out)?;
                }
            }
            Ok(())
        }

        fn finish(&mut self, out: &mut Vec<u8>) -> Result<(), RecorderError> {
            if self.frames_in == 0 {
                return Ok(());
            }
            let packet_len = FRAMES_PER_PACKET * self.channels;
            if !self.pending.is_empty() {
                self.pending.resize(packet_len, 0);
                self.encode_pending(out)?;
            }

            let frames = self.frames_in + self.delay_frames;
            let needed = frames.div_ceil(FRAMES_PER_PACKET as u64);
            // Bounded in case the encoder keeps swallowing packets.
            let mut budget = needed + 4;
            while self.packets_out < needed && budget > 0 {
                self.pending.resize(packet_len, 0);
                self.encode_pending(out)?;
                budget -= 1;
            }
            if self.packets_out < needed {
                log::warn!(
                    "AAC stream ends {} packets short of its input",
                    needed - self.packets_out
                );
            }
            Ok(())
        }

        fn max_encoded_len(&self, frames: usize) -> usize {
            let packets = frames / FRAMES_PER_PACKET + 2;
            packets * MAX_PACKET_BYTES_PER_CHANNEL * self.channels
        }
    }
}
