use crate::models::error::RecorderError;
use crate::models::format::{FormatFlags, FormatTag, StreamFormatDescriptor};

/// How one f32 sample in `[-1.0, 1.0]` becomes bytes in the output stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleEncoding {
    /// Offset-binary 8-bit PCM (WAVE convention).
    UnsignedInt8,
    SignedInt { bytes: u8, big_endian: bool },
    Float32 { big_endian: bool },
    Float64 { big_endian: bool },
    ULaw,
    ALaw,
}

impl SampleEncoding {
    /// Pick the encoding for a negotiated PCM or G.711 stream.
    pub fn for_stream(format: &StreamFormatDescriptor) -> Result<Self, RecorderError> {
        if format.format_id == FormatTag::ULAW {
            return Ok(Self::ULaw);
        }
        if format.format_id == FormatTag::ALAW {
            return Ok(Self::ALaw);
        }
        if !format.is_pcm() {
            return Err(RecorderError::UnsupportedConversion(format!(
                "{} is not a sample-level encoding",
                format.format_id
            )));
        }

        let big_endian = format.is_big_endian();
        let encoding = match (format.is_float(), format.bits_per_channel) {
            (true, 32) => Self::Float32 { big_endian },
            (true, 64) => Self::Float64 { big_endian },
            (false, 8) if !format.format_flags.contains(FormatFlags::IS_SIGNED_INTEGER) => {
                Self::UnsignedInt8
            }
            (false, bits @ (8 | 16 | 24 | 32)) => Self::SignedInt {
                bytes: (bits / 8) as u8,
                big_endian,
            },
            (float, bits) => {
                return Err(RecorderError::FormatNegotiation(format!(
                    "{} {}-bit linear PCM is not supported",
                    if float { "float" } else { "integer" },
                    bits
                )))
            }
        };
        Ok(encoding)
    }

    pub fn bytes_per_sample(&self) -> usize {
        match self {
            Self::UnsignedInt8 | Self::ULaw | Self::ALaw => 1,
            Self::SignedInt { bytes, .. } => *bytes as usize,
            Self::Float32 { .. } => 4,
            Self::Float64 { .. } => 8,
        }
    }

    /// Append the encoded form of `samples` to `out`.
    ///
    /// Out-of-range input is clamped. Does not allocate when `out` has room.
    pub fn encode(&self, samples: &[f32], out: &mut Vec<u8>) {
        match *self {
            Self::UnsignedInt8 => {
                out.extend(samples.iter().map(|&s| (s.clamp(-1.0, 1.0) * 127.0 + 128.0) as u8));
            }
            Self::SignedInt { bytes: 1, .. } => {
                out.extend(samples.iter().map(|&s| (s.clamp(-1.0, 1.0) * 127.0) as i8 as u8));
            }
            Self::SignedInt { bytes: 2, big_endian } => {
                for &s in samples {
                    let v = f32_to_i16(s);
                    out.extend_from_slice(&if big_endian { v.to_be_bytes() } else { v.to_le_bytes() });
                }
            }
            Self::SignedInt { bytes: 3, big_endian } => {
                for &s in samples {
                    let v = (s.clamp(-1.0, 1.0) * 8_388_607.0) as i32;
                    let b = v.to_le_bytes();
                    if big_endian {
                        out.extend_from_slice(&[b[2], b[1], b[0]]);
                    } else {
                        out.extend_from_slice(&b[..3]);
                    }
                }
            }
            Self::SignedInt { big_endian, .. } => {
                for &s in samples {
                    let v = (f64::from(s).clamp(-1.0, 1.0) * i32::MAX as f64) as i32;
                    out.extend_from_slice(&if big_endian { v.to_be_bytes() } else { v.to_le_bytes() });
                }
            }
            Self::Float32 { big_endian } => {
                for &s in samples {
                    let v = s.clamp(-1.0, 1.0);
                    out.extend_from_slice(&if big_endian { v.to_be_bytes() } else { v.to_le_bytes() });
                }
            }
            Self::Float64 { big_endian } => {
                for &s in samples {
                    let v = f64::from(s.clamp(-1.0, 1.0));
                    out.extend_from_slice(&if big_endian { v.to_be_bytes() } else { v.to_le_bytes() });
                }
            }
            Self::ULaw => out.extend(samples.iter().map(|&s| linear_to_ulaw(f32_to_i16(s)))),
            Self::ALaw => out.extend(samples.iter().map(|&s| linear_to_alaw(f32_to_i16(s)))),
        }
    }
}

/// Convert an f32 sample to 16-bit PCM, clamping out-of-range values.
pub fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

const ULAW_BIAS: i32 = 0x84;
const ULAW_CLIP: i32 = 32_635;

/// ITU-T G.711 mu-law compression of one 16-bit sample.
pub fn linear_to_ulaw(sample: i16) -> u8 {
    let mut magnitude = i32::from(sample);
    let sign = if magnitude < 0 {
        magnitude = -magnitude;
        0x80
    } else {
        0
    };
    magnitude = magnitude.min(ULAW_CLIP) + ULAW_BIAS;

    let mut exponent = 7;
    let mut mask = 0x4000;
    while exponent > 0 && magnitude & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = (magnitude >> (exponent + 3)) & 0x0F;
    !((sign | (exponent << 4) | mantissa) as u8)
}

pub fn ulaw_to_linear(code: u8) -> i16 {
    let code = !code;
    let mut t = (i32::from(code & 0x0F) << 3) + ULAW_BIAS;
    t <<= (code & 0x70) >> 4;
    if code & 0x80 != 0 {
        (ULAW_BIAS - t) as i16
    } else {
        (t - ULAW_BIAS) as i16
    }
}

const ALAW_SEGMENT_END: [i32; 8] = [0x1F, 0x3F, 0x7F, 0xFF, 0x1FF, 0x3FF, 0x7FF, 0xFFF];

/// ITU-T G.711 A-law compression of one 16-bit sample.
pub fn linear_to_alaw(sample: i16) -> u8 {
    let mut value = i32::from(sample) >> 3;
    let mask: u8 = if value >= 0 {
        0xD5
    } else {
        value = -value - 1;
        0x55
    };

    let Some(segment) = ALAW_SEGMENT_END.iter().position(|&end| value <= end) else {
        return 0x7F ^ mask;
    };
    let mantissa = if segment < 2 {
        (value >> 1) & 0x0F
    } else {
        (value >> segment) & 0x0F
    };
    (((segment as i32) << 4) | mantissa) as u8 ^ mask
}

pub fn alaw_to_linear(code: u8) -> i16 {
    let code = code ^ 0x55;
    let mut t = i32::from(code & 0x0F) << 4;
    let segment = (code & 0x70) >> 4;
    match segment {
        0 => t += 8,
        1 => t += 0x108,
        _ => {
            t += 0x108;
            t <<= segment - 1;
        }
    }
    if code & 0x80 != 0 {
        t as i16
    } else {
        -t as i16
    }
}
