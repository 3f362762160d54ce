//! Container header generation.
//!
//! Every header here has a fixed length for a given stream format, so the
//! writer can regenerate it at offset 0 after each flush without moving any
//! audio data. All size fields are computed from the data written so far.

use crate::models::error::RecorderError;
use crate::models::format::{FileType, FormatTag, StreamFormatDescriptor};

pub const WAVE_PCM_HEADER_SIZE: usize = 44;
pub const WAVE_EXTENDED_HEADER_SIZE: usize = 58;
pub const AIFF_HEADER_SIZE: usize = 54;
pub const AIFC_HEADER_SIZE: usize = 72;
pub const CAF_HEADER_SIZE: usize = 68;
pub const NEXT_HEADER_SIZE: usize = 24;

/// Largest header any container produces.
pub const MAX_HEADER_SIZE: usize = AIFC_HEADER_SIZE;

const AIFC_VERSION_1: u32 = 0xA280_5140;

/// On-disk layout for an output file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Container {
    Wave,
    Aiff,
    Aifc,
    Caf,
    Next,
    /// Raw ADTS frames, no file header.
    Adts,
}

impl Container {
    /// Choose the container for `file_type`, checking it can carry `stream`.
    pub fn for_output(
        file_type: FileType,
        stream: &StreamFormatDescriptor,
    ) -> Result<Self, RecorderError> {
        let container = match file_type {
            FileType::Wave => Self::Wave,
            FileType::Aiff => Self::Aiff,
            FileType::Aifc => Self::Aifc,
            FileType::Caf => Self::Caf,
            FileType::Next => Self::Next,
            FileType::AacAdts => Self::Adts,
            other => {
                return Err(RecorderError::UnsupportedConversion(format!(
                    "cannot write {} files",
                    other
                )))
            }
        };
        if !container.supports(stream) {
            return Err(RecorderError::UnsupportedConversion(format!(
                "{} files cannot carry {} ({} bits{})",
                file_type,
                stream.format_id,
                stream.bits_per_channel,
                if stream.is_float() { ", float" } else { "" }
            )));
        }
        Ok(container)
    }

    pub fn supports(&self, stream: &StreamFormatDescriptor) -> bool {
        let g711 = stream.format_id == FormatTag::ULAW || stream.format_id == FormatTag::ALAW;
        let big = stream.is_big_endian();
        let bits = stream.bits_per_channel;
        match self {
            Self::Adts => stream.format_id == FormatTag::MPEG4_AAC,
            _ if g711 => !matches!(self, Self::Aiff),
            _ if !stream.is_pcm() => false,
            Self::Wave => {
                !big && if stream.is_float() {
                    matches!(bits, 32 | 64)
                } else {
                    matches!(bits, 8 | 16 | 24 | 32)
                }
            }
            Self::Aiff => big && !stream.is_float() && matches!(bits, 8 | 16 | 24 | 32),
            Self::Aifc => {
                if stream.is_float() {
                    big && matches!(bits, 32 | 64)
                } else {
                    (big && matches!(bits, 8 | 16 | 24 | 32)) || (!big && bits == 16)
                }
            }
            Self::Caf => {
                if stream.is_float() {
                    matches!(bits, 32 | 64)
                } else {
                    matches!(bits, 8 | 16 | 24 | 32)
                }
            }
            Self::Next => {
                big && if stream.is_float() {
                    matches!(bits, 32 | 64)
                } else {
                    matches!(bits, 8 | 16 | 24 | 32)
                }
            }
        }
    }

    pub fn header_len(&self, stream: &StreamFormatDescriptor) -> usize {
        match self {
            Self::Wave if wave_format_code(stream) == 1 => WAVE_PCM_HEADER_SIZE,
            Self::Wave => WAVE_EXTENDED_HEADER_SIZE,
            Self::Aiff => AIFF_HEADER_SIZE,
            Self::Aifc => AIFC_HEADER_SIZE,
            Self::Caf => CAF_HEADER_SIZE,
            Self::Next => NEXT_HEADER_SIZE,
            Self::Adts => 0,
        }
    }

    /// Whether an odd-length data chunk must be followed by a pad byte.
    pub fn pads_odd_chunks(&self) -> bool {
        matches!(self, Self::Wave | Self::Aiff | Self::Aifc)
    }

    /// Build the header into `out`, replacing its contents.
    ///
    /// `finished` marks the final rewrite at close: chunk sizes then account
    /// for the pad byte, and formats that use an "unknown length" marker while
    /// recording get their real data size.
    pub fn write_header(
        &self,
        stream: &StreamFormatDescriptor,
        data_bytes: u64,
        frames: u64,
        finished: bool,
        out: &mut Vec<u8>,
    ) {
        out.clear();
        let pad = u64::from(finished && self.pads_odd_chunks() && data_bytes % 2 == 1);
        match self {
            Self::Wave => write_wave(stream, data_bytes, frames, pad, out),
            Self::Aiff => write_aiff(stream, data_bytes, frames, pad, out),
            Self::Aifc => write_aifc(stream, data_bytes, frames, pad, out),
            Self::Caf => write_caf(stream, data_bytes, finished, out),
            Self::Next => write_next(stream, data_bytes, finished, out),
            Self::Adts => {}
        }
    }
}

fn clamp_u32(value: u64) -> u32 {
    value.min(u64::from(u32::MAX)) as u32
}

fn put_u16_le(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u32_le(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u16_be(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn put_u32_be(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}

/// WAVE format code: 1 integer PCM, 3 IEEE float, 6 A-law, 7 mu-law.
fn wave_format_code(stream: &StreamFormatDescriptor) -> u16 {
    if stream.format_id == FormatTag::ALAW {
        6
    } else if stream.format_id == FormatTag::ULAW {
        7
    } else if stream.is_float() {
        3
    } else {
        1
    }
}

/// RIFF/WAVE header.
///
/// Integer PCM uses the classic 44-byte layout. Float and G.711 streams get
/// an 18-byte `fmt ` chunk plus a `fact` chunk carrying the frame count.
fn write_wave(stream: &StreamFormatDescriptor, data_bytes: u64, frames: u64, pad: u64, out: &mut Vec<u8>) {
    let code = wave_format_code(stream);
    let extended = code != 1;
    let header_len = if extended {
        WAVE_EXTENDED_HEADER_SIZE
    } else {
        WAVE_PCM_HEADER_SIZE
    } as u64;
    let channels = stream.channels_per_frame as u16;
    let sample_rate = stream.sample_rate.round() as u32;
    let block_align = stream.bytes_per_frame as u16;

    out.extend_from_slice(b"RIFF");
    put_u32_le(out, clamp_u32(header_len - 8 + data_bytes + pad));
    out.extend_from_slice(b"WAVE");

    out.extend_from_slice(b"fmt ");
    put_u32_le(out, if extended { 18 } else { 16 });
    put_u16_le(out, code);
    put_u16_le(out, channels);
    put_u32_le(out, sample_rate);
    put_u32_le(out, sample_rate.saturating_mul(u32::from(block_align)));
    put_u16_le(out, block_align);
    put_u16_le(out, stream.bits_per_channel as u16);

    if extended {
        put_u16_le(out, 0);
        out.extend_from_slice(b"fact");
        put_u32_le(out, 4);
        put_u32_le(out, clamp_u32(frames));
    }

    out.extend_from_slice(b"data");
    put_u32_le(out, clamp_u32(data_bytes));
}

/// Encode an f64 as an IEEE 754 80-bit extended float, big-endian.
pub fn f64_to_extended(value: f64) -> [u8; 10] {
    let mut out = [0u8; 10];
    if value == 0.0 || !value.is_finite() {
        return out;
    }
    let bits = value.to_bits();
    let sign = ((bits >> 63) as u16) << 15;
    let exponent = ((bits >> 52) & 0x7FF) as i32;
    let fraction = bits & ((1u64 << 52) - 1);

    let (exponent, mantissa) = if exponent == 0 {
        // Subnormal: normalise the fraction.
        let shift = fraction.leading_zeros() as i32;
        (1 - 1023 - (shift - 11), fraction << shift)
    } else {
        (exponent - 1023, (1u64 << 63) | (fraction << 11))
    };

    out[..2].copy_from_slice(&(sign | (exponent + 16383) as u16).to_be_bytes());
    out[2..].copy_from_slice(&mantissa.to_be_bytes());
    out
}

fn write_comm_common(stream: &StreamFormatDescriptor, frames: u64, out: &mut Vec<u8>) {
    put_u16_be(out, stream.channels_per_frame as u16);
    put_u32_be(out, clamp_u32(frames));
    put_u16_be(out, stream.bits_per_channel as u16);
    out.extend_from_slice(&f64_to_extended(stream.sample_rate));
}

fn write_ssnd(data_bytes: u64, out: &mut Vec<u8>) {
    out.extend_from_slice(b"SSND");
    put_u32_be(out, clamp_u32(8 + data_bytes));
    put_u32_be(out, 0);
    put_u32_be(out, 0);
}

fn write_aiff(stream: &StreamFormatDescriptor, data_bytes: u64, frames: u64, pad: u64, out: &mut Vec<u8>) {
    out.extend_from_slice(b"FORM");
    put_u32_be(out, clamp_u32(AIFF_HEADER_SIZE as u64 - 8 + data_bytes + pad));
    out.extend_from_slice(b"AIFF");

    out.extend_from_slice(b"COMM");
    put_u32_be(out, 18);
    write_comm_common(stream, frames, out);

    write_ssnd(data_bytes, out);
}

fn aifc_compression(stream: &StreamFormatDescriptor) -> &'static [u8; 4] {
    if stream.format_id == FormatTag::ULAW {
        b"ulaw"
    } else if stream.format_id == FormatTag::ALAW {
        b"alaw"
    } else if stream.is_float() {
        if stream.bits_per_channel == 64 {
            b"fl64"
        } else {
            b"fl32"
        }
    } else if stream.is_big_endian() {
        b"NONE"
    } else {
        b"sowt"
    }
}

fn write_aifc(stream: &StreamFormatDescriptor, data_bytes: u64, frames: u64, pad: u64, out: &mut Vec<u8>) {
    out.extend_from_slice(b"FORM");
    put_u32_be(out, clamp_u32(AIFC_HEADER_SIZE as u64 - 8 + data_bytes + pad));
    out.extend_from_slice(b"AIFC");

    out.extend_from_slice(b"FVER");
    put_u32_be(out, 4);
    put_u32_be(out, AIFC_VERSION_1);

    out.extend_from_slice(b"COMM");
    put_u32_be(out, 24);
    write_comm_common(stream, frames, out);
    out.extend_from_slice(aifc_compression(stream));
    // Empty Pascal-string compression name, padded to even length.
    out.extend_from_slice(&[0, 0]);

    write_ssnd(data_bytes, out);
}

const CAF_LPCM_FLAG_IS_FLOAT: u32 = 1;
const CAF_LPCM_FLAG_IS_LITTLE_ENDIAN: u32 = 2;

fn write_caf(stream: &StreamFormatDescriptor, data_bytes: u64, finished: bool, out: &mut Vec<u8>) {
    out.extend_from_slice(b"caff");
    put_u16_be(out, 1);
    put_u16_be(out, 0);

    let flags = if stream.is_pcm() {
        let mut flags = 0;
        if stream.is_float() {
            flags |= CAF_LPCM_FLAG_IS_FLOAT;
        }
        if !stream.is_big_endian() {
            flags |= CAF_LPCM_FLAG_IS_LITTLE_ENDIAN;
        }
        flags
    } else {
        0
    };

    out.extend_from_slice(b"desc");
    out.extend_from_slice(&32i64.to_be_bytes());
    out.extend_from_slice(&stream.sample_rate.to_be_bytes());
    out.extend_from_slice(&stream.format_id.to_bytes());
    put_u32_be(out, flags);
    put_u32_be(out, stream.bytes_per_packet);
    put_u32_be(out, stream.frames_per_packet);
    put_u32_be(out, stream.channels_per_frame);
    put_u32_be(out, stream.bits_per_channel);

    // -1 marks a data chunk that runs to end of file.
    let size: i64 = if finished {
        i64::try_from(4 + data_bytes).unwrap_or(-1)
    } else {
        -1
    };
    out.extend_from_slice(b"data");
    out.extend_from_slice(&size.to_be_bytes());
    put_u32_be(out, 0);
}

fn next_encoding(stream: &StreamFormatDescriptor) -> u32 {
    if stream.format_id == FormatTag::ULAW {
        1
    } else if stream.format_id == FormatTag::ALAW {
        27
    } else if stream.is_float() {
        if stream.bits_per_channel == 64 {
            7
        } else {
            6
        }
    } else {
        match stream.bits_per_channel {
            8 => 2,
            16 => 3,
            24 => 4,
            _ => 5,
        }
    }
}

fn write_next(stream: &StreamFormatDescriptor, data_bytes: u64, finished: bool, out: &mut Vec<u8>) {
    out.extend_from_slice(b".snd");
    put_u32_be(out, NEXT_HEADER_SIZE as u32);
    put_u32_be(out, if finished { clamp_u32(data_bytes) } else { u32::MAX });
    put_u32_be(out, next_encoding(stream));
    put_u32_be(out, stream.sample_rate.round() as u32);
    put_u32_be(out, stream.channels_per_frame);
}
