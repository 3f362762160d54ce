//! Stream format descriptions and their property-map form.
//!
//! A [`StreamFormatDescriptor`] carries the same fields as a classic audio
//! stream basic description. Callers that configure the recorder from loosely
//! typed data (JSON, a settings panel) use the string-keyed [`PropertyMap`]
//! representation instead; the two convert losslessly.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::BitOr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::RecorderError;

/// Property-map keys.
pub mod keys {
    pub const SAMPLE_RATE: &str = "sample_rate";
    pub const FORMAT_ID: &str = "format_id";
    pub const FORMAT_FLAGS: &str = "format_flags";
    pub const BYTES_PER_PACKET: &str = "bytes_per_packet";
    pub const FRAMES_PER_PACKET: &str = "frames_per_packet";
    pub const BYTES_PER_FRAME: &str = "bytes_per_frame";
    pub const CHANNELS_PER_FRAME: &str = "channels_per_frame";
    pub const BITS_PER_CHANNEL: &str = "bits_per_channel";
    /// Output maps only: the file container, distinct from the codec tag.
    pub const FILE_TYPE: &str = "file_type";
}

/// A value in a [`PropertyMap`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Number(f64),
    Text(String),
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<u32> for PropertyValue {
    fn from(value: u32) -> Self {
        Self::Number(value as f64)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// String-keyed format description, serializable as a flat JSON object.
pub type PropertyMap = BTreeMap<String, PropertyValue>;

/// A four-character code such as `lpcm` or `aac `.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FormatTag(pub u32);

impl FormatTag {
    pub const LINEAR_PCM: Self = Self::from_bytes(*b"lpcm");
    pub const AC3: Self = Self::from_bytes(*b"ac-3");
    pub const AC3_60958: Self = Self::from_bytes(*b"cac3");
    pub const APPLE_IMA4: Self = Self::from_bytes(*b"ima4");
    pub const MPEG4_AAC: Self = Self::from_bytes(*b"aac ");
    pub const MPEG4_CELP: Self = Self::from_bytes(*b"celp");
    pub const MPEG4_HVXC: Self = Self::from_bytes(*b"hvxc");
    pub const MPEG4_TWINVQ: Self = Self::from_bytes(*b"twvq");
    pub const MACE3: Self = Self::from_bytes(*b"MAC3");
    pub const MACE6: Self = Self::from_bytes(*b"MAC6");
    pub const ULAW: Self = Self::from_bytes(*b"ulaw");
    pub const ALAW: Self = Self::from_bytes(*b"alaw");
    pub const QDESIGN: Self = Self::from_bytes(*b"QDMC");
    pub const QDESIGN2: Self = Self::from_bytes(*b"QDM2");
    pub const QUALCOMM: Self = Self::from_bytes(*b"Qclp");
    pub const MPEG_LAYER1: Self = Self::from_bytes(*b".mp1");
    pub const MPEG_LAYER2: Self = Self::from_bytes(*b".mp2");
    pub const MPEG_LAYER3: Self = Self::from_bytes(*b".mp3");
    pub const DV_AUDIO: Self = Self::from_bytes(*b"dvca");
    pub const VARIABLE_DURATION_DV_AUDIO: Self = Self::from_bytes(*b"vdva");
    pub const TIME_CODE: Self = Self::from_bytes(*b"time");
    pub const MIDI_STREAM: Self = Self::from_bytes(*b"midi");
    pub const PARAMETER_VALUE_STREAM: Self = Self::from_bytes(*b"apvs");
    pub const APPLE_LOSSLESS: Self = Self::from_bytes(*b"alac");

    pub const fn from_bytes(bytes: [u8; 4]) -> Self {
        Self(u32::from_be_bytes(bytes))
    }

    pub const fn to_bytes(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    /// Human-readable name for the well-known codec tags.
    pub fn well_known_name(self) -> Option<&'static str> {
        let name = match self {
            Self::LINEAR_PCM => "Linear PCM",
            Self::AC3 => "AC-3",
            Self::AC3_60958 => "AC-3 over IEC 60958",
            Self::APPLE_IMA4 => "IMA 4:1 ADPCM",
            Self::MPEG4_AAC => "MPEG-4 AAC",
            Self::MPEG4_CELP => "MPEG-4 CELP",
            Self::MPEG4_HVXC => "MPEG-4 HVXC",
            Self::MPEG4_TWINVQ => "MPEG-4 TwinVQ",
            Self::MACE3 => "MACE 3:1",
            Self::MACE6 => "MACE 6:1",
            Self::ULAW => "mu-law 2:1",
            Self::ALAW => "A-law 2:1",
            Self::QDESIGN => "QDesign Music",
            Self::QDESIGN2 => "QDesign Music 2",
            Self::QUALCOMM => "QUALCOMM PureVoice",
            Self::MPEG_LAYER1 => "MPEG-1/2 Layer I",
            Self::MPEG_LAYER2 => "MPEG-1/2 Layer II",
            Self::MPEG_LAYER3 => "MPEG-1/2 Layer III",
            Self::DV_AUDIO => "DV Audio",
            Self::VARIABLE_DURATION_DV_AUDIO => "Variable-duration DV Audio",
            Self::TIME_CODE => "Time Code",
            Self::MIDI_STREAM => "MIDI Stream",
            Self::PARAMETER_VALUE_STREAM => "Parameter Value Stream",
            Self::APPLE_LOSSLESS => "Apple Lossless",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Display for FormatTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_tag_to_string(*self))
    }
}

impl fmt::Debug for FormatTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FormatTag({:?})", format_tag_to_string(*self))
    }
}

impl FromStr for FormatTag {
    type Err = RecorderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        string_to_format_tag(s)
    }
}

/// Render a tag as four characters, one per byte (Latin-1), so that every
/// possible tag has a textual form.
pub fn format_tag_to_string(tag: FormatTag) -> String {
    tag.to_bytes().iter().map(|&b| char::from(b)).collect()
}

/// Parse four characters in U+0000..=U+00FF back into a tag.
pub fn string_to_format_tag(s: &str) -> Result<FormatTag, RecorderError> {
    let mut bytes = [0u8; 4];
    let mut count = 0;
    for ch in s.chars() {
        if count == 4 {
            return Err(RecorderError::MalformedFormat(format!(
                "format tag {:?} is longer than four characters",
                s
            )));
        }
        bytes[count] = u8::try_from(u32::from(ch)).map_err(|_| {
            RecorderError::MalformedFormat(format!(
                "format tag {:?} contains a character outside Latin-1",
                s
            ))
        })?;
        count += 1;
    }
    if count != 4 {
        return Err(RecorderError::MalformedFormat(format!(
            "format tag {:?} must be exactly four characters",
            s
        )));
    }
    Ok(FormatTag::from_bytes(bytes))
}

/// Format-specific flag bits. Unknown bits are carried through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FormatFlags(pub u32);

impl FormatFlags {
    pub const NONE: Self = Self(0);
    pub const IS_FLOAT: Self = Self(1 << 0);
    pub const IS_BIG_ENDIAN: Self = Self(1 << 1);
    pub const IS_SIGNED_INTEGER: Self = Self(1 << 2);
    pub const IS_PACKED: Self = Self(1 << 3);
    pub const IS_ALIGNED_HIGH: Self = Self(1 << 4);
    pub const IS_NON_INTERLEAVED: Self = Self(1 << 5);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn with(self, other: Self, enabled: bool) -> Self {
        if enabled {
            Self(self.0 | other.0)
        } else {
            Self(self.0 & !other.0)
        }
    }
}

impl BitOr for FormatFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Output file container. Identified by its own four-character code, which
/// is unrelated to the codec tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileType {
    Aiff,
    Aifc,
    Wave,
    SoundDesigner2,
    Next,
    Mp3,
    Ac3,
    AacAdts,
    Mpeg4,
    M4a,
    Caf,
    Other(FormatTag),
}

impl FileType {
    pub fn tag(self) -> FormatTag {
        match self {
            Self::Aiff => FormatTag::from_bytes(*b"AIFF"),
            Self::Aifc => FormatTag::from_bytes(*b"AIFC"),
            Self::Wave => FormatTag::from_bytes(*b"WAVE"),
            Self::SoundDesigner2 => FormatTag::from_bytes(*b"Sd2f"),
            Self::Next => FormatTag::from_bytes(*b"NeXT"),
            Self::Mp3 => FormatTag::from_bytes(*b"MPG3"),
            Self::Ac3 => FormatTag::from_bytes(*b"ac-3"),
            Self::AacAdts => FormatTag::from_bytes(*b"adts"),
            Self::Mpeg4 => FormatTag::from_bytes(*b"mp4f"),
            Self::M4a => FormatTag::from_bytes(*b"m4af"),
            Self::Caf => FormatTag::from_bytes(*b"caff"),
            Self::Other(tag) => tag,
        }
    }

    pub fn from_tag(tag: FormatTag) -> Self {
        const KNOWN: [FileType; 11] = [
            FileType::Aiff,
            FileType::Aifc,
            FileType::Wave,
            FileType::SoundDesigner2,
            FileType::Next,
            FileType::Mp3,
            FileType::Ac3,
            FileType::AacAdts,
            FileType::Mpeg4,
            FileType::M4a,
            FileType::Caf,
        ];
        KNOWN
            .into_iter()
            .find(|known| known.tag() == tag)
            .unwrap_or(Self::Other(tag))
    }

    /// Guess the container from a file extension (case-insensitive).
    pub fn from_extension(ext: &str) -> Option<Self> {
        let file_type = match ext.to_ascii_lowercase().as_str() {
            "wav" | "wave" => Self::Wave,
            "aif" | "aiff" => Self::Aiff,
            "aifc" => Self::Aifc,
            "caf" => Self::Caf,
            "au" | "snd" => Self::Next,
            "aac" | "adts" => Self::AacAdts,
            "m4a" => Self::M4a,
            "mp4" => Self::Mpeg4,
            "mp3" => Self::Mp3,
            "ac3" => Self::Ac3,
            "sd2" => Self::SoundDesigner2,
            _ => return None,
        };
        Some(file_type)
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.tag(), f)
    }
}

/// Description of a PCM or encoded audio stream.
///
/// Values are plain data: build one, hand it around, never mutate it in
/// place. Zero fields are legal and mean "unspecified" when the descriptor
/// is a request that still has to be negotiated.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamFormatDescriptor {
    pub sample_rate: f64,
    pub format_id: FormatTag,
    pub format_flags: FormatFlags,
    pub bytes_per_packet: u32,
    pub frames_per_packet: u32,
    pub bytes_per_frame: u32,
    pub channels_per_frame: u32,
    pub bits_per_channel: u32,
}

impl StreamFormatDescriptor {
    /// Interleaved linear PCM, packed.
    pub fn linear_pcm(
        sample_rate: f64,
        channels: u32,
        bits: u32,
        float: bool,
        big_endian: bool,
    ) -> Self {
        let flags = FormatFlags::IS_PACKED
            .with(FormatFlags::IS_FLOAT, float)
            .with(FormatFlags::IS_SIGNED_INTEGER, !float)
            .with(FormatFlags::IS_BIG_ENDIAN, big_endian);
        let bytes_per_frame = channels * (bits / 8);
        Self {
            sample_rate,
            format_id: FormatTag::LINEAR_PCM,
            format_flags: flags,
            bytes_per_packet: bytes_per_frame,
            frames_per_packet: 1,
            bytes_per_frame,
            channels_per_frame: channels,
            bits_per_channel: bits,
        }
    }

    /// Native-endian, non-interleaved 32-bit float: one buffer per channel.
    pub fn float32_non_interleaved(sample_rate: f64, channels: u32) -> Self {
        Self {
            sample_rate,
            format_id: FormatTag::LINEAR_PCM,
            format_flags: FormatFlags::IS_FLOAT
                | FormatFlags::IS_PACKED
                | FormatFlags::IS_NON_INTERLEAVED
                | FormatFlags(0).with(FormatFlags::IS_BIG_ENDIAN, cfg!(target_endian = "big")),
            bytes_per_packet: 4,
            frames_per_packet: 1,
            bytes_per_frame: 4,
            channels_per_frame: channels,
            bits_per_channel: 32,
        }
    }

    /// AAC-LC; packets are variably sized and carry 1024 frames.
    pub fn aac(sample_rate: f64, channels: u32) -> Self {
        Self {
            sample_rate,
            format_id: FormatTag::MPEG4_AAC,
            format_flags: FormatFlags::NONE,
            bytes_per_packet: 0,
            frames_per_packet: 1024,
            bytes_per_frame: 0,
            channels_per_frame: channels,
            bits_per_channel: 0,
        }
    }

    /// G.711 mu-law or A-law: one byte per sample.
    pub fn g711(format_id: FormatTag, sample_rate: f64, channels: u32) -> Self {
        Self {
            sample_rate,
            format_id,
            format_flags: FormatFlags::NONE,
            bytes_per_packet: channels,
            frames_per_packet: 1,
            bytes_per_frame: channels,
            channels_per_frame: channels,
            bits_per_channel: 8,
        }
    }

    pub fn is_pcm(&self) -> bool {
        self.format_id == FormatTag::LINEAR_PCM
    }

    pub fn is_float(&self) -> bool {
        self.format_flags.contains(FormatFlags::IS_FLOAT)
    }

    pub fn is_big_endian(&self) -> bool {
        self.format_flags.contains(FormatFlags::IS_BIG_ENDIAN)
    }

    pub fn is_non_interleaved(&self) -> bool {
        self.format_flags.contains(FormatFlags::IS_NON_INTERLEAVED)
    }

    /// Check the structural invariants of a fully specified format.
    pub fn validate(&self) -> Result<(), String> {
        if !(self.sample_rate.is_finite() && self.sample_rate > 0.0) {
            return Err(format!("sample rate must be positive, got {}", self.sample_rate));
        }
        if self.channels_per_frame == 0 {
            return Err("channel count must be at least 1".into());
        }
        if self.is_pcm() {
            if self.frames_per_packet != 1 {
                return Err(format!(
                    "linear PCM must have one frame per packet, got {}",
                    self.frames_per_packet
                ));
            }
            if self.bits_per_channel > 0 {
                let sample_bytes = self.bits_per_channel.div_ceil(8);
                let expected = if self.is_non_interleaved() {
                    sample_bytes
                } else {
                    sample_bytes * self.channels_per_frame
                };
                if self.bytes_per_frame != expected {
                    return Err(format!(
                        "bytes per frame is {} but {} channels of {} bits need {}",
                        self.bytes_per_frame, self.channels_per_frame, self.bits_per_channel, expected
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn from_property_map(map: &PropertyMap) -> Result<Self, RecorderError> {
        let format_id = match map.get(keys::FORMAT_ID) {
            Some(PropertyValue::Text(text)) => string_to_format_tag(text)?,
            Some(PropertyValue::Number(_)) => {
                return Err(RecorderError::MalformedFormat(format!(
                    "{} must be a four-character string",
                    keys::FORMAT_ID
                )))
            }
            None => {
                return Err(RecorderError::MalformedFormat(format!(
                    "missing {}",
                    keys::FORMAT_ID
                )))
            }
        };

        let sample_rate = match map.get(keys::SAMPLE_RATE) {
            None => 0.0,
            Some(PropertyValue::Number(rate)) if rate.is_finite() && *rate >= 0.0 => *rate,
            Some(other) => {
                return Err(RecorderError::MalformedFormat(format!(
                    "{} must be a non-negative number, got {:?}",
                    keys::SAMPLE_RATE,
                    other
                )))
            }
        };

        Ok(Self {
            sample_rate,
            format_id,
            format_flags: FormatFlags(read_u32(map, keys::FORMAT_FLAGS)?),
            bytes_per_packet: read_u32(map, keys::BYTES_PER_PACKET)?,
            frames_per_packet: read_u32(map, keys::FRAMES_PER_PACKET)?,
            bytes_per_frame: read_u32(map, keys::BYTES_PER_FRAME)?,
            channels_per_frame: read_u32(map, keys::CHANNELS_PER_FRAME)?,
            bits_per_channel: read_u32(map, keys::BITS_PER_CHANNEL)?,
        })
    }

    pub fn to_property_map(&self) -> PropertyMap {
        let mut map = PropertyMap::new();
        map.insert(keys::SAMPLE_RATE.into(), self.sample_rate.into());
        map.insert(keys::FORMAT_ID.into(), format_tag_to_string(self.format_id).into());
        map.insert(keys::FORMAT_FLAGS.into(), self.format_flags.0.into());
        map.insert(keys::BYTES_PER_PACKET.into(), self.bytes_per_packet.into());
        map.insert(keys::FRAMES_PER_PACKET.into(), self.frames_per_packet.into());
        map.insert(keys::BYTES_PER_FRAME.into(), self.bytes_per_frame.into());
        map.insert(keys::CHANNELS_PER_FRAME.into(), self.channels_per_frame.into());
        map.insert(keys::BITS_PER_CHANNEL.into(), self.bits_per_channel.into());
        map
    }
}

fn read_u32(map: &PropertyMap, key: &str) -> Result<u32, RecorderError> {
    match map.get(key) {
        None => Ok(0),
        Some(PropertyValue::Number(n))
            if n.is_finite() && *n >= 0.0 && n.fract() == 0.0 && *n <= u32::MAX as f64 =>
        {
            Ok(*n as u32)
        }
        Some(other) => Err(RecorderError::MalformedFormat(format!(
            "{} must be an unsigned 32-bit integer, got {:?}",
            key, other
        ))),
    }
}

/// A requested or negotiated output: stream description plus container.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutputFormat {
    pub stream: StreamFormatDescriptor,
    /// None lets the recorder pick the container from the file extension.
    pub file_type: Option<FileType>,
}

impl OutputFormat {
    pub fn new(stream: StreamFormatDescriptor, file_type: Option<FileType>) -> Self {
        Self { stream, file_type }
    }

    pub fn from_property_map(map: &PropertyMap) -> Result<Self, RecorderError> {
        let stream = StreamFormatDescriptor::from_property_map(map)?;
        let file_type = match map.get(keys::FILE_TYPE) {
            None => None,
            Some(PropertyValue::Text(text)) => Some(FileType::from_tag(string_to_format_tag(text)?)),
            Some(PropertyValue::Number(_)) => {
                return Err(RecorderError::MalformedFormat(format!(
                    "{} must be a four-character string",
                    keys::FILE_TYPE
                )))
            }
        };
        Ok(Self { stream, file_type })
    }

    pub fn to_property_map(&self) -> PropertyMap {
        let mut map = self.stream.to_property_map();
        if let Some(file_type) = self.file_type {
            map.insert(keys::FILE_TYPE.into(), format_tag_to_string(file_type.tag()).into());
        }
        map
    }
}
