use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::format::{OutputFormat, PropertyMap};

/// Returned by `stop` when a recording session finishes.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingSummary {
    pub file_path: PathBuf,
    pub duration_secs: f64,
    /// Frames written in the output format (after any resampling).
    pub frames_written: u64,
    /// Total file size including container headers.
    pub bytes_written: u64,
    pub format: OutputFormat,
    /// SHA-256 of the finished file, lowercase hex.
    pub checksum: String,
}

/// Metadata stored alongside a recording as `<file>.metadata.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingMetadata {
    pub id: String,
    pub created_at: String,
    pub duration_secs: f64,
    pub file_path: String,
    pub checksum: String,
    pub frames_written: u64,
    pub bytes_written: u64,
    pub format: PropertyMap,
}

impl RecordingMetadata {
    pub fn from_summary(summary: &RecordingSummary) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: chrono::Utc::now().to_rfc3339(),
            duration_secs: summary.duration_secs,
            file_path: summary.file_path.to_string_lossy().into_owned(),
            checksum: summary.checksum.clone(),
            frames_written: summary.frames_written,
            bytes_written: summary.bytes_written,
            format: summary.format.to_property_map(),
        }
    }
}
