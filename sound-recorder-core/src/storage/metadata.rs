use std::fs;
use std::path::{Path, PathBuf};

use crate::models::error::RecorderError;
use crate::models::recording_result::RecordingMetadata;

/// Sidecar path for a recording: `{recording_path}.metadata.json`.
pub fn metadata_path(recording_path: &Path) -> PathBuf {
    let mut name = recording_path.as_os_str().to_owned();
    name.push(".metadata.json");
    PathBuf::from(name)
}

/// Write recording metadata as a JSON sidecar file.
pub fn write_metadata(metadata: &RecordingMetadata, recording_path: &Path) -> Result<(), RecorderError> {
    let json = serde_json::to_string_pretty(metadata)
        .map_err(|e| RecorderError::Write(format!("failed to serialize metadata: {}", e)))?;
    fs::write(metadata_path(recording_path), json)
        .map_err(|e| RecorderError::Write(format!("failed to write metadata: {}", e)))?;
    Ok(())
}

/// Read recording metadata from a JSON sidecar file.
pub fn read_metadata(recording_path: &Path) -> Result<RecordingMetadata, RecorderError> {
    let json = fs::read_to_string(metadata_path(recording_path))
        .map_err(|e| RecorderError::FileOpen(format!("failed to read metadata: {}", e)))?;
    let metadata: RecordingMetadata = serde_json::from_str(&json)
        .map_err(|e| RecorderError::MalformedFormat(format!("failed to parse metadata: {}", e)))?;
    Ok(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::format::{FileType, OutputFormat, PropertyValue, StreamFormatDescriptor};
    use crate::models::recording_result::RecordingSummary;

    #[test]
    fn sidecar_keeps_recording_extension() {
        assert_eq!(
            metadata_path(Path::new("/tmp/take.wav")),
            PathBuf::from("/tmp/take.wav.metadata.json")
        );
    }

    #[test]
    fn metadata_survives_disk() {
        let dir = tempfile::tempdir().unwrap();
        let recording = dir.path().join("take.aiff");
        let summary = RecordingSummary {
            file_path: recording.clone(),
            duration_secs: 1.5,
            frames_written: 66150,
            bytes_written: 264654,
            format: OutputFormat::new(
                StreamFormatDescriptor::linear_pcm(44100.0, 2, 16, false, true),
                Some(FileType::Aiff),
            ),
            checksum: "ab".repeat(32),
        };
        let metadata = RecordingMetadata::from_summary(&summary);

        write_metadata(&metadata, &recording).unwrap();
        let loaded = read_metadata(&recording).unwrap();

        assert_eq!(loaded, metadata);
        assert_eq!(
            loaded.format.get("file_type"),
            Some(&PropertyValue::Text("AIFF".into()))
        );
    }

    #[test]
    fn missing_sidecar_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_metadata(&dir.path().join("nothing.wav")).is_err());
    }
}
