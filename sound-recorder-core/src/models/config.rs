/// Configuration for a recorder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecorderConfiguration {
    /// Input device ID, or None for the host's default input.
    pub device_id: Option<String>,

    /// Frames per render callback the capture buffer is sized for (default: 512).
    pub period_frames: u32,

    /// Capacity of the duration/amplitude event queue (default: 256).
    pub notification_capacity: usize,

    /// Encoded bytes staged before each write to disk (default: 64 KiB).
    pub flush_threshold_bytes: usize,

    /// Write `<file>.metadata.json` next to each finished recording.
    pub write_metadata: bool,
}

impl RecorderConfiguration {
    pub fn validate(&self) -> Result<(), String> {
        if self.period_frames == 0 {
            return Err("period must be at least one frame".into());
        }
        if self.period_frames > 65_536 {
            return Err(format!("period too large: {} frames", self.period_frames));
        }
        if self.notification_capacity == 0 {
            return Err("notification capacity must be positive".into());
        }
        if self.flush_threshold_bytes < 512 {
            return Err(format!(
                "flush threshold too small: {} bytes",
                self.flush_threshold_bytes
            ));
        }
        if let Some(ref id) = self.device_id {
            if id.is_empty() {
                return Err("device id must not be empty".into());
            }
        }
        Ok(())
    }
}

impl Default for RecorderConfiguration {
    fn default() -> Self {
        Self {
            device_id: None,
            period_frames: 512,
            notification_capacity: 256,
            flush_threshold_bytes: 64 * 1024,
            write_metadata: false,
        }
    }
}
