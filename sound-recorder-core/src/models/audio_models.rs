/// An input device offered by an [`AudioHost`](crate::traits::audio_host::AudioHost).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputDeviceInfo {
    pub id: String,
    pub name: String,
    pub is_default: bool,
    pub input_channels: u32,
}

/// Counters for debugging a recording session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecorderDiagnostics {
    pub callback_count: u64,
    pub frames_captured: u64,
    /// Blocks skipped because the render context was held by the control thread.
    pub blocks_skipped: u64,
    pub events_posted: u64,
    /// Duration/amplitude events dropped because the queue was full.
    pub events_dropped: u64,
}
