/// Recorder lifecycle.
///
/// ```text
/// idle → prepared → recording → stopped → idle
///   ↑________|  (path/device change)
/// ```
///
/// `Stopped` is transient: `stop` passes through it and settles in `Idle` so
/// the recorder can be started again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecorderState {
    Idle,
    Prepared,
    Recording,
    Stopped,
}

impl RecorderState {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn is_prepared(&self) -> bool {
        matches!(self, Self::Prepared)
    }

    pub fn is_recording(&self) -> bool {
        matches!(self, Self::Recording)
    }

    /// Whether output path, format or device may be changed in this state.
    pub fn accepts_configuration(&self) -> bool {
        !self.is_recording()
    }
}

impl Default for RecorderState {
    fn default() -> Self {
        Self::Idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_recording_rejects_configuration() {
        assert!(RecorderState::Idle.accepts_configuration());
        assert!(RecorderState::Prepared.accepts_configuration());
        assert!(RecorderState::Stopped.accepts_configuration());
        assert!(!RecorderState::Recording.accepts_configuration());
    }

    #[test]
    fn default_is_idle() {
        assert!(RecorderState::default().is_idle());
    }
}
