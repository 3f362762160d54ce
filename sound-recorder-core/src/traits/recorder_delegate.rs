use crate::models::error::RecorderError;

/// Which optional notification streams a delegate wants.
///
/// Read once when the delegate is registered; the render callback only looks
/// at the cached flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DelegateCapabilities {
    pub duration_updates: bool,
    pub amplitude_updates: bool,
}

impl DelegateCapabilities {
    pub const NONE: Self = Self {
        duration_updates: false,
        amplitude_updates: false,
    };

    pub const ALL: Self = Self {
        duration_updates: true,
        amplitude_updates: true,
    };
}

/// Listener for recorder notifications.
///
/// Every method has a no-op default, so a delegate implements only what it
/// cares about. Duration and amplitude updates are posted only if
/// [`capabilities`](Self::capabilities) asks for them.
///
/// All methods run on the control thread, from inside `start`, `stop` or
/// `pump_notifications`.
pub trait RecorderDelegate: Send + Sync {
    /// Optional streams this delegate consumes. Defaults to none.
    fn capabilities(&self) -> DelegateCapabilities {
        DelegateCapabilities::NONE
    }

    /// The device is running and audio is being written.
    fn on_started(&self) {}

    /// Elapsed recording time, non-decreasing within a session.
    fn on_duration_reached(&self, _seconds: f64) {}

    /// Peak level of the latest block, in `[0.0, 1.0]`.
    fn on_amplitude(&self, _level: f32) {}

    /// The session ended. `error` is set when it ended because of a failure.
    fn on_stopped(&self, _error: Option<&RecorderError>) {}
}
