use crate::models::audio_models::InputDeviceInfo;
use crate::models::error::RecorderError;
use crate::traits::input_device::InputDevice;

/// Entry point into a platform audio system: lists and opens input devices.
pub trait AudioHost: Send + Sync {
    fn input_devices(&self) -> Result<Vec<InputDeviceInfo>, RecorderError>;

    fn default_input_device_id(&self) -> Option<String>;

    /// Open a device by ID, or the default input when `device_id` is None.
    ///
    /// Fails with `NoInputDevice` when no such device exists.
    fn open_input(&self, device_id: Option<&str>) -> Result<Box<dyn InputDevice>, RecorderError>;
}
