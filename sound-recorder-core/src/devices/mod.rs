pub mod virtual_device;

pub use virtual_device::{DriveMode, ManualClock, Signal, VirtualDeviceHandle, VirtualDeviceSpec, VirtualHost};
