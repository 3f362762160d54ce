use thiserror::Error;

/// Errors that can occur while configuring or running a recorder.
///
/// Configuration, `prepare` and `start` errors are returned synchronously.
/// A `Write` failure during recording is reported through the delegate's
/// stop notification instead.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecorderError {
    #[error("no input device: {0}")]
    NoInputDevice(String),

    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("format negotiation failed: {0}")]
    FormatNegotiation(String),

    #[error("cannot open output file: {0}")]
    FileOpen(String),

    #[error("unsupported conversion: {0}")]
    UnsupportedConversion(String),

    #[error("write failed: {0}")]
    Write(String),

    #[error("already recording")]
    AlreadyRecording,

    #[error("already prepared")]
    AlreadyPrepared,

    #[error("device failed to start: {0}")]
    StartFailed(String),

    #[error("malformed format description: {0}")]
    MalformedFormat(String),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
}
