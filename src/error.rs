//! Error types shared by the session manager, result store and reporter

use thiserror::Error;

/// Errors returned to callers of the session manager and its collaborators.
///
/// None of these are retried internally; the poller simply tries again on
/// its next cycle.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Another radio operation is already in progress")]
    Busy,

    #[error("Failed to open connection to sensor")]
    OpenFailed,

    #[error("Failed to enable notifications on sensor")]
    WriteFailed,

    #[error("Sensor did not answer in time")]
    Timeout,

    #[error("Malformed sensor response")]
    Malformed,

    #[error("Sensor dropped the connection before answering")]
    Disconnected,

    #[error("Radio stack rejected the scan request")]
    ScanFailed,

    #[error("Result slot {slot} out of range ({slots} slots configured)")]
    SlotOutOfRange { slot: usize, slots: usize },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Report error: {0}")]
    Report(String),

    #[error("Radio error: {0}")]
    Radio(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(feature = "bluez")]
impl From<bluer::Error> for Error {
    fn from(err: bluer::Error) -> Self {
        Error::Radio(err.to_string())
    }
}
