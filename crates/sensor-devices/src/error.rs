use i2c_transport::TransportError;
use thiserror::Error;

pub type Result<T, E = DeviceError> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("unknown register: {0}")]
    InvalidRegister(String),
    #[error("device not configured")]
    NotConfigured,
    #[error("transport error: {0}")]
    Io(#[from] TransportError),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

impl DeviceError {
    /// Local programming errors are never worth retrying.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            DeviceError::InvalidRegister(_) | DeviceError::InvalidConfig(_)
        )
    }

    /// Bus glitches and timeouts; a later cycle may well succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, DeviceError::Io(e) if e.is_transient())
    }
}
