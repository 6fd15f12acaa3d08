use thiserror::Error;

pub type Result<T, E = TransportError> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no device at bus {bus} address 0x{address:02X}")]
    NoDevice { bus: u32, address: u8 },
    #[error("operation not supported on this backend: {0}")]
    Unsupported(&'static str),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("timeout")]
    Timeout,
    #[error("invalid 7-bit address: 0x{0:02X}")]
    InvalidAddress(u8),
    #[error("invalid bus config: {0}")]
    InvalidConfig(String),
}

impl TransportError {
    /// True for failures worth retrying on a later cycle (bus glitch, NAK storm),
    /// false for a missing device or a local misuse.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Io(_) | TransportError::Timeout)
    }
}
