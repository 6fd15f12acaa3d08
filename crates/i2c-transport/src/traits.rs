use crate::{I2cConfig, Result, TransportError};

/// A minimal blocking register transport bound to one bus + address.
///
/// Every call is one bus transaction; implementations do no retrying.
pub trait I2cBus {
    /// Open the endpoint described by `cfg`.
    fn open(cfg: &I2cConfig) -> Result<Self>
    where
        Self: Sized;

    /// Endpoint this handle talks to.
    fn config(&self) -> &I2cConfig;

    /// Read one byte from register `reg`.
    fn read_u8(&mut self, reg: u8) -> Result<u8>;

    /// Write one byte to register `reg`.
    fn write_u8(&mut self, reg: u8, value: u8) -> Result<()>;

    /// Read `len` sequential bytes starting at register `reg`.
    fn read_block(&mut self, reg: u8, len: usize) -> Result<Vec<u8>>;

    /// Write `data` sequentially starting at register `reg`.
    fn write_block(&mut self, reg: u8, data: &[u8]) -> Result<()>;

    /// Release the underlying handle. Must be safe to call more than once.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    /// List addresses that acknowledge on `bus`.
    fn scan(_bus: u32) -> Result<Vec<u8>>
    where
        Self: Sized,
    {
        Err(TransportError::Unsupported("bus scan not supported"))
    }
}
