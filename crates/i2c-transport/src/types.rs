use crate::{Result, TransportError};
use core::fmt;
use serde::{Deserialize, Serialize};

/// Lowest and highest non-reserved 7-bit addresses.
pub const MIN_ADDRESS: u8 = 0x03;
pub const MAX_ADDRESS: u8 = 0x77;

pub const DEFAULT_CLOCK_HZ: f64 = 100_000.0;

/// One physical device endpoint: bus index plus 7-bit address.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct I2cConfig {
    pub bus: u32,
    pub address: u8,
    /// Informational; the kernel adapter owns the actual bus clock.
    #[serde(default = "default_clock_hz", alias = "freq_hz")]
    pub clock_frequency_hz: f64,
}

fn default_clock_hz() -> f64 {
    DEFAULT_CLOCK_HZ
}

impl I2cConfig {
    pub fn new(bus: u32, address: u8) -> Result<Self> {
        Self::with_clock(bus, address, DEFAULT_CLOCK_HZ)
    }

    pub fn with_clock(bus: u32, address: u8, clock_frequency_hz: f64) -> Result<Self> {
        let cfg = Self {
            bus,
            address,
            clock_frequency_hz,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Checks the invariants a deserialized config cannot enforce on its own.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_ADDRESS..=MAX_ADDRESS).contains(&self.address) {
            return Err(TransportError::InvalidAddress(self.address));
        }
        if !(self.clock_frequency_hz.is_finite() && self.clock_frequency_hz > 0.0) {
            return Err(TransportError::InvalidConfig(format!(
                "clock frequency must be positive, got {}",
                self.clock_frequency_hz
            )));
        }
        Ok(())
    }

    /// Character device node for this bus on Linux.
    pub fn device_path(&self) -> String {
        format!("/dev/i2c-{}", self.bus)
    }
}

impl fmt::Display for I2cConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "i2c-{}@0x{:02X}", self.bus, self.address)
    }
}
