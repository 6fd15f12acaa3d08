//! i2c-transport: blocking I2C register transport abstractions
//!
//! This crate provides the register-level transport trait the sensor drivers are
//! written against, with feature-gated backends. The default build enables a
//! `mock` backend so that binaries and tests run on any host without hardware.

mod types;
pub use types::{I2cConfig, DEFAULT_CLOCK_HZ, MAX_ADDRESS, MIN_ADDRESS};

mod error;
pub use error::{Result, TransportError};

mod traits;
pub use traits::I2cBus;

#[cfg(feature = "mock")]
mod mock;

#[cfg(feature = "mock")]
pub use mock::{MockBus, MockHandle};

#[cfg(feature = "linux")]
mod linux;

#[cfg(feature = "linux")]
pub use linux::LinuxBus;
