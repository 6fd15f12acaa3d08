//! Common device contract shared by every chip driver.
//!
//! A chip driver owns a [`RegisterDevice`], which binds one transport handle to
//! the chip's fixed symbolic register map, and implements [`Device`] for its
//! typed configuration and readings. The polling side only ever sees the
//! object-safe [`Sensor`] capability set.

use crate::adc128d818::AdcSample;
use crate::ina260::PowerReading;
use crate::{DeviceError, Result};
use i2c_transport::{I2cBus, I2cConfig};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RegisterWidth {
    U8,
    U16,
}

/// One entry in a chip's register map.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Register {
    pub name: &'static str,
    pub address: u8,
    pub width: RegisterWidth,
}

impl Register {
    pub const fn u8(name: &'static str, address: u8) -> Self {
        Self {
            name,
            address,
            width: RegisterWidth::U8,
        }
    }

    pub const fn u16(name: &'static str, address: u8) -> Self {
        Self {
            name,
            address,
            width: RegisterWidth::U16,
        }
    }
}

/// Symbolic name to address mapping, fixed for the lifetime of a driver.
pub type RegisterMap = &'static [Register];

pub fn lookup(map: RegisterMap, name: &str) -> Result<&'static Register> {
    map.iter()
        .find(|r| r.name == name)
        .ok_or_else(|| DeviceError::InvalidRegister(name.to_string()))
}

/// A transport handle plus the register map it is addressed through.
pub struct RegisterDevice<B: I2cBus> {
    bus: B,
    map: RegisterMap,
    closed: bool,
}

impl<B: I2cBus> RegisterDevice<B> {
    pub fn new(bus: B, map: RegisterMap) -> Self {
        Self {
            bus,
            map,
            closed: false,
        }
    }

    pub fn endpoint(&self) -> &I2cConfig {
        self.bus.config()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn resolve(&self, name: &str, width: RegisterWidth) -> Result<u8> {
        if self.closed {
            return Err(DeviceError::NotConfigured);
        }
        let reg = lookup(self.map, name)?;
        if reg.width != width {
            return Err(DeviceError::InvalidRegister(format!(
                "{name} is {:?}, accessed as {width:?}",
                reg.width
            )));
        }
        Ok(reg.address)
    }

    fn resolve_any(&self, name: &str) -> Result<u8> {
        if self.closed {
            return Err(DeviceError::NotConfigured);
        }
        Ok(lookup(self.map, name)?.address)
    }

    pub fn read_register8(&mut self, name: &str) -> Result<u8> {
        let addr = self.resolve(name, RegisterWidth::U8)?;
        let val = self.bus.read_u8(addr)?;
        tracing::trace!(reg = name, value = val, "read8");
        Ok(val)
    }

    pub fn write_register8(&mut self, name: &str, value: u8) -> Result<()> {
        let addr = self.resolve(name, RegisterWidth::U8)?;
        tracing::trace!(reg = name, value, "write8");
        self.bus.write_u8(addr, value)?;
        Ok(())
    }

    /// 16-bit registers travel MSB first on both supported chips.
    pub fn read_register16(&mut self, name: &str) -> Result<u16> {
        let addr = self.resolve(name, RegisterWidth::U16)?;
        let data = self.bus.read_block(addr, 2)?;
        let val = match data.as_slice() {
            [hi, lo, ..] => u16::from_be_bytes([*hi, *lo]),
            _ => {
                return Err(DeviceError::Io(i2c_transport::TransportError::Io(format!(
                    "short read on {name}: {} bytes",
                    data.len()
                ))))
            }
        };
        tracing::trace!(reg = name, value = val, "read16");
        Ok(val)
    }

    pub fn write_register16(&mut self, name: &str, value: u16) -> Result<()> {
        let addr = self.resolve(name, RegisterWidth::U16)?;
        tracing::trace!(reg = name, value, "write16");
        self.bus.write_block(addr, &value.to_be_bytes())?;
        Ok(())
    }

    pub fn read_block(&mut self, name: &str, len: usize) -> Result<Vec<u8>> {
        let addr = self.resolve_any(name)?;
        Ok(self.bus.read_block(addr, len)?)
    }

    pub fn write_block(&mut self, name: &str, data: &[u8]) -> Result<()> {
        let addr = self.resolve_any(name)?;
        self.bus.write_block(addr, data)?;
        Ok(())
    }

    /// Read every register named in `names`, widening 8-bit values.
    pub fn dump(&mut self, names: &[&'static str]) -> Result<Vec<(&'static str, u16)>> {
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            let reg = lookup(self.map, name)?;
            let val = match reg.width {
                RegisterWidth::U8 => u16::from(self.read_register8(name)?),
                RegisterWidth::U16 => self.read_register16(name)?,
            };
            out.push((reg.name, val));
        }
        Ok(out)
    }

    /// Every register in the map, in map order.
    pub fn dump_all(&mut self) -> Result<Vec<(&'static str, u16)>> {
        let names: Vec<&'static str> = self.map.iter().map(|r| r.name).collect();
        self.dump(&names)
    }

    /// Release the transport. Closing twice is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.bus.close()?;
        Ok(())
    }
}

/// Lifecycle every chip driver follows: configure, read any number of times, close.
pub trait Device {
    type Config;
    type Reading;

    const KIND: SensorKind;

    /// Validate `cfg`, then program the chip. Validation failures happen before
    /// any bus traffic.
    fn configure(&mut self, cfg: Self::Config) -> Result<()>;

    fn read(&mut self) -> Result<Self::Reading>;

    /// Release the transport; further calls fail with `NotConfigured`.
    fn close(&mut self) -> Result<()>;

    fn endpoint(&self) -> &I2cConfig;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    Adc128d818,
    Ina260,
}

impl SensorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SensorKind::Adc128d818 => "adc128d818",
            SensorKind::Ina260 => "ina260",
        }
    }
}

/// One reading from any supported chip.
#[derive(Clone, Debug, PartialEq)]
pub enum Reading {
    Adc(AdcSample),
    Power(PowerReading),
}

impl From<AdcSample> for Reading {
    fn from(s: AdcSample) -> Self {
        Reading::Adc(s)
    }
}

impl From<PowerReading> for Reading {
    fn from(r: PowerReading) -> Self {
        Reading::Power(r)
    }
}

/// Object-safe view the scheduler drives; callers never name a concrete chip.
pub trait Sensor {
    fn name(&self) -> &str;
    fn kind(&self) -> SensorKind;
    fn configure(&mut self) -> Result<()>;
    fn read(&mut self) -> Result<Reading>;
    fn close(&mut self) -> Result<()>;
}

pub type DynSensor = Box<dyn Sensor + Send>;

/// A driver paired with the configuration it applies on `configure()`.
pub struct BoundSensor<D: Device> {
    name: String,
    device: D,
    config: D::Config,
}

impl<D: Device> BoundSensor<D> {
    pub fn new(name: impl Into<String>, device: D, config: D::Config) -> Self {
        Self {
            name: name.into(),
            device,
            config,
        }
    }
}

impl<D> Sensor for BoundSensor<D>
where
    D: Device,
    D::Config: Clone,
    D::Reading: Into<Reading>,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SensorKind {
        D::KIND
    }

    fn configure(&mut self) -> Result<()> {
        tracing::info!(sensor = %self.name, endpoint = %self.device.endpoint(), "configuring");
        self.device.configure(self.config.clone())
    }

    fn read(&mut self) -> Result<Reading> {
        self.device.read().map(Into::into)
    }

    fn close(&mut self) -> Result<()> {
        self.device.close()
    }
}
