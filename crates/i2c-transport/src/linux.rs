use crate::{I2cBus, I2cConfig, Result, TransportError, MAX_ADDRESS, MIN_ADDRESS};
use i2cdev::core::I2CDevice;
use i2cdev::linux::{LinuxI2CDevice, LinuxI2CError};
use std::io;

/// errno values the kernel reports when nothing acknowledges the address.
const ENXIO: i32 = 6;
const EREMOTEIO: i32 = 121;

/// SMBus byte/block transfers through `/dev/i2c-N`.
pub struct LinuxBus {
    cfg: I2cConfig,
    dev: Option<LinuxI2CDevice>,
}

impl LinuxBus {
    fn dev(&mut self) -> Result<&mut LinuxI2CDevice> {
        self.dev
            .as_mut()
            .ok_or_else(|| TransportError::Io("device handle closed".into()))
    }

    fn map_err(cfg: &I2cConfig, e: LinuxI2CError) -> TransportError {
        let e = io::Error::from(e);
        match e.raw_os_error() {
            Some(ENXIO) | Some(EREMOTEIO) => TransportError::NoDevice {
                bus: cfg.bus,
                address: cfg.address,
            },
            _ if e.kind() == io::ErrorKind::TimedOut => TransportError::Timeout,
            _ => TransportError::Io(e.to_string()),
        }
    }
}

impl I2cBus for LinuxBus {
    fn open(cfg: &I2cConfig) -> Result<Self> {
        cfg.validate()?;
        let path = cfg.device_path();
        let dev = LinuxI2CDevice::new(&path, u16::from(cfg.address)).map_err(|e| {
            let e = io::Error::from(e);
            if e.kind() == io::ErrorKind::NotFound {
                TransportError::InvalidConfig(format!("no such bus: {path}"))
            } else {
                TransportError::Io(format!("{path}: {e}"))
            }
        })?;
        tracing::debug!(endpoint = %cfg, "opened linux i2c device");
        Ok(Self {
            cfg: *cfg,
            dev: Some(dev),
        })
    }

    fn config(&self) -> &I2cConfig {
        &self.cfg
    }

    fn read_u8(&mut self, reg: u8) -> Result<u8> {
        let cfg = self.cfg;
        self.dev()?
            .smbus_read_byte_data(reg)
            .map_err(|e| Self::map_err(&cfg, e))
    }

    fn write_u8(&mut self, reg: u8, value: u8) -> Result<()> {
        let cfg = self.cfg;
        self.dev()?
            .smbus_write_byte_data(reg, value)
            .map_err(|e| Self::map_err(&cfg, e))
    }

    fn read_block(&mut self, reg: u8, len: usize) -> Result<Vec<u8>> {
        // SMBus I2C-block transfers carry at most 32 bytes
        let len = u8::try_from(len)
            .ok()
            .filter(|l| *l <= 32)
            .ok_or(TransportError::Unsupported("block reads longer than 32 bytes"))?;
        let cfg = self.cfg;
        self.dev()?
            .smbus_read_i2c_block_data(reg, len)
            .map_err(|e| Self::map_err(&cfg, e))
    }

    fn write_block(&mut self, reg: u8, data: &[u8]) -> Result<()> {
        if data.len() > 32 {
            return Err(TransportError::Unsupported(
                "block writes longer than 32 bytes",
            ));
        }
        let cfg = self.cfg;
        self.dev()?
            .smbus_write_i2c_block_data(reg, data)
            .map_err(|e| Self::map_err(&cfg, e))
    }

    fn close(&mut self) -> Result<()> {
        if self.dev.take().is_some() {
            tracing::debug!(endpoint = %self.cfg, "closed linux i2c device");
        }
        Ok(())
    }

    fn scan(bus: u32) -> Result<Vec<u8>> {
        let path = format!("/dev/i2c-{bus}");
        let mut found = Vec::new();
        for addr in MIN_ADDRESS..=MAX_ADDRESS {
            let mut dev = match LinuxI2CDevice::new(&path, u16::from(addr)) {
                Ok(d) => d,
                Err(e) => {
                    let e = io::Error::from(e);
                    if e.kind() == io::ErrorKind::NotFound {
                        return Err(TransportError::InvalidConfig(format!(
                            "no such bus: {path}"
                        )));
                    }
                    // Address claimed by a kernel driver
                    tracing::debug!(address = addr, error = %e, "skipping address");
                    continue;
                }
            };
            if dev.smbus_write_quick(false).is_ok() {
                tracing::info!(bus, address = addr, "found device");
                found.push(addr);
            }
        }
        Ok(found)
    }
}
