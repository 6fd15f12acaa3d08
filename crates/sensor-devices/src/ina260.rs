//! TI INA260 precision current/power monitor with integrated 2 mΩ shunt.
//!
//! All registers are 16-bit and travel MSB first. The configuration word is
//! always written whole; [`Ina260Config`] is only a typed view of it.
//!
//! Voltage, current and power are read as three separate transactions, so a
//! conversion may complete between them. Callers needing a coherent snapshot
//! should run in a triggered mode.

use crate::device::{Device, Register, RegisterDevice, SensorKind};
use crate::{DeviceError, Result};
use i2c_transport::{I2cBus, I2cConfig, TransportError};
use serde::{Deserialize, Serialize};
use std::thread;
use std::time::{Duration, Instant};

pub const DEFAULT_ADDRESS: u8 = 0x40;
pub const MANUFACTURER_ID: u16 = 0x5449;
pub const DIE_ID: u16 = 0x2270;

pub const BUS_VOLTAGE_LSB_V: f64 = 0.001_25;
pub const CURRENT_LSB_A: f64 = 0.001_25;
pub const POWER_LSB_W: f64 = 0.01;

static REGISTERS: [Register; 8] = [
    Register::u16("CONFIG", 0x00),
    Register::u16("CURRENT", 0x01),
    Register::u16("BUS_VOLTAGE", 0x02),
    Register::u16("POWER", 0x03),
    Register::u16("MASK_ENABLE", 0x06),
    Register::u16("ALERT_LIMIT", 0x07),
    Register::u16("MFG_ID", 0xFE),
    Register::u16("DIE_ID", 0xFF),
];

const RESET: u16 = 1 << 15;
/// Bits 14..12 read back as 110b.
const RESERVED: u16 = 0b110 << 12;
const CONVERSION_READY: u16 = 1 << 3;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Averaging {
    #[default]
    #[serde(rename = "avg_1")]
    Avg1 = 0,
    #[serde(rename = "avg_4")]
    Avg4 = 1,
    #[serde(rename = "avg_16")]
    Avg16 = 2,
    #[serde(rename = "avg_64")]
    Avg64 = 3,
    #[serde(rename = "avg_128")]
    Avg128 = 4,
    #[serde(rename = "avg_256")]
    Avg256 = 5,
    #[serde(rename = "avg_512")]
    Avg512 = 6,
    #[serde(rename = "avg_1024")]
    Avg1024 = 7,
}

impl Averaging {
    pub const ALL: [Averaging; 8] = [
        Averaging::Avg1,
        Averaging::Avg4,
        Averaging::Avg16,
        Averaging::Avg64,
        Averaging::Avg128,
        Averaging::Avg256,
        Averaging::Avg512,
        Averaging::Avg1024,
    ];

    pub fn samples(self) -> u32 {
        match self {
            Averaging::Avg1 => 1,
            Averaging::Avg4 => 4,
            Averaging::Avg16 => 16,
            Averaging::Avg64 => 64,
            Averaging::Avg128 => 128,
            Averaging::Avg256 => 256,
            Averaging::Avg512 => 512,
            Averaging::Avg1024 => 1024,
        }
    }

    pub fn from_bits(bits: u16) -> Self {
        Self::ALL[usize::from(bits & 0x7)]
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ConversionTime {
    #[serde(rename = "140us")]
    Us140 = 0,
    #[serde(rename = "204us")]
    Us204 = 1,
    #[serde(rename = "332us")]
    Us332 = 2,
    #[serde(rename = "588us")]
    Us588 = 3,
    #[default]
    #[serde(rename = "1100us")]
    Us1100 = 4,
    #[serde(rename = "2116us")]
    Us2116 = 5,
    #[serde(rename = "4156us")]
    Us4156 = 6,
    #[serde(rename = "8244us")]
    Us8244 = 7,
}

impl ConversionTime {
    pub const ALL: [ConversionTime; 8] = [
        ConversionTime::Us140,
        ConversionTime::Us204,
        ConversionTime::Us332,
        ConversionTime::Us588,
        ConversionTime::Us1100,
        ConversionTime::Us2116,
        ConversionTime::Us4156,
        ConversionTime::Us8244,
    ];

    pub fn micros(self) -> u32 {
        match self {
            ConversionTime::Us140 => 140,
            ConversionTime::Us204 => 204,
            ConversionTime::Us332 => 332,
            ConversionTime::Us588 => 588,
            ConversionTime::Us1100 => 1100,
            ConversionTime::Us2116 => 2116,
            ConversionTime::Us4156 => 4156,
            ConversionTime::Us8244 => 8244,
        }
    }

    pub fn from_bits(bits: u16) -> Self {
        Self::ALL[usize::from(bits & 0x7)]
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatingMode {
    PowerDown = 0,
    ShuntTriggered = 1,
    BusTriggered = 2,
    ShuntBusTriggered = 3,
    PowerDown2 = 4,
    ShuntContinuous = 5,
    BusContinuous = 6,
    #[default]
    ShuntBusContinuous = 7,
}

impl OperatingMode {
    pub const ALL: [OperatingMode; 8] = [
        OperatingMode::PowerDown,
        OperatingMode::ShuntTriggered,
        OperatingMode::BusTriggered,
        OperatingMode::ShuntBusTriggered,
        OperatingMode::PowerDown2,
        OperatingMode::ShuntContinuous,
        OperatingMode::BusContinuous,
        OperatingMode::ShuntBusContinuous,
    ];

    pub fn from_bits(bits: u16) -> Self {
        Self::ALL[usize::from(bits & 0x7)]
    }

    pub fn is_power_down(self) -> bool {
        matches!(self, OperatingMode::PowerDown | OperatingMode::PowerDown2)
    }

    pub fn is_continuous(self) -> bool {
        matches!(
            self,
            OperatingMode::ShuntContinuous
                | OperatingMode::BusContinuous
                | OperatingMode::ShuntBusContinuous
        )
    }

    pub fn is_triggered(self) -> bool {
        matches!(
            self,
            OperatingMode::ShuntTriggered
                | OperatingMode::BusTriggered
                | OperatingMode::ShuntBusTriggered
        )
    }
}

/// Typed view of the CONFIG register. The default encodes to the power-on
/// value `0x6127`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(from = "Ina260ConfigDoc")]
pub struct Ina260Config {
    pub averaging: Averaging,
    pub bus_conversion_time: ConversionTime,
    pub shunt_conversion_time: ConversionTime,
    pub mode: OperatingMode,
    /// Set RST; the chip clears it itself after the reset completes.
    pub reset: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Ina260ConfigDoc {
    Raw {
        config_reg: u16,
    },
    /// Per-field codes as written by the older tooling; extra keys are ignored.
    Codes {
        avg: u16,
        #[serde(default)]
        vbus_ct: u16,
        #[serde(default)]
        ishunt_ct: u16,
        #[serde(default = "continuous_code")]
        mode: u16,
    },
    Fields(Ina260Fields),
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct Ina260Fields {
    #[serde(default)]
    averaging: Averaging,
    #[serde(default)]
    bus_conversion_time: ConversionTime,
    #[serde(default)]
    shunt_conversion_time: ConversionTime,
    #[serde(default)]
    mode: OperatingMode,
    #[serde(default)]
    reset: bool,
}

fn continuous_code() -> u16 {
    OperatingMode::ShuntBusContinuous as u16
}

impl From<Ina260ConfigDoc> for Ina260Config {
    fn from(doc: Ina260ConfigDoc) -> Self {
        match doc {
            Ina260ConfigDoc::Raw { config_reg } => Ina260Config::from_word(config_reg),
            Ina260ConfigDoc::Codes {
                avg,
                vbus_ct,
                ishunt_ct,
                mode,
            } => Ina260Config {
                averaging: Averaging::from_bits(avg),
                bus_conversion_time: ConversionTime::from_bits(vbus_ct),
                shunt_conversion_time: ConversionTime::from_bits(ishunt_ct),
                mode: OperatingMode::from_bits(mode),
                reset: false,
            },
            Ina260ConfigDoc::Fields(Ina260Fields {
                averaging,
                bus_conversion_time,
                shunt_conversion_time,
                mode,
                reset,
            }) => Ina260Config {
                averaging,
                bus_conversion_time,
                shunt_conversion_time,
                mode,
                reset,
            },
        }
    }
}

impl Ina260Config {
    pub fn to_word(&self) -> u16 {
        let mut word = RESERVED
            | (self.averaging as u16) << 9
            | (self.bus_conversion_time as u16) << 6
            | (self.shunt_conversion_time as u16) << 3
            | self.mode as u16;
        if self.reset {
            word |= RESET;
        }
        word
    }

    pub fn from_word(word: u16) -> Self {
        Self {
            averaging: Averaging::from_bits(word >> 9),
            bus_conversion_time: ConversionTime::from_bits(word >> 6),
            shunt_conversion_time: ConversionTime::from_bits(word >> 3),
            mode: OperatingMode::from_bits(word),
            reset: word & RESET != 0,
        }
    }

    /// Time one full measurement takes with averaging applied.
    pub fn conversion_period(&self) -> Duration {
        let per_sample = match self.mode {
            OperatingMode::ShuntTriggered | OperatingMode::ShuntContinuous => {
                self.shunt_conversion_time.micros()
            }
            OperatingMode::BusTriggered | OperatingMode::BusContinuous => {
                self.bus_conversion_time.micros()
            }
            _ => self.shunt_conversion_time.micros() + self.bus_conversion_time.micros(),
        };
        Duration::from_micros(u64::from(per_sample) * u64::from(self.averaging.samples()))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InaState {
    Unconfigured,
    Configured,
    Closed,
}

/// One decoded measurement plus the raw register words it came from.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct PowerReading {
    pub bus_voltage_v: f64,
    pub current_a: f64,
    pub power_w: f64,
    pub raw_bus: u16,
    pub raw_current: u16,
    pub raw_power: u16,
}

impl PowerReading {
    pub fn decode(raw_bus: u16, raw_current: u16, raw_power: u16) -> Self {
        Self {
            bus_voltage_v: decode_bus_voltage(raw_bus),
            current_a: decode_current(raw_current),
            power_w: decode_power(raw_power),
            raw_bus,
            raw_current,
            raw_power,
        }
    }
}

pub fn decode_bus_voltage(raw: u16) -> f64 {
    f64::from(raw) * BUS_VOLTAGE_LSB_V
}

/// Two's complement, 1.25 mA per LSB.
pub fn decode_current(raw: u16) -> f64 {
    f64::from(raw as i16) * CURRENT_LSB_A
}

pub fn decode_power(raw: u16) -> f64 {
    f64::from(raw) * POWER_LSB_W
}

pub struct Ina260<B: I2cBus> {
    regs: RegisterDevice<B>,
    config: Option<Ina260Config>,
    state: InaState,
}

impl<B: I2cBus> Ina260<B> {
    pub fn new(bus: B) -> Self {
        Self {
            regs: RegisterDevice::new(bus, &REGISTERS),
            config: None,
            state: InaState::Unconfigured,
        }
    }

    pub fn open(cfg: &I2cConfig) -> Result<Self> {
        Ok(Self::new(B::open(cfg)?))
    }

    pub fn state(&self) -> InaState {
        self.state
    }

    pub fn config(&self) -> Option<&Ina260Config> {
        self.config.as_ref()
    }

    pub fn registers(&mut self) -> &mut RegisterDevice<B> {
        &mut self.regs
    }

    /// `(manufacturer, die)`; expect `(0x5449, 0x2270)`.
    pub fn read_ids(&mut self) -> Result<(u16, u16)> {
        if self.state == InaState::Closed {
            return Err(DeviceError::NotConfigured);
        }
        let mfg = self.regs.read_register16("MFG_ID")?;
        let die = self.regs.read_register16("DIE_ID")?;
        Ok((mfg, die))
    }

    // Writing CONFIG in a triggered mode starts one conversion; CVRF sets
    // when it completes and clears when MASK_ENABLE is read.
    fn trigger(&mut self, cfg: &Ina260Config) -> Result<()> {
        let word = Ina260Config { reset: false, ..*cfg }.to_word();
        self.regs.write_register16("CONFIG", word)?;
        let timeout = cfg.conversion_period() * 2 + Duration::from_millis(10);
        let t0 = Instant::now();
        loop {
            let flags = self.regs.read_register16("MASK_ENABLE")?;
            if flags & CONVERSION_READY != 0 {
                return Ok(());
            }
            if t0.elapsed() > timeout {
                tracing::error!(flags, "ina260 conversion did not complete");
                return Err(DeviceError::Io(TransportError::Timeout));
            }
            thread::sleep(Duration::from_millis(1));
        }
    }
}

impl<B: I2cBus> Device for Ina260<B> {
    type Config = Ina260Config;
    type Reading = PowerReading;

    const KIND: SensorKind = SensorKind::Ina260;

    fn configure(&mut self, cfg: Ina260Config) -> Result<()> {
        if self.state == InaState::Closed {
            return Err(DeviceError::NotConfigured);
        }
        let word = cfg.to_word();
        // RST self-clears, so the word is never read back for verification
        self.regs.write_register16("CONFIG", word)?;
        self.config = Some(cfg);
        self.state = InaState::Configured;
        let hex = format!("0x{word:04X}");
        tracing::info!(
            endpoint = %self.regs.endpoint(),
            config = %hex,
            averaging = cfg.averaging.samples(),
            mode = ?cfg.mode,
            "ina260 configured"
        );
        Ok(())
    }

    fn read(&mut self) -> Result<PowerReading> {
        let cfg = match (self.state, self.config) {
            (InaState::Configured, Some(cfg)) => cfg,
            _ => return Err(DeviceError::NotConfigured),
        };
        // Result registers hold stale values while powered down
        if cfg.mode.is_power_down() {
            return Err(DeviceError::NotConfigured);
        }
        if cfg.mode.is_triggered() {
            self.trigger(&cfg)?;
        }
        let raw_bus = self.regs.read_register16("BUS_VOLTAGE")?;
        let raw_current = self.regs.read_register16("CURRENT")?;
        let raw_power = self.regs.read_register16("POWER")?;
        let reading = PowerReading::decode(raw_bus, raw_current, raw_power);
        tracing::debug!(
            bus_voltage_v = reading.bus_voltage_v,
            current_a = reading.current_a,
            power_w = reading.power_w,
            "ina260 reading"
        );
        Ok(reading)
    }

    fn close(&mut self) -> Result<()> {
        if self.state == InaState::Closed {
            return Ok(());
        }
        self.state = InaState::Closed;
        self.regs.close()
    }

    fn endpoint(&self) -> &I2cConfig {
        self.regs.endpoint()
    }
}
