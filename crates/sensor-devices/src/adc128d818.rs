//! TI ADC128D818: 8-channel, 12-bit ADC with local temperature sensor and an
//! internal 2.56 V reference.
//!
//! Channel-disable, conversion-rate and advanced-configuration registers only
//! accept writes while the chip is in shutdown (START clear), so every mutator
//! here stops conversions first and restores them afterwards when asked to.
//!
//! Mode table (ADV_CONFIG bits 2:1), stored raw and never reinterpreted:
//!
//! | mode | logical channels                                                |
//! |------|-----------------------------------------------------------------|
//! | 0    | IN0..IN6 single-ended, ch7 local temperature                    |
//! | 1    | IN0..IN7 single-ended                                           |
//! | 2    | IN0-IN1, IN3-IN2, IN4-IN5, IN7-IN6 differential, ch4..7 unused  |
//! | 3    | IN0..IN3 single-ended, IN4-IN5, IN7-IN6 differential, ch7 temp  |

use crate::device::{Device, Register, RegisterDevice, SensorKind};
use crate::{DeviceError, Result};
use i2c_transport::{I2cBus, I2cConfig, TransportError};
use serde::{Deserialize, Serialize};
use std::thread;
use std::time::{Duration, Instant};

pub const DEFAULT_ADDRESS: u8 = 0x1D;
pub const CHANNELS: usize = 8;
pub const INTERNAL_VREF_V: f64 = 2.56;
const CODE_SPAN: f64 = 4096.0;

pub const MANUFACTURER_ID: u8 = 0x01;
pub const REVISION_ID: u8 = 0x09;

/// Settling time after INITIALIZATION before registers are touched.
const RESET_SETTLE: Duration = Duration::from_millis(10);
const READY_TIMEOUT: Duration = Duration::from_secs(1);

mod reg {
    pub const CONFIG: &str = "CONFIG";
    pub const INT_STATUS: &str = "INT_STATUS";
    pub const INT_MASK: &str = "INT_MASK";
    pub const CONV_RATE: &str = "CONV_RATE";
    pub const CH_DISABLE: &str = "CH_DISABLE";
    pub const ONE_SHOT: &str = "ONE_SHOT";
    pub const DEEP_SHUTDOWN: &str = "DEEP_SHUTDOWN";
    pub const ADV_CONFIG: &str = "ADV_CONFIG";
    pub const BUSY_STATUS: &str = "BUSY_STATUS";
    pub const MFG_ID: &str = "MFG_ID";
    pub const REV_ID: &str = "REV_ID";

    pub const READING: [&str; 8] = ["IN0", "IN1", "IN2", "IN3", "IN4", "IN5", "IN6", "IN7"];
    pub const HIGH_LIMIT: [&str; 8] = [
        "IN0_HIGH", "IN1_HIGH", "IN2_HIGH", "IN3_HIGH", "IN4_HIGH", "IN5_HIGH", "IN6_HIGH",
        "IN7_HIGH",
    ];
    pub const LOW_LIMIT: [&str; 8] = [
        "IN0_LOW", "IN1_LOW", "IN2_LOW", "IN3_LOW", "IN4_LOW", "IN5_LOW", "IN6_LOW", "IN7_LOW",
    ];

    /// Control registers logged after configure.
    pub const CONTROL: [&str; 9] = [
        CONFIG,
        INT_STATUS,
        INT_MASK,
        CONV_RATE,
        CH_DISABLE,
        DEEP_SHUTDOWN,
        ADV_CONFIG,
        BUSY_STATUS,
        REV_ID,
    ];
}

static REGISTERS: [Register; 35] = [
    Register::u8(reg::CONFIG, 0x00),
    Register::u8(reg::INT_STATUS, 0x01),
    Register::u8(reg::INT_MASK, 0x03),
    Register::u8(reg::CONV_RATE, 0x07),
    Register::u8(reg::CH_DISABLE, 0x08),
    Register::u8(reg::ONE_SHOT, 0x09),
    Register::u8(reg::DEEP_SHUTDOWN, 0x0A),
    Register::u8(reg::ADV_CONFIG, 0x0B),
    Register::u8(reg::BUSY_STATUS, 0x0C),
    // Results: 12-bit code left justified in a 16-bit pair
    Register::u16("IN0", 0x20),
    Register::u16("IN1", 0x21),
    Register::u16("IN2", 0x22),
    Register::u16("IN3", 0x23),
    Register::u16("IN4", 0x24),
    Register::u16("IN5", 0x25),
    Register::u16("IN6", 0x26),
    Register::u16("IN7", 0x27),
    // Limits compare against the 8 MSBs of the code
    Register::u8("IN0_HIGH", 0x2A),
    Register::u8("IN0_LOW", 0x2B),
    Register::u8("IN1_HIGH", 0x2C),
    Register::u8("IN1_LOW", 0x2D),
    Register::u8("IN2_HIGH", 0x2E),
    Register::u8("IN2_LOW", 0x2F),
    Register::u8("IN3_HIGH", 0x30),
    Register::u8("IN3_LOW", 0x31),
    Register::u8("IN4_HIGH", 0x32),
    Register::u8("IN4_LOW", 0x33),
    Register::u8("IN5_HIGH", 0x34),
    Register::u8("IN5_LOW", 0x35),
    Register::u8("IN6_HIGH", 0x36),
    Register::u8("IN6_LOW", 0x37),
    Register::u8("IN7_HIGH", 0x38),
    Register::u8("IN7_LOW", 0x39),
    Register::u8(reg::MFG_ID, 0x3E),
    Register::u8(reg::REV_ID, 0x3F),
];

mod bits {
    pub const START: u8 = 0x01;
    pub const INITIALIZATION: u8 = 0x80;
    pub const BUSY: u8 = 0x01;
    pub const NOT_READY: u8 = 0x02;
    pub const EXTERNAL_REF: u8 = 0x01;
    pub const CONTINUOUS: u8 = 0x01;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoltageReference {
    /// On-chip 2.56 V reference.
    #[default]
    Internal,
    /// Volts applied to the VREF pin.
    External(f64),
}

impl VoltageReference {
    pub fn volts(self) -> f64 {
        match self {
            VoltageReference::Internal => INTERNAL_VREF_V,
            VoltageReference::External(v) => v,
        }
    }
}

/// How a one-shot read waits for its conversion.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionWait {
    /// Poll BUSY_STATUS until the busy bit clears.
    BusyPoll { timeout_ms: u64, interval_ms: u64 },
    /// Sleep a fixed worst-case duration; compatibility mode for boards where
    /// the status register is unreliable.
    FixedDelay { delay_ms: u64 },
}

impl Default for ConversionWait {
    fn default() -> Self {
        ConversionWait::BusyPoll {
            timeout_ms: 1000,
            interval_ms: 10,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Adc128d818Config {
    /// Set START after programming.
    pub start: bool,
    /// Continuous conversion; otherwise low-power / one-shot.
    pub continuous: bool,
    /// Bit i disables channel i.
    pub disable_mask: u8,
    /// 0..=3, see the module-level mode table.
    pub mode: u8,
    /// Per-channel scale for external resistor dividers, e.g. 4.0 for 10k/30k.
    #[serde(alias = "extResistorMultipliers")]
    pub ext_resistor_multipliers: Vec<f64>,
    pub reference: VoltageReference,
    pub conversion_wait: ConversionWait,
}

impl Default for Adc128d818Config {
    fn default() -> Self {
        Self {
            start: true,
            continuous: true,
            disable_mask: 0x00,
            mode: 0,
            ext_resistor_multipliers: vec![1.0; CHANNELS],
            reference: VoltageReference::Internal,
            conversion_wait: ConversionWait::default(),
        }
    }
}

impl Adc128d818Config {
    pub fn validate(&self) -> Result<()> {
        if self.mode > 3 {
            return Err(DeviceError::InvalidConfig(format!(
                "mode must be within 0..=3, got {}",
                self.mode
            )));
        }
        if self.ext_resistor_multipliers.len() != CHANNELS {
            return Err(DeviceError::InvalidConfig(format!(
                "expected {CHANNELS} resistor multipliers, got {}",
                self.ext_resistor_multipliers.len()
            )));
        }
        if let Some((i, m)) = self
            .ext_resistor_multipliers
            .iter()
            .enumerate()
            .find(|(_, m)| !(m.is_finite() && **m > 0.0))
        {
            return Err(DeviceError::InvalidConfig(format!(
                "multiplier for channel {i} must be positive, got {m}"
            )));
        }
        let vref = self.reference.volts();
        if !(vref.is_finite() && vref > 0.0) {
            return Err(DeviceError::InvalidConfig(format!(
                "reference voltage must be positive, got {vref}"
            )));
        }
        if let ConversionWait::BusyPoll { timeout_ms: 0, .. } = self.conversion_wait {
            return Err(DeviceError::InvalidConfig(
                "busy poll timeout must be non-zero".into(),
            ));
        }
        Ok(())
    }

    pub fn is_enabled(&self, channel: usize) -> bool {
        channel < CHANNELS && (self.disable_mask >> channel) & 1 == 0
    }

    fn adv_config(&self) -> u8 {
        let ext = match self.reference {
            VoltageReference::Internal => 0,
            VoltageReference::External(_) => bits::EXTERNAL_REF,
        };
        ((self.mode & 0x03) << 1) | ext
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AdcState {
    Unconfigured,
    ShutdownConfiguring,
    /// Configured with START clear; reads trigger one-shot conversions.
    Shutdown,
    Running { continuous: bool },
    /// A register write failed mid-sequence; chip contents are unknown.
    Inconsistent,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ChannelReading {
    /// 12-bit conversion code.
    pub code: u16,
    pub volts: f64,
}

/// One pass over all eight logical channels; disabled channels are `None`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AdcSample {
    pub channels: [Option<ChannelReading>; CHANNELS],
}

impl AdcSample {
    pub fn volts(&self) -> [Option<f64>; CHANNELS] {
        self.channels.map(|c| c.map(|r| r.volts))
    }

    pub fn present(&self) -> usize {
        self.channels.iter().filter(|c| c.is_some()).count()
    }
}

/// `code * (vref / 4096) * multiplier`
pub fn code_to_volts(code: u16, vref: f64, multiplier: f64) -> f64 {
    f64::from(code & 0x0FFF) * (vref / CODE_SPAN) * multiplier
}

/// Reassemble the 12-bit code from the MSB byte and upper nibble of the LSB byte.
pub fn decode_code(raw: u16) -> u16 {
    (raw >> 4) & 0x0FFF
}

pub struct Adc128d818<B: I2cBus> {
    regs: RegisterDevice<B>,
    config: Option<Adc128d818Config>,
    state: AdcState,
}

impl<B: I2cBus> Adc128d818<B> {
    pub fn new(bus: B) -> Self {
        Self {
            regs: RegisterDevice::new(bus, &REGISTERS),
            config: None,
            state: AdcState::Unconfigured,
        }
    }

    pub fn open(cfg: &I2cConfig) -> Result<Self> {
        Ok(Self::new(B::open(cfg)?))
    }

    pub fn state(&self) -> AdcState {
        self.state
    }

    pub fn config(&self) -> Option<&Adc128d818Config> {
        self.config.as_ref()
    }

    /// Raw register access for diagnostics.
    pub fn registers(&mut self) -> &mut RegisterDevice<B> {
        &mut self.regs
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state == AdcState::Closed {
            return Err(DeviceError::NotConfigured);
        }
        Ok(())
    }

    fn ready_config(&self) -> Result<&Adc128d818Config> {
        match (self.state, self.config.as_ref()) {
            (AdcState::Shutdown | AdcState::Running { .. }, Some(cfg)) => Ok(cfg),
            _ => Err(DeviceError::NotConfigured),
        }
    }

    fn program(&mut self, cfg: &Adc128d818Config) -> Result<()> {
        // INITIALIZATION restores power-on defaults and leaves START clear
        self.regs
            .write_register8(reg::CONFIG, bits::INITIALIZATION)?;
        thread::sleep(RESET_SETTLE);
        self.wait_status_clear(bits::NOT_READY, READY_TIMEOUT, Duration::from_millis(10))?;

        self.regs.write_register8(reg::CH_DISABLE, cfg.disable_mask)?;
        self.regs.write_register8(reg::ADV_CONFIG, cfg.adv_config())?;
        self.regs.write_register8(
            reg::CONV_RATE,
            if cfg.continuous { bits::CONTINUOUS } else { 0 },
        )?;
        // INT output stays disabled in CONFIG; status bits still latch
        self.regs.write_register8(reg::INT_MASK, 0x00)?;
        for ch in 0..CHANNELS {
            self.regs.write_register8(reg::HIGH_LIMIT[ch], 0xFF)?;
            self.regs.write_register8(reg::LOW_LIMIT[ch], 0x00)?;
        }

        if cfg.start {
            self.regs.write_register8(reg::CONFIG, bits::START)?;
        }
        Ok(())
    }

    fn log_registers(&mut self) {
        match self.regs.dump(&reg::CONTROL) {
            Ok(dump) => {
                for (name, val) in dump {
                    let bin = format!("0b{val:08b}");
                    tracing::debug!(reg = name, value = %bin, "adc128d818 register");
                }
            }
            Err(e) => tracing::debug!(error = %e, "adc128d818 register dump failed"),
        }
    }

    fn wait_status_clear(&mut self, mask: u8, timeout: Duration, interval: Duration) -> Result<()> {
        let t0 = Instant::now();
        loop {
            let status = self.regs.read_register8(reg::BUSY_STATUS)?;
            if status & mask == 0 {
                return Ok(());
            }
            if t0.elapsed() > timeout {
                tracing::error!(status, "adc128d818 status did not clear");
                return Err(DeviceError::Io(TransportError::Timeout));
            }
            thread::sleep(interval);
        }
    }

    /// Wait for the power-up NOT READY bit to clear.
    pub fn wait_until_ready(&mut self, timeout: Duration) -> Result<()> {
        self.ensure_open()?;
        self.wait_status_clear(bits::NOT_READY, timeout, Duration::from_millis(10))
    }

    fn set_start_bit(&mut self, enable: bool) -> Result<()> {
        let mut cfg = self.regs.read_register8(reg::CONFIG)?;
        if enable {
            cfg |= bits::START;
        } else {
            cfg &= !bits::START;
        }
        self.regs.write_register8(reg::CONFIG, cfg)
    }

    /// Stop conversions, apply `f`, then restart if the chip was running and
    /// `restore` is set. Any I/O failure marks the driver inconsistent.
    fn while_shutdown<F>(&mut self, restore: bool, f: F) -> Result<()>
    where
        F: FnOnce(&mut RegisterDevice<B>, &mut Adc128d818Config) -> Result<()>,
    {
        let was_running = matches!(self.state, AdcState::Running { .. });
        let mut cfg = self.ready_config()?.clone();
        self.state = AdcState::ShutdownConfiguring;

        let res = (|| -> Result<()> {
            self.set_start_bit(false)?;
            f(&mut self.regs, &mut cfg)?;
            if restore && was_running {
                self.set_start_bit(true)?;
            }
            Ok(())
        })();

        match res {
            Ok(()) => {
                let running = restore && was_running;
                cfg.start = running;
                self.state = if running {
                    AdcState::Running {
                        continuous: cfg.continuous,
                    }
                } else {
                    AdcState::Shutdown
                };
                self.config = Some(cfg);
                Ok(())
            }
            Err(e @ DeviceError::Io(_)) => {
                self.state = AdcState::Inconsistent;
                Err(e)
            }
            Err(e) => {
                // Nothing reached the wire; keep the previous state
                self.state = if was_running {
                    AdcState::Running {
                        continuous: cfg.continuous,
                    }
                } else {
                    AdcState::Shutdown
                };
                Err(e)
            }
        }
    }

    /// Reprogram CH_DISABLE; only legal in shutdown, handled here.
    pub fn set_disable_mask(&mut self, mask: u8, restore: bool) -> Result<()> {
        self.while_shutdown(restore, |regs, cfg| {
            regs.write_register8(reg::CH_DISABLE, mask)?;
            cfg.disable_mask = mask;
            Ok(())
        })
    }

    pub fn set_mode(&mut self, mode: u8, restore: bool) -> Result<()> {
        if mode > 3 {
            return Err(DeviceError::InvalidConfig(format!(
                "mode must be within 0..=3, got {mode}"
            )));
        }
        self.while_shutdown(restore, |regs, cfg| {
            cfg.mode = mode;
            regs.write_register8(reg::ADV_CONFIG, cfg.adv_config())
        })
    }

    /// Start or stop conversions without touching the rest of the setup.
    pub fn set_running(&mut self, enable: bool) -> Result<()> {
        let continuous = self.ready_config()?.continuous;
        if let Err(e) = self.set_start_bit(enable) {
            self.state = AdcState::Inconsistent;
            return Err(e);
        }
        if let Some(cfg) = self.config.as_mut() {
            cfg.start = enable;
        }
        self.state = if enable {
            AdcState::Running { continuous }
        } else {
            AdcState::Shutdown
        };
        Ok(())
    }

    /// Deep shutdown powers down everything but the serial interface. One-shot
    /// conversions still work from this state.
    pub fn deep_shutdown(&mut self, enable: bool) -> Result<()> {
        if enable {
            self.set_running(false)?;
        } else {
            self.ensure_open()?;
        }
        match self.regs.write_register8(reg::DEEP_SHUTDOWN, u8::from(enable)) {
            Err(e @ DeviceError::Io(_)) => {
                self.state = AdcState::Inconsistent;
                Err(e)
            }
            res => res,
        }
    }

    pub fn set_limits(&mut self, channel: usize, low: u8, high: u8) -> Result<()> {
        self.ensure_open()?;
        if channel >= CHANNELS {
            return Err(DeviceError::InvalidConfig(format!(
                "channel index must be within 0..=7, got {channel}"
            )));
        }
        self.regs.write_register8(reg::HIGH_LIMIT[channel], high)?;
        self.regs.write_register8(reg::LOW_LIMIT[channel], low)
    }

    /// `(manufacturer, revision)`; expect `(0x01, 0x09)`.
    pub fn read_ids(&mut self) -> Result<(u8, u8)> {
        self.ensure_open()?;
        let mfg = self.regs.read_register8(reg::MFG_ID)?;
        let rev = self.regs.read_register8(reg::REV_ID)?;
        Ok((mfg, rev))
    }

    /// Start a single conversion of all enabled channels and wait for it.
    pub fn trigger_one_shot(&mut self) -> Result<()> {
        let wait = self.ready_config()?.conversion_wait;
        // Reading INT_STATUS clears stale latched flags
        self.regs.read_register8(reg::INT_STATUS)?;
        self.regs.write_register8(reg::ONE_SHOT, 0x01)?;
        match wait {
            ConversionWait::BusyPoll {
                timeout_ms,
                interval_ms,
            } => self.wait_status_clear(
                bits::BUSY,
                Duration::from_millis(timeout_ms),
                Duration::from_millis(interval_ms),
            ),
            ConversionWait::FixedDelay { delay_ms } => {
                thread::sleep(Duration::from_millis(delay_ms));
                Ok(())
            }
        }
    }

    fn needs_trigger(&self, cfg: &Adc128d818Config) -> bool {
        !cfg.continuous || self.state == AdcState::Shutdown
    }

    /// 12-bit code for `channel`, no conversion triggered.
    pub fn read_channel_raw(&mut self, channel: usize) -> Result<u16> {
        self.ensure_open()?;
        let name = reg::READING.get(channel).ok_or_else(|| {
            DeviceError::InvalidConfig(format!(
                "channel index must be within 0..=7, got {channel}"
            ))
        })?;
        Ok(decode_code(self.regs.read_register16(name)?))
    }

    /// Convert and read one channel; `None` when it is disabled.
    pub fn read_channel(&mut self, channel: usize) -> Result<Option<ChannelReading>> {
        let cfg = self.ready_config()?.clone();
        if channel >= CHANNELS {
            return Err(DeviceError::InvalidConfig(format!(
                "channel index must be within 0..=7, got {channel}"
            )));
        }
        if !cfg.is_enabled(channel) {
            return Ok(None);
        }
        if self.needs_trigger(&cfg) {
            self.trigger_one_shot()?;
        }
        self.read_converted(&cfg, channel).map(Some)
    }

    fn read_converted(&mut self, cfg: &Adc128d818Config, channel: usize) -> Result<ChannelReading> {
        let code = self.read_channel_raw(channel)?;
        let volts = code_to_volts(
            code,
            cfg.reference.volts(),
            cfg.ext_resistor_multipliers[channel],
        );
        tracing::debug!(channel, code, volts, "adc128d818 reading");
        Ok(ChannelReading { code, volts })
    }

    /// One conversion pass over every enabled channel.
    pub fn read_channels(&mut self) -> Result<AdcSample> {
        let cfg = self.ready_config()?.clone();
        if self.needs_trigger(&cfg) {
            self.trigger_one_shot()?;
        } else {
            self.regs.read_register8(reg::INT_STATUS)?;
        }
        let mut sample = AdcSample::default();
        for ch in 0..CHANNELS {
            if cfg.is_enabled(ch) {
                sample.channels[ch] = Some(self.read_converted(&cfg, ch)?);
            }
        }
        Ok(sample)
    }
}

impl<B: I2cBus> Device for Adc128d818<B> {
    type Config = Adc128d818Config;
    type Reading = AdcSample;

    const KIND: SensorKind = SensorKind::Adc128d818;

    fn configure(&mut self, cfg: Adc128d818Config) -> Result<()> {
        self.ensure_open()?;
        cfg.validate()?;
        self.state = AdcState::ShutdownConfiguring;
        self.config = None;
        if let Err(e) = self.program(&cfg) {
            self.state = AdcState::Inconsistent;
            tracing::error!(endpoint = %self.regs.endpoint(), error = %e, "adc128d818 configure failed");
            return Err(e);
        }
        self.state = if cfg.start {
            AdcState::Running {
                continuous: cfg.continuous,
            }
        } else {
            AdcState::Shutdown
        };
        tracing::info!(
            endpoint = %self.regs.endpoint(),
            start = cfg.start,
            continuous = cfg.continuous,
            disable_mask = cfg.disable_mask,
            mode = cfg.mode,
            "adc128d818 configured"
        );
        self.config = Some(cfg);
        if tracing::enabled!(tracing::Level::DEBUG) {
            self.log_registers();
        }
        Ok(())
    }

    fn read(&mut self) -> Result<AdcSample> {
        self.read_channels()
    }

    fn close(&mut self) -> Result<()> {
        if self.state == AdcState::Closed {
            return Ok(());
        }
        self.state = AdcState::Closed;
        self.regs.close()
    }

    fn endpoint(&self) -> &I2cConfig {
        self.regs.endpoint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use i2c_transport::{MockBus, MockHandle};

    const BUSY_STATUS: u8 = 0x0C;
    const CONFIG: u8 = 0x00;
    const CH_DISABLE: u8 = 0x08;
    const ADV_CONFIG: u8 = 0x0B;
    const CONV_RATE: u8 = 0x07;
    const ONE_SHOT: u8 = 0x09;
    const DEEP_SHUTDOWN: u8 = 0x0A;

    fn adc() -> (Adc128d818<MockBus>, MockHandle) {
        let bus = MockBus::new(I2cConfig::new(1, DEFAULT_ADDRESS).unwrap());
        let h = bus.handle();
        (Adc128d818::new(bus), h)
    }

    fn set_code(h: &MockHandle, ch: u8, code: u16) {
        h.set_u16(0x20 + ch, code << 4);
    }

    #[test]
    fn test_validation_happens_before_io() {
        let (mut a, h) = adc();
        let bad_mode = Adc128d818Config {
            mode: 4,
            ..Default::default()
        };
        assert!(matches!(
            a.configure(bad_mode),
            Err(DeviceError::InvalidConfig(_))
        ));
        let short = Adc128d818Config {
            ext_resistor_multipliers: vec![1.0; 7],
            ..Default::default()
        };
        assert!(matches!(a.configure(short), Err(DeviceError::InvalidConfig(_))));
        let negative = Adc128d818Config {
            ext_resistor_multipliers: vec![1.0, -2.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0],
            ..Default::default()
        };
        assert!(a.configure(negative).is_err());
        assert_eq!(h.transactions(), 0);
        assert_eq!(a.state(), AdcState::Unconfigured);
    }

    #[test]
    fn test_configure_programs_in_shutdown_then_starts() {
        let (mut a, h) = adc();
        let cfg = Adc128d818Config {
            disable_mask: 0b1000_0000,
            mode: 1,
            ..Default::default()
        };
        a.configure(cfg).unwrap();
        assert_eq!(a.state(), AdcState::Running { continuous: true });

        let writes = h.writes();
        let pos = |reg: u8| writes.iter().position(|(r, _)| *r == reg).unwrap();
        // First CONFIG write resets (START clear), last one sets START
        assert_eq!(writes[0], (CONFIG, vec![0x80]));
        assert!(pos(CH_DISABLE) < pos(ADV_CONFIG));
        assert!(pos(ADV_CONFIG) < pos(CONV_RATE));
        assert_eq!(writes.last().unwrap(), &(CONFIG, vec![0x01]));
        assert_eq!(h.u8_at(CH_DISABLE), Some(0x80));
        assert_eq!(h.u8_at(ADV_CONFIG), Some(0b010));
        assert_eq!(h.u8_at(CONV_RATE), Some(0x01));
    }

    #[test]
    fn test_configure_without_start_stays_in_shutdown() {
        let (mut a, h) = adc();
        let cfg = Adc128d818Config {
            start: false,
            continuous: false,
            reference: VoltageReference::External(2.5),
            ..Default::default()
        };
        a.configure(cfg).unwrap();
        assert_eq!(a.state(), AdcState::Shutdown);
        assert_eq!(h.writes_to(CONFIG), vec![vec![0x80]]);
        assert_eq!(h.u8_at(ADV_CONFIG), Some(0x01));
        assert_eq!(h.u8_at(CONV_RATE), Some(0x00));
    }

    #[test]
    fn test_read_channels_honours_disable_mask() {
        for mask in [0x00u8, 0x01, 0x80, 0xA5, 0x7E, 0xFF] {
            let (mut a, h) = adc();
            for ch in 0..8 {
                set_code(&h, ch, 0x100 * u16::from(ch) + 1);
            }
            a.configure(Adc128d818Config {
                disable_mask: mask,
                ..Default::default()
            })
            .unwrap();
            let sample = a.read_channels().unwrap();
            assert_eq!(sample.present(), 8 - mask.count_ones() as usize);
            for ch in 0..8 {
                let disabled = (mask >> ch) & 1 == 1;
                assert_eq!(sample.channels[ch].is_none(), disabled, "mask {mask:#04x} ch {ch}");
            }
        }
    }

    #[test]
    fn test_end_to_end_scaled_reading() {
        let (mut a, h) = adc();
        set_code(&h, 0, 0x0CCC);
        let mut mult = vec![1.0; 8];
        mult[0] = 2.7;
        a.configure(Adc128d818Config {
            start: true,
            continuous: true,
            disable_mask: 0b1000_0000,
            mode: 0,
            ext_resistor_multipliers: mult,
            reference: VoltageReference::External(2.5),
            ..Default::default()
        })
        .unwrap();
        let volts = a.read_channels().unwrap().volts();
        let expected = (f64::from(0xCCCu16) / 4096.0) * 2.5 * 2.7;
        assert!((volts[0].unwrap() - expected).abs() < 1e-9);
        assert!(volts[7].is_none());
        // Continuous mode never triggers a one-shot
        assert!(h.writes_to(ONE_SHOT).is_empty());
    }

    #[test]
    fn test_code_conversion_is_linear() {
        for m in [0.5, 1.0, 2.7, 100.0] {
            assert_eq!(code_to_volts(0, INTERNAL_VREF_V, m), 0.0);
        }
        let full = code_to_volts(4095, 2.5, 1.0);
        assert!((full - 2.5).abs() < 2.0 * 2.5 / 4096.0);
        let half = code_to_volts(2048, 2.5, 1.0);
        assert!((2.0 * half - 2.5).abs() < 1e-12);
        assert_eq!(decode_code(0xCCC0), 0x0CCC);
        assert_eq!(decode_code(0xFFFF), 0x0FFF);
    }

    #[test]
    fn test_one_shot_polls_busy_bit() {
        let (mut a, h) = adc();
        set_code(&h, 3, 0x800);
        a.configure(Adc128d818Config {
            start: false,
            continuous: false,
            conversion_wait: ConversionWait::BusyPoll {
                timeout_ms: 500,
                interval_ms: 1,
            },
            ..Default::default()
        })
        .unwrap();
        h.clear_writes();
        h.script_u8(BUSY_STATUS, [0x01, 0x01, 0x01]);
        let before = h.transactions();
        let r = a.read_channel(3).unwrap().unwrap();
        assert_eq!(r.code, 0x800);
        assert_eq!(h.writes_to(ONE_SHOT), vec![vec![0x01]]);
        // INT_STATUS + ONE_SHOT + 4 status polls + result
        assert_eq!(h.transactions() - before, 7);
    }

    #[test]
    fn test_one_shot_times_out_when_busy_sticks() {
        let (mut a, h) = adc();
        a.configure(Adc128d818Config {
            start: false,
            continuous: false,
            conversion_wait: ConversionWait::BusyPoll {
                timeout_ms: 20,
                interval_ms: 1,
            },
            ..Default::default()
        })
        .unwrap();
        h.set_u8(BUSY_STATUS, 0x01);
        assert!(matches!(
            a.read_channels(),
            Err(DeviceError::Io(TransportError::Timeout))
        ));
        // A conversion timeout is a read failure, not a lifecycle change
        assert_eq!(a.state(), AdcState::Shutdown);
    }

    #[test]
    fn test_fixed_delay_mode_skips_status_polls() {
        let (mut a, h) = adc();
        a.configure(Adc128d818Config {
            start: false,
            continuous: false,
            conversion_wait: ConversionWait::FixedDelay { delay_ms: 1 },
            ..Default::default()
        })
        .unwrap();
        h.set_u8(BUSY_STATUS, 0x01);
        assert!(a.read_channels().is_ok());
    }

    #[test]
    fn test_io_failure_during_configure_marks_inconsistent() {
        let (mut a, h) = adc();
        h.fail_register(CONV_RATE);
        assert!(matches!(
            a.configure(Adc128d818Config::default()),
            Err(DeviceError::Io(_))
        ));
        assert_eq!(a.state(), AdcState::Inconsistent);
        assert!(matches!(a.read_channels(), Err(DeviceError::NotConfigured)));

        h.clear_failures();
        a.configure(Adc128d818Config::default()).unwrap();
        assert!(a.read_channels().is_ok());
    }

    #[test]
    fn test_read_before_configure() {
        let (mut a, h) = adc();
        assert!(matches!(a.read_channels(), Err(DeviceError::NotConfigured)));
        assert!(matches!(a.read_channel(0), Err(DeviceError::NotConfigured)));
        assert_eq!(h.transactions(), 0);
    }

    #[test]
    fn test_disable_mask_change_restores_running() {
        let (mut a, h) = adc();
        a.configure(Adc128d818Config::default()).unwrap();
        h.clear_writes();
        a.set_disable_mask(0x0F, true).unwrap();
        let cfg_writes = h.writes_to(CONFIG);
        assert_eq!(cfg_writes.first().unwrap(), &vec![0x00]);
        assert_eq!(cfg_writes.last().unwrap(), &vec![0x01]);
        let writes = h.writes();
        let stop = writes.iter().position(|(r, _)| *r == CONFIG).unwrap();
        let mask = writes.iter().position(|(r, _)| *r == CH_DISABLE).unwrap();
        assert!(stop < mask);
        assert_eq!(a.state(), AdcState::Running { continuous: true });
        assert_eq!(a.config().unwrap().disable_mask, 0x0F);
        assert_eq!(a.read_channels().unwrap().present(), 4);
    }

    #[test]
    fn test_mode_change_without_restore_leaves_shutdown() {
        let (mut a, h) = adc();
        a.configure(Adc128d818Config {
            reference: VoltageReference::External(3.0),
            ..Default::default()
        })
        .unwrap();
        a.set_mode(2, false).unwrap();
        assert_eq!(a.state(), AdcState::Shutdown);
        assert_eq!(h.u8_at(ADV_CONFIG), Some(0b101));
        assert!(matches!(a.set_mode(5, true), Err(DeviceError::InvalidConfig(_))));
        assert_eq!(a.state(), AdcState::Shutdown);
    }

    #[test]
    fn test_set_running_both_directions() {
        let (mut a, h) = adc();
        a.configure(Adc128d818Config::default()).unwrap();
        a.set_running(false).unwrap();
        assert_eq!(a.state(), AdcState::Shutdown);
        assert_eq!(h.u8_at(CONFIG), Some(0x00));
        assert!(!a.config().unwrap().start);

        a.set_running(true).unwrap();
        assert_eq!(a.state(), AdcState::Running { continuous: true });
        assert_eq!(h.u8_at(CONFIG), Some(0x01));
        assert!(a.config().unwrap().start);

        h.fail_register(CONFIG);
        assert!(matches!(a.set_running(false), Err(DeviceError::Io(_))));
        assert_eq!(a.state(), AdcState::Inconsistent);
    }

    #[test]
    fn test_set_running_requires_configure() {
        let (mut a, h) = adc();
        assert!(matches!(a.set_running(true), Err(DeviceError::NotConfigured)));
        assert_eq!(h.transactions(), 0);
    }

    #[test]
    fn test_deep_shutdown_then_one_shot_read() {
        let (mut a, h) = adc();
        set_code(&h, 1, 0x400);
        a.configure(Adc128d818Config::default()).unwrap();
        h.clear_writes();
        a.deep_shutdown(true).unwrap();
        assert_eq!(a.state(), AdcState::Shutdown);
        assert_eq!(h.u8_at(DEEP_SHUTDOWN), Some(0x01));
        let stop = h.writes().iter().position(|(r, _)| *r == CONFIG).unwrap();
        let deep = h.writes().iter().position(|(r, _)| *r == DEEP_SHUTDOWN).unwrap();
        assert!(stop < deep);

        // Stopped chip converts on demand
        let sample = a.read_channels().unwrap();
        assert_eq!(sample.channels[1].unwrap().code, 0x400);
        assert_eq!(h.writes_to(ONE_SHOT), vec![vec![0x01]]);

        a.deep_shutdown(false).unwrap();
        assert_eq!(h.u8_at(DEEP_SHUTDOWN), Some(0x00));
        assert_eq!(a.state(), AdcState::Shutdown);
    }

    #[test]
    fn test_deep_shutdown_write_failure_marks_inconsistent() {
        let (mut a, h) = adc();
        a.configure(Adc128d818Config::default()).unwrap();
        h.fail_register(DEEP_SHUTDOWN);
        assert!(matches!(a.deep_shutdown(true), Err(DeviceError::Io(_))));
        assert_eq!(a.state(), AdcState::Inconsistent);
        assert!(matches!(a.read_channels(), Err(DeviceError::NotConfigured)));
    }

    #[test]
    fn test_wait_until_ready_times_out_while_not_ready() {
        let (mut a, h) = adc();
        h.set_u8(BUSY_STATUS, 0x02);
        assert!(matches!(
            a.wait_until_ready(Duration::from_millis(20)),
            Err(DeviceError::Io(TransportError::Timeout))
        ));
        h.set_u8(BUSY_STATUS, 0x00);
        a.wait_until_ready(Duration::from_millis(20)).unwrap();

        a.close().unwrap();
        assert!(matches!(
            a.wait_until_ready(Duration::from_millis(20)),
            Err(DeviceError::NotConfigured)
        ));
    }

    #[test]
    fn test_limits_and_ids() {
        let (mut a, h) = adc();
        h.set_u8(0x3E, MANUFACTURER_ID);
        h.set_u8(0x3F, REVISION_ID);
        assert_eq!(a.read_ids().unwrap(), (0x01, 0x09));
        a.set_limits(2, 0x10, 0xF0).unwrap();
        assert_eq!(h.u8_at(0x2E), Some(0xF0));
        assert_eq!(h.u8_at(0x2F), Some(0x10));
        assert!(matches!(
            a.set_limits(8, 0, 0),
            Err(DeviceError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_closed_driver_rejects_everything() {
        let (mut a, h) = adc();
        a.configure(Adc128d818Config::default()).unwrap();
        a.close().unwrap();
        a.close().unwrap();
        assert!(h.is_closed());
        let before = h.transactions();
        assert!(matches!(a.read_channels(), Err(DeviceError::NotConfigured)));
        assert!(matches!(
            a.configure(Adc128d818Config::default()),
            Err(DeviceError::NotConfigured)
        ));
        assert!(matches!(a.read_channel_raw(0), Err(DeviceError::NotConfigured)));
        assert!(matches!(a.set_limits(0, 0, 0), Err(DeviceError::NotConfigured)));
        assert!(matches!(a.read_ids(), Err(DeviceError::NotConfigured)));
        assert_eq!(h.transactions(), before);
    }

    #[test]
    fn test_config_document_aliases() {
        let cfg: Adc128d818Config = serde_json::from_str(
            r#"{"start": false, "continuous": false, "disable_mask": 255, "mode": 1,
                "extResistorMultipliers": [2.0, 2.0, 2.0, 5.0, 5.0, 5.0, 2.0, 100.0],
                "unknown": "ignored"}"#,
        )
        .unwrap();
        assert_eq!(cfg.disable_mask, 0xFF);
        assert_eq!(cfg.ext_resistor_multipliers[7], 100.0);
        assert_eq!(cfg.reference, VoltageReference::Internal);
        assert!(cfg.validate().is_ok());

        let cfg: Adc128d818Config = serde_json::from_str(
            r#"{"reference": {"external": 2.5},
                "conversion_wait": {"fixed_delay": {"delay_ms": 100}}}"#,
        )
        .unwrap();
        assert_eq!(cfg.reference.volts(), 2.5);
        assert_eq!(cfg.conversion_wait, ConversionWait::FixedDelay { delay_ms: 100 });
    }
}
