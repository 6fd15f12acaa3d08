use crate::{MonitorError, Result};
use anyhow::Context;
use i2c_transport::{I2cBus, I2cConfig, TransportError};
use sensor_devices::{
    adc128d818, ina260, Adc128d818, Adc128d818Config, Averaging, BoundSensor, ConversionTime,
    DeviceError, DynSensor, Ina260, Ina260Config, OperatingMode, SensorKind,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_UDP_HOST: &str = "localhost";
pub const DEFAULT_UDP_PORT: u16 = 9999;
pub const DEFAULT_READ_INTERVAL_S: f64 = 1.0;
pub const DEFAULT_BUS: u32 = 1;

/// Divider scale per ADC channel on the stock board.
pub const DEFAULT_MULTIPLIERS: [f64; 8] = [2.7, 2.7, 2.7, 5.0, 5.0, 5.0, 2.0, 100.0];

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UdpTarget {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    DEFAULT_UDP_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_UDP_PORT
}

impl Default for UdpTarget {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdcSection {
    pub i2c: I2cConfig,
    #[serde(default)]
    pub config: Adc128d818Config,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InaSection {
    pub i2c: I2cConfig,
    #[serde(default)]
    pub config: Ina260Config,
}

/// Monitor configuration document. Unknown keys are ignored.
///
/// Documents written by the older tooling (`UDP_Addr`, `UDP_Port`,
/// `Read_Interval`, `ADC128D818_I2C`/`ADC128D818_config`,
/// `INA260_I2C`/`INA260_config`) load as well; when both spellings are
/// present the snake_case sections win.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "MonitorConfigDoc")]
pub struct MonitorConfig {
    pub udp: Option<UdpTarget>,
    pub read_interval_s: f64,
    /// 0 = run until cancelled.
    pub samples: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prom_out: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adc128d818: Option<AdcSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ina260: Option<InaSection>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            udp: Some(UdpTarget::default()),
            read_interval_s: DEFAULT_READ_INTERVAL_S,
            samples: 0,
            prom_out: None,
            adc128d818: None,
            ina260: None,
        }
    }
}

#[derive(Deserialize)]
#[serde(default)]
struct MonitorConfigDoc {
    udp: Option<UdpTarget>,
    #[serde(alias = "Read_Interval")]
    read_interval_s: f64,
    samples: u64,
    prom_out: Option<PathBuf>,
    adc128d818: Option<AdcSection>,
    ina260: Option<InaSection>,
    #[serde(rename = "UDP_Addr")]
    legacy_udp_host: Option<String>,
    #[serde(rename = "UDP_Port")]
    legacy_udp_port: Option<u16>,
    #[serde(rename = "ADC128D818_I2C")]
    legacy_adc_i2c: Option<I2cConfig>,
    #[serde(rename = "ADC128D818_config")]
    legacy_adc_config: Option<Adc128d818Config>,
    #[serde(rename = "INA260_I2C")]
    legacy_ina_i2c: Option<I2cConfig>,
    #[serde(rename = "INA260_config")]
    legacy_ina_config: Option<Ina260Config>,
}

impl Default for MonitorConfigDoc {
    fn default() -> Self {
        let base = MonitorConfig::default();
        Self {
            udp: base.udp,
            read_interval_s: base.read_interval_s,
            samples: base.samples,
            prom_out: None,
            adc128d818: None,
            ina260: None,
            legacy_udp_host: None,
            legacy_udp_port: None,
            legacy_adc_i2c: None,
            legacy_adc_config: None,
            legacy_ina_i2c: None,
            legacy_ina_config: None,
        }
    }
}

fn default_endpoint(address: u8) -> I2cConfig {
    I2cConfig {
        bus: DEFAULT_BUS,
        address,
        clock_frequency_hz: i2c_transport::DEFAULT_CLOCK_HZ,
    }
}

impl From<MonitorConfigDoc> for MonitorConfig {
    fn from(doc: MonitorConfigDoc) -> Self {
        let mut udp = doc.udp;
        if doc.legacy_udp_host.is_some() || doc.legacy_udp_port.is_some() {
            let base = udp.unwrap_or_default();
            udp = Some(UdpTarget {
                host: doc.legacy_udp_host.unwrap_or(base.host),
                port: doc.legacy_udp_port.unwrap_or(base.port),
            });
        }
        let legacy_adc = match (doc.legacy_adc_i2c, doc.legacy_adc_config) {
            (None, None) => None,
            (i2c, config) => Some(AdcSection {
                i2c: i2c.unwrap_or_else(|| default_endpoint(adc128d818::DEFAULT_ADDRESS)),
                config: config.unwrap_or_default(),
            }),
        };
        let legacy_ina = match (doc.legacy_ina_i2c, doc.legacy_ina_config) {
            (None, None) => None,
            (i2c, config) => Some(InaSection {
                i2c: i2c.unwrap_or_else(|| default_endpoint(ina260::DEFAULT_ADDRESS)),
                config: config.unwrap_or_default(),
            }),
        };
        Self {
            udp,
            read_interval_s: doc.read_interval_s,
            samples: doc.samples,
            prom_out: doc.prom_out,
            adc128d818: doc.adc128d818.or(legacy_adc),
            ina260: doc.ina260.or(legacy_ina),
        }
    }
}

enum Format {
    Yaml,
    Json,
}

fn format_for(path: &Path) -> Format {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("json") => Format::Json,
        _ => Format::Yaml,
    }
}

impl MonitorConfig {
    /// Stock wiring: ADC128D818 at 0x1D in one-shot mode and INA260 at 0x40
    /// averaging 4 samples, both on bus 1.
    pub fn defaults() -> Self {
        Self {
            adc128d818: Some(AdcSection {
                i2c: default_endpoint(adc128d818::DEFAULT_ADDRESS),
                config: Adc128d818Config {
                    start: false,
                    continuous: false,
                    disable_mask: 0x00,
                    mode: 0,
                    ext_resistor_multipliers: DEFAULT_MULTIPLIERS.to_vec(),
                    ..Default::default()
                },
            }),
            ina260: Some(InaSection {
                i2c: default_endpoint(ina260::DEFAULT_ADDRESS),
                config: Ina260Config {
                    averaging: Averaging::Avg4,
                    bus_conversion_time: ConversionTime::Us1100,
                    shunt_conversion_time: ConversionTime::Us1100,
                    mode: OperatingMode::ShuntBusContinuous,
                    reset: false,
                },
            }),
            ..Default::default()
        }
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        let cfg: MonitorConfig = match format_for(path) {
            Format::Json => serde_json::from_str(&raw)
                .with_context(|| format!("parsing json: {}", path.display()))?,
            Format::Yaml => serde_yaml::from_str(&raw)
                .with_context(|| format!("parsing yaml: {}", path.display()))?,
        };
        cfg.validate()
            .with_context(|| format!("validating config: {}", path.display()))?;
        tracing::info!(
            path = %path.display(),
            adc128d818 = cfg.adc128d818.is_some(),
            ina260 = cfg.ina260.is_some(),
            "loaded monitor config"
        );
        Ok(cfg)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        let text = match format_for(path) {
            Format::Json => serde_json::to_string_pretty(self)?,
            Format::Yaml => serde_yaml::to_string(self)?,
        };
        fs::write(path, text).with_context(|| format!("writing config: {}", path.display()))?;
        Ok(())
    }

    /// Checks every invariant before any device is opened.
    pub fn validate(&self) -> Result<()> {
        if !(self.read_interval_s.is_finite() && self.read_interval_s >= 0.0) {
            return Err(MonitorError::Config(format!(
                "read_interval_s must be >= 0, got {}",
                self.read_interval_s
            )));
        }
        if let Some(udp) = &self.udp {
            if udp.host.trim().is_empty() || udp.port == 0 {
                return Err(MonitorError::Config(format!(
                    "invalid udp target {}:{}",
                    udp.host, udp.port
                )));
            }
        }
        if self.adc128d818.is_none() && self.ina260.is_none() {
            return Err(MonitorError::Config(
                "at least one of adc128d818 or ina260 must be configured".into(),
            ));
        }
        let bad_endpoint = |kind: SensorKind, e: TransportError| {
            MonitorError::Config(format!("{} i2c: {e}", kind.as_str()))
        };
        if let Some(adc) = &self.adc128d818 {
            adc.i2c
                .validate()
                .map_err(|e| bad_endpoint(SensorKind::Adc128d818, e))?;
            adc.config.validate().map_err(|e| MonitorError::Sensor {
                name: SensorKind::Adc128d818.as_str().to_string(),
                source: e,
            })?;
        }
        if let Some(ina) = &self.ina260 {
            ina.i2c
                .validate()
                .map_err(|e| bad_endpoint(SensorKind::Ina260, e))?;
        }
        if let (Some(adc), Some(ina)) = (&self.adc128d818, &self.ina260) {
            if adc.i2c.bus == ina.i2c.bus && adc.i2c.address == ina.i2c.address {
                return Err(MonitorError::Config(format!(
                    "adc128d818 and ina260 share endpoint {}",
                    adc.i2c
                )));
            }
        }
        Ok(())
    }

    /// Open every configured chip through `open`, ADC first, then INA260.
    pub fn build_sensors<B, F>(&self, mut open: F) -> Result<Vec<DynSensor>>
    where
        B: I2cBus + Send + 'static,
        F: FnMut(SensorKind, &I2cConfig) -> Result<B, TransportError>,
    {
        let opened = |kind: SensorKind, e: TransportError| MonitorError::Sensor {
            name: kind.as_str().to_string(),
            source: DeviceError::Io(e),
        };
        let mut sensors: Vec<DynSensor> = Vec::new();
        if let Some(adc) = &self.adc128d818 {
            let kind = SensorKind::Adc128d818;
            let bus = open(kind, &adc.i2c).map_err(|e| opened(kind, e))?;
            sensors.push(Box::new(BoundSensor::new(
                kind.as_str(),
                Adc128d818::new(bus),
                adc.config.clone(),
            )));
        }
        if let Some(ina) = &self.ina260 {
            let kind = SensorKind::Ina260;
            let bus = open(kind, &ina.i2c).map_err(|e| opened(kind, e))?;
            sensors.push(Box::new(BoundSensor::new(
                kind.as_str(),
                Ina260::new(bus),
                ina.config,
            )));
        }
        Ok(sensors)
    }
}
