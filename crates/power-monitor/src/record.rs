use crate::{MonitorError, Result};
use sensor_devices::adc128d818::CHANNELS;
use sensor_devices::Reading;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

/// Positional value order after the timestamp. Exporters and the UDP
/// listener depend on this order, not on names.
pub const FIELD_NAMES: [&str; 11] = [
    "ch0",
    "ch1",
    "ch2",
    "ch3",
    "ch4",
    "ch5",
    "ch6",
    "ch7",
    "bus_voltage_v",
    "current_a",
    "power_w",
];

const SEPARATOR: &str = ", ";
const ABSENT: &str = "NaN";

/// One polling cycle. Every field shares `timestamp`; `None` marks a disabled
/// channel, a missing sensor or a failed read.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SampleRecord {
    /// Unix seconds.
    pub timestamp: f64,
    pub adc_channels: [Option<f64>; CHANNELS],
    pub bus_voltage_v: Option<f64>,
    pub current_a: Option<f64>,
    pub power_w: Option<f64>,
}

impl SampleRecord {
    pub fn new(timestamp: f64) -> Self {
        Self {
            timestamp,
            ..Default::default()
        }
    }

    pub fn apply(&mut self, reading: &Reading) {
        match reading {
            Reading::Adc(sample) => self.adc_channels = sample.volts(),
            Reading::Power(p) => {
                self.bus_voltage_v = Some(p.bus_voltage_v);
                self.current_a = Some(p.current_a);
                self.power_w = Some(p.power_w);
            }
        }
    }

    /// Values in [`FIELD_NAMES`] order.
    pub fn positional(&self) -> [Option<f64>; 11] {
        let mut out = [None; 11];
        out[..CHANNELS].copy_from_slice(&self.adc_channels);
        out[8] = self.bus_voltage_v;
        out[9] = self.current_a;
        out[10] = self.power_w;
        out
    }

    /// `timestamp, ch0..ch7, bus_voltage_v, current_a, power_w` joined by
    /// `", "`, absent values as `NaN`.
    pub fn status_line(&self) -> String {
        let mut line = format!("{:.3}", self.timestamp);
        for v in self.positional() {
            line.push_str(SEPARATOR);
            match v {
                Some(v) => {
                    let _ = write!(line, "{v:.4}");
                }
                None => line.push_str(ABSENT),
            }
        }
        line
    }

    /// Inverse of [`status_line`](Self::status_line), up to its rounding.
    pub fn parse_status_line(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.trim().split(SEPARATOR).collect();
        let Some((ts, rest)) = fields.split_first() else {
            return Err(MonitorError::Parse("empty line".into()));
        };
        if rest.len() != FIELD_NAMES.len() {
            return Err(MonitorError::Parse(format!(
                "expected timestamp and {} values, got {} fields",
                FIELD_NAMES.len(),
                fields.len()
            )));
        }
        let timestamp: f64 = ts
            .trim()
            .parse()
            .map_err(|_| MonitorError::Parse(format!("timestamp: {ts:?}")))?;

        let mut values = [None; 11];
        for (i, raw) in rest.iter().enumerate() {
            let raw = raw.trim();
            if raw == ABSENT {
                continue;
            }
            let v: f64 = raw
                .parse()
                .map_err(|_| MonitorError::Parse(format!("{}: {raw:?}", FIELD_NAMES[i])))?;
            values[i] = Some(v);
        }
        let mut adc_channels = [None; CHANNELS];
        adc_channels.copy_from_slice(&values[..CHANNELS]);
        Ok(Self {
            timestamp,
            adc_channels,
            bus_voltage_v: values[8],
            current_a: values[9],
            power_w: values[10],
        })
    }
}
