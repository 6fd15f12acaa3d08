use crate::record::SampleRecord;
use crate::Result;
use prometheus::{
    Encoder, Gauge, GaugeVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

const CHANNEL_LABELS: [&str; 8] = ["0", "1", "2", "3", "4", "5", "6", "7"];

#[derive(Clone)]
pub struct SampleMetrics {
    pub channel_volts: GaugeVec,
    pub bus_voltage: Gauge,
    pub current: Gauge,
    pub power: Gauge,
    pub timestamp: Gauge,
    pub samples: IntCounter,
    pub read_errors: IntCounterVec,
}

/// Prometheus registry for the monitor; clones share the same collectors.
#[derive(Clone)]
pub struct MetricsHub {
    pub registry: Registry,
    pub sample: SampleMetrics,
}

impl MetricsHub {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let sample = SampleMetrics {
            channel_volts: GaugeVec::new(
                Opts::new("pmon_adc_channel_volts", "Calibrated ADC128D818 channel voltage"),
                &["channel"],
            )?,
            bus_voltage: Gauge::new("pmon_bus_voltage_volts", "INA260 bus voltage")?,
            current: Gauge::new("pmon_current_amps", "INA260 current")?,
            power: Gauge::new("pmon_power_watts", "INA260 power")?,
            timestamp: Gauge::new(
                "pmon_sample_timestamp_seconds",
                "Unix time of the latest sample",
            )?,
            samples: IntCounter::new("pmon_samples_total", "Sample records produced")?,
            read_errors: IntCounterVec::new(
                Opts::new("pmon_read_errors_total", "Failed sensor reads"),
                &["sensor", "reason"],
            )?,
        };
        registry.register(Box::new(sample.channel_volts.clone()))?;
        registry.register(Box::new(sample.bus_voltage.clone()))?;
        registry.register(Box::new(sample.current.clone()))?;
        registry.register(Box::new(sample.power.clone()))?;
        registry.register(Box::new(sample.timestamp.clone()))?;
        registry.register(Box::new(sample.samples.clone()))?;
        registry.register(Box::new(sample.read_errors.clone()))?;
        Ok(Self { registry, sample })
    }

    /// Absent channels drop out of the exposition; absent power values read NaN.
    pub fn observe(&self, rec: &SampleRecord) {
        let m = &self.sample;
        for (label, v) in CHANNEL_LABELS.iter().zip(rec.adc_channels) {
            match v {
                Some(v) => m.channel_volts.with_label_values(&[*label]).set(v),
                None => {
                    let _ = m.channel_volts.remove_label_values(&[*label]);
                }
            }
        }
        m.bus_voltage.set(rec.bus_voltage_v.unwrap_or(f64::NAN));
        m.current.set(rec.current_a.unwrap_or(f64::NAN));
        m.power.set(rec.power_w.unwrap_or(f64::NAN));
        m.timestamp.set(rec.timestamp);
        m.samples.inc();
    }

    pub fn read_error(&self, sensor: &str, reason: &str) {
        self.sample
            .read_errors
            .with_label_values(&[sensor, reason])
            .inc();
    }

    /// Current count for one label pair; an unseen pair is registered at zero.
    pub fn read_errors(&self, sensor: &str, reason: &str) -> u64 {
        self.sample
            .read_errors
            .get_metric_with_label_values(&[sensor, reason])
            .map(|c| c.get())
            .unwrap_or(0)
    }

    pub fn encode_text(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            return format!("error encoding metrics: {e}");
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}
