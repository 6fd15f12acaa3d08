//! Fixed-order polling loop over a set of sensors.
//!
//! Each cycle takes one timestamp, reads every sensor in order, assembles a
//! [`SampleRecord`] and hands it to the sink. A failed read is logged and
//! leaves that sensor's fields absent; it never aborts the cycle.

use crate::metrics::MetricsHub;
use crate::record::SampleRecord;
use crate::sink::RecordSink;
use crate::{MonitorError, Result};
use sensor_devices::{DeviceError, DynSensor};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use time::OffsetDateTime;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PollSettings {
    /// Number of cycles; 0 runs until the stop flag is raised.
    pub count: u64,
    /// Sleep between cycles. Not applied after the last one.
    pub delay: Duration,
}

impl PollSettings {
    pub fn new(count: u64, delay_s: f64) -> Result<Self> {
        if !(delay_s.is_finite() && delay_s >= 0.0) {
            return Err(MonitorError::Config(format!(
                "delay must be a non-negative number of seconds, got {delay_s}"
            )));
        }
        Ok(Self {
            count,
            delay: Duration::from_secs_f64(delay_s),
        })
    }
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            count: 0,
            delay: Duration::from_secs(1),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PollSummary {
    pub cycles: u64,
    pub read_errors: u64,
}

/// Why a sensor read produced no values.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReadFailure {
    /// Bus glitch or timeout; the next cycle is expected to succeed.
    Transient,
    /// Device absent or not in a readable state.
    Unavailable,
    /// Bad register name or config; retrying cannot help.
    Local,
}

impl ReadFailure {
    pub fn classify(e: &DeviceError) -> Self {
        if e.is_local() {
            ReadFailure::Local
        } else if e.is_transient() {
            ReadFailure::Transient
        } else {
            ReadFailure::Unavailable
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReadFailure::Transient => "transient",
            ReadFailure::Unavailable => "unavailable",
            ReadFailure::Local => "local",
        }
    }
}

pub struct Poller {
    sensors: Vec<DynSensor>,
    settings: PollSettings,
    metrics: Option<MetricsHub>,
    last_timestamp: f64,
}

fn unix_now() -> f64 {
    let now = OffsetDateTime::now_utc();
    now.unix_timestamp() as f64 + f64::from(now.nanosecond()) / 1e9
}

impl Poller {
    pub fn new(sensors: Vec<DynSensor>, settings: PollSettings) -> Self {
        Self {
            sensors,
            settings,
            metrics: None,
            last_timestamp: f64::MIN,
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsHub) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Configure every sensor in order, stopping at the first failure.
    pub fn configure_all(&mut self) -> Result<()> {
        for sensor in &mut self.sensors {
            sensor.configure().map_err(|source| {
                tracing::error!(sensor = sensor.name(), error = %source, "configure failed");
                MonitorError::Sensor {
                    name: sensor.name().to_string(),
                    source,
                }
            })?;
        }
        Ok(())
    }

    /// Cycle timestamp. The previous value is the only state carried between
    /// cycles; it clamps a backwards wall-clock step so records stay ordered.
    fn timestamp(&mut self) -> f64 {
        let ts = unix_now().max(self.last_timestamp);
        self.last_timestamp = ts;
        ts
    }

    fn cycle(&mut self) -> (SampleRecord, u64) {
        let mut rec = SampleRecord::new(self.timestamp());
        let mut errors = 0;
        for sensor in &mut self.sensors {
            match sensor.read() {
                Ok(reading) => rec.apply(&reading),
                Err(e) => {
                    errors += 1;
                    let failure = ReadFailure::classify(&e);
                    match failure {
                        ReadFailure::Transient => {
                            tracing::warn!(sensor = sensor.name(), error = %e, "read failed, retrying next cycle")
                        }
                        ReadFailure::Unavailable => {
                            tracing::warn!(sensor = sensor.name(), error = %e, "sensor unavailable")
                        }
                        ReadFailure::Local => {
                            tracing::error!(sensor = sensor.name(), error = %e, "sensor misconfigured")
                        }
                    }
                    if let Some(m) = &self.metrics {
                        m.read_error(sensor.name(), failure.as_str());
                    }
                }
            }
        }
        if let Some(m) = &self.metrics {
            m.observe(&rec);
        }
        (rec, errors)
    }

    /// One cycle without a sink.
    pub fn poll_once(&mut self) -> SampleRecord {
        self.cycle().0
    }

    /// Poll until `settings.count` cycles have run or `stop` is raised. Stop
    /// is checked before each cycle, which also covers the moment right after
    /// each delay.
    pub fn run(&mut self, stop: &AtomicBool, sink: &mut dyn RecordSink) -> PollSummary {
        let PollSettings { count, delay } = self.settings;
        let mut summary = PollSummary::default();
        tracing::info!(count, delay_s = delay.as_secs_f64(), sensors = self.sensors.len(), "polling");
        loop {
            if stop.load(Ordering::SeqCst) {
                tracing::info!(cycles = summary.cycles, "stop requested");
                break;
            }
            let (rec, errors) = self.cycle();
            summary.read_errors += errors;
            if let Err(e) = sink.write(&rec) {
                tracing::warn!(error = %e, "sink write failed");
            }
            summary.cycles += 1;
            if count != 0 && summary.cycles >= count {
                break;
            }
            if !delay.is_zero() {
                thread::sleep(delay);
            }
        }
        if let Err(e) = sink.flush() {
            tracing::warn!(error = %e, "sink flush failed");
        }
        summary
    }

    /// Close every sensor, logging failures. Safe to call more than once.
    pub fn close_all(&mut self) {
        for sensor in &mut self.sensors {
            if let Err(e) = sensor.close() {
                tracing::warn!(sensor = sensor.name(), error = %e, "close failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sensor_devices::{Reading, Sensor, SensorKind};

    /// Sensor that fails on chosen read calls.
    struct Flaky {
        reads: u32,
        fail_on: Vec<u32>,
        error: fn() -> DeviceError,
    }

    impl Sensor for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        fn kind(&self) -> SensorKind {
            SensorKind::Ina260
        }

        fn configure(&mut self) -> sensor_devices::Result<()> {
            Ok(())
        }

        fn read(&mut self) -> sensor_devices::Result<Reading> {
            self.reads += 1;
            if self.fail_on.contains(&self.reads) {
                return Err((self.error)());
            }
            Ok(Reading::Power(sensor_devices::PowerReading::decode(
                800, 80, 10,
            )))
        }

        fn close(&mut self) -> sensor_devices::Result<()> {
            Ok(())
        }
    }

    fn flaky(fail_on: Vec<u32>) -> DynSensor {
        flaky_with(fail_on, || DeviceError::NotConfigured)
    }

    fn flaky_with(fail_on: Vec<u32>, error: fn() -> DeviceError) -> DynSensor {
        Box::new(Flaky {
            reads: 0,
            fail_on,
            error,
        })
    }

    #[test]
    fn test_settings_reject_negative_delay() {
        assert!(PollSettings::new(1, -0.5).is_err());
        assert!(PollSettings::new(1, f64::INFINITY).is_err());
        assert_eq!(PollSettings::new(3, 0.0).unwrap().delay, Duration::ZERO);
    }

    #[test]
    fn test_failed_read_leaves_fields_absent() {
        let mut p = Poller::new(vec![flaky(vec![2])], PollSettings::new(3, 0.0).unwrap());
        let mut out: Vec<SampleRecord> = Vec::new();
        let summary = p.run(&AtomicBool::new(false), &mut out);
        assert_eq!(summary, PollSummary { cycles: 3, read_errors: 1 });
        assert!(out[0].bus_voltage_v.is_some());
        assert!(out[1].bus_voltage_v.is_none());
        assert!(out[2].bus_voltage_v.is_some());
    }

    #[test]
    fn test_stop_flag_checked_before_first_cycle() {
        let mut p = Poller::new(vec![flaky(vec![])], PollSettings::new(0, 0.0).unwrap());
        let mut out: Vec<SampleRecord> = Vec::new();
        let summary = p.run(&AtomicBool::new(true), &mut out);
        assert_eq!(summary.cycles, 0);
        assert!(out.is_empty());
    }

    #[test]
    fn test_metrics_count_read_errors() {
        let hub = MetricsHub::new().unwrap();
        let mut p = Poller::new(vec![flaky(vec![1])], PollSettings::new(2, 0.0).unwrap())
            .with_metrics(hub.clone());
        p.configure_all().unwrap();
        let mut out: Vec<SampleRecord> = Vec::new();
        p.run(&AtomicBool::new(false), &mut out);
        assert_eq!(hub.read_errors("flaky", "unavailable"), 1);
        assert!(hub.encode_text().contains("pmon_samples_total 2"));
    }

    #[test]
    fn test_read_failures_are_classified() {
        use i2c_transport::TransportError;

        assert_eq!(
            ReadFailure::classify(&DeviceError::Io(TransportError::Io("nak".into()))),
            ReadFailure::Transient
        );
        assert_eq!(
            ReadFailure::classify(&DeviceError::Io(TransportError::NoDevice {
                bus: 1,
                address: 0x40
            })),
            ReadFailure::Unavailable
        );
        assert_eq!(
            ReadFailure::classify(&DeviceError::InvalidRegister("X".into())),
            ReadFailure::Local
        );

        let hub = MetricsHub::new().unwrap();
        let sensors = vec![
            flaky_with(vec![1, 2], || DeviceError::Io(TransportError::Timeout)),
            flaky_with(vec![2], || {
                DeviceError::Io(TransportError::NoDevice {
                    bus: 1,
                    address: 0x40,
                })
            }),
        ];
        let mut p = Poller::new(sensors, PollSettings::new(2, 0.0).unwrap()).with_metrics(hub.clone());
        let mut out: Vec<SampleRecord> = Vec::new();
        let summary = p.run(&AtomicBool::new(false), &mut out);
        assert_eq!(summary.read_errors, 3);
        assert_eq!(hub.read_errors("flaky", "transient"), 2);
        assert_eq!(hub.read_errors("flaky", "unavailable"), 1);
    }
}
