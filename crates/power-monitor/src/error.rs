use sensor_devices::DeviceError;
use thiserror::Error;

pub type Result<T, E = MonitorError> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("invalid config: {0}")]
    Config(String),
    #[error("sensor {name}: {source}")]
    Sensor {
        name: String,
        #[source]
        source: DeviceError,
    },
    #[error("malformed status line: {0}")]
    Parse(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}
