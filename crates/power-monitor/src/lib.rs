//! power-monitor: polling scheduler, sample records and exporters

mod error;
pub use error::{MonitorError, Result};

mod config;
pub use config::{AdcSection, InaSection, MonitorConfig, UdpTarget, DEFAULT_MULTIPLIERS};

mod record;
pub use record::{SampleRecord, FIELD_NAMES};

mod poller;
pub use poller::{PollSettings, PollSummary, Poller, ReadFailure};

mod sink;
pub use sink::{
    sink_for_path, CsvSink, DynSink, Fanout, JsonLinesSink, PromFileSink, RecordSink, StdoutSink,
    UdpSink,
};

mod metrics;
pub use metrics::{MetricsHub, SampleMetrics};
