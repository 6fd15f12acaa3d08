//! Destinations for sample records.
//!
//! A sink failure is reported to the caller and never retried here; the
//! poller logs it and keeps polling.

use crate::metrics::MetricsHub;
use crate::record::{SampleRecord, FIELD_NAMES};
use crate::{MonitorError, Result};
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::path::{Path, PathBuf};

pub trait RecordSink {
    fn write(&mut self, rec: &SampleRecord) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<S: RecordSink + ?Sized> RecordSink for Box<S> {
    fn write(&mut self, rec: &SampleRecord) -> Result<()> {
        (**self).write(rec)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }
}

/// Collects records in memory.
impl RecordSink for Vec<SampleRecord> {
    fn write(&mut self, rec: &SampleRecord) -> Result<()> {
        self.push(rec.clone());
        Ok(())
    }
}

pub type DynSink = Box<dyn RecordSink + Send>;

/// Hands every record to each inner sink, even when an earlier one fails.
#[derive(Default)]
pub struct Fanout {
    sinks: Vec<DynSink>,
}

impl Fanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, sink: DynSink) {
        self.sinks.push(sink);
    }

    pub fn with(mut self, sink: DynSink) -> Self {
        self.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl RecordSink for Fanout {
    fn write(&mut self, rec: &SampleRecord) -> Result<()> {
        let mut first_err = None;
        for sink in &mut self.sinks {
            if let Err(e) = sink.write(rec) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn flush(&mut self) -> Result<()> {
        let mut first_err = None;
        for sink in &mut self.sinks {
            if let Err(e) = sink.flush() {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// One datagram per record carrying its status line.
pub struct UdpSink {
    socket: UdpSocket,
    target: SocketAddr,
}

impl UdpSink {
    pub fn new(host: &str, port: u16) -> Result<Self> {
        let target = (host, port).to_socket_addrs()?.next().ok_or_else(|| {
            MonitorError::Config(format!("cannot resolve udp target {host}:{port}"))
        })?;
        let bind: SocketAddr = if target.is_ipv4() {
            ([0u8; 4], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(bind)?;
        tracing::info!(%target, "udp status sink ready");
        Ok(Self { socket, target })
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }
}

impl RecordSink for UdpSink {
    fn write(&mut self, rec: &SampleRecord) -> Result<()> {
        let line = rec.status_line();
        tracing::debug!(line = %line, "udp send");
        self.socket.send_to(line.as_bytes(), self.target)?;
        Ok(())
    }
}

/// Status line per record on stdout.
#[derive(Default)]
pub struct StdoutSink;

impl RecordSink for StdoutSink {
    fn write(&mut self, rec: &SampleRecord) -> Result<()> {
        let mut out = io::stdout().lock();
        writeln!(out, "{}", rec.status_line())?;
        Ok(())
    }
}

/// One JSON object per line.
pub struct JsonLinesSink<W: Write> {
    w: W,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(w: W) -> Self {
        Self { w }
    }

    pub fn into_inner(self) -> W {
        self.w
    }
}

impl<W: Write> RecordSink for JsonLinesSink<W> {
    fn write(&mut self, rec: &SampleRecord) -> Result<()> {
        let json = serde_json::to_string(rec)?;
        self.w.write_all(json.as_bytes())?;
        self.w.write_all(b"\n")?;
        self.w.flush()?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.w.flush()?;
        Ok(())
    }
}

/// Header on first write; absent values are empty cells.
pub struct CsvSink<W: Write> {
    w: W,
    header_written: bool,
}

impl<W: Write> CsvSink<W> {
    pub fn new(w: W) -> Self {
        Self {
            w,
            header_written: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.w
    }
}

impl<W: Write> RecordSink for CsvSink<W> {
    fn write(&mut self, rec: &SampleRecord) -> Result<()> {
        if !self.header_written {
            let header = FIELD_NAMES.join(",");
            writeln!(self.w, "timestamp,{header}")?;
            self.header_written = true;
        }
        let mut row = format!("{:.3}", rec.timestamp);
        for v in rec.positional() {
            row.push(',');
            if let Some(v) = v {
                row.push_str(&v.to_string());
            }
        }
        writeln!(self.w, "{row}")?;
        self.w.flush()?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.w.flush()?;
        Ok(())
    }
}

/// Rewrites a node-exporter textfile with the current metrics each cycle.
///
/// The file is replaced through a sibling temp file so scrapers never see a
/// partial write. The hub is expected to be fed by the poller.
pub struct PromFileSink {
    path: PathBuf,
    tmp: PathBuf,
    metrics: MetricsHub,
}

impl PromFileSink {
    pub fn new(path: impl Into<PathBuf>, metrics: MetricsHub) -> Self {
        let path = path.into();
        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        Self {
            path,
            tmp: PathBuf::from(tmp),
            metrics,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RecordSink for PromFileSink {
    fn write(&mut self, _rec: &SampleRecord) -> Result<()> {
        fs::write(&self.tmp, self.metrics.encode_text())?;
        fs::rename(&self.tmp, &self.path)?;
        Ok(())
    }
}

/// Pick a file sink by extension: `.json`/`.jsonl`, `.csv`, `.prom`/`.txt`.
pub fn sink_for_path(path: &Path, metrics: &MetricsHub) -> Result<DynSink> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    let sink: DynSink = match ext.as_str() {
        "json" | "jsonl" => Box::new(JsonLinesSink::new(BufWriter::new(File::create(path)?))),
        "csv" => Box::new(CsvSink::new(BufWriter::new(File::create(path)?))),
        "prom" | "txt" => Box::new(PromFileSink::new(path, metrics.clone())),
        other => {
            return Err(MonitorError::Config(format!(
                "unsupported output extension {other:?} for {}",
                path.display()
            )))
        }
    };
    tracing::info!(path = %path.display(), "file sink ready");
    Ok(sink)
}
