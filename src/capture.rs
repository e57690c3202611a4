//! Host side of the bedside capture link.
//!
//! The recorder samples for a fixed window, then dumps the block as text
//! lines over USB serial and waits for `START` before sampling again.
//! [`CaptureSession`] is the line-level state machine; [`SerialLink`] drives
//! it from a port and hands back finished [`CapturedBlock`]s, which convert
//! into the same binary frames the batch pipeline decodes.
use std::io::{self, BufRead, BufReader, Read, Write};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use ndarray::Array2;
use serialport::SerialPort;

use crate::config::DeviceProfile;
use crate::signal::{encode_frame, FrameHeader, HolterError};

pub const DEFAULT_BAUD_RATE: u32 = 115_200;
pub const READ_TIMEOUT: Duration = Duration::from_secs(2);
/// The recorder samples ECG and accelerometer together at this rate.
pub const DEVICE_SAMPLE_RATE_HZ: u16 = 100;
pub const CAPTURE_COMMAND: &str = "START";
const FRAME_VERSION: u16 = 2;
const DATA_FIELDS: usize = 7;

// AD8232 front end: mid-rail offset and instrumentation gain.
const AD8232_OFFSET_V: f64 = 1.65;
const AD8232_GAIN: f64 = 1100.0;
const STANDARD_GRAVITY: f64 = 9.806_65;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureState {
    AwaitingReady,
    AwaitingCaptureStart,
    /// `CAPTURE:START` seen, the recorder is sampling.
    Capturing,
    ReceivingSamples,
    TransferComplete,
}

#[derive(Clone, Debug, PartialEq)]
pub enum CaptureEvent {
    System(String),
    DeviceError(String),
    Ready,
    CaptureStarted,
    Progress { done: usize, total: usize },
    CaptureComplete,
    TransferStarted,
    TransferSize { expected: usize },
    Sample,
    /// A DATA line that could not be decoded. The sample is dropped.
    MalformedData { line: String, reason: String },
    TransferEnded { received: usize, expected: Option<usize> },
    WaitingForCommand,
    Ignored(String),
}

/// One `DATA:t,I,II,III,ax,ay,az` line as the device sent it: lead
/// voltages straight off the AD8232 and acceleration in m/s².
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CapturedSample {
    pub timestamp_ms: u64,
    pub leads_v: [f64; 3],
    pub accel_ms2: [f64; 3],
}

impl CapturedSample {
    pub fn parse(fields: &str) -> Result<Self, String> {
        let values = fields
            .split(',')
            .map(|field| field.trim().parse::<f64>())
            .collect::<Result<Vec<f64>, _>>()
            .map_err(|err| err.to_string())?;
        if values.len() != DATA_FIELDS {
            return Err(format!(
                "expected {DATA_FIELDS} fields, got {}",
                values.len()
            ));
        }
        if values.iter().any(|v| !v.is_finite()) || values[0] < 0.0 {
            return Err("non-finite or negative value".to_string());
        }
        Ok(Self {
            timestamp_ms: values[0] as u64,
            leads_v: [values[1], values[2], values[3]],
            accel_ms2: [values[4], values[5], values[6]],
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CapturedBlock {
    pub samples: Vec<CapturedSample>,
    /// Sample count announced by `TRANSFER:SAMPLES`, if it arrived.
    pub expected: Option<usize>,
    pub started_at: Option<DateTime<Utc>>,
}

impl CapturedBlock {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.expected.map_or(true, |n| n == self.samples.len())
    }

    /// Elapsed device time between the first and last sample.
    pub fn duration_s(&self) -> f64 {
        match (self.samples.first(), self.samples.last()) {
            (Some(first), Some(last)) => {
                last.timestamp_ms.saturating_sub(first.timestamp_ms) as f64 / 1000.0
            }
            _ => 0.0,
        }
    }

    /// Leads I, II, III in millivolts. Lead III is rebuilt from I and II so
    /// the Einthoven relation holds exactly after conversion.
    pub fn ecg_millivolts(&self) -> Array2<f64> {
        Array2::from_shape_fn((self.samples.len(), 3), |(i, lead)| {
            let [lead_i, lead_ii, _] = self.samples[i].leads_v;
            let lead_i = ad8232_millivolts(lead_i);
            let lead_ii = ad8232_millivolts(lead_ii);
            match lead {
                0 => lead_i,
                1 => lead_ii,
                _ => lead_ii - lead_i,
            }
        })
    }

    pub fn accel_g(&self) -> Array2<f64> {
        Array2::from_shape_fn((self.samples.len(), 3), |(i, axis)| {
            self.samples[i].accel_ms2[axis] / STANDARD_GRAVITY
        })
    }

    /// Packs the block into a current-layout frame.
    pub fn to_frame(
        &self,
        device_id: u16,
        start_time: u32,
        device: &DeviceProfile,
    ) -> Result<Vec<u8>, HolterError> {
        let header = FrameHeader {
            magic: device.expected_magic,
            version: FRAME_VERSION,
            device_id,
            session_id: start_time,
            start_time,
            ecg_rate_hz: DEVICE_SAMPLE_RATE_HZ,
            accel_rate_hz: DEVICE_SAMPLE_RATE_HZ,
            ecg_samples: self.samples.len() as u32,
            accel_samples: self.samples.len() as u32,
        };
        let ecg = self.ecg_millivolts();
        let accel = self.accel_g();
        encode_frame(&header, ecg.view(), accel.view(), device)
    }
}

pub fn ad8232_millivolts(volts: f64) -> f64 {
    (volts - AD8232_OFFSET_V) / AD8232_GAIN * 1000.0
}

/// Line-driven state machine for one recorder.
#[derive(Debug)]
pub struct CaptureSession {
    state: CaptureState,
    current: CapturedBlock,
    finished: Option<CapturedBlock>,
    malformed: usize,
}

impl Default for CaptureSession {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureSession {
    pub fn new() -> Self {
        Self {
            state: CaptureState::AwaitingReady,
            current: CapturedBlock::default(),
            finished: None,
            malformed: 0,
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    /// DATA lines rejected since the session was created.
    pub fn malformed_lines(&self) -> usize {
        self.malformed
    }

    pub fn ingest_line(&mut self, raw: &str) -> CaptureEvent {
        let line = raw.trim();
        if line.is_empty() {
            return CaptureEvent::Ignored(String::new());
        }
        if let Some(fields) = line.strip_prefix("DATA:") {
            return self.ingest_data(line, fields);
        }
        match line {
            "SYSTEM:READY" => {
                if self.state == CaptureState::AwaitingReady {
                    self.state = CaptureState::AwaitingCaptureStart;
                }
                return CaptureEvent::Ready;
            }
            "CAPTURE:START" => {
                // A host attached after boot never sees READY; the capture
                // announcement arms the session on its own.
                if self.state != CaptureState::ReceivingSamples {
                    self.state = CaptureState::Capturing;
                }
                return CaptureEvent::CaptureStarted;
            }
            "CAPTURE:COMPLETE" => return CaptureEvent::CaptureComplete,
            "TRANSFER:START" => {
                if !matches!(
                    self.state,
                    CaptureState::Capturing | CaptureState::ReceivingSamples
                ) {
                    warn!(
                        "transfer announced in state {:?} without a capture, ignored",
                        self.state
                    );
                    return CaptureEvent::Ignored(line.to_string());
                }
                if self.finished.is_some() {
                    warn!("new transfer started before the previous block was taken");
                }
                self.current = CapturedBlock {
                    started_at: self.current.started_at.take(),
                    ..CapturedBlock::default()
                };
                self.finished = None;
                self.state = CaptureState::ReceivingSamples;
                return CaptureEvent::TransferStarted;
            }
            "TRANSFER:END" => return self.finish_transfer(line),
            "WAITING:COMMAND" => return CaptureEvent::WaitingForCommand,
            _ => {}
        }
        if let Some(count) = line.strip_prefix("TRANSFER:SAMPLES:") {
            return match count.trim().parse::<usize>() {
                Ok(expected) if self.state == CaptureState::ReceivingSamples => {
                    self.current.expected = Some(expected);
                    CaptureEvent::TransferSize { expected }
                }
                _ => CaptureEvent::Ignored(line.to_string()),
            };
        }
        if let Some(progress) = line.strip_prefix("PROGRESS:") {
            return match parse_progress(progress) {
                Some((done, total)) => CaptureEvent::Progress { done, total },
                None => CaptureEvent::Ignored(line.to_string()),
            };
        }
        if let Some(message) = line.strip_prefix("SYSTEM:") {
            return CaptureEvent::System(message.to_string());
        }
        if let Some(message) = line.strip_prefix("ERROR:") {
            return CaptureEvent::DeviceError(message.to_string());
        }
        CaptureEvent::Ignored(line.to_string())
    }

    /// Hands out the finished block and re-arms for the next capture.
    pub fn take_block(&mut self) -> Option<CapturedBlock> {
        let block = self.finished.take()?;
        if self.state == CaptureState::TransferComplete {
            self.state = CaptureState::AwaitingCaptureStart;
        }
        Some(block)
    }

    /// Stamps the block being assembled. Done by the link, which owns the clock.
    pub fn mark_started(&mut self, at: DateTime<Utc>) {
        self.current.started_at = Some(at);
    }

    fn ingest_data(&mut self, line: &str, fields: &str) -> CaptureEvent {
        if self.state != CaptureState::ReceivingSamples {
            return CaptureEvent::Ignored(line.to_string());
        }
        match CapturedSample::parse(fields) {
            Ok(sample) => {
                self.current.samples.push(sample);
                CaptureEvent::Sample
            }
            Err(reason) => {
                self.malformed += 1;
                CaptureEvent::MalformedData {
                    line: line.to_string(),
                    reason,
                }
            }
        }
    }

    fn finish_transfer(&mut self, line: &str) -> CaptureEvent {
        if self.state != CaptureState::ReceivingSamples {
            return CaptureEvent::Ignored(line.to_string());
        }
        let block = std::mem::take(&mut self.current);
        let received = block.samples.len();
        let expected = block.expected;
        self.finished = Some(block);
        self.state = CaptureState::TransferComplete;
        CaptureEvent::TransferEnded { received, expected }
    }
}

fn parse_progress(text: &str) -> Option<(usize, usize)> {
    let (done, total) = text.split_once('/')?;
    Some((done.trim().parse().ok()?, total.trim().parse().ok()?))
}

/// A recorder on the other end of a byte stream, normally a serial port.
pub struct SerialLink<P: Read + Write = Box<dyn SerialPort>> {
    name: String,
    reader: BufReader<P>,
    pending: Vec<u8>,
    /// Consecutive read timeouts tolerated before giving up on a block.
    idle_limit: usize,
}

impl SerialLink {
    pub fn open(port_name: &str, baud_rate: u32) -> Result<Self, HolterError> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(READ_TIMEOUT)
            .open()?;
        info!("opened {port_name} at {baud_rate} baud");
        Ok(Self::from_port(port_name, port))
    }
}

impl<P: Read + Write> SerialLink<P> {
    pub fn from_port(name: &str, port: P) -> Self {
        Self {
            name: name.to_string(),
            reader: BufReader::new(port),
            pending: Vec::new(),
            idle_limit: 30,
        }
    }

    pub fn with_idle_limit(mut self, timeouts: usize) -> Self {
        self.idle_limit = timeouts;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Next complete line, or `None` if the read timed out first. A partial
    /// line survives the timeout and is completed by the next call.
    pub fn read_line(&mut self) -> Result<Option<String>, HolterError> {
        match self.reader.read_until(b'\n', &mut self.pending) {
            Ok(0) if self.pending.is_empty() => Err(HolterError::Capture(format!(
                "{} closed the connection",
                self.name
            ))),
            Ok(_) => {
                let line = String::from_utf8_lossy(&self.pending).trim().to_string();
                self.pending.clear();
                Ok(Some(line))
            }
            Err(err) if err.kind() == io::ErrorKind::TimedOut => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub fn request_capture(&mut self) -> Result<(), HolterError> {
        let port = self.reader.get_mut();
        port.write_all(format!("{CAPTURE_COMMAND}\n").as_bytes())?;
        port.flush()?;
        debug!("sent {CAPTURE_COMMAND} to {}", self.name);
        Ok(())
    }

    /// Feeds lines into `session` until a block has been transferred.
    /// Answers `WAITING:COMMAND` with a capture request, so the same call
    /// works on a freshly booted recorder and on one idling between blocks.
    pub fn run_capture(&mut self, session: &mut CaptureSession) -> Result<CapturedBlock, HolterError> {
        let mut idle = 0;
        loop {
            let Some(line) = self.read_line()? else {
                idle += 1;
                if idle > self.idle_limit {
                    return Err(HolterError::Capture(format!(
                        "no data from {} after {idle} read timeouts",
                        self.name
                    )));
                }
                continue;
            };
            idle = 0;
            match session.ingest_line(&line) {
                CaptureEvent::System(message) => info!("device: {message}"),
                CaptureEvent::DeviceError(message) => {
                    return Err(HolterError::Capture(format!("device reported {message}")));
                }
                CaptureEvent::Ready => info!("{} is ready", self.name),
                CaptureEvent::CaptureStarted => {
                    session.mark_started(Utc::now());
                    info!("capture started");
                }
                CaptureEvent::Progress { done, total } => debug!("captured {done}/{total}"),
                CaptureEvent::CaptureComplete => info!("capture complete, waiting for transfer"),
                CaptureEvent::TransferStarted => debug!("transfer started"),
                CaptureEvent::TransferSize { expected } => {
                    debug!("expecting {expected} samples")
                }
                CaptureEvent::Sample => {}
                CaptureEvent::MalformedData { line, reason } => {
                    warn!("dropped malformed line {line:?}: {reason}")
                }
                CaptureEvent::TransferEnded { received, expected } => {
                    match expected {
                        Some(n) if n != received => {
                            warn!("received {received} samples, device announced {n}")
                        }
                        _ => info!("received {received} samples"),
                    }
                    if let Some(block) = session.take_block() {
                        return Ok(block);
                    }
                }
                CaptureEvent::WaitingForCommand => self.request_capture()?,
                CaptureEvent::Ignored(line) => {
                    if !line.is_empty() {
                        debug!("ignored {line:?}");
                    }
                }
            }
        }
    }
}
