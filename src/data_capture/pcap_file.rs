//! Packet-capture backend replaying a classic libpcap savefile.
//!
//! Both timestamp resolutions (micro and nano) and both byte orders are accepted. Frames are
//! delivered from a dedicated `pcap-replay` thread, optionally paced to the recorded timing.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, trace, warn};

use super::backend::{Callback, CallbackSlot, CaptureBackend, OpenOptions};
use super::packet_filter::PacketFilter;
use super::types::{LinkType, RawPacket};
use crate::error_handling::types::CaptureError;

const MAGIC_MICROS: u32 = 0xa1b2_c3d4;
const MAGIC_NANOS: u32 = 0xa1b2_3c4d;
const GLOBAL_HEADER_LEN: usize = 24;
const RECORD_HEADER_LEN: usize = 16;
const MAX_RECORD_LEN: u32 = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SavefileHeader {
    pub little_endian: bool,
    pub nanosecond: bool,
    pub snaplen: u32,
    pub link_type: LinkType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavefileRecord {
    /// Capture time relative to the epoch.
    pub timestamp: Duration,
    pub packet: RawPacket,
}

/// Sequential reader of savefile records.
pub struct SavefileReader<R> {
    inner: R,
    header: SavefileHeader,
}

fn corrupt(reason: impl Into<String>) -> CaptureError {
    CaptureError::DeviceError(format!("corrupt savefile: {}", reason.into()))
}

// Fills `buf` unless EOF comes first, returning how many bytes were read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

impl<R: Read> SavefileReader<R> {
    pub fn new(mut inner: R) -> Result<Self, CaptureError> {
        let mut raw = [0u8; GLOBAL_HEADER_LEN];
        if read_full(&mut inner, &mut raw)? < GLOBAL_HEADER_LEN {
            return Err(corrupt("global header truncated"));
        }

        let magic_le = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        let magic_be = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
        let (little_endian, nanosecond) = match (magic_le, magic_be) {
            (MAGIC_MICROS, _) => (true, false),
            (MAGIC_NANOS, _) => (true, true),
            (_, MAGIC_MICROS) => (false, false),
            (_, MAGIC_NANOS) => (false, true),
            _ => return Err(corrupt(format!("unknown magic {:#010x}", magic_be))),
        };

        let field = |offset: usize| {
            let bytes = [raw[offset], raw[offset + 1], raw[offset + 2], raw[offset + 3]];
            if little_endian {
                u32::from_le_bytes(bytes)
            } else {
                u32::from_be_bytes(bytes)
            }
        };

        let header = SavefileHeader {
            little_endian,
            nanosecond,
            snaplen: field(16),
            link_type: LinkType(field(20)),
        };
        Ok(Self { inner, header })
    }

    pub fn header(&self) -> SavefileHeader {
        self.header
    }

    /// Returns `None` at the end of the file. A record cut short by the end of the file also ends
    /// the replay.
    pub fn next_record(&mut self) -> Result<Option<SavefileRecord>, CaptureError> {
        let mut raw = [0u8; RECORD_HEADER_LEN];
        let n = read_full(&mut self.inner, &mut raw)?;
        if n == 0 {
            return Ok(None);
        }
        if n < RECORD_HEADER_LEN {
            debug!("Savefile ends inside a record header ({} bytes)", n);
            return Ok(None);
        }

        let little_endian = self.header.little_endian;
        let field = |offset: usize| {
            let bytes = [raw[offset], raw[offset + 1], raw[offset + 2], raw[offset + 3]];
            if little_endian {
                u32::from_le_bytes(bytes)
            } else {
                u32::from_be_bytes(bytes)
            }
        };
        let (seconds, fraction, captured_len, original_len) = (field(0), field(4), field(8), field(12));

        if captured_len > MAX_RECORD_LEN {
            return Err(corrupt(format!("record length {} too large", captured_len)));
        }

        let mut data = vec![0u8; captured_len as usize];
        if read_full(&mut self.inner, &mut data)? < data.len() {
            debug!("Savefile ends inside a record body");
            return Ok(None);
        }

        let nanos = if self.header.nanosecond {
            fraction
        } else {
            fraction.saturating_mul(1000)
        };
        let timestamp = Duration::from_secs(u64::from(seconds)) + Duration::from_nanos(u64::from(nanos));

        Ok(Some(SavefileRecord {
            timestamp,
            packet: RawPacket {
                link_type: self.header.link_type,
                data,
                original_len,
            },
        }))
    }
}

/// Replays a savefile as if frames arrived from a live device.
pub struct PcapFileBackend {
    path: PathBuf,
    pace: bool,
    read_timeout: Duration,
    reader: Option<SavefileReader<BufReader<File>>>,
    filter: Arc<PacketFilter>,
    callback: CallbackSlot<RawPacket>,
    stop_flag: Arc<AtomicBool>,
    delivered: Arc<AtomicU64>,
    worker: Option<JoinHandle<()>>,
}

impl PcapFileBackend {
    pub fn new(path: impl AsRef<Path>, pace: bool) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            pace,
            read_timeout: OpenOptions::default().read_timeout,
            reader: None,
            filter: Arc::new(PacketFilter::default()),
            callback: CallbackSlot::new(),
            stop_flag: Arc::new(AtomicBool::new(false)),
            delivered: Arc::new(AtomicU64::new(0)),
            worker: None,
        }
    }

    /// Frames handed to the callback since the backend was opened.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Whether the replay thread has run to the end of the file.
    pub fn is_finished(&self) -> bool {
        self.worker.as_ref().map_or(true, |w| w.is_finished())
    }
}

// Sleeps `total` in slices so a stop request is noticed promptly.
fn paced_sleep(total: Duration, slice: Duration, stop: &AtomicBool) {
    let mut remaining = total;
    while !remaining.is_zero() && !stop.load(Ordering::Relaxed) {
        let step = remaining.min(slice);
        thread::sleep(step);
        remaining -= step;
    }
}

impl CaptureBackend for PcapFileBackend {
    type Observation = RawPacket;

    fn describe(&self) -> String {
        format!("pcap:{}", self.path.display())
    }

    fn check_privileges(&self) -> Result<(), CaptureError> {
        match File::open(&self.path) {
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => Err(CaptureError::PermissionError(
                format!("cannot read {}: {}", self.path.display(), e),
            )),
            _ => Ok(()),
        }
    }

    fn open(&mut self, options: &OpenOptions) -> Result<(), CaptureError> {
        if self.reader.is_some() || self.worker.is_some() {
            return Err(CaptureError::AlreadyRunning);
        }
        let file = File::open(&self.path).map_err(|e| match e.kind() {
            io::ErrorKind::PermissionDenied => CaptureError::from(e),
            _ => CaptureError::DeviceError(format!("cannot open {}: {}", self.path.display(), e)),
        })?;
        let reader = SavefileReader::new(BufReader::new(file))?;
        let header = reader.header();

        info!(
            "Opened savefile {} (link type {}, snaplen {}, {}s timestamps)",
            self.path.display(),
            header.link_type.0,
            header.snaplen,
            if header.nanosecond { "n" } else { "µ" }
        );
        self.read_timeout = options.read_timeout.max(Duration::from_millis(1));
        self.reader = Some(reader);
        self.delivered.store(0, Ordering::Relaxed);
        Ok(())
    }

    fn set_filter(&mut self, expression: &str) -> Result<(), CaptureError> {
        if self.reader.is_none() {
            return Err(CaptureError::NotOpen);
        }
        self.filter = Arc::new(PacketFilter::parse(expression)?);
        Ok(())
    }

    fn register_callback(&mut self, callback: Callback<RawPacket>) -> Result<(), CaptureError> {
        self.callback.set(callback);
        Ok(())
    }

    fn unregister_callback(&mut self) -> Result<(), CaptureError> {
        self.callback.clear();
        Ok(())
    }

    fn start(&mut self) -> Result<(), CaptureError> {
        if self.worker.is_some() {
            return Err(CaptureError::AlreadyRunning);
        }
        let mut reader = self.reader.take().ok_or(CaptureError::NotOpen)?;

        self.stop_flag.store(false, Ordering::SeqCst);
        let stop = Arc::clone(&self.stop_flag);
        let filter = Arc::clone(&self.filter);
        let callback = self.callback.clone();
        let delivered = Arc::clone(&self.delivered);
        let pace = self.pace;
        let slice = self.read_timeout;
        let name = self.describe();
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);

        let worker = thread::Builder::new()
            .name("pcap-replay".to_string())
            .spawn(move || {
                let _ = ready_tx.send(());
                let mut previous: Option<Duration> = None;

                while !stop.load(Ordering::Relaxed) {
                    let record = match reader.next_record() {
                        Ok(Some(record)) => record,
                        Ok(None) => {
                            debug!("Reached end of {}", name);
                            break;
                        }
                        Err(e) => {
                            warn!("Stopping replay of {}: {}", name, e);
                            break;
                        }
                    };

                    if pace {
                        if let Some(prev) = previous {
                            paced_sleep(record.timestamp.saturating_sub(prev), slice, &stop);
                        }
                        previous = Some(record.timestamp);
                        if stop.load(Ordering::Relaxed) {
                            break;
                        }
                    }

                    if !filter.matches(&record.packet) {
                        trace!("Frame of {} bytes rejected by filter", record.packet.data.len());
                        continue;
                    }
                    if callback.invoke(record.packet) {
                        delivered.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })?;

        if ready_rx.recv().is_err() {
            let _ = worker.join();
            return Err(CaptureError::DeviceError(format!(
                "replay thread for {} exited before starting",
                self.describe()
            )));
        }
        self.worker = Some(worker);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), CaptureError> {
        self.stop_flag.store(true, Ordering::SeqCst);
        match self.worker.take() {
            Some(worker) => {
                let joined = worker.join();
                debug!("Replay of {} stopped after {} frames", self.describe(), self.delivered());
                joined.map_err(|_| {
                    CaptureError::DeviceError(format!("replay thread for {} panicked", self.describe()))
                })
            }
            None => Ok(()),
        }
    }

    fn close(&mut self) -> Result<(), CaptureError> {
        let stopped = self.stop();
        self.callback.clear();
        self.reader = None;
        self.filter = Arc::new(PacketFilter::default());
        stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::types::CaptureSettings;
    use crate::data_capture::capture_source::{CaptureCounters, CaptureSource, ObservationHandoff};
    use crate::data_capture::packet::fixtures::ipv4_udp;
    use crate::flow_tracking::types::{ByteDelta, FlowKey, FlowUpdate};
    use crate::monitor::capture_source_from_settings;
    use std::io::{Cursor, Write};
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    struct Frame {
        seconds: u32,
        fraction: u32,
        data: Vec<u8>,
    }

    fn savefile(frames: &[Frame], link_type: u32, little_endian: bool, nanosecond: bool) -> Vec<u8> {
        let put = |out: &mut Vec<u8>, v: u32| {
            if little_endian {
                out.extend_from_slice(&v.to_le_bytes());
            } else {
                out.extend_from_slice(&v.to_be_bytes());
            }
        };
        let put16 = |out: &mut Vec<u8>, v: u16| {
            if little_endian {
                out.extend_from_slice(&v.to_le_bytes());
            } else {
                out.extend_from_slice(&v.to_be_bytes());
            }
        };

        let mut out = Vec::new();
        put(&mut out, if nanosecond { MAGIC_NANOS } else { MAGIC_MICROS });
        put16(&mut out, 2);
        put16(&mut out, 4);
        put(&mut out, 0);
        put(&mut out, 0);
        put(&mut out, 65535);
        put(&mut out, link_type);
        for frame in frames {
            put(&mut out, frame.seconds);
            put(&mut out, frame.fraction);
            put(&mut out, frame.data.len() as u32);
            put(&mut out, frame.data.len() as u32);
            out.extend_from_slice(&frame.data);
        }
        out
    }

    fn udp(last_octet: u8, dport: u16, payload: usize) -> Vec<u8> {
        ipv4_udp(
            [203, 0, 113, last_octet].into(),
            [192, 168, 1, 10].into(),
            40000,
            dport,
            payload,
        )
    }

    fn write_temp(bytes: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(bytes).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_reader_big_endian_nanoseconds() {
        let bytes = savefile(
            &[Frame {
                seconds: 10,
                fraction: 500,
                data: udp(1, 3074, 4),
            }],
            LinkType::RAW.0,
            false,
            true,
        );
        let mut reader = SavefileReader::new(Cursor::new(bytes)).unwrap();
        assert_eq!(
            reader.header(),
            SavefileHeader {
                little_endian: false,
                nanosecond: true,
                snaplen: 65535,
                link_type: LinkType::RAW,
            }
        );

        let record = reader.next_record().unwrap().unwrap();
        assert_eq!(record.timestamp, Duration::new(10, 500));
        assert_eq!(record.packet.data.len(), 32);
        assert!(reader.next_record().unwrap().is_none());
    }

    #[test]
    fn test_reader_truncated_record_ends_replay() {
        let mut bytes = savefile(
            &[Frame {
                seconds: 1,
                fraction: 2,
                data: udp(1, 3074, 4),
            }],
            LinkType::RAW.0,
            true,
            false,
        );
        bytes.truncate(bytes.len() - 3);
        let mut reader = SavefileReader::new(Cursor::new(bytes)).unwrap();
        assert!(reader.next_record().unwrap().is_none());
    }

    #[test]
    fn test_reader_rejects_unknown_magic() {
        let result = SavefileReader::new(Cursor::new(vec![0u8; 24]));
        assert!(matches!(result, Err(CaptureError::DeviceError(_))));

        let result = SavefileReader::new(Cursor::new(vec![0xd4, 0xc3]));
        assert!(matches!(result, Err(CaptureError::DeviceError(_))));
    }

    #[test]
    fn test_open_missing_file_is_device_error() {
        let mut backend = PcapFileBackend::new("/nonexistent/capture.pcap", false);
        assert!(backend.check_privileges().is_ok());
        let err = backend.open(&OpenOptions::default()).unwrap_err();
        assert!(matches!(err, CaptureError::DeviceError(_)));
    }

    #[test]
    fn test_filter_requires_open_device() {
        let file = write_temp(&savefile(&[], LinkType::RAW.0, true, false));
        let mut backend = PcapFileBackend::new(file.path(), false);

        assert!(matches!(backend.set_filter("udp"), Err(CaptureError::NotOpen)));
        backend.open(&OpenOptions::default()).unwrap();
        assert!(matches!(
            backend.set_filter("udp or tcp"),
            Err(CaptureError::InvalidFilter(_))
        ));
        backend.set_filter("udp dst port 3074").unwrap();
        backend.close().unwrap();
    }

    #[test]
    fn test_replay_applies_filter() {
        let frames = [
            Frame { seconds: 1, fraction: 0, data: udp(1, 3074, 10) },
            Frame { seconds: 1, fraction: 10, data: udp(2, 53, 10) },
            Frame { seconds: 1, fraction: 20, data: udp(3, 3074, 20) },
        ];
        let file = write_temp(&savefile(&frames, LinkType::RAW.0, true, false));
        let mut backend = PcapFileBackend::new(file.path(), false);

        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        backend.open(&OpenOptions::default()).unwrap();
        backend.set_filter("udp dst port 3074").unwrap();
        backend
            .register_callback(Arc::new(move |packet: RawPacket| {
                tx.lock().unwrap().send(packet.data[15]).unwrap();
            }))
            .unwrap();
        backend.start().unwrap();

        let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!((first, second), (1, 3));

        backend.unregister_callback().unwrap();
        backend.stop().unwrap();
        backend.close().unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(backend.delivered(), 2);
        assert!(backend.is_finished());
    }

    #[test]
    fn test_default_settings_source_replays_savefile() {
        let frames = [
            Frame { seconds: 1, fraction: 0, data: udp(1, 3074, 10) },
            Frame { seconds: 1, fraction: 10, data: udp(2, 53, 10) },
            Frame { seconds: 1, fraction: 20, data: udp(3, 3074, 20) },
        ];
        let file = write_temp(&savefile(&frames, LinkType::RAW.0, true, false));
        let settings = CaptureSettings {
            source: Some(file.path().to_string_lossy().into_owned()),
            ..CaptureSettings::default()
        };
        let mut source = capture_source_from_settings(&settings, None).unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        let counters = Arc::new(CaptureCounters::new());
        source
            .start(ObservationHandoff::new(tx, Arc::clone(&counters)))
            .unwrap();

        let mut updates = Vec::new();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while updates.len() < 2 && std::time::Instant::now() < deadline {
            match rx.try_recv() {
                Ok(update) => updates.push(update),
                Err(_) => std::thread::sleep(Duration::from_millis(10)),
            }
        }
        source.stop().unwrap();

        assert_eq!(
            updates,
            vec![
                FlowUpdate {
                    key: FlowKey::Remote([203, 0, 113, 1].into()),
                    delta: ByteDelta::received(10),
                },
                FlowUpdate {
                    key: FlowKey::Remote([203, 0, 113, 3].into()),
                    delta: ByteDelta::received(20),
                },
            ]
        );
        assert_eq!(counters.snapshot().observed, 2);
    }

    #[test]
    fn test_paced_replay_stops_promptly() {
        let frames = [
            Frame { seconds: 1, fraction: 0, data: udp(1, 3074, 10) },
            Frame { seconds: 3600, fraction: 0, data: udp(2, 3074, 10) },
        ];
        let file = write_temp(&savefile(&frames, LinkType::RAW.0, true, false));
        let mut backend = PcapFileBackend::new(file.path(), true);

        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        backend
            .open(&OpenOptions {
                read_timeout: Duration::from_millis(10),
                ..OpenOptions::default()
            })
            .unwrap();
        backend
            .register_callback(Arc::new(move |_packet: RawPacket| {
                tx.lock().unwrap().send(()).unwrap();
            }))
            .unwrap();
        backend.start().unwrap();

        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        // the second frame is an hour away in recorded time
        backend.stop().unwrap();
        assert_eq!(backend.delivered(), 1);
        backend.close().unwrap();
    }

    #[test]
    fn test_start_requires_open() {
        let mut backend = PcapFileBackend::new("/nonexistent/capture.pcap", false);
        assert!(matches!(backend.start(), Err(CaptureError::NotOpen)));
        assert!(backend.stop().is_ok());
        assert!(backend.close().is_ok());
    }
}
