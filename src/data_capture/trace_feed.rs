//! Kernel-trace backend reading UDP send/receive events as JSON lines.
//!
//! Each line holds one [`TraceEvent`]:
//!
//! ```text
//! {"kind":"recv","local":"192.168.1.10:3074","remote":"203.0.113.9:3074","size":120,"pid":4242}
//! ```
//!
//! The source is a file path, or `-` for standard input, so any tracer able to print events can
//! feed the monitor. A path naming a FIFO or another non-regular file is opened by the reader
//! thread, since opening a FIFO blocks until a writer shows up.

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};

use log::{debug, info, trace, warn};

use super::backend::{Callback, CallbackSlot, CaptureBackend, OpenOptions};
use super::types::TraceEvent;
use crate::error_handling::types::CaptureError;

pub const STDIN_SOURCE: &str = "-";

/// Input resolved by `open`.
enum FeedInput {
    Stdin,
    Regular(File),
    /// FIFO, pipe or character device; reads on it cannot be interrupted.
    Stream(PathBuf),
}

impl FeedInput {
    fn is_interruptible(&self) -> bool {
        matches!(self, FeedInput::Regular(_))
    }

    /// Runs on the reader thread.
    fn into_reader(self) -> io::Result<Box<dyn BufRead + Send>> {
        Ok(match self {
            FeedInput::Stdin => Box::new(BufReader::new(io::stdin())),
            FeedInput::Regular(file) => Box::new(BufReader::new(file)),
            FeedInput::Stream(path) => Box::new(BufReader::new(File::open(path)?)),
        })
    }
}

pub struct TraceFeedBackend {
    source: String,
    session_name: String,
    input: Option<FeedInput>,
    /// Whether the running reader can be joined on stop.
    interruptible: bool,
    callback: CallbackSlot<TraceEvent>,
    stop_flag: Arc<AtomicBool>,
    skipped: Arc<AtomicU64>,
    worker: Option<JoinHandle<()>>,
}

impl TraceFeedBackend {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            session_name: OpenOptions::default().session_name,
            input: None,
            interruptible: true,
            callback: CallbackSlot::new(),
            stop_flag: Arc::new(AtomicBool::new(false)),
            skipped: Arc::new(AtomicU64::new(0)),
            worker: None,
        }
    }

    fn is_stdin(&self) -> bool {
        self.source == STDIN_SOURCE
    }

    /// Lines that could not be decoded as trace events.
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }
}

impl CaptureBackend for TraceFeedBackend {
    type Observation = TraceEvent;

    fn describe(&self) -> String {
        format!("trace session '{}' ({})", self.session_name, self.source)
    }

    fn check_privileges(&self) -> Result<(), CaptureError> {
        if self.is_stdin() {
            return Ok(());
        }
        // opening a FIFO here would block until a writer appears
        match fs::metadata(&self.source) {
            Ok(meta) if !meta.file_type().is_file() => return Ok(()),
            _ => {}
        }
        match File::open(&self.source) {
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => Err(CaptureError::PermissionError(
                format!("cannot read {}: {}", self.source, e),
            )),
            _ => Ok(()),
        }
    }

    fn open(&mut self, options: &OpenOptions) -> Result<(), CaptureError> {
        if self.input.is_some() || self.worker.is_some() {
            return Err(CaptureError::AlreadyRunning);
        }
        self.session_name = options.session_name.clone();

        let device_error = |e: io::Error| match e.kind() {
            io::ErrorKind::PermissionDenied => CaptureError::from(e),
            _ => CaptureError::DeviceError(format!("cannot open {}: {}", self.source, e)),
        };
        let input = if self.is_stdin() {
            FeedInput::Stdin
        } else if fs::metadata(&self.source).map_err(device_error)?.file_type().is_file() {
            FeedInput::Regular(File::open(&self.source).map_err(device_error)?)
        } else {
            FeedInput::Stream(PathBuf::from(&self.source))
        };

        info!("Opened {}", self.describe());
        self.input = Some(input);
        self.skipped.store(0, Ordering::Relaxed);
        Ok(())
    }

    /// Trace providers deliver every UDP event, only the empty expression is accepted.
    fn set_filter(&mut self, expression: &str) -> Result<(), CaptureError> {
        if self.input.is_none() {
            return Err(CaptureError::NotOpen);
        }
        if expression.trim().is_empty() {
            return Ok(());
        }
        Err(CaptureError::InvalidFilter(format!(
            "'{}': trace sessions cannot be pre-filtered",
            expression
        )))
    }

    fn register_callback(&mut self, callback: Callback<TraceEvent>) -> Result<(), CaptureError> {
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
        let input = self.input.take().ok_or(CaptureError::NotOpen)?;
        self.interruptible = input.is_interruptible();

        // a detached reader of an earlier run keeps its own flag
        self.stop_flag = Arc::new(AtomicBool::new(false));
        let stop = Arc::clone(&self.stop_flag);
        let skipped = Arc::clone(&self.skipped);
        let callback = self.callback.clone();
        let name = self.describe();
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);

        let worker = thread::Builder::new()
            .name("trace-feed".to_string())
            .spawn(move || {
                let _ = ready_tx.send(());
                let mut reader = match input.into_reader() {
                    Ok(reader) => reader,
                    Err(e) => {
                        warn!("Unable to read {}: {}", name, e);
                        return;
                    }
                };
                let mut line = String::new();

                while !stop.load(Ordering::Relaxed) {
                    line.clear();
                    match reader.read_line(&mut line) {
                        Ok(0) => {
                            debug!("End of {}", name);
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!("Stopping {}: {}", name, e);
                            break;
                        }
                    }
                    if stop.load(Ordering::Relaxed) {
                        break;
                    }

                    let text = line.trim();
                    if text.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<TraceEvent>(text) {
                        Ok(event) => {
                            callback.invoke(event);
                        }
                        Err(e) => {
                            skipped.fetch_add(1, Ordering::Relaxed);
                            trace!("Skipping undecodable trace line: {}", e);
                        }
                    }
                }
            })?;

        if ready_rx.recv().is_err() {
            let _ = worker.join();
            return Err(CaptureError::DeviceError(format!(
                "reader thread for {} exited before starting",
                self.describe()
            )));
        }
        self.worker = Some(worker);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), CaptureError> {
        self.stop_flag.store(true, Ordering::SeqCst);
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };

        // Reads on stdin or a FIFO cannot be interrupted. The thread is left to exit on its own
        // with a cleared callback slot that the next run no longer shares.
        if !self.interruptible && !worker.is_finished() {
            self.callback.clear();
            self.callback = CallbackSlot::new();
            debug!("Detached reader of {}", self.describe());
            return Ok(());
        }

        worker.join().map_err(|_| {
            CaptureError::DeviceError(format!("reader thread for {} panicked", self.describe()))
        })?;
        debug!("{} stopped, {} lines skipped", self.describe(), self.skipped());
        Ok(())
    }

    fn close(&mut self) -> Result<(), CaptureError> {
        let stopped = self.stop();
        self.callback.clear();
        self.input = None;
        stopped
    }
}
