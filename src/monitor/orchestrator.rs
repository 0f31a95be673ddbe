//! # Monitor
//!
//! Owns the capture source of the current session and the engine loop consuming it.
//!
//! ```text
//! ┌───────────────┐  bounded mpsc  ┌─────────────┐ merge/refresh ┌───────────────────┐
//! │ CaptureSource │───────────────▶│ EngineLoop  │──────────────▶│ ConnectionManager │
//! │ (own thread)  │   FlowUpdate   │ (tokio task)│               └───────────────────┘
//! └───────────────┘                └──────┬──────┘
//!                                         │ Snapshot
//!                                         ▼
//!                              SnapshotSink / broadcast
//! ```
//!
//! `start_monitoring` clears the manager, starts the source and spawns the loop; any failure is
//! followed by a best-effort stop of whatever was brought up. `stop_monitoring` runs the reverse
//! sequence, may be called any number of times, and once it returned no callback or scheduled
//! task of the session runs anymore.

use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::engine_loop::{EngineLoop, EngineTiming};
use super::sink::SnapshotSink;
use crate::configuration::types::{BackendKind, CaptureSettings};
use crate::data_capture::backend::OpenOptions;
use crate::data_capture::capture_source::{
    CaptureCounters, CaptureSource, CaptureStats, KernelTraceSource, ObservationHandoff,
    PacketCaptureSource,
};
use crate::data_capture::pcap_file::PcapFileBackend;
use crate::data_capture::trace_feed::TraceFeedBackend;
use crate::data_capture::translator::TraceTranslator;
use crate::error_handling::types::MonitorError;
use crate::flow_tracking::connection_manager::ConnectionManager;
use crate::flow_tracking::types::Snapshot;

const SNAPSHOT_BACKLOG: usize = 16;

struct RunningSession {
    id: Uuid,
    shutdown: oneshot::Sender<()>,
    engine: JoinHandle<Vec<Box<dyn SnapshotSink>>>,
    counters: Arc<CaptureCounters>,
}

pub struct Monitor {
    manager: Arc<ConnectionManager>,
    timing: EngineTiming,
    source: Option<Box<dyn CaptureSource>>,
    sinks: Vec<Box<dyn SnapshotSink>>,
    snapshots: broadcast::Sender<Arc<Snapshot>>,
    running: Option<RunningSession>,
}

impl Monitor {
    pub fn new(manager: Arc<ConnectionManager>, timing: EngineTiming) -> Self {
        let (snapshots, _) = broadcast::channel(SNAPSHOT_BACKLOG);
        Self {
            manager,
            timing,
            source: None,
            sinks: Vec::new(),
            snapshots,
            running: None,
        }
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Sinks added while a session runs receive snapshots from the next session on.
    pub fn add_sink(&mut self, sink: Box<dyn SnapshotSink>) {
        self.sinks.push(sink);
    }

    /// Receiver of every snapshot emitted by later refresh cycles.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Snapshot>> {
        self.snapshots.subscribe()
    }

    /// Replaces the capture source. Not allowed while monitoring.
    pub fn select_source(&mut self, source: Box<dyn CaptureSource>) -> Result<(), MonitorError> {
        if self.running.is_some() {
            return Err(MonitorError::AlreadyRunning);
        }
        info!("Selected capture source {} ({})", source.name(), source.variant());
        self.source = Some(source);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.running.as_ref().map(|s| s.id)
    }

    pub fn capture_stats(&self) -> Option<CaptureStats> {
        self.running.as_ref().map(|s| s.counters.snapshot())
    }

    pub async fn start_monitoring(&mut self) -> Result<Uuid, MonitorError> {
        if self.running.is_some() {
            return Err(MonitorError::AlreadyRunning);
        }
        let source = self.source.as_mut().ok_or(MonitorError::NoCaptureSource)?;
        let id = Uuid::new_v4();

        self.manager.clear();

        let (updates_tx, updates_rx) = mpsc::channel(self.timing.channel_capacity.max(1));
        let counters = Arc::new(CaptureCounters::new());
        if let Err(e) = source.start(ObservationHandoff::new(updates_tx, Arc::clone(&counters))) {
            error!("[{}] Unable to start capture on {}: {}", id, source.name(), e);
            if let Err(stop_err) = source.stop() {
                warn!("[{}] Cleanup after failed start: {}", id, stop_err);
            }
            self.manager.clear();
            return Err(MonitorError::from(e));
        }

        let engine = EngineLoop {
            session_id: id,
            manager: Arc::clone(&self.manager),
            updates: updates_rx,
            counters: Arc::clone(&counters),
            sinks: std::mem::take(&mut self.sinks),
            snapshots: self.snapshots.clone(),
            timing: self.timing,
        };
        let (shutdown, shutdown_rx) = oneshot::channel();
        let engine = tokio::spawn(engine.run(shutdown_rx));

        info!(
            "[{}] Monitoring started on {} (merge every {:?}, refresh every {:?})",
            id,
            source.name(),
            self.timing.merge_interval,
            self.timing.refresh_interval
        );
        self.running = Some(RunningSession {
            id,
            shutdown,
            engine,
            counters,
        });
        Ok(id)
    }

    /// Stops the session if one is running. Every release step runs even when an earlier one
    /// failed; the first capture failure is returned.
    pub async fn stop_monitoring(&mut self) -> Result<(), MonitorError> {
        let Some(session) = self.running.take() else {
            return Ok(());
        };

        let _ = session.shutdown.send(());
        match session.engine.await {
            Ok(sinks) => self.sinks = sinks,
            Err(e) => error!("[{}] Engine loop ended abnormally: {}", session.id, e),
        }

        let mut result = Ok(());
        if let Some(source) = self.source.as_mut() {
            if let Err(e) = source.stop() {
                warn!("[{}] Capture teardown failed: {}", session.id, e);
                result = Err(MonitorError::from(e));
            }
        }

        self.manager.clear();
        info!(
            "[{}] Monitoring stopped ({})",
            session.id,
            session.counters.snapshot()
        );
        result
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        if let Some(session) = self.running.take() {
            let _ = session.shutdown.send(());
            session.engine.abort();
            if let Some(source) = self.source.as_mut() {
                if let Err(e) = source.stop() {
                    warn!("[{}] Capture teardown on drop failed: {}", session.id, e);
                }
            }
        }
    }
}

/// Builds the configured capture source. `process_id` (from presence detection) takes precedence
/// over the configured pid filter of the trace variant.
pub fn capture_source_from_settings(
    settings: &CaptureSettings,
    process_id: Option<u32>,
) -> Result<Box<dyn CaptureSource>, MonitorError> {
    let source = settings
        .source
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .ok_or(MonitorError::NoCaptureSource)?;
    let options = OpenOptions {
        promiscuous: settings.promiscuous,
        read_timeout: Duration::from_millis(settings.read_timeout_ms),
        session_name: settings.session_name.clone(),
    };

    Ok(match settings.backend {
        BackendKind::PcapFile => Box::new(PacketCaptureSource::packet_capture(
            PcapFileBackend::new(source, settings.pace),
            settings.filter.clone(),
            options,
        )),
        BackendKind::TraceFeed => Box::new(KernelTraceSource::kernel_trace(
            TraceFeedBackend::new(source),
            TraceTranslator::new(settings.monitored_port, process_id.or(settings.process_id)),
            options,
        )),
    })
}
