//! The single consumer loop of a monitoring session.
//!
//! Flow updates arrive through the capture channel and are buffered into the connection manager.
//! Merges run on a short interval and opportunistically when a burst of updates arrives after the
//! interval elapsed; refreshes (eviction then snapshot emission) run on a longer interval. Both
//! run on this one task, so they never overlap.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use log::{debug, trace};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{self, Instant, MissedTickBehavior};
use uuid::Uuid;

use super::sink::SnapshotSink;
use crate::configuration::config::Config;
use crate::data_capture::capture_source::CaptureCounters;
use crate::flow_tracking::connection_manager::ConnectionManager;
use crate::flow_tracking::types::{FlowUpdate, Snapshot};

/// Timing of the engine loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineTiming {
    pub merge_interval: Duration,
    pub refresh_interval: Duration,
    pub connection_timeout: Duration,
    pub channel_capacity: usize,
}

impl EngineTiming {
    pub fn from_config(config: &Config) -> Self {
        Self {
            merge_interval: config.merge_interval(),
            refresh_interval: config.refresh_interval(),
            connection_timeout: config.connection_timeout(),
            channel_capacity: config.engine.channel_capacity,
        }
    }
}

impl Default for EngineTiming {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Wall clock derived from the runtime's monotonic clock, so paused test runtimes drive eviction
/// deterministically.
#[derive(Debug, Clone, Copy)]
struct EngineClock {
    wall: DateTime<Local>,
    origin: Instant,
}

impl EngineClock {
    fn start() -> Self {
        Self {
            wall: Local::now(),
            origin: Instant::now(),
        }
    }

    fn now(&self) -> DateTime<Local> {
        chrono::Duration::from_std(self.origin.elapsed())
            .ok()
            .and_then(|elapsed| self.wall.checked_add_signed(elapsed))
            .unwrap_or_else(Local::now)
    }
}

pub(crate) struct EngineLoop {
    pub(crate) session_id: Uuid,
    pub(crate) manager: Arc<ConnectionManager>,
    pub(crate) updates: mpsc::Receiver<FlowUpdate>,
    pub(crate) counters: Arc<CaptureCounters>,
    pub(crate) sinks: Vec<Box<dyn SnapshotSink>>,
    pub(crate) snapshots: broadcast::Sender<Arc<Snapshot>>,
    pub(crate) timing: EngineTiming,
}

impl EngineLoop {
    /// Runs until `shutdown` fires (or its sender is dropped), then hands the sinks back.
    pub(crate) async fn run(mut self, mut shutdown: oneshot::Receiver<()>) -> Vec<Box<dyn SnapshotSink>> {
        let clock = EngineClock::start();
        let started = Instant::now();

        let mut merge_tick = time::interval_at(started + self.timing.merge_interval, self.timing.merge_interval);
        merge_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut refresh_tick =
            time::interval_at(started + self.timing.refresh_interval, self.timing.refresh_interval);
        refresh_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_merge = started;
        let mut channel_open = true;

        debug!("[{}] Engine loop running", self.session_id);
        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => break,

                received = self.updates.recv(), if channel_open => match received {
                    Some(update) => {
                        trace!("[{}] {} +{:?}", self.session_id, update.key, update.delta);
                        self.manager.update_stats(update.key, update.delta);
                        if last_merge.elapsed() >= self.timing.merge_interval {
                            self.merge(clock.now());
                            last_merge = Instant::now();
                            merge_tick.reset();
                        }
                    }
                    None => {
                        debug!("[{}] Capture channel closed", self.session_id);
                        channel_open = false;
                    }
                },

                _ = merge_tick.tick() => {
                    self.merge(clock.now());
                    last_merge = Instant::now();
                }

                _ = refresh_tick.tick() => self.refresh(clock.now()),
            }
        }

        debug!("[{}] Engine loop stopped", self.session_id);
        self.sinks
    }

    fn merge(&self, now: DateTime<Local>) {
        let report = self.manager.apply_pending_updates_at(now);
        if report.flows_merged > 0 {
            trace!(
                "[{}] Merge cycle: {} flows, {} new views",
                self.session_id,
                report.flows_merged,
                report.views_created
            );
        }
    }

    fn refresh(&mut self, now: DateTime<Local>) {
        let evicted = self
            .manager
            .remove_inactive_connections_at(self.timing.connection_timeout, now);
        let snapshot = Arc::new(self.manager.snapshot());

        debug!(
            "[{}] Refresh: {} visible, {} tracked, {} evicted, capture {}",
            self.session_id,
            snapshot.flows.len(),
            self.manager.flow_count(),
            evicted,
            self.counters.snapshot()
        );

        for sink in self.sinks.iter_mut() {
            sink.publish(self.session_id, &snapshot);
        }
        // no subscribers is not an error
        let _ = self.snapshots.send(snapshot);
    }
}
