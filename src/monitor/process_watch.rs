//! Process-presence signal: polls for the monitored process and reports transitions.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};

/// Linux truncates `comm` to 15 bytes.
const COMM_LEN: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessPresence {
    Present(u32),
    Absent,
}

/// Looks up a running process by name.
pub trait ProcessProbe: Send + Sync + 'static {
    fn find(&self, name: &str) -> Option<u32>;
}

/// Scans `/proc/<pid>/comm`. The lowest matching pid wins.
#[derive(Debug, Clone)]
pub struct ProcFsProbe {
    root: PathBuf,
}

impl Default for ProcFsProbe {
    fn default() -> Self {
        Self::with_root("/proc")
    }
}

impl ProcFsProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }
}

fn comm_name(name: &str) -> &str {
    if name.len() <= COMM_LEN {
        return name;
    }
    let mut end = COMM_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

impl ProcessProbe for ProcFsProbe {
    fn find(&self, name: &str) -> Option<u32> {
        let wanted = comm_name(name);
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("Cannot list {}: {}", self.root.display(), e);
                return None;
            }
        };

        entries
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let pid = entry.file_name().to_str()?.parse::<u32>().ok()?;
                // processes may exit between listing and reading
                let comm = fs::read_to_string(entry.path().join("comm")).ok()?;
                (comm.trim_end_matches('\n') == wanted).then_some(pid)
            })
            .min()
    }
}

/// Polls a [`ProcessProbe`] and sends a [`ProcessPresence`] on every change, starting with the
/// state found by the first poll.
pub struct ProcessWatcher<P> {
    probe: Arc<P>,
    name: String,
    poll_interval: Duration,
}

impl<P: ProcessProbe> ProcessWatcher<P> {
    pub fn new(probe: P, name: impl Into<String>, poll_interval: Duration) -> Self {
        Self {
            probe: Arc::new(probe),
            name: name.into(),
            poll_interval,
        }
    }

    /// Runs until the receiving side is dropped.
    pub async fn run(self, presence: mpsc::Sender<ProcessPresence>) {
        let mut interval = time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last: Option<ProcessPresence> = None;

        loop {
            interval.tick().await;
            if presence.is_closed() {
                debug!("Presence receiver dropped, watcher for '{}' exits", self.name);
                return;
            }
            let current = match self.probe.find(&self.name) {
                Some(pid) => ProcessPresence::Present(pid),
                None => ProcessPresence::Absent,
            };
            if last == Some(current) {
                continue;
            }

            match current {
                ProcessPresence::Present(pid) => info!("Process '{}' found with pid {}", self.name, pid),
                ProcessPresence::Absent => info!("Process '{}' is not running", self.name),
            }
            if presence.send(current).await.is_err() {
                debug!("Presence receiver dropped, watcher for '{}' exits", self.name);
                return;
            }
            last = Some(current);
        }
    }

    pub fn spawn(self, presence: mpsc::Sender<ProcessPresence>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(presence))
    }
}
