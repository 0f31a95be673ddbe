//! Contract of the OS-level capture collaborator.
//!
//! A backend is either a packet-capture device or a kernel trace session. It delivers raw
//! observations to a single registered callback from a thread it owns. Concrete backends in this
//! crate are [`PcapFileBackend`](super::pcap_file::PcapFileBackend) and
//! [`TraceFeedBackend`](super::trace_feed::TraceFeedBackend); live backends plug in by
//! implementing [`CaptureBackend`].

use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::error_handling::types::CaptureError;

/// Callback invoked once per raw observation, on the backend's delivery thread.
pub type Callback<T> = Arc<dyn Fn(T) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenOptions {
    pub promiscuous: bool,
    pub read_timeout: Duration,
    /// Name of the trace session, ignored by packet-capture devices.
    pub session_name: String,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            promiscuous: true,
            read_timeout: Duration::from_millis(1000),
            session_name: String::from("UdpMonitorSession"),
        }
    }
}

/// Lifecycle: `check_privileges` → `open` → `set_filter` → `register_callback` → `start`, then
/// `unregister_callback` → `stop` → `close`.
///
/// Implementations must guarantee that no callback runs once `unregister_callback` returned, and
/// in any case strictly before `close` returns.
pub trait CaptureBackend: Send + 'static {
    type Observation: Send + 'static;

    /// Human readable name of the device or session, for logs.
    fn describe(&self) -> String;

    /// Fails with `PermissionError` when the process may not capture at all.
    fn check_privileges(&self) -> Result<(), CaptureError>;

    fn open(&mut self, options: &OpenOptions) -> Result<(), CaptureError>;

    fn set_filter(&mut self, expression: &str) -> Result<(), CaptureError>;

    fn register_callback(&mut self, callback: Callback<Self::Observation>) -> Result<(), CaptureError>;

    fn unregister_callback(&mut self) -> Result<(), CaptureError>;

    /// Begins delivery and returns once the delivery thread is confirmed running.
    fn start(&mut self) -> Result<(), CaptureError>;

    fn stop(&mut self) -> Result<(), CaptureError>;

    fn close(&mut self) -> Result<(), CaptureError>;
}

/// Callback holder shared between a backend and its delivery thread.
///
/// Invocation holds the read side for the duration of the call, so [`CallbackSlot::clear`] blocks
/// until every in-flight invocation has returned.
pub struct CallbackSlot<T> {
    inner: Arc<RwLock<Option<Callback<T>>>>,
}

impl<T> Clone for CallbackSlot<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for CallbackSlot<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(RwLock::new(None)),
        }
    }
}

impl<T> CallbackSlot<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, callback: Callback<T>) {
        let mut slot = self.inner.write().unwrap_or_else(|e| e.into_inner());
        *slot = Some(callback);
    }

    pub fn clear(&self) {
        let mut slot = self.inner.write().unwrap_or_else(|e| e.into_inner());
        *slot = None;
    }

    pub fn is_set(&self) -> bool {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// Returns false when no callback is registered and the observation was dropped.
    pub fn invoke(&self, observation: T) -> bool {
        let slot = self.inner.read().unwrap_or_else(|e| e.into_inner());
        match slot.as_ref() {
            Some(callback) => {
                callback(observation);
                true
            }
            None => false,
        }
    }
}
