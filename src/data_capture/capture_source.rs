//! # Capture Sources
//!
//! A [`CaptureSource`] owns one [`CaptureBackend`] and the [`FlowTranslator`] matching its
//! observation type. Every raw observation is translated on the backend's delivery thread and
//! handed to the engine loop through a bounded channel:
//!
//! ```text
//! ┌──────────────┐ callback ┌───────────────┐ try_send ┌────────────────┐
//! │ CaptureBackend│────────▶│ FlowTranslator │─────────▶│ mpsc<FlowUpdate>│──▶ engine loop
//! └──────────────┘          └───────────────┘          └────────────────┘
//! ```
//!
//! The handoff never blocks the producer. When the channel is full or closed the update is
//! dropped and counted.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::mpsc;

use super::backend::{Callback, CaptureBackend, OpenOptions};
use super::translator::{
    DiscardReason, FlowTranslator, PacketTranslator, TraceTranslator, Translation,
};
use super::types::{CaptureVariant, RawPacket, TraceEvent};
use crate::error_handling::types::CaptureError;
use crate::flow_tracking::types::FlowUpdate;

/// Diagnostic counters updated from the delivery thread.
#[derive(Debug, Default)]
pub struct CaptureCounters {
    observed: AtomicU64,
    accepted: AtomicU64,
    discarded: AtomicU64,
    malformed: AtomicU64,
    dropped: AtomicU64,
}

impl CaptureCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> CaptureStats {
        CaptureStats {
            observed: self.observed.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CaptureStats {
    pub observed: u64,
    pub accepted: u64,
    pub discarded: u64,
    pub malformed: u64,
    /// Updates lost because the engine channel was full or closed.
    pub dropped: u64,
}

impl fmt::Display for CaptureStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "observed={} accepted={} discarded={} malformed={} dropped={}",
            self.observed, self.accepted, self.discarded, self.malformed, self.dropped
        )
    }
}

/// Producer end of the channel between a capture source and the engine loop.
#[derive(Debug, Clone)]
pub struct ObservationHandoff {
    sender: mpsc::Sender<FlowUpdate>,
    counters: Arc<CaptureCounters>,
}

impl ObservationHandoff {
    pub fn new(sender: mpsc::Sender<FlowUpdate>, counters: Arc<CaptureCounters>) -> Self {
        Self { sender, counters }
    }

    pub fn counters(&self) -> &Arc<CaptureCounters> {
        &self.counters
    }

    fn handle(&self, translation: Translation) {
        self.counters.observed.fetch_add(1, Ordering::Relaxed);
        match translation {
            Translation::Flow(update) => match self.sender.try_send(update) {
                Ok(()) => {
                    self.counters.accepted.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => {
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                }
            },
            Translation::Discard(DiscardReason::Malformed) => {
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
            }
            Translation::Discard(_) => {
                self.counters.discarded.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Asynchronous producer of flow updates, selected at configuration time.
pub trait CaptureSource: Send {
    fn name(&self) -> String;

    fn variant(&self) -> CaptureVariant;

    /// Starts delivery into `handoff`, returning once delivery runs or failed. A failed start
    /// leaves nothing open.
    fn start(&mut self, handoff: ObservationHandoff) -> Result<(), CaptureError>;

    /// Best-effort teardown. Runs every release step, logs each failure and returns the first.
    /// Calling it on a stopped source is a no-op.
    fn stop(&mut self) -> Result<(), CaptureError>;

    fn is_running(&self) -> bool;
}

/// [`CaptureSource`] driving a [`CaptureBackend`] through its full lifecycle.
pub struct BackendCaptureSource<B, T> {
    backend: B,
    translator: Arc<T>,
    variant: CaptureVariant,
    options: OpenOptions,
    filter: Option<String>,
    opened: bool,
    registered: bool,
    started: bool,
}

pub type PacketCaptureSource<B> = BackendCaptureSource<B, PacketTranslator>;
pub type KernelTraceSource<B> = BackendCaptureSource<B, TraceTranslator>;

impl<B> BackendCaptureSource<B, PacketTranslator>
where
    B: CaptureBackend<Observation = RawPacket>,
{
    /// Packet-capture variant. `filter` is installed on the device before delivery starts.
    pub fn packet_capture(backend: B, filter: impl Into<String>, options: OpenOptions) -> Self {
        Self::with_translator(
            backend,
            PacketTranslator,
            CaptureVariant::PacketCapture,
            Some(filter.into()),
            options,
        )
    }
}

impl<B> BackendCaptureSource<B, TraceTranslator>
where
    B: CaptureBackend<Observation = TraceEvent>,
{
    /// Kernel-trace variant. The provider is not pre-filtered, the translator checks the port.
    pub fn kernel_trace(backend: B, translator: TraceTranslator, options: OpenOptions) -> Self {
        Self::with_translator(backend, translator, CaptureVariant::KernelTrace, None, options)
    }
}

impl<B, T> BackendCaptureSource<B, T>
where
    B: CaptureBackend,
    T: FlowTranslator<Observation = B::Observation>,
{
    pub fn with_translator(
        backend: B,
        translator: T,
        variant: CaptureVariant,
        filter: Option<String>,
        options: OpenOptions,
    ) -> Self {
        Self {
            backend,
            translator: Arc::new(translator),
            variant,
            options,
            filter,
            opened: false,
            registered: false,
            started: false,
        }
    }

    fn bring_up(&mut self, handoff: ObservationHandoff) -> Result<(), CaptureError> {
        self.backend.open(&self.options)?;
        self.opened = true;

        if let Some(filter) = self.filter.as_deref() {
            self.backend.set_filter(filter)?;
            debug!("Installed capture filter '{}' on {}", filter, self.backend.describe());
        }

        let translator = Arc::clone(&self.translator);
        let callback: Callback<B::Observation> = Arc::new(move |observation: B::Observation| {
            handoff.handle(translator.translate(&observation));
        });
        self.backend.register_callback(callback)?;
        self.registered = true;

        self.backend.start()?;
        self.started = true;
        Ok(())
    }

    fn tear_down(&mut self) -> Result<(), CaptureError> {
        let name = self.backend.describe();
        let mut first_error = None;

        if self.registered {
            self.registered = false;
            if let Err(e) = self.backend.unregister_callback() {
                warn!("Failed to unregister capture callback on {}: {}", name, e);
                first_error.get_or_insert(e);
            }
        }
        if self.started {
            self.started = false;
            if let Err(e) = self.backend.stop() {
                warn!("Failed to stop capture on {}: {}", name, e);
                first_error.get_or_insert(e);
            }
        }
        if self.opened {
            self.opened = false;
            if let Err(e) = self.backend.close() {
                warn!("Failed to close {}: {}", name, e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl<B, T> CaptureSource for BackendCaptureSource<B, T>
where
    B: CaptureBackend,
    T: FlowTranslator<Observation = B::Observation>,
{
    fn name(&self) -> String {
        self.backend.describe()
    }

    fn variant(&self) -> CaptureVariant {
        self.variant
    }

    fn start(&mut self, handoff: ObservationHandoff) -> Result<(), CaptureError> {
        if self.is_running() {
            return Err(CaptureError::AlreadyRunning);
        }
        self.backend.check_privileges()?;

        if let Err(e) = self.bring_up(handoff) {
            let _ = self.tear_down();
            return Err(e);
        }
        info!("Capture started on {} ({})", self.backend.describe(), self.variant);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), CaptureError> {
        if !(self.opened || self.registered || self.started) {
            return Ok(());
        }
        let result = self.tear_down();
        info!("Capture stopped on {}", self.backend.describe());
        result
    }

    fn is_running(&self) -> bool {
        self.started
    }
}

/// Scriptable in-memory backend shared by the capture and monitor tests.
#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use crate::data_capture::backend::CallbackSlot;
    use std::sync::Mutex;

    pub(crate) struct MockHandle<T> {
        pub calls: Arc<Mutex<Vec<&'static str>>>,
        pub slot: CallbackSlot<T>,
    }

    impl<T> Clone for MockHandle<T> {
        fn clone(&self) -> Self {
            Self {
                calls: Arc::clone(&self.calls),
                slot: self.slot.clone(),
            }
        }
    }

    impl<T> MockHandle<T> {
        pub fn emit(&self, observation: T) -> bool {
            self.slot.invoke(observation)
        }

        pub fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }
    }

    pub(crate) struct MockBackend<T> {
        handle: MockHandle<T>,
        pub fail_on: Option<&'static str>,
        pub deny_privileges: bool,
    }

    impl<T: Send + 'static> MockBackend<T> {
        pub fn new() -> (Self, MockHandle<T>) {
            let handle = MockHandle {
                calls: Arc::new(Mutex::new(Vec::new())),
                slot: CallbackSlot::new(),
            };
            let backend = Self {
                handle: handle.clone(),
                fail_on: None,
                deny_privileges: false,
            };
            (backend, handle)
        }

        fn step(&self, name: &'static str) -> Result<(), CaptureError> {
            self.handle.calls.lock().unwrap().push(name);
            if self.fail_on == Some(name) {
                return Err(CaptureError::DeviceError(format!("{} failed", name)));
            }
            Ok(())
        }
    }

    impl<T: Send + 'static> CaptureBackend for MockBackend<T> {
        type Observation = T;

        fn describe(&self) -> String {
            "mock0".to_string()
        }

        fn check_privileges(&self) -> Result<(), CaptureError> {
            if self.deny_privileges {
                return Err(CaptureError::PermissionError("not root".to_string()));
            }
            Ok(())
        }

        fn open(&mut self, _options: &OpenOptions) -> Result<(), CaptureError> {
            self.step("open")
        }

        fn set_filter(&mut self, _expression: &str) -> Result<(), CaptureError> {
            self.step("set_filter")
        }

        fn register_callback(&mut self, callback: Callback<T>) -> Result<(), CaptureError> {
            self.step("register")?;
            self.handle.slot.set(callback);
            Ok(())
        }

        fn unregister_callback(&mut self) -> Result<(), CaptureError> {
            self.handle.slot.clear();
            self.step("unregister")
        }

        fn start(&mut self) -> Result<(), CaptureError> {
            self.step("start")
        }

        fn stop(&mut self) -> Result<(), CaptureError> {
            self.step("stop")
        }

        fn close(&mut self) -> Result<(), CaptureError> {
            self.step("close")
        }
    }
}
