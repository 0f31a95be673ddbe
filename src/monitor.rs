pub mod engine_loop;
pub mod orchestrator;
pub mod process_watch;
pub mod sink;
#[cfg(test)]
pub mod tests;

pub use engine_loop::EngineTiming;
pub use orchestrator::{capture_source_from_settings, Monitor};
pub use process_watch::{ProcFsProbe, ProcessPresence, ProcessProbe, ProcessWatcher};
pub use sink::{JsonLinesSink, LogSink, SnapshotSink};
