//! Flow aggregation core.
//!
//! Turns a stream of `(FlowKey, ByteDelta)` observations into thresholded, evictable per-peer
//! statistics.
//!
//! Re-exports:
//! - [`ConnectionManager`]: pending buffer, persistent statistics and view projection.
//! - [`format_bytes`]: human-scaled byte counts used by the view.
//! - Core types from [`types`].

pub mod byte_formatter;
pub mod connection_manager;
pub mod types;

pub use byte_formatter::format_bytes;
pub use connection_manager::{ConnectionManager, MergeReport};
pub use types::{ByteDelta, Direction, FlowKey, FlowStats, FlowUpdate, FlowView, GeoInfo, Snapshot};
