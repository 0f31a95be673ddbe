pub mod backend;
pub mod capture_source;
pub mod packet;
pub mod packet_filter;
pub mod pcap_file;
pub mod trace_feed;
pub mod translator;
pub mod types;

pub use backend::{Callback, CallbackSlot, CaptureBackend, OpenOptions};
pub use capture_source::{
    BackendCaptureSource, CaptureCounters, CaptureSource, CaptureStats, KernelTraceSource,
    ObservationHandoff, PacketCaptureSource,
};
pub use packet_filter::PacketFilter;
pub use pcap_file::PcapFileBackend;
pub use trace_feed::TraceFeedBackend;
pub use translator::{DiscardReason, FlowTranslator, PacketTranslator, TraceTranslator, Translation};
pub use types::{CaptureVariant, LinkType, RawPacket, TraceEvent, TraceEventKind};
