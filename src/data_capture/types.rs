//! Common data types used across the data_capture subsystem.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// Link-layer header type of a captured frame, using the libpcap `LINKTYPE_*` numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkType(pub u32);

impl LinkType {
    pub const NULL: LinkType = LinkType(0);
    pub const ETHERNET: LinkType = LinkType(1);
    /// `DLT_RAW` as exposed by most live capture APIs.
    pub const RAW_DLT: LinkType = LinkType(12);
    /// `DLT_RAW` on OpenBSD.
    pub const RAW_OPENBSD: LinkType = LinkType(14);
    pub const RAW: LinkType = LinkType(101);
    pub const LINUX_SLL: LinkType = LinkType(113);
    pub const IPV4: LinkType = LinkType(228);
    pub const IPV6: LinkType = LinkType(229);
}

/// One frame delivered by the packet-capture variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPacket {
    pub link_type: LinkType,
    pub data: Vec<u8>,
    /// Length of the frame on the wire, which may exceed `data.len()` when the snapshot length
    /// truncated it.
    pub original_len: u32,
}

impl RawPacket {
    pub fn new(link_type: LinkType, data: Vec<u8>) -> Self {
        let original_len = u32::try_from(data.len()).unwrap_or(u32::MAX);
        Self {
            link_type,
            data,
            original_len,
        }
    }
}

/// Kind of kernel UDP event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceEventKind {
    Send,
    Recv,
}

/// One UDP send/receive event delivered by the kernel-trace variant.
///
/// Endpoints are always expressed from the local host's point of view, whatever the event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub kind: TraceEventKind,
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub size: u32,
    pub pid: u32,
}

/// Which of the two capture variants a source implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureVariant {
    PacketCapture,
    KernelTrace,
}

impl std::fmt::Display for CaptureVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureVariant::PacketCapture => write!(f, "packet-capture"),
            CaptureVariant::KernelTrace => write!(f, "kernel-trace"),
        }
    }
}
