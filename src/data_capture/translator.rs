//! Mapping of raw observations to `(FlowKey, ByteDelta)` pairs.
//!
//! Translators hold only immutable settings and are called from the capture thread for every
//! observation. A frame that cannot be decoded becomes [`DiscardReason::Malformed`]; nothing is
//! ever propagated back into the capture loop.

use super::packet;
use super::types::{RawPacket, TraceEvent, TraceEventKind};
use crate::error_handling::types::PacketError;
use crate::flow_tracking::types::{ByteDelta, Direction, FlowKey, FlowUpdate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    Loopback,
    NotIp,
    NotUdp,
    /// Non-first IPv4 fragment, which carries no UDP header.
    Fragment,
    PortMismatch,
    ForeignProcess,
    Malformed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Translation {
    Flow(FlowUpdate),
    Discard(DiscardReason),
}

pub trait FlowTranslator: Send + Sync + 'static {
    type Observation: Send + 'static;

    fn translate(&self, observation: &Self::Observation) -> Translation;
}

/// Translator of the packet-capture variant.
///
/// The device filter already selected inbound datagrams for the monitored port, so the source
/// address is the remote peer and the UDP payload counts as received bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct PacketTranslator;

impl FlowTranslator for PacketTranslator {
    type Observation = RawPacket;

    fn translate(&self, observation: &RawPacket) -> Translation {
        let parsed = match packet::parse(observation) {
            Ok(parsed) => parsed,
            Err(PacketError::NotIp) => return Translation::Discard(DiscardReason::NotIp),
            Err(_) => return Translation::Discard(DiscardReason::Malformed),
        };

        if !parsed.is_udp() {
            return Translation::Discard(DiscardReason::NotUdp);
        }
        if parsed.ports.is_none() {
            return Translation::Discard(DiscardReason::Fragment);
        }
        if parsed.source.to_canonical().is_loopback() {
            return Translation::Discard(DiscardReason::Loopback);
        }

        Translation::Flow(FlowUpdate {
            key: FlowKey::Remote(parsed.source),
            delta: ByteDelta::received(parsed.payload_len as u64),
        })
    }
}

/// Translator of the kernel-trace variant.
///
/// Trace providers are not pre-filtered, so the monitored local port (and optionally the
/// monitored process) is checked here.
#[derive(Debug, Clone, Copy)]
pub struct TraceTranslator {
    pub monitored_port: u16,
    pub process_id: Option<u32>,
}

impl TraceTranslator {
    pub fn new(monitored_port: u16, process_id: Option<u32>) -> Self {
        Self {
            monitored_port,
            process_id,
        }
    }
}

impl FlowTranslator for TraceTranslator {
    type Observation = TraceEvent;

    fn translate(&self, event: &TraceEvent) -> Translation {
        if event.local.port() != self.monitored_port {
            return Translation::Discard(DiscardReason::PortMismatch);
        }
        if matches!(self.process_id, Some(pid) if pid != event.pid) {
            return Translation::Discard(DiscardReason::ForeignProcess);
        }

        let remote = event.remote.ip().to_canonical();
        if remote.is_loopback() {
            return Translation::Discard(DiscardReason::Loopback);
        }
        if remote.is_unspecified() || event.remote.port() == 0 {
            return Translation::Discard(DiscardReason::Malformed);
        }

        let direction = match event.kind {
            TraceEventKind::Send => Direction::Sent,
            TraceEventKind::Recv => Direction::Received,
        };
        Translation::Flow(FlowUpdate {
            key: FlowKey::Endpoints {
                local: event.local,
                remote: event.remote,
            },
            delta: ByteDelta::new(direction, u64::from(event.size)),
        })
    }
}
