//! Data types shared by the aggregation core and its consumers.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// Identity of a tracked flow.
///
/// The packet-capture path only knows the remote peer, so it uses [`FlowKey::Remote`]. Kernel
/// trace events carry both endpoints and are keyed by [`FlowKey::Endpoints`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FlowKey {
    Remote(IpAddr),
    Endpoints { local: SocketAddr, remote: SocketAddr },
}

impl FlowKey {
    /// Address of the remote peer, used for geolocation.
    pub fn remote_ip(&self) -> IpAddr {
        match self {
            FlowKey::Remote(ip) => *ip,
            FlowKey::Endpoints { remote, .. } => remote.ip(),
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowKey::Remote(ip) => write!(f, "{}", ip),
            FlowKey::Endpoints { local, remote } => write!(f, "{}-{}", local, remote),
        }
    }
}

/// Direction of observed bytes, seen from the monitored host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Sent,
    Received,
}

/// Bytes observed for one flow, split by direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ByteDelta {
    pub sent: u64,
    pub received: u64,
}

impl ByteDelta {
    pub fn new(direction: Direction, bytes: u64) -> Self {
        match direction {
            Direction::Sent => Self::sent(bytes),
            Direction::Received => Self::received(bytes),
        }
    }

    pub fn sent(bytes: u64) -> Self {
        Self { sent: bytes, received: 0 }
    }

    pub fn received(bytes: u64) -> Self {
        Self { sent: 0, received: bytes }
    }

    pub fn total(&self) -> u64 {
        self.sent.saturating_add(self.received)
    }

    pub fn accumulate(&mut self, other: ByteDelta) {
        self.sent = self.sent.saturating_add(other.sent);
        self.received = self.received.saturating_add(other.received);
    }
}

/// One translated observation handed from a capture source to the aggregation core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowUpdate {
    pub key: FlowKey,
    pub delta: ByteDelta,
}

/// Persistent statistics of a tracked flow.
///
/// Both byte totals only ever grow while the entry is alive, and `last_activity` never moves
/// backwards.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowStats {
    pub key: FlowKey,
    pub total_bytes_sent: u64,
    pub total_bytes_received: u64,
    pub last_activity: DateTime<Local>,
}

impl FlowStats {
    pub fn new(key: FlowKey, now: DateTime<Local>) -> Self {
        Self {
            key,
            total_bytes_sent: 0,
            total_bytes_received: 0,
            last_activity: now,
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes_sent.saturating_add(self.total_bytes_received)
    }

    pub(crate) fn absorb(&mut self, delta: ByteDelta, now: DateTime<Local>) {
        self.total_bytes_sent = self.total_bytes_sent.saturating_add(delta.sent);
        self.total_bytes_received = self.total_bytes_received.saturating_add(delta.received);
        if now > self.last_activity {
            self.last_activity = now;
        }
    }
}

/// Geolocation fields attached to a view entry when it is first created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoInfo {
    pub country: String,
    pub country_iso: String,
    pub city: String,
    pub asn: String,
}

/// Presentation-facing projection of a flow whose total crossed the minimum-bytes threshold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowView {
    pub key: FlowKey,
    pub remote_identifier: String,
    pub formatted_traffic: String,
    pub last_activity_display: String,
    #[serde(flatten)]
    pub geo: GeoInfo,
    pub total_bytes: u64,
    pub last_activity: DateTime<Local>,
    /// Set by the `hide` eviction policy instead of removing the entry.
    pub hidden: bool,
}

/// Ordered view entries emitted on each refresh cycle, most recent activity first.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub taken_at: DateTime<Local>,
    pub flows: Vec<FlowView>,
}
