//! A small subset of the pcap filter language, evaluated in user space by backends that cannot
//! install a kernel filter.
//!
//! Supported primitives, joined with `and` or simply juxtaposed (`udp dst port 53`):
//! `udp`, `tcp`, `ip`, `ip6`, `[src|dst] port N`, `[src|dst] host ADDR`.

use std::net::IpAddr;

use super::packet::{self, ParsedPacket, PROTO_TCP, PROTO_UDP};
use super::types::RawPacket;
use crate::error_handling::types::CaptureError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Src,
    Dst,
    Either,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Primitive {
    Protocol(u8),
    Ipv4,
    Ipv6,
    Port(Side, u16),
    Host(Side, IpAddr),
}

impl Primitive {
    fn matches(&self, packet: &ParsedPacket) -> bool {
        match self {
            Primitive::Protocol(p) => packet.protocol == *p,
            Primitive::Ipv4 => packet.source.is_ipv4(),
            Primitive::Ipv6 => packet.source.is_ipv6(),
            Primitive::Port(side, port) => match packet.ports {
                Some(ports) => match side {
                    Side::Src => ports.source == *port,
                    Side::Dst => ports.destination == *port,
                    Side::Either => ports.source == *port || ports.destination == *port,
                },
                None => false,
            },
            Primitive::Host(side, addr) => match side {
                Side::Src => packet.source == *addr,
                Side::Dst => packet.destination == *addr,
                Side::Either => packet.source == *addr || packet.destination == *addr,
            },
        }
    }
}

/// Compiled filter expression. The empty expression accepts every frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PacketFilter {
    primitives: Vec<Primitive>,
}

impl PacketFilter {
    pub fn parse(expression: &str) -> Result<PacketFilter, CaptureError> {
        let tokens: Vec<String> = expression
            .split_whitespace()
            .map(|t| t.to_ascii_lowercase())
            .collect();
        let mut primitives = Vec::new();
        let mut i = 0;
        let mut expect_term = true;

        let invalid = |reason: String| CaptureError::InvalidFilter(format!("'{}': {}", expression, reason));

        while i < tokens.len() {
            let token = tokens[i].as_str();
            if token == "and" || token == "&&" {
                if expect_term {
                    return Err(invalid(format!("unexpected '{}'", token)));
                }
                expect_term = true;
                i += 1;
                continue;
            }

            let (side, next) = match token {
                "src" => (Some(Side::Src), i + 1),
                "dst" => (Some(Side::Dst), i + 1),
                _ => (None, i),
            };
            let keyword = tokens
                .get(next)
                .map(String::as_str)
                .ok_or_else(|| invalid("dangling direction qualifier".to_string()))?;

            let (primitive, consumed) = match (side, keyword) {
                (None, "udp") => (Primitive::Protocol(PROTO_UDP), 1),
                (None, "tcp") => (Primitive::Protocol(PROTO_TCP), 1),
                (None, "ip") => (Primitive::Ipv4, 1),
                (None, "ip6") => (Primitive::Ipv6, 1),
                (side, "port") => {
                    let value = tokens
                        .get(next + 1)
                        .ok_or_else(|| invalid("missing port number".to_string()))?;
                    let port = value
                        .parse::<u16>()
                        .map_err(|_| invalid(format!("bad port '{}'", value)))?;
                    (Primitive::Port(side.unwrap_or(Side::Either), port), next + 2 - i)
                }
                (side, "host") => {
                    let value = tokens
                        .get(next + 1)
                        .ok_or_else(|| invalid("missing host address".to_string()))?;
                    let addr = value
                        .parse::<IpAddr>()
                        .map_err(|_| invalid(format!("bad host address '{}'", value)))?;
                    (Primitive::Host(side.unwrap_or(Side::Either), addr), next + 2 - i)
                }
                (_, other) => return Err(invalid(format!("unsupported primitive '{}'", other))),
            };

            primitives.push(primitive);
            i += consumed;
            expect_term = false;
        }

        if expect_term && !primitives.is_empty() {
            return Err(invalid("expression ends with 'and'".to_string()));
        }
        Ok(PacketFilter { primitives })
    }

    pub fn is_empty(&self) -> bool {
        self.primitives.is_empty()
    }

    /// Frames that cannot be decoded only pass the empty filter.
    pub fn matches(&self, raw: &RawPacket) -> bool {
        if self.primitives.is_empty() {
            return true;
        }
        match packet::parse(raw) {
            Ok(parsed) => self.primitives.iter().all(|p| p.matches(&parsed)),
            Err(_) => false,
        }
    }
}
