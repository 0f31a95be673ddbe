//! Header decoding for captured frames: link layer, IPv4/IPv6, then UDP or TCP ports.
//!
//! Only the fields needed to key a flow are read. IPv6 extension headers are not walked, so a
//! datagram behind one is reported with the extension's next-header value as its protocol.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use super::types::{LinkType, RawPacket};
use crate::error_handling::types::PacketError;

pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86DD;
const ETHERTYPE_VLAN: u16 = 0x8100;
const ETHERTYPE_QINQ: u16 = 0x88A8;

// address families seen in BSD null/loopback headers
const AF_INET: u32 = 2;
const AF_INET6: [u32; 4] = [10, 24, 28, 30];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ports {
    pub source: u16,
    pub destination: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedPacket {
    pub source: IpAddr,
    pub destination: IpAddr,
    pub protocol: u8,
    /// `None` for non-first IPv4 fragments and protocols without ports.
    pub ports: Option<Ports>,
    /// Transport payload length when ports are known, IP payload length otherwise.
    pub payload_len: usize,
}

impl ParsedPacket {
    pub fn is_udp(&self) -> bool {
        self.protocol == PROTO_UDP
    }
}

enum Network {
    V4,
    V6,
}

fn read_u16(data: &[u8], offset: usize) -> Result<u16, PacketError> {
    data.get(offset..offset + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or(PacketError::Truncated)
}

fn read_u32_ne(data: &[u8], offset: usize) -> Result<(u32, u32), PacketError> {
    data.get(offset..offset + 4)
        .map(|b| {
            let bytes = [b[0], b[1], b[2], b[3]];
            (u32::from_le_bytes(bytes), u32::from_be_bytes(bytes))
        })
        .ok_or(PacketError::Truncated)
}

fn ethertype_network(ethertype: u16) -> Result<Network, PacketError> {
    match ethertype {
        ETHERTYPE_IPV4 => Ok(Network::V4),
        ETHERTYPE_IPV6 => Ok(Network::V6),
        _ => Err(PacketError::NotIp),
    }
}

fn version_network(data: &[u8], offset: usize) -> Result<Network, PacketError> {
    match data.get(offset).map(|b| b >> 4) {
        Some(4) => Ok(Network::V4),
        Some(6) => Ok(Network::V6),
        Some(_) => Err(PacketError::NotIp),
        None => Err(PacketError::Truncated),
    }
}

/// Locates the network header, returning its kind and offset.
fn link_layer(link_type: LinkType, data: &[u8]) -> Result<(Network, usize), PacketError> {
    match link_type {
        LinkType::ETHERNET => {
            let mut offset = 12;
            let mut ethertype = read_u16(data, offset)?;
            while ethertype == ETHERTYPE_VLAN || ethertype == ETHERTYPE_QINQ {
                offset += 4;
                ethertype = read_u16(data, offset)?;
            }
            Ok((ethertype_network(ethertype)?, offset + 2))
        }
        LinkType::LINUX_SLL => Ok((ethertype_network(read_u16(data, 14)?)?, 16)),
        LinkType::NULL => {
            let (le, be) = read_u32_ne(data, 0)?;
            if le == AF_INET || be == AF_INET {
                Ok((Network::V4, 4))
            } else if AF_INET6.contains(&le) || AF_INET6.contains(&be) {
                Ok((Network::V6, 4))
            } else {
                Err(PacketError::NotIp)
            }
        }
        LinkType::RAW | LinkType::RAW_DLT | LinkType::RAW_OPENBSD => {
            Ok((version_network(data, 0)?, 0))
        }
        LinkType::IPV4 => Ok((Network::V4, 0)),
        LinkType::IPV6 => Ok((Network::V6, 0)),
        LinkType(other) => Err(PacketError::UnsupportedLinkType(other)),
    }
}

fn transport(
    protocol: u8,
    segment: &[u8],
) -> Result<(Option<Ports>, usize), PacketError> {
    match protocol {
        PROTO_UDP => {
            if segment.len() < 8 {
                return Err(PacketError::Truncated);
            }
            let ports = Ports {
                source: read_u16(segment, 0)?,
                destination: read_u16(segment, 2)?,
            };
            let length = usize::from(read_u16(segment, 4)?);
            if length < 8 {
                return Err(PacketError::BadHeader("UDP length shorter than its header"));
            }
            Ok((Some(ports), (length - 8).min(segment.len() - 8)))
        }
        PROTO_TCP => {
            let ports = Ports {
                source: read_u16(segment, 0)?,
                destination: read_u16(segment, 2)?,
            };
            let data_offset = segment
                .get(12)
                .map(|b| usize::from(b >> 4) * 4)
                .ok_or(PacketError::Truncated)?;
            if data_offset < 20 {
                return Err(PacketError::BadHeader("TCP data offset below minimum"));
            }
            Ok((Some(ports), segment.len().saturating_sub(data_offset)))
        }
        _ => Ok((None, segment.len())),
    }
}

fn parse_ipv4(data: &[u8]) -> Result<ParsedPacket, PacketError> {
    let header = data.get(..20).ok_or(PacketError::Truncated)?;
    if header[0] >> 4 != 4 {
        return Err(PacketError::BadHeader("IPv4 version mismatch"));
    }
    let header_len = usize::from(header[0] & 0x0F) * 4;
    if header_len < 20 {
        return Err(PacketError::BadHeader("IPv4 header length below minimum"));
    }
    let total_len = usize::from(read_u16(header, 2)?);
    if total_len < header_len {
        return Err(PacketError::BadHeader("IPv4 total length below header length"));
    }
    let protocol = header[9];
    let source = IpAddr::V4(Ipv4Addr::new(header[12], header[13], header[14], header[15]));
    let destination = IpAddr::V4(Ipv4Addr::new(header[16], header[17], header[18], header[19]));

    // Snapshot truncation may leave fewer bytes than `total_len`.
    let end = total_len.min(data.len());
    let payload = data.get(header_len..end).ok_or(PacketError::Truncated)?;

    let fragment_offset = read_u16(header, 6)? & 0x1FFF;
    let (ports, payload_len) = if fragment_offset != 0 {
        (None, payload.len())
    } else {
        transport(protocol, payload)?
    };

    Ok(ParsedPacket {
        source,
        destination,
        protocol,
        ports,
        payload_len,
    })
}

fn parse_ipv6(data: &[u8]) -> Result<ParsedPacket, PacketError> {
    let header = data.get(..40).ok_or(PacketError::Truncated)?;
    if header[0] >> 4 != 6 {
        return Err(PacketError::BadHeader("IPv6 version mismatch"));
    }
    let payload_len = usize::from(read_u16(header, 4)?);
    let protocol = header[6];

    let mut src = [0u8; 16];
    src.copy_from_slice(&header[8..24]);
    let mut dst = [0u8; 16];
    dst.copy_from_slice(&header[24..40]);

    let end = (40 + payload_len).min(data.len());
    let payload = &data[40..end];
    let (ports, payload_len) = transport(protocol, payload)?;

    Ok(ParsedPacket {
        source: IpAddr::V6(Ipv6Addr::from(src)),
        destination: IpAddr::V6(Ipv6Addr::from(dst)),
        protocol,
        ports,
        payload_len,
    })
}

/// Decodes the network and transport headers of a captured frame.
pub fn parse(packet: &RawPacket) -> Result<ParsedPacket, PacketError> {
    let (network, offset) = link_layer(packet.link_type, &packet.data)?;
    let ip = packet.data.get(offset..).ok_or(PacketError::Truncated)?;
    match network {
        Network::V4 => parse_ipv4(ip),
        Network::V6 => parse_ipv6(ip),
    }
}
