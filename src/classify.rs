//! IPv4/TCP packet classification.
//!
//! Validates the IPv4 header of a raw packet and pulls out addressing
//! detail without copying and without byte-order conversion: addresses
//! and ports are reported exactly as they sit on the wire. Consumers
//! that want host-order values go through the accessor methods.
//!
//! All offsets are bounds-checked before use; `classify` never reads
//! past the end of the buffer it is given.

use std::net::Ipv4Addr;

/// Minimum IPv4 header size in bytes (header-length field of 5).
pub const MIN_IPV4_HEADER: usize = 20;

/// Minimum TCP header size in bytes (data-offset field of 5).
pub const MIN_TCP_HEADER: usize = 20;

/// IP protocol number for TCP.
pub const PROTO_TCP: u8 = 6;

/// Addressing detail of a structurally valid IPv4 packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketInfo {
    /// Declared IPv4 header length in bytes (header-length field x 4).
    pub ip_header_len: usize,
    /// Source address, network byte order.
    pub src_addr: u32,
    /// Destination address, network byte order.
    pub dst_addr: u32,
    /// TCP detail, present only when a complete TCP header follows the
    /// IP header.
    pub tcp: Option<TcpInfo>,
}

/// TCP header detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpInfo {
    /// Declared TCP header length in bytes (data-offset field x 4).
    ///
    /// Reported as declared; not checked against the bytes actually
    /// present after the fixed header.
    pub header_len: usize,
    /// Source port, network byte order.
    pub src_port: u16,
    /// Destination port, network byte order.
    pub dst_port: u16,
}

impl PacketInfo {
    /// Whether a complete TCP header was present.
    pub fn is_tcp(&self) -> bool {
        self.tcp.is_some()
    }

    /// Source address for display.
    pub fn src_ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.src_addr.to_ne_bytes())
    }

    /// Destination address for display.
    pub fn dst_ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.dst_addr.to_ne_bytes())
    }
}

impl TcpInfo {
    /// Source port in host order.
    pub fn src_port_host(&self) -> u16 {
        u16::from_be(self.src_port)
    }

    /// Destination port in host order.
    pub fn dst_port_host(&self) -> u16 {
        u16::from_be(self.dst_port)
    }
}

/// Classify a raw IP packet.
///
/// Returns `None` for anything that is not a structurally valid IPv4
/// packet: shorter than a minimal header, wrong version nibble, or
/// shorter than its own declared header length. A valid IPv4 packet
/// that is not TCP, or whose TCP header is cut short, still classifies
/// with `tcp` unset.
pub fn classify(packet: &[u8]) -> Option<PacketInfo> {
    if packet.len() < MIN_IPV4_HEADER {
        return None;
    }

    if packet[0] >> 4 != 4 {
        return None;
    }

    let ip_header_len = ((packet[0] & 0x0F) as usize) * 4;
    if packet.len() < ip_header_len {
        return None;
    }

    let src_addr = u32::from_ne_bytes([packet[12], packet[13], packet[14], packet[15]]);
    let dst_addr = u32::from_ne_bytes([packet[16], packet[17], packet[18], packet[19]]);

    let tcp = if packet[9] == PROTO_TCP && packet.len() >= ip_header_len + MIN_TCP_HEADER {
        let tcp_hdr = &packet[ip_header_len..];
        Some(TcpInfo {
            header_len: ((tcp_hdr[12] >> 4) as usize) * 4,
            src_port: u16::from_ne_bytes([tcp_hdr[0], tcp_hdr[1]]),
            dst_port: u16::from_ne_bytes([tcp_hdr[2], tcp_hdr[3]]),
        })
    } else {
        None
    };

    Some(PacketInfo {
        ip_header_len,
        src_addr,
        dst_addr,
        tcp,
    })
}
