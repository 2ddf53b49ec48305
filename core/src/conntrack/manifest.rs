//! Parsed packet manifests.
//!
//! A `PacketManifest` is the monitor's sole input: the capture side
//! parses each frame and hands over an owned manifest on the input
//! channel. Manifests never alias capture-side buffers, so the
//! reassembly path can retain payload bytes freely.

use std::net::Ipv4Addr;
use std::time::SystemTime;

use crate::conntrack::flow::TcpFlow;

// TCP flags.
pub const CWR: u8 = 0b1000_0000;
pub const ECE: u8 = 0b0100_0000;
pub const URG: u8 = 0b0010_0000;
pub const ACK: u8 = 0b0001_0000;
pub const PSH: u8 = 0b0000_1000;
pub const RST: u8 = 0b0000_0100;
pub const SYN: u8 = 0b0000_0010;
pub const FIN: u8 = 0b0000_0001;

/// Fixed TCP header fields the shadow engine consumes.
#[derive(Debug, Clone, Copy)]
pub struct TcpHeader {
    /// Raw sequence number.
    pub seq_no: u32,
    /// Raw acknowledgment number.
    pub ack_no: u32,
    /// The 8-bit TCP flags.
    pub flags: u8,
    /// Receive window in window size units.
    pub window: u16,
}

impl TcpHeader {
    #[inline]
    pub fn syn(&self) -> bool {
        self.flags & SYN != 0
    }

    #[inline]
    pub fn ack(&self) -> bool {
        self.flags & ACK != 0
    }

    #[inline]
    pub fn fin(&self) -> bool {
        self.flags & FIN != 0
    }

    #[inline]
    pub fn rst(&self) -> bool {
        self.flags & RST != 0
    }
}

/// Parsed IPv4 header summary.
#[derive(Debug, Clone, Copy)]
pub struct Ipv4Header {
    pub src_addr: Ipv4Addr,
    pub dst_addr: Ipv4Addr,
    pub ttl: u8,
}

/// A parsed packet delivered on the monitor's input channel.
#[derive(Debug, Clone)]
pub struct PacketManifest {
    /// Capture timestamp.
    pub timestamp: SystemTime,
    /// Directional flow of this packet.
    pub flow: TcpFlow,
    /// The raw frame, for the packet log sink.
    pub raw: Vec<u8>,
    pub ip: Ipv4Header,
    pub tcp: TcpHeader,
    /// TCP payload bytes.
    pub payload: Vec<u8>,
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::net::SocketAddrV4;

    /// The client-to-server flow used throughout the scenario tests.
    pub(crate) fn client_flow() -> TcpFlow {
        TcpFlow::new(
            SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, 4), 1),
            SocketAddrV4::new(Ipv4Addr::new(2, 3, 4, 5), 2),
        )
    }

    pub(crate) fn manifest(
        flow: TcpFlow,
        seq_no: u32,
        ack_no: u32,
        flags: u8,
        payload: &[u8],
    ) -> PacketManifest {
        PacketManifest {
            timestamp: SystemTime::now(),
            flow,
            raw: payload.to_vec(),
            ip: Ipv4Header {
                src_addr: *flow.src.ip(),
                dst_addr: *flow.dst.ip(),
                ttl: 64,
            },
            tcp: TcpHeader {
                seq_no,
                ack_no,
                flags,
                window: 65535,
            },
            payload: payload.to_vec(),
        }
    }
}
