//! Bidirectional flow identifiers.
//!
//! Provides a directional view of a TCP conversation and the
//! direction-agnostic key used by the connection pool.

use std::cmp;
use std::fmt;
use std::net::SocketAddrV4;

use serde::Serialize;

/// One direction of a TCP conversation.
///
/// Which endpoint is the client is decided by the connection state
/// machine (the sender of the first SYN without ACK, or failing that the
/// first-seen source), not by the flow itself.
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, Serialize)]
pub struct TcpFlow {
    /// The sending endpoint.
    pub src: SocketAddrV4,
    /// The receiving endpoint.
    pub dst: SocketAddrV4,
}

impl TcpFlow {
    pub fn new(src: SocketAddrV4, dst: SocketAddrV4) -> Self {
        TcpFlow { src, dst }
    }

    /// Returns the opposite direction of the conversation.
    pub fn reverse(&self) -> TcpFlow {
        TcpFlow {
            src: self.dst,
            dst: self.src,
        }
    }

    /// Converts to the direction-agnostic pool key.
    pub fn key(&self) -> FlowId {
        FlowId::new(self.src, self.dst)
    }
}

impl fmt::Display for TcpFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.src, self.dst)
    }
}

/// A direction-agnostic conversation identifier.
///
/// Two packets of the same conversation map to the same `FlowId`
/// regardless of which endpoint sent them.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct FlowId(SocketAddrV4, SocketAddrV4);

impl FlowId {
    fn new(a: SocketAddrV4, b: SocketAddrV4) -> Self {
        FlowId(cmp::max(a, b), cmp::min(a, b))
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <> {}", self.0, self.1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::net::Ipv4Addr;

    fn flow() -> TcpFlow {
        TcpFlow::new(
            SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, 4), 1),
            SocketAddrV4::new(Ipv4Addr::new(2, 3, 4, 5), 2),
        )
    }

    #[test]
    fn key_is_direction_agnostic() {
        let forward = flow();
        let backward = forward.reverse();
        assert_ne!(forward, backward);
        assert_eq!(forward.key(), backward.key());
    }

    #[test]
    fn reverse_twice_is_identity() {
        let forward = flow();
        assert_eq!(forward.reverse().reverse(), forward);
    }

    #[test]
    fn both_directions_hash_to_one_entry() {
        let mut table = HashMap::new();
        table.insert(flow().key(), 1);
        table.insert(flow().reverse().key(), 2);
        assert_eq!(table.len(), 1);
    }
}
