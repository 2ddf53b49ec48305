//! A passive monitor for TCP segment-injection attacks.
//!
//! `tcpwarden-core` mirrors both endpoints of every observed TCP
//! conversation — handshake, sequence cursors, recent segment history,
//! out-of-order buffers — and compares each arriving segment against
//! that shadow state to detect three classes of adversarial injection:
//!
//! - **Handshake hijack**: an off-path SYN-ACK racing the legitimate
//!   peer to complete the three-way handshake.
//! - **Injection (segment veto / overrun)**: a retransmission of an
//!   already-delivered range carrying divergent payload.
//! - **Coalesce injection**: a forged future segment planted in the
//!   reassembly window so that the later legitimate data loses.
//!
//! The crate is the analysis core only. Packet capture, BPF filtering,
//! and header parsing run outside and feed the monitor owned
//! [`PacketManifest`]s over a bounded channel; detections leave through
//! an [`AttackSink`](sink::AttackSink) and (optionally) every processed
//! packet through a per-flow packet sink. See [`Monitor`] for the
//! runtime surface and [`config`] for the TOML-backed options.

pub mod config;
pub mod conntrack;
pub mod detect;
mod memory;
pub mod runtime;
pub mod sink;

pub use self::conntrack::flow::{FlowId, TcpFlow};
pub use self::conntrack::manifest::{Ipv4Header, PacketManifest, TcpHeader};
pub use self::conntrack::{ConnectionPool, PoolError};
pub use self::detect::{AttackKind, AttackReport, Direction};
pub use self::runtime::Monitor;
pub use self::sink::{AttackSink, ChannelAttackSink, PacketSink, PacketSinkFactory};
