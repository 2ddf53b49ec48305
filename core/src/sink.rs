//! Output sinks.
//!
//! The monitor's user-visible output is the stream of attack reports;
//! optionally it also hands every processed packet to a per-flow packet
//! sink. Formatting, encoding, and rotation policy all belong to the
//! sink implementations, which live outside this crate.

use std::time::SystemTime;

use crossbeam::channel::Sender;

use crate::conntrack::flow::TcpFlow;
use crate::detect::AttackReport;

/// Receives structured attack reports.
pub trait AttackSink: Send + Sync {
    fn record(&self, report: AttackReport);
}

/// Receives every raw packet a connection processes.
pub trait PacketSink: Send {
    fn log_packet(&mut self, timestamp: SystemTime, raw: &[u8]);

    /// Flushes and releases any underlying resources.
    fn close(&mut self) {}
}

/// Produces one packet sink per monitored flow, keyed by the flow's
/// first-seen direction.
pub type PacketSinkFactory = dyn Fn(&TcpFlow) -> Box<dyn PacketSink> + Send + Sync;

/// Attack sink that forwards reports over a channel.
pub struct ChannelAttackSink {
    tx: Sender<AttackReport>,
}

impl ChannelAttackSink {
    pub fn new(tx: Sender<AttackReport>) -> Self {
        ChannelAttackSink { tx }
    }
}

impl AttackSink for ChannelAttackSink {
    fn record(&self, report: AttackReport) {
        if self.tx.send(report).is_err() {
            log::warn!("attack report dropped: receiver gone");
        }
    }
}
