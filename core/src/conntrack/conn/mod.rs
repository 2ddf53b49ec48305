//! Per-connection stream tracking.
//!
//! A `Connection` mirrors both endpoints' sequence spaces through the
//! handshake, data transfer, and teardown, retaining recent segment
//! history per direction and invoking the detection predicates on every
//! segment that touches delivered or buffered ranges. Each live
//! connection is driven by its own worker thread, which is the sole
//! consumer of the connection's input channel.

pub(crate) mod reassembly;
pub(crate) mod ring;

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::SystemTime;

use crossbeam::channel::{Receiver, Sender};

use self::reassembly::{wrapping_lt, ReassemblyBuffer};
use self::ring::SegmentRing;
use crate::conntrack::flow::{FlowId, TcpFlow};
use crate::conntrack::manifest::{PacketManifest, FIN};
use crate::detect::{AttackReport, Detector, Direction};
use crate::memory::pager::{BufferBudget, Pager};
use crate::sink::{AttackSink, PacketSink};

/// Connection lifecycle states mirrored from the endpoints' exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TcpState {
    /// No handshake observed yet; awaiting a SYN or joined mid-stream.
    Listen,
    /// Client SYN seen; awaiting the SYN-ACK.
    ConnectionRequest,
    /// Server SYN-ACK seen; awaiting the final ACK.
    ConnectionEstablished,
    /// Handshake complete; normal data flow.
    DataTransfer,
    /// FIN observed from at least one side.
    ConnectionClosing,
    /// Terminal; scheduled for removal from the pool.
    Closed,
}

/// Construction parameters shared by the dispatcher.
pub(crate) struct ConnectionOptions {
    pub(crate) max_ring_pages: usize,
    pub(crate) buffered_per_connection: usize,
    pub(crate) pager: Arc<Pager>,
    pub(crate) budget: Arc<BufferBudget>,
    pub(crate) detector: Detector,
    pub(crate) attack_sink: Arc<dyn AttackSink>,
    pub(crate) packet_sink: Option<Box<dyn PacketSink>>,
    pub(crate) close_tx: Sender<FlowId>,
}

/// Per-direction stream state.
struct HalfStream {
    /// Initial sequence number witnessed in the handshake.
    isn: Option<u32>,
    /// Next expected in-order sequence number.
    next_seq: Option<u32>,
    ring: SegmentRing,
    buffer: ReassemblyBuffer,
    /// Sequence number consumed by this side's FIN.
    fin_seq: Option<u32>,
    fin_acked: bool,
}

impl HalfStream {
    fn new(options: &ConnectionOptions) -> Self {
        HalfStream {
            isn: None,
            next_seq: None,
            ring: SegmentRing::new(options.max_ring_pages, Arc::clone(&options.pager)),
            buffer: ReassemblyBuffer::new(
                options.buffered_per_connection,
                Arc::clone(&options.budget),
                Arc::clone(&options.pager),
            ),
            fin_seq: None,
            fin_acked: false,
        }
    }

    /// Moves newly contiguous buffered segments into the ring. A drained
    /// segment whose FIN lines up with the cursor takes effect exactly as
    /// if it had arrived in order. Returns `true` when such a FIN was
    /// consumed; the caller owns the state transition.
    fn drain(&mut self, next: &mut u32) -> bool {
        let mut fin_consumed = false;
        loop {
            let drained = self.buffer.pop_contiguous(next);
            if drained.is_empty() {
                break;
            }
            for page in drained {
                if page.flags & FIN != 0 && page.end_seq() == *next {
                    self.fin_seq = Some(*next);
                    *next = next.wrapping_add(1);
                    fin_consumed = true;
                }
                self.ring.insert_page(page);
            }
        }
        fin_consumed
    }
}

/// State for one tracked TCP conversation.
pub(crate) struct Connection {
    state: TcpState,
    /// The SYN sender's direction, or the first-seen direction until a
    /// handshake is observed.
    client_flow: TcpFlow,
    server_flow: TcpFlow,
    client: HalfStream,
    server: HalfStream,
    #[allow(dead_code)]
    first_seen: SystemTime,
    #[allow(dead_code)]
    last_seen: SystemTime,
    detector: Detector,
    attack_sink: Arc<dyn AttackSink>,
    packet_sink: Option<Box<dyn PacketSink>>,
    close_tx: Sender<FlowId>,
    close_requested: bool,
}

impl Connection {
    pub(crate) fn new(
        first_flow: TcpFlow,
        first_seen: SystemTime,
        mut options: ConnectionOptions,
    ) -> Self {
        let client = HalfStream::new(&options);
        let server = HalfStream::new(&options);
        let packet_sink = options.packet_sink.take();
        Connection {
            state: TcpState::Listen,
            client_flow: first_flow,
            server_flow: first_flow.reverse(),
            client,
            server,
            first_seen,
            last_seen: first_seen,
            detector: options.detector,
            attack_sink: Arc::clone(&options.attack_sink),
            packet_sink,
            close_tx: options.close_tx,
            close_requested: false,
        }
    }

    /// Processes one packet of this conversation, in capture order.
    pub(crate) fn receive_packet(&mut self, manifest: &PacketManifest) {
        self.last_seen = manifest.timestamp;
        if let Some(sink) = &mut self.packet_sink {
            sink.log_packet(manifest.timestamp, &manifest.raw);
        }
        if manifest.tcp.rst() {
            log::debug!("{}: RST received, closing", self.client_flow);
            self.close();
            return;
        }
        match self.state {
            TcpState::Listen => self.on_listen(manifest),
            TcpState::ConnectionRequest => self.on_connection_request(manifest),
            TcpState::ConnectionEstablished => self.on_connection_established(manifest),
            TcpState::DataTransfer | TcpState::ConnectionClosing => self.on_stream(manifest),
            TcpState::Closed => {}
        }
    }

    /// Returns retained pages to the pager. Runs on the worker after the
    /// dispatcher has removed the pool entry.
    pub(crate) fn shutdown(&mut self) {
        self.client.ring.clear();
        self.client.buffer.clear();
        self.server.ring.clear();
        self.server.buffer.clear();
        if let Some(sink) = &mut self.packet_sink {
            sink.close();
        }
    }

    fn on_listen(&mut self, manifest: &PacketManifest) {
        if manifest.tcp.syn() && !manifest.tcp.ack() {
            self.client_flow = manifest.flow;
            self.server_flow = manifest.flow.reverse();
            self.client.isn = Some(manifest.tcp.seq_no);
            self.client.next_seq = Some(manifest.tcp.seq_no.wrapping_add(1));
            self.state = TcpState::ConnectionRequest;
        } else {
            log::debug!("{}: ignoring non-SYN packet before handshake", manifest.flow);
        }
    }

    fn on_connection_request(&mut self, manifest: &PacketManifest) {
        if manifest.flow != self.server_flow {
            // client SYN retransmission
            return;
        }
        if !(manifest.tcp.syn() && manifest.tcp.ack()) {
            log::debug!(
                "{}: expected SYN-ACK, got flags {:#x}",
                manifest.flow,
                manifest.tcp.flags
            );
            return;
        }
        if Some(manifest.tcp.ack_no) != self.client.next_seq {
            log::debug!(
                "{}: SYN-ACK acks {} instead of the client SYN",
                manifest.flow,
                manifest.tcp.ack_no
            );
            return;
        }
        self.server.isn = Some(manifest.tcp.seq_no);
        self.server.next_seq = Some(manifest.tcp.seq_no.wrapping_add(1));
        self.state = TcpState::ConnectionEstablished;
    }

    fn on_connection_established(&mut self, manifest: &PacketManifest) {
        if manifest.flow == self.server_flow {
            if manifest.tcp.syn()
                && manifest.tcp.ack()
                && Some(manifest.tcp.ack_no) == self.client.next_seq
            {
                // a competing SYN-ACK for the handshake we already witnessed
                if let Some(witnessed) = self.server.isn {
                    if let Some(report) = self.detector.check_hijack(
                        manifest.timestamp,
                        self.client_flow,
                        witnessed,
                        manifest.tcp.seq_no,
                    ) {
                        self.deliver(report);
                    }
                }
            }
            return;
        }
        if manifest.tcp.ack()
            && Some(manifest.tcp.ack_no) == self.server.next_seq
            && Some(manifest.tcp.seq_no) == self.client.next_seq
        {
            self.state = TcpState::DataTransfer;
            if !manifest.payload.is_empty() || manifest.tcp.fin() {
                self.on_stream(manifest);
            }
        }
    }

    fn on_stream(&mut self, manifest: &PacketManifest) {
        let from_client = manifest.flow == self.client_flow;
        let direction = if from_client {
            Direction::ClientToServer
        } else {
            Direction::ServerToClient
        };
        if manifest.tcp.ack() {
            self.note_fin_ack(from_client, manifest.tcp.ack_no);
        }

        let half = if from_client {
            &mut self.client
        } else {
            &mut self.server
        };
        let mut next = match half.next_seq {
            Some(next) => next,
            None => return,
        };
        let seq = manifest.tcp.seq_no;
        let len = manifest.payload.len();
        let mut reports: Vec<AttackReport> = Vec::new();
        let mut deferred_fin = false;

        if len > 0 {
            let end = seq.wrapping_add(len as u32);
            if seq == next {
                // in-order new data
                half.ring
                    .insert(seq, &manifest.payload, manifest.timestamp, manifest.tcp.flags);
                next = end;
                deferred_fin |= half.drain(&mut next);
            } else if wrapping_lt(seq, next) {
                if !wrapping_lt(next, end) {
                    // entirely retransmitted range
                    let overlaps = half.ring.covering(seq, len);
                    reports = self.detector.check_retransmission(
                        manifest.timestamp,
                        self.client_flow,
                        direction,
                        seq,
                        &manifest.payload,
                        &overlaps,
                    );
                } else {
                    // straddles the cursor: retransmitted head, new tail
                    let old_len = next.wrapping_sub(seq) as usize;
                    let overlaps = half.ring.covering(seq, old_len);
                    reports = self.detector.check_retransmission(
                        manifest.timestamp,
                        self.client_flow,
                        direction,
                        seq,
                        &manifest.payload[..old_len],
                        &overlaps,
                    );
                    half.ring.insert(
                        next,
                        &manifest.payload[old_len..],
                        manifest.timestamp,
                        manifest.tcp.flags,
                    );
                    next = end;
                    deferred_fin |= half.drain(&mut next);
                }
            } else {
                // future data
                let outcome = half.buffer.insert(
                    seq,
                    &manifest.payload,
                    manifest.timestamp,
                    manifest.tcp.flags,
                    next,
                );
                reports = self.detector.check_coalesce(
                    manifest.timestamp,
                    self.client_flow,
                    direction,
                    outcome.conflicts,
                );
                if let Some(skip_to) = outcome.skipped_to {
                    log::warn!(
                        "{}: reassembly over budget, skipping hole {} -> {}",
                        self.client_flow,
                        next,
                        skip_to
                    );
                    next = skip_to;
                    deferred_fin |= half.drain(&mut next);
                }
            }
        }

        if manifest.tcp.fin() {
            // the FIN consumes one sequence number after any payload
            let fin_seq = seq.wrapping_add(len as u32);
            if fin_seq == next {
                half.fin_seq = Some(fin_seq);
                next = next.wrapping_add(1);
                deferred_fin = true;
            } else if len > 0 && wrapping_lt(next, fin_seq) {
                // rides its buffered segment and takes effect on drain
                log::debug!("{}: FIN at {} deferred past the cursor", manifest.flow, fin_seq);
            } else {
                log::debug!("{}: duplicate or bare out-of-order FIN at {} ignored", manifest.flow, fin_seq);
            }
        }
        if deferred_fin && self.state == TcpState::DataTransfer {
            self.state = TcpState::ConnectionClosing;
        }
        half.next_seq = Some(next);

        for report in reports {
            self.deliver(report);
        }

        if self.state == TcpState::ConnectionClosing
            && self.client.fin_acked
            && self.server.fin_acked
        {
            self.close();
        }
    }

    fn note_fin_ack(&mut self, from_client: bool, ack_no: u32) {
        let other = if from_client {
            &mut self.server
        } else {
            &mut self.client
        };
        if let Some(fin_seq) = other.fin_seq {
            if wrapping_lt(fin_seq, ack_no) {
                other.fin_acked = true;
            }
        }
    }

    fn deliver(&self, report: AttackReport) {
        log::info!(
            "{}: {} detected in [{}, {})",
            self.client_flow,
            report.kind,
            report.start_seq,
            report.end_seq
        );
        self.attack_sink.record(report);
    }

    fn close(&mut self) {
        self.state = TcpState::Closed;
        if self.close_requested {
            return;
        }
        self.close_requested = true;
        // the dispatcher removes the pool entry; resources are released
        // by the worker once the input channel drains
        if self.close_tx.try_send(self.client_flow.key()).is_err() {
            log::debug!("{}: close request not delivered", self.client_flow);
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> TcpState {
        self.state
    }

    #[cfg(test)]
    fn next_seq(&self, from_client: bool) -> Option<u32> {
        if from_client {
            self.client.next_seq
        } else {
            self.server.next_seq
        }
    }
}

/// Runs a connection's packet loop. The loop ends when the dispatcher
/// drops the sending side; retained pages go back to the pager before
/// the thread exits.
pub(crate) fn spawn(mut connection: Connection, rx: Receiver<PacketManifest>) -> JoinHandle<()> {
    thread::spawn(move || {
        while let Ok(manifest) = rx.recv() {
            connection.receive_packet(&manifest);
        }
        connection.shutdown();
    })
}
