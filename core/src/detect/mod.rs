//! Attack detection.
//!
//! The predicates here decide whether a segment that touches retained
//! history is a legitimate retransmission or an injection attempt, and
//! shape the structured reports handed to the attack sink.

use std::fmt;
use std::time::SystemTime;

use serde::Serialize;

use crate::config::DetectorConfig;
use crate::conntrack::conn::reassembly::CoalesceConflict;
use crate::conntrack::conn::ring::OverlapRecord;
use crate::conntrack::flow::TcpFlow;

/// Classes of segment-injection attack the monitor reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttackKind {
    /// An off-path SYN-ACK raced the legitimate peer's handshake.
    HandshakeHijack,
    /// A retransmitted range arrived with divergent payload.
    Injection,
    /// A buffered future range was overwritten with divergent payload.
    CoalesceInjection,
}

impl fmt::Display for AttackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AttackKind::HandshakeHijack => "handshake_hijack",
            AttackKind::Injection => "injection",
            AttackKind::CoalesceInjection => "coalesce_injection",
        };
        write!(f, "{}", name)
    }
}

/// Direction of the offending segment within its conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

/// A structured attack report delivered to the attack sink.
#[derive(Debug, Clone, Serialize)]
pub struct AttackReport {
    /// Capture timestamp of the offending segment.
    pub timestamp: SystemTime,
    /// Client-to-server view of the affected conversation.
    pub flow: TcpFlow,
    pub direction: Direction,
    pub kind: AttackKind,
    /// Offending sequence range, start inclusive, end exclusive.
    pub start_seq: u32,
    pub end_seq: u32,
    /// Bytes previously retained for the range, unless metadata-only.
    pub retained: Option<Vec<u8>>,
    /// Bytes observed in the offending segment, unless metadata-only.
    pub observed: Option<Vec<u8>>,
}

/// Per-connection predicate evaluation with the configured toggles.
#[derive(Debug, Clone)]
pub(crate) struct Detector {
    hijack: bool,
    injection: bool,
    coalesce: bool,
    metadata_only: bool,
}

impl Detector {
    pub(crate) fn new(config: &DetectorConfig) -> Self {
        Detector {
            hijack: config.hijack,
            injection: config.injection,
            coalesce: config.coalesce_injection,
            metadata_only: config.metadata_only,
        }
    }

    /// Compares a retransmitted range against retained history. Each
    /// overlap with divergent bytes yields one `injection` report
    /// covering exactly the differing sub-range.
    pub(crate) fn check_retransmission(
        &self,
        timestamp: SystemTime,
        flow: TcpFlow,
        direction: Direction,
        seq: u32,
        payload: &[u8],
        overlaps: &[OverlapRecord],
    ) -> Vec<AttackReport> {
        if !self.injection {
            return Vec::new();
        }
        let mut reports = Vec::new();
        for record in overlaps {
            let offset = record.seq.wrapping_sub(seq) as usize;
            let observed = &payload[offset..offset + record.bytes.len()];
            if let Some((lo, hi)) = diff_range(&record.bytes, observed) {
                reports.push(AttackReport {
                    timestamp,
                    flow,
                    direction,
                    kind: AttackKind::Injection,
                    start_seq: record.seq.wrapping_add(lo as u32),
                    end_seq: record.seq.wrapping_add(hi as u32),
                    retained: self.payload_field(record.bytes[lo..hi].to_vec()),
                    observed: self.payload_field(observed[lo..hi].to_vec()),
                });
            }
        }
        reports
    }

    /// Reports divergent overwrites of buffered future segments.
    pub(crate) fn check_coalesce(
        &self,
        timestamp: SystemTime,
        flow: TcpFlow,
        direction: Direction,
        conflicts: Vec<CoalesceConflict>,
    ) -> Vec<AttackReport> {
        if !self.coalesce {
            return Vec::new();
        }
        conflicts
            .into_iter()
            .map(|conflict| AttackReport {
                timestamp,
                flow,
                direction,
                kind: AttackKind::CoalesceInjection,
                start_seq: conflict.seq,
                end_seq: conflict.seq.wrapping_add(conflict.retained.len() as u32),
                retained: self.payload_field(conflict.retained),
                observed: self.payload_field(conflict.observed),
            })
            .collect()
    }

    /// Reports a competing SYN-ACK whose initial sequence number
    /// disagrees with the one already witnessed for this handshake.
    pub(crate) fn check_hijack(
        &self,
        timestamp: SystemTime,
        flow: TcpFlow,
        witnessed_isn: u32,
        observed_isn: u32,
    ) -> Option<AttackReport> {
        if !self.hijack || witnessed_isn == observed_isn {
            return None;
        }
        Some(AttackReport {
            timestamp,
            flow,
            direction: Direction::ServerToClient,
            kind: AttackKind::HandshakeHijack,
            start_seq: observed_isn,
            end_seq: observed_isn.wrapping_add(1),
            retained: None,
            observed: None,
        })
    }

    fn payload_field(&self, bytes: Vec<u8>) -> Option<Vec<u8>> {
        if self.metadata_only {
            None
        } else {
            Some(bytes)
        }
    }
}

/// First and last differing byte between `a` and `b`, end exclusive.
fn diff_range(a: &[u8], b: &[u8]) -> Option<(usize, usize)> {
    let n = a.len().min(b.len());
    let first = (0..n).find(|&i| a[i] != b[i])?;
    let mut last = first;
    for i in first + 1..n {
        if a[i] != b[i] {
            last = i;
        }
    }
    Some((first, last + 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conntrack::manifest::testing::client_flow;

    fn detector() -> Detector {
        Detector::new(&DetectorConfig::default())
    }

    #[test]
    fn diff_range_finds_the_divergent_span() {
        assert_eq!(diff_range(b"hello", b"hello"), None);
        assert_eq!(diff_range(b"hello", b"HELLO"), Some((0, 5)));
        assert_eq!(diff_range(b"hello", b"heLlo"), Some((2, 3)));
        assert_eq!(diff_range(b"abcdef", b"aXcdeY"), Some((1, 6)));
    }

    #[test]
    fn identical_retransmission_is_silent() {
        let overlaps = vec![OverlapRecord {
            seq: 101,
            bytes: b"hello".to_vec(),
        }];
        let reports = detector().check_retransmission(
            SystemTime::UNIX_EPOCH,
            client_flow(),
            Direction::ClientToServer,
            101,
            b"hello",
            &overlaps,
        );
        assert!(reports.is_empty());
    }

    #[test]
    fn divergent_retransmission_reports_the_differing_range() {
        let overlaps = vec![OverlapRecord {
            seq: 101,
            bytes: b"hello".to_vec(),
        }];
        let reports = detector().check_retransmission(
            SystemTime::UNIX_EPOCH,
            client_flow(),
            Direction::ClientToServer,
            101,
            b"HELLO",
            &overlaps,
        );
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].kind, AttackKind::Injection);
        assert_eq!(reports[0].start_seq, 101);
        assert_eq!(reports[0].end_seq, 106);
        assert_eq!(reports[0].retained.as_deref(), Some(&b"hello"[..]));
        assert_eq!(reports[0].observed.as_deref(), Some(&b"HELLO"[..]));
    }

    #[test]
    fn disabled_toggle_suppresses_reports() {
        let config = DetectorConfig {
            injection: false,
            ..DetectorConfig::default()
        };
        let overlaps = vec![OverlapRecord {
            seq: 101,
            bytes: b"hello".to_vec(),
        }];
        let reports = Detector::new(&config).check_retransmission(
            SystemTime::UNIX_EPOCH,
            client_flow(),
            Direction::ClientToServer,
            101,
            b"HELLO",
            &overlaps,
        );
        assert!(reports.is_empty());
    }

    #[test]
    fn metadata_only_omits_payload_bytes() {
        let config = DetectorConfig {
            metadata_only: true,
            ..DetectorConfig::default()
        };
        let overlaps = vec![OverlapRecord {
            seq: 101,
            bytes: b"hello".to_vec(),
        }];
        let reports = Detector::new(&config).check_retransmission(
            SystemTime::UNIX_EPOCH,
            client_flow(),
            Direction::ClientToServer,
            101,
            b"HELLO",
            &overlaps,
        );
        assert_eq!(reports.len(), 1);
        assert!(reports[0].retained.is_none());
        assert!(reports[0].observed.is_none());
    }

    #[test]
    fn hijack_fires_only_on_a_different_isn() {
        let detector = detector();
        assert!(detector
            .check_hijack(SystemTime::UNIX_EPOCH, client_flow(), 500, 500)
            .is_none());
        let report = detector
            .check_hijack(SystemTime::UNIX_EPOCH, client_flow(), 500, 999)
            .expect("hijack report");
        assert_eq!(report.kind, AttackKind::HandshakeHijack);
        assert_eq!(report.start_seq, 999);
    }

    #[test]
    fn attack_kind_serialises_snake_case() {
        assert_eq!(AttackKind::HandshakeHijack.to_string(), "handshake_hijack");
        assert_eq!(AttackKind::Injection.to_string(), "injection");
        assert_eq!(
            AttackKind::CoalesceInjection.to_string(),
            "coalesce_injection"
        );
    }
}
