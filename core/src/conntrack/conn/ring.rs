//! Retained segment history.
//!
//! Each direction of a connection keeps the most recently received
//! segments in an arrival-ordered ring. The ring is what makes
//! retransmissions comparable: a new segment covering an already
//! delivered range is checked byte-for-byte against the retained copy.
//! The lowest sequence still held defines the detection lookback horizon.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::SystemTime;

use crate::conntrack::conn::reassembly::{seq_max, seq_min, wrapping_lt};
use crate::memory::page::Page;
use crate::memory::pager::Pager;

/// Bytes a new segment shares with a retained one.
#[derive(Debug)]
pub(crate) struct OverlapRecord {
    /// Start sequence of the intersection.
    pub(crate) seq: u32,
    /// Retained bytes within the intersection.
    pub(crate) bytes: Vec<u8>,
}

/// Arrival-ordered ring of retained segments for one direction.
pub(crate) struct SegmentRing {
    slots: VecDeque<Page>,
    max_pages: usize,
    pager: Arc<Pager>,
}

impl SegmentRing {
    pub(crate) fn new(max_pages: usize, pager: Arc<Pager>) -> Self {
        SegmentRing {
            slots: VecDeque::with_capacity(max_pages),
            max_pages,
            pager,
        }
    }

    /// Appends a segment, chunked to the pager's page size. The oldest
    /// slot is evicted when the ring is full or the pager has no pages.
    pub(crate) fn insert(&mut self, seq: u32, payload: &[u8], timestamp: SystemTime, flags: u8) {
        let page_size = self.pager.page_size();
        let mut offset = 0;
        while offset < payload.len() {
            let n = (payload.len() - offset).min(page_size);
            let mut page = match self.acquire_page() {
                Some(page) => page,
                None => {
                    log::warn!("segment ring dropping {} bytes: no pages", payload.len() - offset);
                    return;
                }
            };
            page.fill(
                seq.wrapping_add(offset as u32),
                &payload[offset..offset + n],
                timestamp,
                flags,
            );
            self.push(page);
            offset += n;
        }
    }

    /// Takes ownership of a page drained from the reassembly buffer.
    pub(crate) fn insert_page(&mut self, page: Page) {
        self.push(page);
    }

    /// Returns, for each retained segment intersecting `[seq, seq+len)`,
    /// the intersection start and the retained bytes within it.
    pub(crate) fn covering(&self, seq: u32, len: usize) -> Vec<OverlapRecord> {
        let end = seq.wrapping_add(len as u32);
        let mut records = Vec::new();
        for slot in &self.slots {
            if slot.len() == 0 {
                continue;
            }
            let start = seq_max(seq, slot.seq);
            let stop = seq_min(end, slot.end_seq());
            if !wrapping_lt(start, stop) {
                continue;
            }
            let offset = start.wrapping_sub(slot.seq) as usize;
            let n = stop.wrapping_sub(start) as usize;
            records.push(OverlapRecord {
                seq: start,
                bytes: slot.bytes()[offset..offset + n].to_vec(),
            });
        }
        records
    }

    /// Releases every retained page back to the pager.
    pub(crate) fn clear(&mut self) {
        for page in self.slots.drain(..) {
            self.pager.release(page);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    fn push(&mut self, page: Page) {
        if self.slots.len() >= self.max_pages {
            if let Some(oldest) = self.slots.pop_front() {
                self.pager.release(oldest);
            }
        }
        self.slots.push_back(page);
    }

    fn acquire_page(&mut self) -> Option<Page> {
        match self.pager.acquire() {
            Ok(page) => Some(page),
            // backpressure: reuse our own oldest retained page
            Err(_) => self.slots.pop_front(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(max_pages: usize, pager_capacity: usize, page_size: usize) -> (SegmentRing, Arc<Pager>) {
        let pager = Arc::new(Pager::new(pager_capacity, page_size));
        pager.start();
        (SegmentRing::new(max_pages, Arc::clone(&pager)), pager)
    }

    fn insert(ring: &mut SegmentRing, seq: u32, payload: &[u8]) {
        ring.insert(seq, payload, SystemTime::UNIX_EPOCH, 0);
    }

    #[test]
    fn covering_returns_the_intersection() {
        let (mut ring, _pager) = ring(8, 16, 1024);
        insert(&mut ring, 100, b"hello");
        let records = ring.covering(101, 3);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].seq, 101);
        assert_eq!(records[0].bytes, b"ell");
    }

    #[test]
    fn disjoint_ranges_do_not_overlap() {
        let (mut ring, _pager) = ring(8, 16, 1024);
        insert(&mut ring, 100, b"hello");
        assert!(ring.covering(105, 4).is_empty());
        assert!(ring.covering(90, 10).is_empty());
    }

    #[test]
    fn full_ring_evicts_the_oldest_slot() {
        let (mut ring, pager) = ring(2, 16, 1024);
        insert(&mut ring, 100, b"aa");
        insert(&mut ring, 102, b"bb");
        insert(&mut ring, 104, b"cc");
        assert_eq!(ring.len(), 2);
        assert_eq!(pager.pages_in_use(), 2);
        assert!(ring.covering(100, 2).is_empty());
        assert_eq!(ring.covering(102, 2).len(), 1);
    }

    #[test]
    fn large_segments_are_chunked() {
        let (mut ring, _pager) = ring(8, 16, 4);
        insert(&mut ring, 100, b"abcdefgh");
        assert_eq!(ring.len(), 2);
        let records = ring.covering(102, 4);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].seq, 102);
        assert_eq!(records[0].bytes, b"cd");
        assert_eq!(records[1].seq, 104);
        assert_eq!(records[1].bytes, b"ef");
    }

    #[test]
    fn pager_exhaustion_reuses_the_oldest_slot() {
        let (mut ring, pager) = ring(4, 1, 1024);
        insert(&mut ring, 100, b"aa");
        insert(&mut ring, 102, b"bb");
        assert_eq!(ring.len(), 1);
        assert_eq!(pager.pages_in_use(), 1);
        assert!(ring.covering(100, 2).is_empty());
        assert_eq!(ring.covering(102, 2).len(), 1);
    }

    #[test]
    fn covering_handles_the_sequence_wrap() {
        let (mut ring, _pager) = ring(8, 16, 1024);
        insert(&mut ring, u32::MAX - 1, b"wxyz");
        let records = ring.covering(0, 2);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].seq, 0);
        assert_eq!(records[0].bytes, b"yz");
    }

    #[test]
    fn clear_releases_all_pages() {
        let (mut ring, pager) = ring(8, 16, 1024);
        insert(&mut ring, 100, b"hello");
        assert_eq!(pager.pages_in_use(), 1);
        ring.clear();
        assert_eq!(ring.len(), 0);
        assert_eq!(pager.pages_in_use(), 0);
    }
}
