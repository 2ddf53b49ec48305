//! The shared page pool.
//!
//! One `Pager` is maintained per monitor and shared by every connection.
//! It preallocates a bounded free-list of uniformly sized pages so that
//! segment retention never allocates on the packet path and total memory
//! stays bounded. Exhaustion is a backpressure signal: the caller evicts
//! its own oldest retained page and reuses it.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::queue::ArrayQueue;
use thiserror::Error;

use crate::memory::page::Page;

#[derive(Error, Debug)]
pub(crate) enum PagerError {
    #[error("page allocation failed: pager exhausted")]
    Exhausted,
}

/// A bounded pool of reusable packet pages.
pub(crate) struct Pager {
    free: ArrayQueue<Page>,
    page_size: usize,
    capacity: usize,
    in_use: AtomicUsize,
}

impl Pager {
    /// Creates a pager for `capacity` pages of `page_size` bytes each.
    /// No pages are available until [`start`](Self::start) runs.
    pub(crate) fn new(capacity: usize, page_size: usize) -> Self {
        Pager {
            free: ArrayQueue::new(capacity.max(1)),
            page_size,
            capacity,
            in_use: AtomicUsize::new(0),
        }
    }

    /// Populates the free-list.
    pub(crate) fn start(&self) {
        for _ in 0..self.capacity {
            let _ = self.free.push(Page::new(self.page_size));
        }
        log::debug!(
            "pager started: {} pages x {} bytes",
            self.capacity,
            self.page_size
        );
    }

    /// Drains the free-list. Every owning container must have been
    /// drained first; outstanding pages are a lifecycle violation.
    pub(crate) fn stop(&self) {
        while self.free.pop().is_some() {}
        let outstanding = self.in_use.load(Ordering::Acquire);
        if outstanding != 0 {
            log::error!("pager stopped with {} pages still in use", outstanding);
        }
    }

    pub(crate) fn acquire(&self) -> Result<Page, PagerError> {
        match self.free.pop() {
            Some(page) => {
                self.in_use.fetch_add(1, Ordering::AcqRel);
                Ok(page)
            }
            None => Err(PagerError::Exhausted),
        }
    }

    pub(crate) fn release(&self, page: Page) {
        self.in_use.fetch_sub(1, Ordering::AcqRel);
        let _ = self.free.push(page);
    }

    /// Number of pages currently owned by rings and reassembly buffers.
    #[inline]
    pub(crate) fn pages_in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn page_size(&self) -> usize {
        self.page_size
    }
}

/// Pool-wide accounting for reassembly pages across all connections.
///
/// Rings are bounded per connection; future segments are additionally
/// capped globally so that a flood of out-of-order traffic on many flows
/// cannot pin the whole page pool. A cap of zero means unbounded.
pub(crate) struct BufferBudget {
    cap: usize,
    in_use: AtomicUsize,
}

impl BufferBudget {
    pub(crate) fn new(cap: usize) -> Self {
        BufferBudget {
            cap,
            in_use: AtomicUsize::new(0),
        }
    }

    /// Attempts to charge one page against the pool-wide cap.
    pub(crate) fn try_charge(&self) -> bool {
        if self.cap == 0 {
            self.in_use.fetch_add(1, Ordering::AcqRel);
            return true;
        }
        let mut current = self.in_use.load(Ordering::Acquire);
        loop {
            if current >= self.cap {
                return false;
            }
            match self.in_use.compare_exchange(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Charges past the cap. Used when a gap-skip is about to reclaim the
    /// overshoot; bounded by the pages of one segment.
    pub(crate) fn force_charge(&self) {
        self.in_use.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn credit(&self) {
        self.in_use.fetch_sub(1, Ordering::AcqRel);
    }

    #[cfg(test)]
    pub(crate) fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    #[test]
    fn acquire_until_exhausted() {
        let pager = Pager::new(2, 64);
        pager.start();
        let a = pager.acquire().unwrap();
        let b = pager.acquire().unwrap();
        assert!(matches!(pager.acquire(), Err(PagerError::Exhausted)));
        assert_eq!(pager.pages_in_use(), 2);
        pager.release(a);
        pager.release(b);
        assert_eq!(pager.pages_in_use(), 0);
        assert!(pager.acquire().is_ok());
    }

    #[test]
    fn acquire_before_start_is_exhausted() {
        let pager = Pager::new(4, 64);
        assert!(matches!(pager.acquire(), Err(PagerError::Exhausted)));
    }

    #[test]
    fn released_pages_are_reused() {
        let pager = Pager::new(1, 64);
        pager.start();
        let mut page = pager.acquire().unwrap();
        page.fill(7, b"xyz", SystemTime::UNIX_EPOCH, 0);
        pager.release(page);
        let page = pager.acquire().unwrap();
        // contents are stale until refilled, but the slab is the same size
        assert_eq!(page.bytes().len(), 3);
    }

    #[test]
    fn budget_caps_charges() {
        let budget = BufferBudget::new(2);
        assert!(budget.try_charge());
        assert!(budget.try_charge());
        assert!(!budget.try_charge());
        budget.credit();
        assert!(budget.try_charge());
        assert_eq!(budget.in_use(), 2);
    }

    #[test]
    fn zero_cap_budget_is_unbounded() {
        let budget = BufferBudget::new(0);
        for _ in 0..100 {
            assert!(budget.try_charge());
        }
        assert_eq!(budget.in_use(), 100);
    }
}
