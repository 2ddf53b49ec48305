//! Connection state management.
//!
//! The connection pool maps direction-agnostic flow keys to live
//! connections. It is the only state shared between the dispatcher and
//! the reaping path; a single mutex guards the map, and the lock is
//! never held across a channel send.

pub(crate) mod conn;
pub mod flow;
pub mod manifest;

use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::SystemTime;

use crossbeam::channel::Sender;
use hashlink::LinkedHashMap;
use thiserror::Error;

use self::flow::FlowId;
use self::manifest::PacketManifest;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("no connection tracked for {0}")]
    NotFound(FlowId),
}

/// What the pool keeps for one live connection: the worker's input
/// channel, its join handle, and the liveness timestamp the reaper
/// consults. The connection state itself is owned by the worker thread.
pub(crate) struct ConnectionHandle {
    pub(crate) tx: Sender<PacketManifest>,
    pub(crate) last_seen: SystemTime,
    pub(crate) worker: Option<JoinHandle<()>>,
}

/// Maps flow keys to live connections.
pub struct ConnectionPool {
    table: Mutex<LinkedHashMap<FlowId, ConnectionHandle>>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        ConnectionPool {
            table: Mutex::new(LinkedHashMap::new()),
        }
    }

    /// Returns `true` if a connection is tracked for `key`.
    pub fn has(&self, key: &FlowId) -> bool {
        self.table.lock().unwrap().contains_key(key)
    }

    /// Returns the input channel of the connection tracked for `key`.
    pub(crate) fn get(&self, key: &FlowId) -> Result<Sender<PacketManifest>, PoolError> {
        self.table
            .lock()
            .unwrap()
            .get(key)
            .map(|handle| handle.tx.clone())
            .ok_or_else(|| PoolError::NotFound(key.clone()))
    }

    /// Refreshes the liveness timestamp for `key`.
    pub(crate) fn touch(&self, key: &FlowId, timestamp: SystemTime) {
        if let Some(handle) = self.table.lock().unwrap().get_mut(key) {
            handle.last_seen = timestamp;
        }
    }

    /// Tracks a new connection. At most one connection may exist per
    /// conversation; a duplicate insert replaces the old entry and is an
    /// invariant violation.
    pub(crate) fn put(&self, key: FlowId, handle: ConnectionHandle) {
        let replaced = self.table.lock().unwrap().insert(key, handle);
        if replaced.is_some() {
            log::error!("connection replaced while still tracked");
        }
    }

    /// Stops tracking `key`. Dropping the handle closes the worker's
    /// input channel; the worker drains and releases its resources after
    /// the entry is gone from the map.
    pub fn delete(&self, key: &FlowId) -> bool {
        let removed = self.table.lock().unwrap().remove(key);
        removed.is_some()
    }

    /// Initiates closure of every connection not seen after `threshold`.
    /// Returns the number of closures initiated; teardown completes
    /// asynchronously on the worker threads.
    pub fn close_older_than(&self, threshold: SystemTime) -> usize {
        let mut idle = Vec::new();
        {
            let mut table = self.table.lock().unwrap();
            let keys: Vec<FlowId> = table
                .iter()
                .filter(|(_, handle)| handle.last_seen <= threshold)
                .map(|(key, _)| key.clone())
                .collect();
            for key in keys {
                if let Some(handle) = table.remove(&key) {
                    idle.push(handle);
                }
            }
        }
        idle.len()
    }

    /// Closes every connection and waits for the workers to finish
    /// releasing their resources.
    pub fn close_all(&self) -> usize {
        let handles: Vec<ConnectionHandle> = {
            let mut table = self.table.lock().unwrap();
            let mut handles = Vec::with_capacity(table.len());
            while let Some((_, handle)) = table.pop_front() {
                handles.push(handle);
            }
            handles
        };
        let closed = handles.len();
        for mut handle in handles {
            drop(handle.tx);
            if let Some(worker) = handle.worker.take() {
                if worker.join().is_err() {
                    log::error!("connection worker panicked during shutdown");
                }
            }
        }
        closed
    }

    pub fn len(&self) -> usize {
        self.table.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conntrack::manifest::testing::client_flow;
    use crossbeam::channel::bounded;
    use std::time::Duration;

    fn handle(last_seen: SystemTime) -> ConnectionHandle {
        let (tx, _rx) = bounded(1);
        // the receiver is dropped: fine for pool bookkeeping tests
        ConnectionHandle {
            tx,
            last_seen,
            worker: None,
        }
    }

    #[test]
    fn put_then_delete() {
        let pool = ConnectionPool::new();
        let key = client_flow().key();
        pool.put(key.clone(), handle(SystemTime::now()));
        assert_eq!(pool.len(), 1);

        assert!(pool.delete(&key));
        assert_eq!(pool.len(), 0);

        // deleting a flow that is no longer tracked is a no-op
        assert!(!pool.delete(&key));
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn lookup_is_direction_agnostic() {
        let pool = ConnectionPool::new();
        pool.put(client_flow().key(), handle(SystemTime::now()));
        assert!(pool.has(&client_flow().key()));
        assert!(pool.has(&client_flow().reverse().key()));
        assert!(pool.get(&client_flow().reverse().key()).is_ok());
    }

    #[test]
    fn get_on_untracked_key_is_an_error() {
        let pool = ConnectionPool::new();
        assert!(matches!(
            pool.get(&client_flow().key()),
            Err(PoolError::NotFound(_))
        ));
    }

    #[test]
    fn close_all_on_an_empty_pool() {
        let pool = ConnectionPool::new();
        assert_eq!(pool.close_all(), 0);
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn close_all_drains_the_table() {
        let pool = ConnectionPool::new();
        pool.put(client_flow().key(), handle(SystemTime::now()));
        assert_eq!(pool.close_all(), 1);
        assert_eq!(pool.len(), 0);
        assert!(!pool.has(&client_flow().key()));
    }

    #[test]
    fn close_older_than_on_an_empty_pool() {
        let pool = ConnectionPool::new();
        assert_eq!(pool.close_older_than(SystemTime::now()), 0);
    }

    #[test]
    fn close_older_than_uses_the_liveness_timestamp() {
        let pool = ConnectionPool::new();
        let now = SystemTime::now();
        pool.put(client_flow().key(), handle(now));

        // a threshold before last_seen leaves the connection alone
        assert_eq!(pool.close_older_than(now - Duration::from_secs(60)), 0);
        assert!(pool.has(&client_flow().key()));

        // last_seen <= threshold closes it
        assert_eq!(pool.close_older_than(now), 1);
        assert!(!pool.has(&client_flow().key()));
    }

    #[test]
    fn touch_defers_the_reaper() {
        let pool = ConnectionPool::new();
        let start = SystemTime::now();
        let key = client_flow().key();
        pool.put(key.clone(), handle(start));
        pool.touch(&key, start + Duration::from_secs(300));
        assert_eq!(pool.close_older_than(start + Duration::from_secs(60)), 0);
        assert!(pool.has(&key));
    }
}
