//! Monitor runtime.
//!
//! The runtime owns the page pool and the connection pool, and runs the
//! dispatcher thread that demultiplexes packet manifests onto
//! per-connection workers. Capture and decode live outside this crate
//! and feed the runtime through the packet-manifest input channel.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::SystemTime;

use anyhow::Result;
use crossbeam::channel::{bounded, tick, Receiver, Sender};
use crossbeam::select;

use crate::config::{ConnTrackConfig, DetectorConfig, MonitorConfig};
use crate::conntrack::conn::{self, Connection, ConnectionOptions};
use crate::conntrack::flow::FlowId;
use crate::conntrack::manifest::PacketManifest;
use crate::conntrack::{ConnectionHandle, ConnectionPool};
use crate::detect::Detector;
use crate::memory::pager::{BufferBudget, Pager};
use crate::sink::{AttackSink, PacketSinkFactory};

/// Depth of the capture-side input channel.
const INPUT_CHANNEL_SIZE: usize = 1024;
/// Depth of each connection worker's input channel.
const CONN_CHANNEL_SIZE: usize = 128;
/// Depth of the close-request channel.
const CLOSE_CHANNEL_SIZE: usize = 256;

/// The passive monitor runtime.
///
/// ```no_run
/// use std::sync::Arc;
/// use crossbeam::channel::unbounded;
/// use tcpwarden_core::config::default_config;
/// use tcpwarden_core::sink::ChannelAttackSink;
/// use tcpwarden_core::Monitor;
///
/// let (report_tx, report_rx) = unbounded();
/// let mut monitor = Monitor::new(
///     default_config(),
///     Arc::new(ChannelAttackSink::new(report_tx)),
/// )
/// .unwrap();
/// let input = monitor.input();
/// monitor.start();
/// // capture/decode side: input.send(manifest) ...
/// for report in report_rx.iter() {
///     println!("{}", report.kind);
/// }
/// ```
pub struct Monitor {
    config: MonitorConfig,
    pool: Arc<ConnectionPool>,
    pager: Arc<Pager>,
    budget: Arc<BufferBudget>,
    attack_sink: Arc<dyn AttackSink>,
    packet_sinks: Option<Arc<PacketSinkFactory>>,
    packet_tx: Option<Sender<PacketManifest>>,
    packet_rx: Option<Receiver<PacketManifest>>,
    stop_tx: Sender<()>,
    stop_rx: Option<Receiver<()>>,
    dispatcher: Option<JoinHandle<()>>,
}

impl Monitor {
    /// Creates a monitor from `config`. Fails when the configuration
    /// cannot bound memory use.
    pub fn new(config: MonitorConfig, attack_sink: Arc<dyn AttackSink>) -> Result<Self> {
        config.validate()?;
        let (packet_tx, packet_rx) = bounded(INPUT_CHANNEL_SIZE);
        let (stop_tx, stop_rx) = bounded(1);
        let pager = Arc::new(Pager::new(config.pager.capacity, config.pager.page_size));
        let budget = Arc::new(BufferBudget::new(config.conntrack.buffered_total));
        Ok(Monitor {
            config,
            pool: Arc::new(ConnectionPool::new()),
            pager,
            budget,
            attack_sink,
            packet_sinks: None,
            packet_tx: Some(packet_tx),
            packet_rx: Some(packet_rx),
            stop_tx,
            stop_rx: Some(stop_rx),
            dispatcher: None,
        })
    }

    /// Installs the per-flow packet sink factory used when
    /// `logging.log_packets` is set.
    pub fn set_packet_sink_factory(&mut self, factory: Arc<PacketSinkFactory>) {
        self.packet_sinks = Some(factory);
    }

    /// Takes the sending side of the packet-manifest input channel. The
    /// monitor shuts down cooperatively when every clone of the returned
    /// sender has been dropped.
    pub fn input(&mut self) -> Sender<PacketManifest> {
        self.packet_tx.take().expect("input channel already taken")
    }

    /// Number of currently tracked connections.
    pub fn tracked_connections(&self) -> usize {
        self.pool.len()
    }

    /// Starts the page pool and the dispatcher thread.
    pub fn start(&mut self) {
        let (packet_rx, stop_rx) = match (self.packet_rx.take(), self.stop_rx.take()) {
            (Some(packet_rx), Some(stop_rx)) => (packet_rx, stop_rx),
            _ => {
                log::error!("monitor already started");
                return;
            }
        };
        self.pager.start();
        let (close_tx, close_rx) = bounded(CLOSE_CHANNEL_SIZE);
        let dispatcher = Dispatcher {
            conntrack: self.config.conntrack.clone(),
            detect: self.config.detect.clone(),
            log_packets: self.config.logging.log_packets,
            pool: Arc::clone(&self.pool),
            pager: Arc::clone(&self.pager),
            budget: Arc::clone(&self.budget),
            attack_sink: Arc::clone(&self.attack_sink),
            packet_sinks: self.packet_sinks.clone(),
            close_tx,
            close_rx,
        };
        self.dispatcher = Some(thread::spawn(move || dispatcher.run(packet_rx, stop_rx)));
    }

    /// Stops the dispatcher, closes every connection, and releases the
    /// page pool.
    pub fn stop(&mut self) {
        let dispatcher = match self.dispatcher.take() {
            Some(dispatcher) => dispatcher,
            None => return,
        };
        let _ = self.stop_tx.try_send(());
        // unblock the dispatcher if it is waiting on ingest
        self.packet_tx = None;
        if dispatcher.join().is_err() {
            log::error!("dispatcher panicked");
        }
        self.pager.stop();
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        if self.dispatcher.is_some() {
            self.stop();
        }
    }
}

struct Dispatcher {
    conntrack: ConnTrackConfig,
    detect: DetectorConfig,
    log_packets: bool,
    pool: Arc<ConnectionPool>,
    pager: Arc<Pager>,
    budget: Arc<BufferBudget>,
    attack_sink: Arc<dyn AttackSink>,
    packet_sinks: Option<Arc<PacketSinkFactory>>,
    close_tx: Sender<FlowId>,
    close_rx: Receiver<FlowId>,
}

impl Dispatcher {
    fn run(self, packet_rx: Receiver<PacketManifest>, stop_rx: Receiver<()>) {
        let idle_timeout = self.conntrack.idle_timeout();
        let ticker = tick(self.conntrack.resolution());
        loop {
            // finished connections come off the table before further ingest
            while let Ok(key) = self.close_rx.try_recv() {
                self.pool.delete(&key);
            }
            select! {
                recv(stop_rx) -> _ => break,
                recv(self.close_rx) -> msg => {
                    if let Ok(key) = msg {
                        self.pool.delete(&key);
                    }
                }
                recv(ticker) -> _ => {
                    let threshold = SystemTime::now() - idle_timeout;
                    let closed = self.pool.close_older_than(threshold);
                    if closed != 0 {
                        log::info!("idle timeout closed {} connections", closed);
                    }
                }
                recv(packet_rx) -> msg => {
                    match msg {
                        Ok(manifest) => self.dispatch(manifest),
                        // capture side is done
                        Err(_) => break,
                    }
                }
            }
        }
        let closed = self.pool.close_all();
        log::info!("dispatcher stopped, closed {} connections", closed);
    }

    fn dispatch(&self, manifest: PacketManifest) {
        let key = manifest.flow.key();
        let tx = match self.pool.get(&key) {
            Ok(tx) => {
                self.pool.touch(&key, manifest.timestamp);
                tx
            }
            Err(_) => {
                let max = self.conntrack.max_connections;
                if max != 0 && self.pool.len() >= max {
                    log::debug!("connection table full, dropping new flow {}", manifest.flow);
                    return;
                }
                self.admit(key, &manifest)
            }
        };
        if tx.send(manifest).is_err() {
            log::debug!("connection worker exited before delivery");
        }
    }

    fn admit(&self, key: FlowId, manifest: &PacketManifest) -> Sender<PacketManifest> {
        let (tx, rx) = bounded(CONN_CHANNEL_SIZE);
        let packet_sink = match (&self.packet_sinks, self.log_packets) {
            (Some(factory), true) => Some(factory.as_ref()(&manifest.flow)),
            _ => None,
        };
        let options = ConnectionOptions {
            max_ring_pages: self.conntrack.max_ring_pages,
            buffered_per_connection: self.conntrack.buffered_per_connection,
            pager: Arc::clone(&self.pager),
            budget: Arc::clone(&self.budget),
            detector: Detector::new(&self.detect),
            attack_sink: Arc::clone(&self.attack_sink),
            packet_sink,
            close_tx: self.close_tx.clone(),
        };
        let connection = Connection::new(manifest.flow, manifest.timestamp, options);
        let worker = conn::spawn(connection, rx);
        self.pool.put(
            key,
            ConnectionHandle {
                tx: tx.clone(),
                last_seen: manifest.timestamp,
                worker: Some(worker),
            },
        );
        tx
    }
}
