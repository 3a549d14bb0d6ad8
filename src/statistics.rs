use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use ahash::AHashMap;
use parking_lot::RwLock;
use std::net::SocketAddr;

/// The type of information passed into the statistics channel.
#[derive(Debug, Clone, Copy)]
pub enum Stats {
    ReceivedBytes(usize),
    SendBytes(usize),
    ReceivedPkts(usize),
    SendPkts(usize),
    ErrorPkts(usize),
}

pub trait Number {
    fn add(&self, value: usize);
    fn get(&self) -> usize;
}

#[derive(Default)]
pub struct Count(AtomicUsize);

impl Number for Count {
    fn add(&self, value: usize) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

/// Worker independent statistics counters.
#[derive(Default)]
pub struct Counts<T> {
    pub received_bytes: T,
    pub send_bytes: T,
    pub received_pkts: T,
    pub send_pkts: T,
    pub error_pkts: T,
}

impl<T: Number> Counts<T> {
    pub fn add(&self, payload: &Stats) {
        match payload {
            Stats::ReceivedBytes(v) => self.received_bytes.add(*v),
            Stats::ReceivedPkts(v) => self.received_pkts.add(*v),
            Stats::SendBytes(v) => self.send_bytes.add(*v),
            Stats::SendPkts(v) => self.send_pkts.add(*v),
            Stats::ErrorPkts(v) => self.error_pkts.add(*v),
        }
    }
}

/// Node-wide totals plus a per-peer breakdown for the peers currently on
/// watch.
///
/// # Example
///
/// ```
/// use fscp_node::statistics::{Number, Statistics, Stats};
///
/// let statistics = Statistics::default();
/// let peer = "127.0.0.1:12001".parse().unwrap();
///
/// statistics.register(peer);
/// statistics.add(Some(peer), &[Stats::ReceivedBytes(100), Stats::ReceivedPkts(1)]);
///
/// assert_eq!(statistics.total().received_bytes.get(), 100);
/// assert_eq!(statistics.peer(&peer).unwrap().received_pkts, 1);
/// ```
#[derive(Clone, Default)]
pub struct Statistics {
    total: Arc<Counts<Count>>,
    peers: Arc<RwLock<AHashMap<SocketAddr, Counts<Count>>>>,
}

/// A plain-number snapshot of one peer's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerStats {
    pub received_bytes: usize,
    pub send_bytes: usize,
    pub received_pkts: usize,
    pub send_pkts: usize,
    pub error_pkts: usize,
}

impl Statistics {
    /// Start tracking a peer.
    pub fn register(&self, peer: SocketAddr) {
        self.peers.write().insert(peer, Counts::default());
    }

    /// Stop tracking a peer and drop its counters.
    pub fn unregister(&self, peer: &SocketAddr) {
        self.peers.write().remove(peer);
    }

    /// Record events against the totals and, when given, a tracked peer.
    pub fn add(&self, peer: Option<SocketAddr>, payloads: &[Stats]) {
        for payload in payloads {
            self.total.add(payload);
        }

        if let Some(peer) = peer {
            if let Some(counts) = self.peers.read().get(&peer) {
                for payload in payloads {
                    counts.add(payload);
                }
            }
        }
    }

    pub fn total(&self) -> &Counts<Count> {
        &self.total
    }

    pub fn peer(&self, peer: &SocketAddr) -> Option<PeerStats> {
        self.peers.read().get(peer).map(|counts| PeerStats {
            received_bytes: counts.received_bytes.get(),
            send_bytes: counts.send_bytes.get(),
            received_pkts: counts.received_pkts.get(),
            send_pkts: counts.send_pkts.get(),
            error_pkts: counts.error_pkts.get(),
        })
    }
}
