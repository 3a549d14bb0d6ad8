use std::{
    net::SocketAddr,
    sync::{Arc, OnceLock},
};

use codec::crypto::CertificateHash;
use service::{peer::ServiceHandler, session::LossReason};
use tokio::sync::mpsc::UnboundedSender;

use crate::{
    server::Shared,
    statistics::{Statistics, Stats},
};

/// Engine events the server loop finishes asynchronously (the route
/// exchange kick-off).
#[derive(Debug)]
pub enum NodeEvent {
    Established(SocketAddr, Option<CertificateHash>),
}

/// The binary's event sink: logs, counters, relay port wiring.
///
/// Port registration happens right here, synchronously, so a peer's first
/// data message can never outrun its port; the `wiring` cell is filled in
/// once the server state exists.
#[derive(Clone)]
pub struct Observer {
    statistics: Statistics,
    events: UnboundedSender<NodeEvent>,
    wiring: Arc<OnceLock<Arc<Shared>>>,
}

impl Observer {
    pub(crate) fn new(
        statistics: Statistics,
        events: UnboundedSender<NodeEvent>,
        wiring: Arc<OnceLock<Arc<Shared>>>,
    ) -> Self {
        Self {
            statistics,
            events,
            wiring,
        }
    }
}

impl ServiceHandler for Observer {
    fn on_session_established(&self, endpoint: SocketAddr, hash: Option<CertificateHash>) {
        match &hash {
            Some(hash) => {
                log::info!("session established: peer={}, certificate={}", endpoint, hash)
            }
            None => log::info!("session established: peer={} (psk)", endpoint),
        }

        self.statistics.register(endpoint);
        if let Some(shared) = self.wiring.get() {
            shared.register_peer_port(endpoint);
        }

        let _ = self.events.send(NodeEvent::Established(endpoint, hash));
    }

    fn on_session_lost(&self, endpoint: SocketAddr, reason: LossReason) {
        log::info!("session lost: peer={}, reason={}", endpoint, reason);

        self.statistics.unregister(&endpoint);
        if let Some(shared) = self.wiring.get() {
            shared.remove_peer_state(endpoint);
        }
    }

    fn on_contact_learned(&self, hash: CertificateHash, endpoint: SocketAddr) {
        log::info!("contact learned: certificate={} at {}", hash, endpoint);
    }

    fn on_wire_error(&self, source: SocketAddr, error: &codec::Error) {
        log::trace!("wire error from {}: {}", source, error);
        self.statistics.add(Some(source), &[Stats::ErrorPkts(1)]);
    }
}
