//! The FSCP node core: peer sessions over UDP plus the layer 2/3 relay
//! fabric between the local virtual interface and the mesh.
//!
//! The crate performs no I/O of its own. The embedding server feeds
//! received datagrams into [`peer::PeerManager::process`], drains the
//! produced [`peer::Output`]s into its socket, pumps the virtual interface
//! through the [`relay::Relay`] and calls [`peer::PeerManager::tick`] once
//! a second.

pub mod net;
pub mod osi;
pub mod peer;
pub mod proxy;
pub mod rate;
pub mod relay;
pub mod routes;
pub mod session;

use std::{net::SocketAddr, sync::Arc};

use codec::{Error, routes::RoutesMessage};
use parking_lot::Mutex;

use self::{
    peer::{CertificateVerifier, FscpOptions, IdentityStore, PeerManager, PeerManagerOptions,
        ServiceHandler},
    relay::{
        MultiWriteResult, Port, PortIndex,
        router::{Router, RouterOptions},
        switch::{Switch, SwitchOptions},
    },
    routes::{AcceptedRoutes, RoutesDirectory, RoutesOptions},
};

/// Which relay flavor the node runs.
pub enum RelayOptions {
    /// Layer 2: a learning Ethernet switch (TAP mode).
    Switch(SwitchOptions),
    /// Layer 3: longest-prefix-match IP routing (TUN mode).
    Router(RouterOptions),
}

/// The configured relay, behind a lock because the switch learns while
/// forwarding.
pub enum Relay {
    Switch(Mutex<Switch>),
    Router(Mutex<Router>),
}

impl Relay {
    pub fn register_port(&self, index: PortIndex, port: Port, local: &[net::IpNetwork]) {
        match self {
            Self::Switch(switch) => switch.lock().register_port(index, port),
            Self::Router(router) => router.lock().register_port(index, port, local),
        }
    }

    pub fn unregister_port(&self, index: PortIndex) {
        match self {
            Self::Switch(switch) => switch.lock().unregister_port(index),
            Self::Router(router) => router.lock().unregister_port(index),
        }
    }

    /// Relay one frame (or packet) arriving on `from`.
    pub fn write(&self, from: PortIndex, frame: &[u8]) -> MultiWriteResult {
        match self {
            Self::Switch(switch) => switch.lock().write(from, frame),
            Self::Router(router) => router.lock().write(from, frame),
        }
    }

    /// Install the route set a port announced; meaningless (and ignored)
    /// in switch mode.
    pub fn set_port_routes(&self, index: PortIndex, routes: &[net::IpNetwork]) {
        if let Self::Router(router) = self {
            router.lock().set_port_routes(index, routes);
        }
    }
}

pub struct ServiceOptions<T> {
    pub identity: IdentityStore,
    pub verifier: Arc<dyn CertificateVerifier>,
    pub fscp: FscpOptions,
    pub relay: RelayOptions,
    pub routes: RoutesOptions,
    pub handler: T,
}

/// The assembled core: the FSCP engine, the relay and the route
/// distribution state.
pub struct Service<T> {
    manager: Arc<PeerManager<T>>,
    relay: Relay,
    routes: Mutex<RoutesDirectory>,
}

impl<T> Service<T>
where
    T: ServiceHandler,
{
    pub fn new(options: ServiceOptions<T>) -> Result<Arc<Self>, Error> {
        Ok(Arc::new(Self {
            manager: PeerManager::new(PeerManagerOptions {
                identity: options.identity,
                verifier: options.verifier,
                fscp: options.fscp,
                handler: options.handler,
            })?,
            relay: match options.relay {
                RelayOptions::Switch(options) => Relay::Switch(Mutex::new(Switch::new(options))),
                RelayOptions::Router(options) => Relay::Router(Mutex::new(Router::new(options))),
            },
            routes: Mutex::new(RoutesDirectory::new(options.routes)),
        }))
    }

    pub fn manager(&self) -> &Arc<PeerManager<T>> {
        &self.manager
    }

    pub fn relay(&self) -> &Relay {
        &self.relay
    }

    /// Run a peer's ROUTES announcement through the acceptance filters.
    pub fn accept_routes(
        &self,
        peer: SocketAddr,
        message: &RoutesMessage,
    ) -> Option<AcceptedRoutes> {
        self.routes.lock().accept(peer, message)
    }

    /// A peer disconnected: its next announcement starts a new version
    /// history.
    pub fn forget_peer_routes(&self, peer: SocketAddr) {
        self.routes.lock().forget_peer(peer);
    }
}
