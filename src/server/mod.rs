//! The running node: UDP workers, the virtual interface pump, the engine
//! clock and the session-lifecycle plumbing between them.

use std::{
    io::ErrorKind,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use ahash::AHashMap;
use anyhow::Result;
use bytes::Bytes;
use codec::{
    HEADER_LEN,
    routes::{self, IpRoute, RoutesExchange, RoutesMessage},
};
use parking_lot::{Mutex, RwLock};
use service::{
    RelayOptions, Service, ServiceOptions,
    net::IpNetwork,
    osi::Mac,
    peer::{FscpOptions, Output, PinnedKeyVerifier},
    proxy::{FilterAction, ProxyPipeline, arp::ArpProxy, dhcp::DhcpProxy, icmpv6::NeighborProxy},
    rate::AdmissionOptions,
    relay::{
        Port, PortGroup, PortIndex, PortWriter, WriteError,
        router::RouterOptions,
        switch::SwitchOptions,
    },
    routes::{AcceptedRoutes, RoutesOptions},
};
use tokio::{
    net::{UdpSocket, lookup_host},
    sync::mpsc::{self, Receiver, Sender, UnboundedReceiver, error::TrySendError},
    task::JoinHandle,
    time::{Duration, interval},
};

use crate::{
    config::{Config, Mode, parse_certificate_hash},
    observer::{NodeEvent, Observer},
    statistics::{Statistics, Stats},
    tap::{DnsInstaller, LoggingInstaller, RouteInstaller, VirtualInterface},
};

/// The virtual interface's port index; peers start above it.
pub const TAP_PORT: PortIndex = 0;

/// The data channel carrying relayed frames. Channel 1 is the route
/// exchange.
const DATA_CHANNEL: u8 = 0;

/// Capacity of the queue between the synchronous port writers and the UDP
/// socket.
const DATAGRAM_QUEUE_CAPACITY: usize = 1024;

/// A running node. Dropping the handle aborts every task.
pub struct NodeHandle {
    pub service: Arc<Service<Observer>>,
    pub statistics: Statistics,
    local_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
    /// The configured interface object; it only carries state once its
    /// channels are taken, but its lifetime is the device's lifetime.
    _interface: Option<Box<dyn VirtualInterface>>,
}

impl NodeHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Cancel every peer and stop all tasks.
    pub fn close(&self) {
        self.service.manager().close();
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for NodeHandle {
    fn drop(&mut self) {
        self.close();
    }
}

pub(crate) struct Shared {
    service: Arc<Service<Observer>>,
    socket: Arc<UdpSocket>,
    statistics: Statistics,
    /// Established peer endpoint -> relay port index.
    ports: RwLock<AHashMap<SocketAddr, PortIndex>>,
    next_port: AtomicUsize,
    /// Our own ROUTES announcement, answered to every ROUTES_REQUEST.
    announcement: RoutesMessage,
    /// What each peer currently has installed through the system
    /// installers, so losses and re-announcements can undo it.
    installed: Mutex<AHashMap<SocketAddr, AcceptedRoutes>>,
    route_installer: Arc<dyn RouteInstaller>,
    dns_installer: Arc<dyn DnsInstaller>,
    interface_name: String,
    /// Queue from the synchronous port writers towards the socket.
    datagrams: Sender<(SocketAddr, Bytes)>,
}

impl Shared {
    /// Drain engine outputs in order: transmit datagrams, relay
    /// deliveries. Handshake messages are order-sensitive, so this is a
    /// queue, not a stack.
    async fn drain(&self, outputs: Vec<Output>) {
        let mut outputs: std::collections::VecDeque<Output> = outputs.into();
        while let Some(output) = outputs.pop_front() {
            match output {
                Output::Transmit(destination, datagram) => {
                    self.statistics.add(
                        Some(destination),
                        &[Stats::SendBytes(datagram.len()), Stats::SendPkts(1)],
                    );

                    if let Err(error) = self.socket.send_to(&datagram, destination).await {
                        if error.kind() != ErrorKind::ConnectionReset {
                            log::warn!("udp send to {} failed: {}", destination, error);
                        }
                    }
                }
                Output::Deliver {
                    source,
                    channel,
                    payload,
                } => {
                    let mut produced = Vec::new();
                    self.deliver(source, channel, &payload, &mut produced);
                    outputs.extend(produced);
                }
            }
        }
    }

    fn deliver(
        &self,
        source: SocketAddr,
        channel: u8,
        payload: &[u8],
        outputs: &mut Vec<Output>,
    ) {
        match channel {
            DATA_CHANNEL => {
                let Some(port) = self.ports.read().get(&source).copied() else {
                    log::debug!("data from {} before its port registration", source);
                    return;
                };

                self.service.relay().write(port, payload);
            }
            routes::CHANNEL => self.handle_routes(source, payload, outputs),
            other => log::debug!("data on unassigned channel {} from {}", other, source),
        }
    }

    fn handle_routes(&self, source: SocketAddr, payload: &[u8], outputs: &mut Vec<Output>) {
        match RoutesExchange::decode(payload) {
            Ok(RoutesExchange::Request) => {
                let encoded = RoutesExchange::Routes(self.announcement.clone()).encode();
                if let Err(error) =
                    self.service
                        .manager()
                        .send_data(source, routes::CHANNEL, &encoded, outputs)
                {
                    log::debug!("routes answer towards {} failed: {}", source, error);
                }
            }
            Ok(RoutesExchange::Routes(message)) => {
                let Some(accepted) = self.service.accept_routes(source, &message) else {
                    return;
                };

                log::info!(
                    "routes v{} from {}: {} routes, {} dns servers accepted",
                    accepted.version,
                    source,
                    accepted.routes.len(),
                    accepted.dns_servers.len()
                );

                if let Some(port) = self.ports.read().get(&source).copied() {
                    let networks: Vec<IpNetwork> = accepted
                        .routes
                        .iter()
                        .filter_map(|route| IpNetwork::new(route.network, route.prefix_len))
                        .collect();

                    self.service.relay().set_port_routes(port, &networks);
                }

                self.apply_system_state(source, accepted);
            }
            Err(error) => {
                log::debug!("undecodable routes payload from {}: {}", source, error)
            }
        }
    }

    /// Diff a peer's newly accepted announcement against what it had
    /// installed before and drive the system installers accordingly.
    fn apply_system_state(&self, source: SocketAddr, accepted: AcceptedRoutes) {
        let previous = self.installed.lock().insert(source, accepted.clone());

        let (old_routes, old_dns): (Vec<IpRoute>, Vec<std::net::IpAddr>) = previous
            .map(|it| (it.system_routes, it.dns_servers))
            .unwrap_or_default();

        for route in old_routes
            .iter()
            .filter(|route| !accepted.system_routes.contains(route))
        {
            self.route_installer.uninstall(route);
        }
        for route in accepted
            .system_routes
            .iter()
            .filter(|route| !old_routes.contains(route))
        {
            self.route_installer.install(route);
        }

        for server in old_dns
            .iter()
            .filter(|server| !accepted.dns_servers.contains(server))
        {
            self.dns_installer.remove(&self.interface_name, *server);
        }
        for server in accepted
            .dns_servers
            .iter()
            .filter(|server| !old_dns.contains(server))
        {
            self.dns_installer.add(&self.interface_name, *server);
        }
    }

    /// Give an established peer a relay port. Idempotent: a renewal
    /// re-announces an endpoint that already has one.
    pub(crate) fn register_peer_port(self: &Arc<Self>, endpoint: SocketAddr) {
        let index = {
            let mut ports = self.ports.write();
            if ports.contains_key(&endpoint) {
                return;
            }

            let index = self.next_port.fetch_add(1, Ordering::Relaxed);
            ports.insert(endpoint, index);
            index
        };

        let writer = PeerPortWriter {
            manager: self.service.manager().clone(),
            datagrams: self.datagrams.clone(),
            endpoint,
        };
        self.service
            .relay()
            .register_port(index, Port::new(Arc::new(writer), PortGroup::Peer), &[]);
    }

    pub(crate) fn remove_peer_state(&self, endpoint: SocketAddr) {
        if let Some(index) = self.ports.write().remove(&endpoint) {
            self.service.relay().unregister_port(index);
        }

        self.service.forget_peer_routes(endpoint);

        if let Some(stale) = self.installed.lock().remove(&endpoint) {
            for route in &stale.system_routes {
                self.route_installer.uninstall(route);
            }
            for server in &stale.dns_servers {
                self.dns_installer.remove(&self.interface_name, *server);
            }
        }
    }
}

/// The write half of a peer port: seal the frame onto the peer's data
/// channel and queue the datagram without blocking the relay.
struct PeerPortWriter {
    manager: Arc<service::peer::PeerManager<Observer>>,
    datagrams: Sender<(SocketAddr, Bytes)>,
    endpoint: SocketAddr,
}

impl PortWriter for PeerPortWriter {
    fn write(&self, frame: &[u8]) -> Result<(), WriteError> {
        let mut outputs = Vec::with_capacity(1);
        self.manager
            .send_data(self.endpoint, DATA_CHANNEL, frame, &mut outputs)
            .map_err(|_| WriteError::Closed)?;

        for output in outputs {
            if let Output::Transmit(destination, datagram) = output {
                self.datagrams
                    .try_send((destination, datagram))
                    .map_err(|error| match error {
                        TrySendError::Full(_) => WriteError::QueueFull,
                        TrySendError::Closed(_) => WriteError::Closed,
                    })?;
            }
        }

        Ok(())
    }
}

/// The write half of the TAP port: clamp inbound TCP SYNs and queue the
/// frame towards the device.
struct TapPortWriter {
    to_device: Sender<Vec<u8>>,
    max_mss: Option<u16>,
    layer2: bool,
}

impl PortWriter for TapPortWriter {
    fn write(&self, frame: &[u8]) -> Result<(), WriteError> {
        let mut frame = frame.to_vec();
        if let Some(max_mss) = self.max_mss {
            let at = if self.layer2 {
                service::osi::EthernetFrame::HEADER_LEN.min(frame.len())
            } else {
                0
            };
            service::proxy::mss::clamp(&mut frame[at..], max_mss);
        }

        self.to_device.try_send(frame).map_err(|error| match error {
            TrySendError::Full(_) => WriteError::QueueFull,
            TrySendError::Closed(_) => WriteError::Closed,
        })
    }
}

/// Build the node and spawn every task.
pub async fn run(
    config: Arc<Config>,
    statistics: Statistics,
    interface: Option<Box<dyn VirtualInterface>>,
) -> Result<NodeHandle> {
    let (events_sender, events) = mpsc::unbounded_channel();
    let wiring = Arc::new(std::sync::OnceLock::new());
    let observer = Observer::new(statistics.clone(), events_sender, wiring.clone());

    let layer2 = config.relay.mode == Mode::Switch;
    let local_networks = local_networks(&config);

    let service = Service::new(ServiceOptions {
        identity: crate::load_identity(&config.security)?,
        verifier: Arc::new(build_verifier(&config.security)?),
        fscp: FscpOptions {
            hello_timeout_secs: config.timers.hello_timeout,
            contact_period_secs: config.timers.contact_period,
            keep_alive_period_secs: config.timers.keep_alive_period,
            idle_timeout_secs: config.timers.idle_timeout,
            renew_period_secs: config.timers.renew_period,
            accept_contact_requests: config.security.accept_contact_requests,
            accept_contacts: config.security.accept_contacts,
            admission: AdmissionOptions {
                max_unauthenticated_messages_per_second: config
                    .security
                    .max_unauthenticated_messages_per_second,
                never_contact: config.security.never_contact.clone(),
            },
            ..FscpOptions::default()
        },
        relay: if layer2 {
            RelayOptions::Switch(SwitchOptions {
                routing_method: config.relay.routing_method,
                relay_mode_enabled: config.relay.relay_mode_enabled,
                max_entries: config.relay.max_switch_entries,
            })
        } else {
            RelayOptions::Router(RouterOptions {
                relay_mode_enabled: config.relay.relay_mode_enabled,
            })
        },
        routes: RoutesOptions {
            accept_routes: config.routes.accept_routes,
            system_route_scope: config.routes.system_route_scope,
            dns_scope: config.routes.dns_scope,
            maximum_routes_limit: config.routes.maximum_routes_limit,
            local_networks: local_networks.clone(),
        },
        handler: observer,
    })
    .map_err(|error| anyhow::anyhow!("service construction failed: {}", error))?;

    let socket = Arc::new(UdpSocket::bind(config.node.listen).await?);
    let local_addr = socket.local_addr()?;

    let (datagrams_sender, datagrams) = mpsc::channel(DATAGRAM_QUEUE_CAPACITY);
    let shared = Arc::new(Shared {
        service: service.clone(),
        socket: socket.clone(),
        statistics: statistics.clone(),
        ports: RwLock::new(AHashMap::with_capacity(64)),
        next_port: AtomicUsize::new(TAP_PORT + 1),
        announcement: RoutesMessage {
            version: 1,
            routes: config
                .routes
                .local_ip_routes
                .iter()
                .map(|network| IpRoute::new(network.address(), network.prefix_len()))
                .collect(),
            dns_servers: config.routes.local_dns_servers.clone(),
        },
        installed: Mutex::new(AHashMap::with_capacity(64)),
        route_installer: Arc::new(LoggingInstaller),
        dns_installer: Arc::new(LoggingInstaller),
        interface_name: config.tap.name.clone(),
        datagrams: datagrams_sender,
    });

    // From here on the observer wires ports itself.
    let _ = wiring.set(shared.clone());

    let mut tasks = Vec::new();
    let mut kept_interface = None;

    // The queue between the synchronous port writers and the socket.
    tasks.push(tokio::spawn(forward_datagrams(shared.clone(), datagrams)));

    for _ in 0..config.node.threads.max(1) {
        tasks.push(tokio::spawn(fork_socket(shared.clone())));
    }

    tasks.push(tokio::spawn(handle_events(shared.clone(), events)));
    tasks.push(tokio::spawn(drive_clock(shared.clone(), config.clone())));
    tasks.push(tokio::spawn(resolve_contacts(shared.clone(), config.clone())));

    if let Some(mut interface) = interface {
        interface.set_mtu(config.effective_mtu())?;
        if let Some(network) = config.tap.ipv4 {
            interface.set_ipv4(network)?;
        }
        if let Some(network) = config.tap.ipv6 {
            interface.set_ipv6(network)?;
        }
        interface.set_connected(true)?;

        let (from_device, to_device) = interface.channels();
        let max_mss = config.tap.max_mss.or_else(|| {
            // Clamp to the tunnel MTU by default: MSS = MTU - IP - TCP.
            Some(config.effective_mtu().saturating_sub(40))
        });

        // The interface owns a host entry per configured address plus the
        // locally announced routes, which are reachable through it.
        let tap_routes: Vec<IpNetwork> = local_networks
            .iter()
            .filter_map(host_network)
            .chain(config.routes.local_ip_routes.iter().copied())
            .collect();

        shared.service.relay().register_port(
            TAP_PORT,
            Port::new(
                Arc::new(TapPortWriter {
                    to_device: to_device.clone(),
                    max_mss,
                    layer2,
                }),
                PortGroup::Tap,
            ),
            &tap_routes,
        );

        let pipeline = build_pipeline(&config, layer2)?;
        tasks.push(tokio::spawn(pump_interface(
            shared.clone(),
            from_device,
            to_device,
            pipeline,
        )));

        kept_interface = Some(interface);
    } else {
        log::warn!("no virtual interface: running as a pure relay node");
    }

    for hash in &config.node.wanted_contacts {
        service.manager().add_wanted_contact(parse_certificate_hash(hash)?);
    }

    log::info!("fscp node workers: {}", config.node.threads.max(1));
    log::info!("fscp node listening: {}", local_addr);

    Ok(NodeHandle {
        service,
        statistics,
        local_addr,
        tasks,
        _interface: kept_interface,
    })
}

fn local_networks(config: &Config) -> Vec<IpNetwork> {
    config
        .tap
        .ipv4
        .iter()
        .chain(config.tap.ipv6.iter())
        .copied()
        .collect()
}

/// The host entry (`/32` or `/128`) of an interface network.
fn host_network(network: &IpNetwork) -> Option<IpNetwork> {
    let prefix_len = if network.is_ipv4() { 32 } else { 128 };
    IpNetwork::new(network.address(), prefix_len)
}

fn build_verifier(security: &crate::config::Security) -> Result<PinnedKeyVerifier> {
    if security.trusted_certificates.is_empty() {
        if security.pre_shared_key.is_none() {
            log::warn!(
                "no trusted certificates pinned and no PSK: any presented certificate is accepted"
            );
        }

        return Ok(PinnedKeyVerifier::accept_any());
    }

    let mut keys = Vec::new();
    for path in &security.trusted_certificates {
        keys.push(std::fs::read(path)?);
    }

    Ok(PinnedKeyVerifier::pinned(keys))
}

fn build_pipeline(config: &Config, layer2: bool) -> Result<ProxyPipeline> {
    let mut pipeline = ProxyPipeline::disabled(layer2);
    pipeline.max_mss = config
        .tap
        .max_mss
        .or_else(|| Some(config.effective_mtu().saturating_sub(40)));

    let fake_mac: Mac = config.proxy_fake_mac()?;

    if layer2 && config.tap.arp_proxy_enabled {
        let own = config
            .tap
            .ipv4
            .iter()
            .filter_map(|network| match network.address() {
                std::net::IpAddr::V4(address) => Some(address),
                _ => None,
            })
            .collect();

        pipeline.arp = Some(ArpProxy::new(fake_mac, own));
    }

    if layer2 && config.tap.dhcp_proxy_enabled {
        if let Some(std::net::IpAddr::V4(server)) = config.tap.ipv4.map(|it| it.address()) {
            pipeline.dhcp = Some(DhcpProxy::new(fake_mac, server));
        }
    }

    if config.tap.icmpv6_proxy_enabled {
        let own = config
            .tap
            .ipv6
            .iter()
            .filter_map(|network| match network.address() {
                std::net::IpAddr::V6(address) => Some(address),
                _ => None,
            })
            .collect();

        pipeline.neighbor = Some(NeighborProxy::new(fake_mac, own));
    }

    Ok(pipeline)
}

/// udp socket worker.
///
/// Reads datagrams from the shared socket, hands them to the engine and
/// drains whatever the engine wants sent or delivered.
async fn fork_socket(shared: Arc<Shared>) {
    let mut buf = vec![0u8; 4096];

    loop {
        // Windows reports a previous send to a dead peer as an error on
        // the next receive; that is not fatal for the socket.
        let (size, source) = match shared.socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(error) => {
                if error.kind() == ErrorKind::ConnectionReset {
                    continue;
                }

                log::error!("udp socket receive failed: {}", error);
                return;
            }
        };

        shared.statistics.add(
            Some(source),
            &[Stats::ReceivedBytes(size), Stats::ReceivedPkts(1)],
        );
        log::trace!("udp socket receive: size={}, addr={:?}", size, source);

        if size < HEADER_LEN {
            shared.statistics.add(Some(source), &[Stats::ErrorPkts(1)]);
            continue;
        }

        let mut outputs = Vec::new();
        shared
            .service
            .manager()
            .process(&buf[..size], source, &mut outputs);
        shared.drain(outputs).await;
    }
}

async fn forward_datagrams(shared: Arc<Shared>, mut datagrams: Receiver<(SocketAddr, Bytes)>) {
    while let Some((destination, datagram)) = datagrams.recv().await {
        shared.statistics.add(
            Some(destination),
            &[Stats::SendBytes(datagram.len()), Stats::SendPkts(1)],
        );

        if let Err(error) = shared.socket.send_to(&datagram, destination).await {
            if error.kind() != ErrorKind::ConnectionReset {
                log::warn!("udp send to {} failed: {}", destination, error);
            }
        }
    }
}

/// Kick off the route exchange with freshly established peers. Port
/// wiring itself happens synchronously in the observer; only the sealed
/// messages need an async context.
async fn handle_events(shared: Arc<Shared>, mut events: UnboundedReceiver<NodeEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            NodeEvent::Established(endpoint, _) => {
                // Ask for the peer's routes and volunteer ours.
                let mut outputs = Vec::new();
                let request = RoutesExchange::Request.encode();
                if let Err(error) = shared.service.manager().send_data(
                    endpoint,
                    routes::CHANNEL,
                    &request,
                    &mut outputs,
                ) {
                    log::debug!("routes request towards {} failed: {}", endpoint, error);
                }

                let announcement =
                    RoutesExchange::Routes(shared.announcement.clone()).encode();
                if let Err(error) = shared.service.manager().send_data(
                    endpoint,
                    routes::CHANNEL,
                    &announcement,
                    &mut outputs,
                ) {
                    log::debug!("routes announce towards {} failed: {}", endpoint, error);
                }

                shared.drain(outputs).await;
            }
        }
    }
}

/// Advance the engine clock once a second and run the periodic
/// ROUTES_REQUEST round.
async fn drive_clock(shared: Arc<Shared>, config: Arc<Config>) {
    let mut clock = interval(Duration::from_secs(1));
    let mut seconds = 0u64;

    loop {
        clock.tick().await;
        seconds += 1;

        let mut outputs = Vec::new();
        shared.service.manager().tick(&mut outputs);

        if seconds % config.timers.routes_request_period.max(1) == 0 {
            let request = RoutesExchange::Request.encode();
            for endpoint in shared.service.manager().established_peers() {
                let _ = shared.service.manager().send_data(
                    endpoint,
                    routes::CHANNEL,
                    &request,
                    &mut outputs,
                );
            }
        }

        shared.drain(outputs).await;
    }
}

/// Resolve the statically configured contacts, now and on every contact
/// period; greeting is idempotent for peers that already hold a session.
async fn resolve_contacts(shared: Arc<Shared>, config: Arc<Config>) {
    let mut clock = interval(Duration::from_secs(config.timers.contact_period.max(1)));

    loop {
        clock.tick().await;

        let mut outputs = Vec::new();
        for contact in &config.node.contacts {
            match lookup_host(contact).await {
                Ok(mut addresses) => {
                    if let Some(address) = addresses.next() {
                        shared
                            .service
                            .manager()
                            .add_static_peer(address, &mut outputs);
                    }
                }
                Err(error) => log::warn!("cannot resolve contact {}: {}", contact, error),
            }
        }

        shared.drain(outputs).await;
    }
}

/// Pump the virtual interface: frames it produces go through the filter
/// pipeline and into the relay.
async fn pump_interface(
    shared: Arc<Shared>,
    mut from_device: Receiver<Vec<u8>>,
    to_device: Sender<Vec<u8>>,
    mut pipeline: ProxyPipeline,
) {
    while let Some(mut frame) = from_device.recv().await {
        match pipeline.process_outbound(&mut frame) {
            FilterAction::Reply(reply) => {
                if to_device.try_send(reply).is_err() {
                    log::debug!("interface write queue full, dropping proxy reply");
                }
            }
            FilterAction::Pass => {
                shared.service.relay().write(TAP_PORT, &frame);
            }
        }
    }
}
