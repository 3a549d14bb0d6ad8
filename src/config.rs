use std::{fs::read_to_string, net::SocketAddr, str::FromStr};

use anyhow::Result;
use clap::Parser;
use serde::{Deserialize, Serialize};

use service::{
    net::IpNetwork,
    relay::switch::RoutingMethod,
    routes::{DnsScope, RouteAcceptancePolicy, SystemRouteScope},
};

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Node {
    ///
    /// The address and port the UDP server binds. IPv4 and IPv6 are both
    /// supported.
    ///
    #[serde(default = "Node::listen")]
    pub listen: SocketAddr,
    ///
    /// Number of UDP worker tasks. UDP receive is a syscall-level
    /// concurrency-safe operation, so more workers than cores rarely
    /// helps; the default is the core count.
    ///
    #[serde(default = "num_cpus::get")]
    pub threads: usize,
    ///
    /// Statically configured peers, as `host:port`. Hostnames are
    /// resolved at startup and again on every contact period.
    ///
    #[serde(default)]
    pub contacts: Vec<String>,
    ///
    /// Base64 encoded certificate hashes of peers to locate through the
    /// mesh's contact exchange.
    ///
    #[serde(default)]
    pub wanted_contacts: Vec<String>,
}

impl Node {
    fn listen() -> SocketAddr {
        "0.0.0.0:12000".parse().unwrap()
    }
}

impl Default for Node {
    fn default() -> Self {
        Self {
            listen: Self::listen(),
            threads: num_cpus::get(),
            contacts: Vec::new(),
            wanted_contacts: Vec::new(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Security {
    ///
    /// DER encoded signature certificate, presented to every peer.
    ///
    #[serde(default)]
    pub certificate_file: Option<String>,
    ///
    /// PKCS#8 DER encoded ECDSA P-256 private key matching the
    /// certificate.
    ///
    #[serde(default)]
    pub private_key_file: Option<String>,
    ///
    /// Pre-shared key. May be combined with a certificate; at least one
    /// of the two must be present unless `allow-generated-identity` is
    /// set.
    ///
    #[serde(default)]
    pub pre_shared_key: Option<String>,
    ///
    /// Run with a generated throwaway identity when nothing else is
    /// configured. Peers have no way to recognize this node across
    /// restarts; never enable it outside experiments.
    ///
    #[serde(default)]
    pub allow_generated_identity: bool,
    ///
    /// DER encoded certificates (raw public key blobs for the built-in
    /// verifier) this node trusts. Empty means every presented
    /// certificate is accepted, which is only sane behind a PSK.
    ///
    #[serde(default)]
    pub trusted_certificates: Vec<String>,
    ///
    /// Prefixes that are never greeted and whose greetings are ignored.
    ///
    #[serde(default)]
    pub never_contact: Vec<IpNetwork>,
    ///
    /// Token bucket rate for unauthenticated messages, per source
    /// address and message class.
    ///
    #[serde(default = "Security::max_unauthenticated_messages_per_second")]
    pub max_unauthenticated_messages_per_second: u32,
    ///
    /// Answer CONTACT_REQUESTs from peers.
    ///
    #[serde(default = "Security::yes")]
    pub accept_contact_requests: bool,
    ///
    /// Act on CONTACT introductions from peers.
    ///
    #[serde(default = "Security::yes")]
    pub accept_contacts: bool,
}

impl Security {
    fn max_unauthenticated_messages_per_second() -> u32 {
        50
    }

    fn yes() -> bool {
        true
    }
}

impl Default for Security {
    fn default() -> Self {
        Self {
            certificate_file: None,
            private_key_file: None,
            pre_shared_key: None,
            allow_generated_identity: false,
            trusted_certificates: Vec::new(),
            never_contact: Vec::new(),
            max_unauthenticated_messages_per_second:
                Self::max_unauthenticated_messages_per_second(),
            accept_contact_requests: Self::yes(),
            accept_contacts: Self::yes(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Timers {
    ///
    /// Seconds before an unanswered HELLO is retried.
    ///
    #[serde(default = "Timers::hello_timeout")]
    pub hello_timeout: u64,
    ///
    /// Cadence of the contact machinery: static peer greetings and
    /// wanted-contact requests.
    ///
    #[serde(default = "Timers::contact_period")]
    pub contact_period: u64,
    #[serde(default = "Timers::keep_alive_period")]
    pub keep_alive_period: u64,
    ///
    /// Seconds of silence before a peer session is torn down.
    ///
    #[serde(default = "Timers::idle_timeout")]
    pub idle_timeout: u64,
    ///
    /// Seconds before an established session is renewed regardless of
    /// traffic.
    ///
    #[serde(default = "Timers::renew_period")]
    pub renew_period: u64,
    ///
    /// Seconds between ROUTES_REQUESTs towards every established peer.
    ///
    #[serde(default = "Timers::routes_request_period")]
    pub routes_request_period: u64,
}

impl Timers {
    fn hello_timeout() -> u64 {
        3
    }

    fn contact_period() -> u64 {
        30
    }

    fn keep_alive_period() -> u64 {
        10
    }

    fn idle_timeout() -> u64 {
        90
    }

    fn renew_period() -> u64 {
        12 * 3600
    }

    fn routes_request_period() -> u64 {
        180
    }
}

impl Default for Timers {
    fn default() -> Self {
        Self {
            hello_timeout: Self::hello_timeout(),
            contact_period: Self::contact_period(),
            keep_alive_period: Self::keep_alive_period(),
            idle_timeout: Self::idle_timeout(),
            renew_period: Self::renew_period(),
            routes_request_period: Self::routes_request_period(),
        }
    }
}

///
/// Which relay the node runs between the virtual interface and the mesh.
///
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    /// Layer 2: Ethernet frames through a learning switch (TAP).
    #[default]
    Switch,
    /// Layer 3: IP packets through a longest-prefix-match router (TUN).
    Router,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Tap {
    ///
    /// Open a virtual interface at startup. Without one the node still
    /// relays between peers (subject to `relay-mode-enabled`).
    ///
    #[serde(default = "Tap::enabled")]
    pub enabled: bool,
    ///
    /// Interface name hint, passed to the platform driver.
    ///
    #[serde(default = "Tap::name")]
    pub name: String,
    #[serde(default)]
    pub ipv4: Option<IpNetwork>,
    #[serde(default)]
    pub ipv6: Option<IpNetwork>,
    ///
    /// Interface MTU. The default subtracts the FSCP and IP/UDP overhead
    /// from the usual 1500.
    ///
    #[serde(default)]
    pub mtu: Option<u16>,
    ///
    /// Answer ARP requests for foreign addresses with the fake hardware
    /// address below.
    ///
    #[serde(default)]
    pub arp_proxy_enabled: bool,
    ///
    /// Serve planned addresses over DHCP.
    ///
    #[serde(default)]
    pub dhcp_proxy_enabled: bool,
    ///
    /// Answer IPv6 neighbor solicitations for foreign addresses.
    ///
    #[serde(default)]
    pub icmpv6_proxy_enabled: bool,
    ///
    /// The hardware address the ARP and ICMPv6 proxies answer with.
    ///
    #[serde(default = "Tap::fake_mac")]
    pub proxy_fake_mac: String,
    ///
    /// Clamp the MSS of tunnelled TCP SYNs. Defaults to matching the
    /// interface MTU.
    ///
    #[serde(default)]
    pub max_mss: Option<u16>,
}

impl Tap {
    fn enabled() -> bool {
        true
    }

    fn name() -> String {
        "fscp0".to_string()
    }

    fn fake_mac() -> String {
        "0a:00:27:00:00:01".to_string()
    }
}

impl Default for Tap {
    fn default() -> Self {
        Self {
            enabled: Self::enabled(),
            name: Self::name(),
            ipv4: None,
            ipv6: None,
            mtu: None,
            arp_proxy_enabled: false,
            dhcp_proxy_enabled: false,
            icmpv6_proxy_enabled: false,
            proxy_fake_mac: Self::fake_mac(),
            max_mss: None,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Relay {
    #[serde(default)]
    pub mode: Mode,
    ///
    /// Switch mode only: learn addresses or flood everything.
    ///
    #[serde(default)]
    pub routing_method: RoutingMethod,
    ///
    /// Allow forwarding between two peers. Off by default to prevent
    /// loops; enable it on deliberate relay nodes only.
    ///
    #[serde(default)]
    pub relay_mode_enabled: bool,
    ///
    /// Switch mode only: bound of the MAC learning table.
    ///
    #[serde(default = "Relay::max_switch_entries")]
    pub max_switch_entries: usize,
}

impl Relay {
    fn max_switch_entries() -> usize {
        1024
    }
}

impl Default for Relay {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            routing_method: RoutingMethod::default(),
            relay_mode_enabled: false,
            max_switch_entries: Self::max_switch_entries(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Routes {
    ///
    /// Routes announced to every peer (router mode).
    ///
    #[serde(default)]
    pub local_ip_routes: Vec<IpNetwork>,
    ///
    /// DNS servers announced to every peer.
    ///
    #[serde(default)]
    pub local_dns_servers: Vec<std::net::IpAddr>,
    #[serde(default)]
    pub accept_routes: RouteAcceptancePolicy,
    #[serde(default)]
    pub system_route_scope: SystemRouteScope,
    #[serde(default)]
    pub dns_scope: DnsScope,
    #[serde(default = "Routes::maximum_routes_limit")]
    pub maximum_routes_limit: usize,
}

impl Routes {
    fn maximum_routes_limit() -> usize {
        256
    }
}

impl Default for Routes {
    fn default() -> Self {
        Self {
            local_ip_routes: Vec::new(),
            local_dns_servers: Vec::new(),
            accept_routes: RouteAcceptancePolicy::default(),
            system_route_scope: SystemRouteScope::default(),
            dns_scope: DnsScope::default(),
            maximum_routes_limit: Self::maximum_routes_limit(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
pub struct Log {
    ///
    /// Verbosity of the logger.
    ///
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub node: Node,
    #[serde(default)]
    pub security: Security,
    #[serde(default)]
    pub timers: Timers,
    #[serde(default)]
    pub tap: Tap,
    #[serde(default)]
    pub relay: Relay,
    #[serde(default)]
    pub routes: Routes,
    #[serde(default)]
    pub log: Log,
}

#[derive(Parser)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    /// Path of the configuration file (JSON5).
    #[arg(long)]
    config: Option<String>,
}

impl Config {
    /// Load command line parameters; when a configuration file path is
    /// given the configuration is read from it, otherwise every default
    /// applies.
    pub fn load() -> Result<Self> {
        Self::from_args(Cli::parse())
    }

    fn from_args(cli: Cli) -> Result<Self> {
        Ok(match cli.config {
            Some(path) => serde_json5::from_str(&read_to_string(&path)?)?,
            None => Self::default(),
        })
    }

    /// The interface MTU: the explicit setting, or 1500 minus the FSCP
    /// framing (header, sequence number, AEAD tag) and IPv4/UDP overhead.
    pub fn effective_mtu(&self) -> u16 {
        self.tap.mtu.unwrap_or(1500 - 4 - 4 - 16 - 20 - 8)
    }

    /// The hardware address used by the ARP and ICMPv6 proxies.
    pub fn proxy_fake_mac(&self) -> Result<service::osi::Mac> {
        parse_mac(&self.tap.proxy_fake_mac)
    }
}

fn parse_mac(value: &str) -> Result<service::osi::Mac> {
    let mut bytes = [0u8; 6];
    let mut parts = value.split(':');

    for byte in &mut bytes {
        let part = parts
            .next()
            .ok_or_else(|| anyhow::anyhow!("invalid hardware address: {}", value))?;
        *byte = u8::from_str_radix(part, 16)?;
    }

    if parts.next().is_some() {
        anyhow::bail!("invalid hardware address: {}", value);
    }

    Ok(service::osi::Mac(bytes))
}

/// Decode a base64 certificate hash from the configuration.
pub fn parse_certificate_hash(value: &str) -> Result<codec::crypto::CertificateHash> {
    use base64::Engine;

    let bytes = base64::engine::general_purpose::STANDARD.decode(value)?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("certificate hashes are 32 bytes"))?;

    Ok(codec::crypto::CertificateHash(bytes))
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        Ok(serde_json5::from_str(value)?)
    }
}
