//! The virtual interface seam and the system installer seams.
//!
//! The kernel driver itself is not part of this crate: platform code (or a
//! test) hands the server something implementing [`VirtualInterface`] and
//! the server pumps frames between it and the relay. Frames are raw
//! Ethernet in switch mode and raw IP in router mode.

use std::io;

use service::net::IpNetwork;
use tokio::sync::mpsc::{Receiver, Sender, channel};

use codec::routes::IpRoute;

/// Capacity of the write queue towards the device. When it is full frames
/// are dropped instead of blocking the relay.
pub const WRITE_QUEUE_CAPACITY: usize = 64;

/// A TAP (layer 2) or TUN (layer 3) device.
pub trait VirtualInterface: Send {
    fn set_mtu(&mut self, mtu: u16) -> io::Result<()>;
    fn set_ipv4(&mut self, network: IpNetwork) -> io::Result<()>;
    fn set_ipv6(&mut self, network: IpNetwork) -> io::Result<()>;
    fn set_connected(&mut self, connected: bool) -> io::Result<()>;

    /// Hand over the frame channels: frames read from the device and the
    /// bounded sink of frames to write to it. Called exactly once, after
    /// the interface is configured.
    fn channels(&mut self) -> (Receiver<Vec<u8>>, Sender<Vec<u8>>);

    fn close(&mut self) {}
}

/// An in-memory interface: what the driver would exchange with the kernel
/// is exchanged with the holder of the [`MemoryInterfaceHandle`] instead.
/// This is what the integration tests run on.
pub struct MemoryInterface {
    channels: Option<(Receiver<Vec<u8>>, Sender<Vec<u8>>)>,
    pub mtu: u16,
    pub ipv4: Option<IpNetwork>,
    pub ipv6: Option<IpNetwork>,
    pub connected: bool,
}

pub struct MemoryInterfaceHandle {
    /// Push a frame as if the kernel had written it to the device.
    pub inject: Sender<Vec<u8>>,
    /// Frames the node wrote towards the kernel.
    pub written: Receiver<Vec<u8>>,
}

impl MemoryInterface {
    pub fn new() -> (Self, MemoryInterfaceHandle) {
        let (inject, from_kernel) = channel(WRITE_QUEUE_CAPACITY);
        let (to_kernel, written) = channel(WRITE_QUEUE_CAPACITY);

        (
            Self {
                channels: Some((from_kernel, to_kernel)),
                mtu: 0,
                ipv4: None,
                ipv6: None,
                connected: false,
            },
            MemoryInterfaceHandle { inject, written },
        )
    }
}

impl VirtualInterface for MemoryInterface {
    fn set_mtu(&mut self, mtu: u16) -> io::Result<()> {
        self.mtu = mtu;
        Ok(())
    }

    fn set_ipv4(&mut self, network: IpNetwork) -> io::Result<()> {
        self.ipv4 = Some(network);
        Ok(())
    }

    fn set_ipv6(&mut self, network: IpNetwork) -> io::Result<()> {
        self.ipv6 = Some(network);
        Ok(())
    }

    fn set_connected(&mut self, connected: bool) -> io::Result<()> {
        self.connected = connected;
        Ok(())
    }

    fn channels(&mut self) -> (Receiver<Vec<u8>>, Sender<Vec<u8>>) {
        self.channels.take().expect("channels taken twice")
    }
}

/// Installs routes learned from peers into the operating system.
pub trait RouteInstaller: Send + Sync {
    fn install(&self, route: &IpRoute);
    fn uninstall(&self, route: &IpRoute);
}

/// Installs DNS servers learned from peers.
pub trait DnsInstaller: Send + Sync {
    fn add(&self, interface: &str, address: std::net::IpAddr);
    fn remove(&self, interface: &str, address: std::net::IpAddr);
}

/// The default installers only log. Platforms wire their own; on systems
/// without a DNS mechanism the administrator must supply a script, which
/// this default loudly points out.
pub struct LoggingInstaller;

impl RouteInstaller for LoggingInstaller {
    fn install(&self, route: &IpRoute) {
        log::info!("system route install requested: {}", route);
    }

    fn uninstall(&self, route: &IpRoute) {
        log::info!("system route uninstall requested: {}", route);
    }
}

impl DnsInstaller for LoggingInstaller {
    fn add(&self, interface: &str, address: std::net::IpAddr) {
        log::warn!(
            "no DNS script provided; cannot add {} to {}",
            address,
            interface
        );
    }

    fn remove(&self, interface: &str, address: std::net::IpAddr) {
        log::warn!(
            "no DNS script provided; cannot remove {} from {}",
            address,
            interface
        );
    }
}
