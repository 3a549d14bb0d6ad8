//! The relay fabric shared by the layer 2 and layer 3 modes.
//!
//! Both the local TAP/TUN device and every remote peer session are modelled
//! as a *port*: a write sink plus a group tag. The group tag implements
//! loop prevention: frames arriving from a peer port are never forwarded to
//! another peer port unless relay mode is explicitly enabled, since every
//! other node runs the same flooding logic.

pub mod router;
pub mod switch;

use std::sync::Arc;

pub type PortIndex = usize;

/// Coarse port classification used for forwarding decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortGroup {
    /// The local TAP/TUN device.
    Tap,
    /// A remote peer session.
    Peer,
}

/// Why a port write did not happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteError {
    /// The port's bounded queue is full; the frame is dropped rather than
    /// blocking the reader.
    QueueFull,
    /// The port is shutting down.
    Closed,
}

impl std::error::Error for WriteError {}

impl std::fmt::Display for WriteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::QueueFull => write!(f, "write queue full"),
            Self::Closed => write!(f, "port closed"),
        }
    }
}

/// The write side of a port. Implementations push onto a bounded queue and
/// report `QueueFull` instead of blocking.
pub trait PortWriter: Send + Sync {
    fn write(&self, frame: &[u8]) -> Result<(), WriteError>;
}

/// A registered port: its writer and the group it belongs to.
#[derive(Clone)]
pub struct Port {
    writer: Arc<dyn PortWriter>,
    group: PortGroup,
}

impl Port {
    pub fn new(writer: Arc<dyn PortWriter>, group: PortGroup) -> Self {
        Self { writer, group }
    }

    pub fn group(&self) -> PortGroup {
        self.group
    }

    pub fn write(&self, frame: &[u8]) -> Result<(), WriteError> {
        self.writer.write(frame)
    }
}

/// Whether a frame entering on `from` may leave on `to`.
pub(crate) fn forwarding_allowed(from: PortGroup, to: PortGroup, relay_mode_enabled: bool) -> bool {
    match (from, to) {
        (PortGroup::Peer, PortGroup::Peer) => relay_mode_enabled,
        _ => true,
    }
}

/// One `(port, result)` entry per attempted write.
pub type MultiWriteResult = Vec<(PortIndex, Result<(), WriteError>)>;

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// Collects written frames for assertions.
    #[derive(Default)]
    pub struct RecordingWriter {
        pub frames: Mutex<Vec<Vec<u8>>>,
        pub fail: bool,
    }

    impl RecordingWriter {
        pub fn failing() -> Self {
            Self {
                frames: Mutex::new(Vec::new()),
                fail: true,
            }
        }

        pub fn take(&self) -> Vec<Vec<u8>> {
            std::mem::take(&mut *self.frames.lock())
        }
    }

    impl PortWriter for RecordingWriter {
        fn write(&self, frame: &[u8]) -> Result<(), WriteError> {
            if self.fail {
                return Err(WriteError::QueueFull);
            }

            self.frames.lock().push(frame.to_vec());
            Ok(())
        }
    }
}
