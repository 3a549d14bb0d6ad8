//! ## FreeLAN Secure Channel Protocol (FSCP)
//!
//! FSCP is a datagram protocol used to establish authenticated and
//! encrypted sessions between equal peers over UDP. Every datagram starts
//! with a fixed four byte header:
//!
//! ```text
//! 0        1        2        3
//! +--------+--------+--------+--------+
//! | version|  type  |     length      |
//! +--------+--------+--------+--------+
//! ```
//!
//! `version` is always 3 and `length` is the big-endian payload size,
//! excluding the header itself. Greeting and presentation messages travel in
//! clear, session negotiation messages are signed, and everything at or
//! above type `0x70` is sealed with the session keys negotiated through the
//! SESSION exchange.

pub mod crypto;
pub mod message;
pub mod routes;

use std::array::TryFromSliceError;

use self::message::{Handshake, Hello, Presentation, Secure, SecureKind};

/// The protocol version carried in every header.
pub const VERSION: u8 = 3;

/// The fixed header size.
pub const HEADER_LEN: usize = 4;

#[derive(Debug)]
pub enum Error {
    InvalidInput,
    BadVersion,
    UnknownType,
    BadLength,
    UnknownCipherSuite,
    UnknownEllipticCurve,
    UnknownRouteTag,
    UnknownEndpointTag,
    CryptoFailed,
    SignatureFailed,
    TryFromSliceError(TryFromSliceError),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<TryFromSliceError> for Error {
    fn from(value: TryFromSliceError) -> Self {
        Self::TryFromSliceError(value)
    }
}

impl From<aws_lc_rs::error::Unspecified> for Error {
    fn from(_: aws_lc_rs::error::Unspecified) -> Self {
        Self::CryptoFailed
    }
}

/// The message type byte of the fixed header.
///
/// Data messages occupy the whole `0x80..=0x8F` range, one type per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    HelloRequest,
    HelloResponse,
    Presentation,
    SessionRequest,
    Session,
    ContactRequest,
    Contact,
    Data(u8),
    KeepAlive,
}

impl MessageType {
    pub const fn to_u8(self) -> u8 {
        match self {
            Self::HelloRequest => 0x00,
            Self::HelloResponse => 0x01,
            Self::Presentation => 0x02,
            Self::SessionRequest => 0x03,
            Self::Session => 0x04,
            Self::ContactRequest => 0x70,
            Self::Contact => 0x71,
            Self::Data(channel) => 0x80 | (channel & 0x0F),
            Self::KeepAlive => 0x90,
        }
    }

    pub const fn try_from(value: u8) -> Option<Self> {
        Some(match value {
            0x00 => Self::HelloRequest,
            0x01 => Self::HelloResponse,
            0x02 => Self::Presentation,
            0x03 => Self::SessionRequest,
            0x04 => Self::Session,
            0x70 => Self::ContactRequest,
            0x71 => Self::Contact,
            0x80..=0x8F => Self::Data(value & 0x0F),
            0x90 => Self::KeepAlive,
            _ => return None,
        })
    }
}

/// A decoded datagram, borrowing the receive buffer.
///
/// In-session messages (contact exchange, data channels, keep-alive) decode
/// to [`Secure`]: their payload is still sealed and must be opened with the
/// receive half of the session keys before any further parsing.
#[derive(Debug)]
pub enum Packet<'a> {
    HelloRequest(Hello),
    HelloResponse(Hello),
    Presentation(Presentation<'a>),
    SessionRequest(Handshake<'a>),
    Session(Handshake<'a>),
    Secure(Secure<'a>),
}

#[derive(Default)]
pub struct Decoder;

impl Decoder {
    /// Decode a datagram.
    ///
    /// # Test
    ///
    /// ```
    /// use fscp_node_codec::{Decoder, Packet};
    ///
    /// let buffer = [0x03u8, 0x00, 0x00, 0x04, 0xde, 0xad, 0xbe, 0xef];
    ///
    /// match Decoder::decode(&buffer).unwrap() {
    ///     Packet::HelloRequest(hello) => assert_eq!(hello.unique_id, 0xdeadbeef),
    ///     _ => panic!("expected a hello request"),
    /// }
    /// ```
    pub fn decode(bytes: &[u8]) -> Result<Packet<'_>, Error> {
        let (kind, header, payload) = Self::split(bytes)?;

        Ok(match kind {
            MessageType::HelloRequest => Packet::HelloRequest(Hello::decode(payload)?),
            MessageType::HelloResponse => Packet::HelloResponse(Hello::decode(payload)?),
            MessageType::Presentation => Packet::Presentation(Presentation::decode(payload)?),
            MessageType::SessionRequest => Packet::SessionRequest(Handshake::decode(payload)?),
            MessageType::Session => Packet::Session(Handshake::decode(payload)?),
            MessageType::ContactRequest => {
                Packet::Secure(Secure::decode(SecureKind::ContactRequest, header, payload)?)
            }
            MessageType::Contact => {
                Packet::Secure(Secure::decode(SecureKind::Contact, header, payload)?)
            }
            MessageType::Data(channel) => {
                Packet::Secure(Secure::decode(SecureKind::Data(channel), header, payload)?)
            }
            MessageType::KeepAlive => {
                Packet::Secure(Secure::decode(SecureKind::KeepAlive, header, payload)?)
            }
        })
    }

    /// Split a datagram into its header and payload, validating the fixed
    /// header fields.
    fn split(bytes: &[u8]) -> Result<(MessageType, [u8; 4], &[u8]), Error> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::InvalidInput);
        }

        if bytes[0] != VERSION {
            return Err(Error::BadVersion);
        }

        let kind = MessageType::try_from(bytes[1]).ok_or(Error::UnknownType)?;
        let length = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
        if bytes.len() != HEADER_LEN + length {
            return Err(Error::BadLength);
        }

        let header = [bytes[0], bytes[1], bytes[2], bytes[3]];
        Ok((kind, header, &bytes[HEADER_LEN..]))
    }
}
