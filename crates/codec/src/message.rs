//! Encoders and decoders for every FSCP message.
//!
//! Decoders borrow the receive buffer and never allocate for fixed-size
//! fields. Encoders clear and fill a caller-provided `BytesMut`, one
//! datagram per call.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, BytesMut};

use crate::{
    Error, HEADER_LEN, MessageType, VERSION,
    crypto::{
        CertificateHash, CipherSuite, EllipticCurve, HostIdentifier, SessionKey, TAG_LEN,
    },
};

fn begin(buf: &mut BytesMut, kind: MessageType) -> usize {
    buf.clear();
    buf.put_u8(VERSION);
    buf.put_u8(kind.to_u8());
    buf.put_u16(0);

    buf.len() - 2
}

fn finish(buf: &mut BytesMut, length_at: usize) {
    let payload = buf.len() - length_at - 2;
    let bytes = (payload as u16).to_be_bytes();
    buf[length_at] = bytes[0];
    buf[length_at + 1] = bytes[1];
}

/// HELLO_REQUEST / HELLO_RESPONSE.
///
/// The unique identifier is echoed verbatim by the responder, proving
/// round-trip reachability and timing the path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hello {
    pub unique_id: u32,
}

impl Hello {
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use fscp_node_codec::message::Hello;
    ///
    /// let mut buf = BytesMut::new();
    /// Hello { unique_id: 0xdeadbeef }.encode_request(&mut buf);
    ///
    /// assert_eq!(&buf[..], &[0x03, 0x00, 0x00, 0x04, 0xde, 0xad, 0xbe, 0xef]);
    /// ```
    pub fn encode_request(&self, buf: &mut BytesMut) {
        let at = begin(buf, MessageType::HelloRequest);
        buf.put_u32(self.unique_id);
        finish(buf, at);
    }

    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use fscp_node_codec::message::Hello;
    ///
    /// let mut buf = BytesMut::new();
    /// Hello { unique_id: 1 }.encode_response(&mut buf);
    ///
    /// assert_eq!(&buf[..], &[0x03, 0x01, 0x00, 0x04, 0x00, 0x00, 0x00, 0x01]);
    /// ```
    pub fn encode_response(&self, buf: &mut BytesMut) {
        let at = begin(buf, MessageType::HelloResponse);
        buf.put_u32(self.unique_id);
        finish(buf, at);
    }

    pub(crate) fn decode(payload: &[u8]) -> Result<Self, Error> {
        Ok(Self {
            unique_id: u32::from_be_bytes(payload.try_into().map_err(|_| Error::BadLength)?),
        })
    }
}

/// PRESENTATION: the sender's DER certificate (absent when only a
/// pre-shared key is configured) and its host identifier.
#[derive(Debug, PartialEq, Eq)]
pub struct Presentation<'a> {
    pub certificate: Option<&'a [u8]>,
    pub host_identifier: HostIdentifier,
}

impl<'a> Presentation<'a> {
    pub fn encode(&self, buf: &mut BytesMut) {
        let at = begin(buf, MessageType::Presentation);

        let certificate = self.certificate.unwrap_or(&[]);
        buf.put_u16(certificate.len() as u16);
        buf.put_slice(certificate);
        buf.put_slice(self.host_identifier.as_bytes());

        finish(buf, at);
    }

    pub(crate) fn decode(payload: &'a [u8]) -> Result<Self, Error> {
        if payload.len() < 2 {
            return Err(Error::BadLength);
        }

        let certificate_len = u16::from_be_bytes([payload[0], payload[1]]) as usize;
        let rest = &payload[2..];
        if rest.len() != certificate_len + 32 {
            return Err(Error::BadLength);
        }

        let certificate = (certificate_len > 0).then(|| &rest[..certificate_len]);
        let mut host_identifier = [0u8; 32];
        host_identifier.copy_from_slice(&rest[certificate_len..]);

        Ok(Self {
            certificate,
            host_identifier: HostIdentifier(host_identifier),
        })
    }
}

/// Whether a handshake payload travels as SESSION_REQUEST or SESSION.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeKind {
    SessionRequest,
    Session,
}

impl HandshakeKind {
    fn message_type(self) -> MessageType {
        match self {
            Self::SessionRequest => MessageType::SessionRequest,
            Self::Session => MessageType::Session,
        }
    }
}

/// SESSION_REQUEST / SESSION payload.
///
/// Both messages share one layout: a session number, the sender's cipher
/// suite and elliptic curve capabilities, an ephemeral public key and a
/// signature (or PSK MAC) over everything before it. A SESSION carries
/// single-element capability lists naming the responder's choice.
#[derive(Debug, PartialEq, Eq)]
pub struct Handshake<'a> {
    pub session_number: u32,
    pub cipher_suites: Vec<CipherSuite>,
    pub elliptic_curves: Vec<EllipticCurve>,
    pub public_key: &'a [u8],
    pub signature: &'a [u8],
    /// The raw payload bytes covered by the signature.
    pub signed: &'a [u8],
}

impl<'a> Handshake<'a> {
    /// Encode a handshake, obtaining the trailing signature from `sign`,
    /// which receives exactly the bytes a receiver will verify.
    pub fn encode<F>(
        buf: &mut BytesMut,
        kind: HandshakeKind,
        session_number: u32,
        cipher_suites: &[CipherSuite],
        elliptic_curves: &[EllipticCurve],
        public_key: &[u8],
        sign: F,
    ) -> Result<(), Error>
    where
        F: FnOnce(&[u8]) -> Result<Vec<u8>, Error>,
    {
        let at = begin(buf, kind.message_type());
        let signed_from = buf.len();

        buf.put_u32(session_number);
        buf.put_u8(cipher_suites.len() as u8);
        for suite in cipher_suites {
            buf.put_u8((*suite).into());
        }

        buf.put_u8(elliptic_curves.len() as u8);
        for curve in elliptic_curves {
            buf.put_u8((*curve).into());
        }

        buf.put_u16(public_key.len() as u16);
        buf.put_slice(public_key);

        let signature = sign(&buf[signed_from..])?;
        buf.put_u16(signature.len() as u16);
        buf.put_slice(&signature);

        finish(buf, at);
        Ok(())
    }

    pub(crate) fn decode(payload: &'a [u8]) -> Result<Self, Error> {
        let mut at = 0usize;
        let take = |at: &mut usize, n: usize| -> Result<&'a [u8], Error> {
            let bytes = payload.get(*at..*at + n).ok_or(Error::BadLength)?;
            *at += n;
            Ok(bytes)
        };

        let session_number = u32::from_be_bytes(take(&mut at, 4)?.try_into()?);

        let count = take(&mut at, 1)?[0] as usize;
        let mut cipher_suites = Vec::with_capacity(count);
        for byte in take(&mut at, count)? {
            // Unknown identifiers from newer peers are skipped, not fatal.
            if let Ok(suite) = CipherSuite::try_from(*byte) {
                cipher_suites.push(suite);
            }
        }

        let count = take(&mut at, 1)?[0] as usize;
        let mut elliptic_curves = Vec::with_capacity(count);
        for byte in take(&mut at, count)? {
            if let Ok(curve) = EllipticCurve::try_from(*byte) {
                elliptic_curves.push(curve);
            }
        }

        let public_key_len = u16::from_be_bytes(take(&mut at, 2)?.try_into()?) as usize;
        let public_key = take(&mut at, public_key_len)?;
        let signed = &payload[..at];

        let signature_len = u16::from_be_bytes(take(&mut at, 2)?.try_into()?) as usize;
        let signature = take(&mut at, signature_len)?;
        if at != payload.len() {
            return Err(Error::BadLength);
        }

        Ok(Self {
            session_number,
            cipher_suites,
            elliptic_curves,
            public_key,
            signature,
            signed,
        })
    }
}

/// The in-session message family, sealed with the sender's session key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecureKind {
    ContactRequest,
    Contact,
    Data(u8),
    KeepAlive,
}

impl SecureKind {
    pub fn message_type(self) -> MessageType {
        match self {
            Self::ContactRequest => MessageType::ContactRequest,
            Self::Contact => MessageType::Contact,
            Self::Data(channel) => MessageType::Data(channel),
            Self::KeepAlive => MessageType::KeepAlive,
        }
    }
}

/// A still-sealed in-session message: `sequence_number (4) || ciphertext ||
/// tag`, authenticated against the datagram header.
#[derive(Debug)]
pub struct Secure<'a> {
    pub kind: SecureKind,
    pub sequence_number: u32,
    pub ciphertext: &'a [u8],
    header: [u8; 4],
}

impl<'a> Secure<'a> {
    pub(crate) fn decode(
        kind: SecureKind,
        header: [u8; 4],
        payload: &'a [u8],
    ) -> Result<Self, Error> {
        if payload.len() < 4 + TAG_LEN {
            return Err(Error::BadLength);
        }

        Ok(Self {
            kind,
            sequence_number: u32::from_be_bytes(payload[..4].try_into()?),
            ciphertext: &payload[4..],
            header,
        })
    }

    /// Open the sealed payload with the peer's sending key.
    pub fn open(&self, key: &SessionKey) -> Result<Vec<u8>, Error> {
        key.open(self.header, self.sequence_number, self.ciphertext)
    }

    /// Seal `plaintext` under `key` and encode the whole datagram.
    pub fn encode(
        buf: &mut BytesMut,
        kind: SecureKind,
        sequence_number: u32,
        plaintext: &[u8],
        key: &SessionKey,
    ) -> Result<(), Error> {
        let payload_len = 4 + plaintext.len() + TAG_LEN;
        if payload_len > u16::MAX as usize {
            return Err(Error::BadLength);
        }

        let length = (payload_len as u16).to_be_bytes();
        let header = [VERSION, kind.message_type().to_u8(), length[0], length[1]];
        let sealed = key.seal(header, sequence_number, plaintext)?;

        buf.clear();
        buf.reserve(HEADER_LEN + payload_len);
        buf.put_slice(&header);
        buf.put_u32(sequence_number);
        buf.put_slice(&sealed);
        Ok(())
    }
}

fn put_endpoint(buf: &mut BytesMut, endpoint: &SocketAddr) {
    match endpoint.ip() {
        IpAddr::V4(ip) => {
            buf.put_u8(0x01);
            buf.put_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.put_u8(0x02);
            buf.put_slice(&ip.octets());
        }
    }

    buf.put_u16(endpoint.port());
}

fn take_endpoint(payload: &[u8], at: &mut usize) -> Result<SocketAddr, Error> {
    let tag = *payload.get(*at).ok_or(Error::BadLength)?;
    *at += 1;

    let (ip, len): (IpAddr, usize) = match tag {
        0x01 => {
            let bytes: [u8; 4] = payload
                .get(*at..*at + 4)
                .ok_or(Error::BadLength)?
                .try_into()?;
            (IpAddr::V4(Ipv4Addr::from(bytes)), 4)
        }
        0x02 => {
            let bytes: [u8; 16] = payload
                .get(*at..*at + 16)
                .ok_or(Error::BadLength)?
                .try_into()?;
            (IpAddr::V6(Ipv6Addr::from(bytes)), 16)
        }
        _ => return Err(Error::UnknownEndpointTag),
    };
    *at += len;

    let port = u16::from_be_bytes(
        payload
            .get(*at..*at + 2)
            .ok_or(Error::BadLength)?
            .try_into()?,
    );
    *at += 2;

    Ok(SocketAddr::new(ip, port))
}

/// CONTACT_REQUEST plaintext: certificate hashes whose endpoints the sender
/// wants to learn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactRequest {
    pub hashes: Vec<CertificateHash>,
}

impl ContactRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.hashes.len() * 32);
        out.push(self.hashes.len() as u8);
        for hash in &self.hashes {
            out.extend_from_slice(&hash.0);
        }

        out
    }

    pub fn decode(payload: &[u8]) -> Result<Self, Error> {
        let count = *payload.first().ok_or(Error::BadLength)? as usize;
        if payload.len() != 1 + count * 32 {
            return Err(Error::BadLength);
        }

        let mut hashes = Vec::with_capacity(count);
        for chunk in payload[1..].chunks_exact(32) {
            let mut hash = [0u8; 32];
            hash.copy_from_slice(chunk);
            hashes.push(CertificateHash(hash));
        }

        Ok(Self { hashes })
    }
}

/// CONTACT plaintext: the endpoints the responder knows and is willing to
/// share, one per requested hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub entries: Vec<(CertificateHash, SocketAddr)>,
}

impl Contact {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(1 + self.entries.len() * 51);
        buf.put_u8(self.entries.len() as u8);
        for (hash, endpoint) in &self.entries {
            buf.put_slice(&hash.0);
            put_endpoint(&mut buf, endpoint);
        }

        buf.to_vec()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, Error> {
        let count = *payload.first().ok_or(Error::BadLength)? as usize;
        let mut at = 1usize;

        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let hash: [u8; 32] = payload
                .get(at..at + 32)
                .ok_or(Error::BadLength)?
                .try_into()?;
            at += 32;

            entries.push((CertificateHash(hash), take_endpoint(payload, &mut at)?));
        }

        if at != payload.len() {
            return Err(Error::BadLength);
        }

        Ok(Self { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Decoder, Packet, crypto};

    #[test]
    fn hello_round_trip() {
        let mut buf = BytesMut::new();
        Hello { unique_id: 0x01020304 }.encode_request(&mut buf);

        match Decoder::decode(&buf).unwrap() {
            Packet::HelloRequest(hello) => assert_eq!(hello.unique_id, 0x01020304),
            other => panic!("unexpected packet: {:?}", other),
        }
    }

    #[test]
    fn presentation_round_trip() {
        let host_identifier = HostIdentifier([0xAB; 32]);
        let certificate = vec![0x30, 0x82, 0x01, 0x0A];

        let mut buf = BytesMut::new();
        Presentation {
            certificate: Some(&certificate),
            host_identifier,
        }
        .encode(&mut buf);

        match Decoder::decode(&buf).unwrap() {
            Packet::Presentation(p) => {
                assert_eq!(p.certificate, Some(certificate.as_slice()));
                assert_eq!(p.host_identifier, host_identifier);
            }
            other => panic!("unexpected packet: {:?}", other),
        }
    }

    #[test]
    fn presentation_without_certificate() {
        let mut buf = BytesMut::new();
        Presentation {
            certificate: None,
            host_identifier: HostIdentifier([1; 32]),
        }
        .encode(&mut buf);

        match Decoder::decode(&buf).unwrap() {
            Packet::Presentation(p) => assert!(p.certificate.is_none()),
            other => panic!("unexpected packet: {:?}", other),
        }
    }

    #[test]
    fn handshake_round_trip_and_signature_coverage() {
        let public_key = [0x04u8; 65];
        let mut buf = BytesMut::new();

        Handshake::encode(
            &mut buf,
            HandshakeKind::SessionRequest,
            7,
            &CipherSuite::ALL,
            &EllipticCurve::ALL,
            &public_key,
            |signed| Ok(crypto::psk_sign(b"psk", signed)),
        )
        .unwrap();

        match Decoder::decode(&buf).unwrap() {
            Packet::SessionRequest(h) => {
                assert_eq!(h.session_number, 7);
                assert_eq!(h.cipher_suites, CipherSuite::ALL.to_vec());
                assert_eq!(h.elliptic_curves, EllipticCurve::ALL.to_vec());
                assert_eq!(h.public_key, &public_key[..]);
                crypto::psk_verify(b"psk", h.signed, h.signature).unwrap();
            }
            other => panic!("unexpected packet: {:?}", other),
        }
    }

    #[test]
    fn handshake_truncation_is_rejected() {
        let mut buf = BytesMut::new();
        Handshake::encode(
            &mut buf,
            HandshakeKind::Session,
            1,
            &[CipherSuite::EcdheRsaAes128GcmSha256],
            &[EllipticCurve::Secp256r1],
            &[0x04; 65],
            |_| Ok(vec![0u8; 32]),
        )
        .unwrap();

        // Cut a byte off and fix the header length so only the payload is
        // inconsistent.
        let mut broken = buf.to_vec();
        broken.pop();
        let length = (broken.len() - 4) as u16;
        broken[2..4].copy_from_slice(&length.to_be_bytes());

        assert!(Decoder::decode(&broken).is_err());
    }

    #[test]
    fn secure_data_round_trip() {
        let suite = CipherSuite::EcdheRsaAes256GcmSha384;
        let material = crypto::derive_key_material(suite, b"z", &HostIdentifier([9; 32]));
        let key = crypto::SessionKey::new(suite, &material).unwrap();

        let mut buf = BytesMut::new();
        Secure::encode(&mut buf, SecureKind::Data(3), 17, &[0xAA, 0xBB, 0xCC], &key).unwrap();

        match Decoder::decode(&buf).unwrap() {
            Packet::Secure(secure) => {
                assert_eq!(secure.kind, SecureKind::Data(3));
                assert_eq!(secure.sequence_number, 17);
                assert_eq!(secure.open(&key).unwrap(), vec![0xAA, 0xBB, 0xCC]);
            }
            other => panic!("unexpected packet: {:?}", other),
        }
    }

    #[test]
    fn contact_round_trip() {
        let request = ContactRequest {
            hashes: vec![CertificateHash([3; 32]), CertificateHash([4; 32])],
        };
        assert_eq!(ContactRequest::decode(&request.encode()).unwrap(), request);

        let contact = Contact {
            entries: vec![
                (CertificateHash([3; 32]), "10.0.0.1:12000".parse().unwrap()),
                (CertificateHash([4; 32]), "[2001:db8::1]:12001".parse().unwrap()),
            ],
        };
        assert_eq!(Contact::decode(&contact.encode()).unwrap(), contact);
    }

    #[test]
    fn unknown_type_and_bad_version_are_rejected() {
        assert!(matches!(
            Decoder::decode(&[0x02, 0x00, 0x00, 0x00]),
            Err(Error::BadVersion)
        ));
        assert!(matches!(
            Decoder::decode(&[0x03, 0x42, 0x00, 0x00]),
            Err(Error::UnknownType)
        ));
        assert!(matches!(
            Decoder::decode(&[0x03, 0x00, 0x00, 0x08, 0x00]),
            Err(Error::BadLength)
        ));
    }
}
