//! Cryptographic primitives of the secure channel.
//!
//! Everything is backed by `aws-lc-rs`: ECDHE key agreement for the session
//! exchange, the TLS 1.2 style PRF for key expansion, AES-GCM for sealing
//! in-session messages and ECDSA (or an HMAC when a pre-shared key is used)
//! for authenticating the session negotiation itself.

use aws_lc_rs::{
    aead::{self, Aad, LessSafeKey, Nonce, UnboundKey},
    agreement::{self, UnparsedPublicKey},
    digest, hmac,
    rand::{SecureRandom, SystemRandom},
    signature::{self, KeyPair},
};
use base64::Engine;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::Error;

/// The AEAD tag length shared by both supported suites.
pub const TAG_LEN: usize = 16;

/// The nonce prefix length. A full nonce is the 8 byte prefix followed by
/// the 4 byte big-endian sequence number.
pub const NONCE_PREFIX_LEN: usize = 8;

/// A cipher suite negotiated through the SESSION exchange.
///
/// The wire identifier is stable; preference is expressed by list order in
/// the SESSION_REQUEST, not by the identifier value.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
pub enum CipherSuite {
    EcdheRsaAes128GcmSha256 = 0x01,
    EcdheRsaAes256GcmSha384 = 0x02,
}

impl CipherSuite {
    /// All suites, in default preference order (strongest first).
    pub const ALL: [CipherSuite; 2] = [
        CipherSuite::EcdheRsaAes256GcmSha384,
        CipherSuite::EcdheRsaAes128GcmSha256,
    ];

    pub const fn key_len(self) -> usize {
        match self {
            Self::EcdheRsaAes128GcmSha256 => 16,
            Self::EcdheRsaAes256GcmSha384 => 32,
        }
    }

    fn aead(self) -> &'static aead::Algorithm {
        match self {
            Self::EcdheRsaAes128GcmSha256 => &aead::AES_128_GCM,
            Self::EcdheRsaAes256GcmSha384 => &aead::AES_256_GCM,
        }
    }

    fn prf_algorithm(self) -> hmac::Algorithm {
        match self {
            Self::EcdheRsaAes128GcmSha256 => hmac::HMAC_SHA256,
            Self::EcdheRsaAes256GcmSha384 => hmac::HMAC_SHA384,
        }
    }
}

/// An elliptic curve usable for the ephemeral key agreement.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
pub enum EllipticCurve {
    Secp256r1 = 0x01,
    Secp384r1 = 0x02,
    Secp521r1 = 0x03,
}

impl EllipticCurve {
    /// All curves, in default preference order.
    pub const ALL: [EllipticCurve; 3] = [
        EllipticCurve::Secp256r1,
        EllipticCurve::Secp384r1,
        EllipticCurve::Secp521r1,
    ];

    fn algorithm(self) -> &'static agreement::Algorithm {
        match self {
            Self::Secp256r1 => &agreement::ECDH_P256,
            Self::Secp384r1 => &agreement::ECDH_P384,
            Self::Secp521r1 => &agreement::ECDH_P521,
        }
    }

    /// Infer the curve from the length of an uncompressed public point.
    pub const fn from_public_key_len(len: usize) -> Option<Self> {
        Some(match len {
            65 => Self::Secp256r1,
            97 => Self::Secp384r1,
            133 => Self::Secp521r1,
            _ => return None,
        })
    }
}

/// A 32 byte random value bound to one run of the local node.
///
/// It is transmitted in every PRESENTATION and mixed into the key schedule,
/// which both distinguishes restarts of the same certificate holder and
/// makes the derived keys direction-asymmetric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HostIdentifier(pub [u8; 32]);

impl HostIdentifier {
    pub fn generate() -> Result<Self, Error> {
        let mut bytes = [0u8; 32];
        SystemRandom::new().fill(&mut bytes)?;

        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// SHA-256 of a certificate's DER encoding, used as a compact peer
/// identifier in the contact exchange and towards rendezvous servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CertificateHash(pub [u8; 32]);

impl CertificateHash {
    pub fn of(certificate_der: &[u8]) -> Self {
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(digest::digest(&digest::SHA256, certificate_der).as_ref());

        Self(bytes)
    }
}

impl std::fmt::Display for CertificateHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            base64::engine::general_purpose::STANDARD.encode(self.0)
        )
    }
}

/// The TLS 1.2 pseudo random function (P_hash of the suite's digest).
///
/// # Test
///
/// ```
/// use fscp_node_codec::crypto::{CipherSuite, prf};
///
/// let suite = CipherSuite::EcdheRsaAes256GcmSha384;
/// let a = prf(suite, b"secret", "session key", b"seed", 32);
/// let b = prf(suite, b"secret", "session key", b"seed", 32);
/// let c = prf(suite, b"secret", "nonce prefix", b"seed", 32);
///
/// assert_eq!(a.len(), 32);
/// assert_eq!(a, b);
/// assert_ne!(a, c);
/// ```
pub fn prf(suite: CipherSuite, secret: &[u8], label: &str, seed: &[u8], out_len: usize) -> Vec<u8> {
    let key = hmac::Key::new(suite.prf_algorithm(), secret);

    let mut label_and_seed = Vec::with_capacity(label.len() + seed.len());
    label_and_seed.extend_from_slice(label.as_bytes());
    label_and_seed.extend_from_slice(seed);

    // A(1) = HMAC(secret, seed), A(i) = HMAC(secret, A(i - 1)).
    let mut a = hmac::sign(&key, &label_and_seed);
    let mut out = Vec::with_capacity(out_len);

    while out.len() < out_len {
        let mut ctx = hmac::Context::with_key(&key);
        ctx.update(a.as_ref());
        ctx.update(&label_and_seed);
        out.extend_from_slice(ctx.sign().as_ref());

        a = hmac::sign(&key, a.as_ref());
    }

    out.truncate(out_len);
    out
}

/// One direction's worth of derived session material.
pub struct KeyMaterial {
    pub session_key: Vec<u8>,
    pub nonce_prefix: [u8; NONCE_PREFIX_LEN],
}

/// Expand the ECDHE shared secret into a session key and nonce prefix for
/// the side identified by `host_identifier`.
///
/// Each side seals with the material derived from its own identifier and
/// opens with the material derived from the peer's, so reflected datagrams
/// never decrypt.
pub fn derive_key_material(
    suite: CipherSuite,
    shared_secret: &[u8],
    host_identifier: &HostIdentifier,
) -> KeyMaterial {
    let session_key = prf(
        suite,
        shared_secret,
        "session key",
        host_identifier.as_bytes(),
        suite.key_len(),
    );

    let mut nonce_prefix = [0u8; NONCE_PREFIX_LEN];
    nonce_prefix.copy_from_slice(&prf(
        suite,
        shared_secret,
        "nonce prefix",
        host_identifier.as_bytes(),
        NONCE_PREFIX_LEN,
    ));

    KeyMaterial {
        session_key,
        nonce_prefix,
    }
}

/// One direction of an established session: an AEAD key plus the nonce
/// prefix the sealing side mixes with its sequence numbers.
pub struct SessionKey {
    key: LessSafeKey,
    nonce_prefix: [u8; NONCE_PREFIX_LEN],
}

impl SessionKey {
    pub fn new(suite: CipherSuite, material: &KeyMaterial) -> Result<Self, Error> {
        Ok(Self {
            key: LessSafeKey::new(UnboundKey::new(suite.aead(), &material.session_key)?),
            nonce_prefix: material.nonce_prefix,
        })
    }

    fn nonce(&self, sequence_number: u32) -> Nonce {
        let mut bytes = [0u8; aead::NONCE_LEN];
        bytes[..NONCE_PREFIX_LEN].copy_from_slice(&self.nonce_prefix);
        bytes[NONCE_PREFIX_LEN..].copy_from_slice(&sequence_number.to_be_bytes());

        Nonce::assume_unique_for_key(bytes)
    }

    /// Seal a plaintext. Returns `ciphertext || tag`. The associated data is
    /// the datagram header followed by the big-endian sequence number.
    pub fn seal(
        &self,
        header: [u8; 4],
        sequence_number: u32,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, Error> {
        let mut aad = [0u8; 8];
        aad[..4].copy_from_slice(&header);
        aad[4..].copy_from_slice(&sequence_number.to_be_bytes());

        let mut in_out = plaintext.to_vec();
        self.key
            .seal_in_place_append_tag(self.nonce(sequence_number), Aad::from(aad), &mut in_out)?;

        Ok(in_out)
    }

    /// Open `ciphertext || tag`. Fails on any tag or associated data
    /// mismatch.
    pub fn open(
        &self,
        header: [u8; 4],
        sequence_number: u32,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, Error> {
        let mut aad = [0u8; 8];
        aad[..4].copy_from_slice(&header);
        aad[4..].copy_from_slice(&sequence_number.to_be_bytes());

        let mut in_out = ciphertext.to_vec();
        let plaintext = self
            .key
            .open_in_place(self.nonce(sequence_number), Aad::from(aad), &mut in_out)?;
        let len = plaintext.len();

        in_out.truncate(len);
        Ok(in_out)
    }
}

/// An ephemeral ECDHE key pair, held while a session negotiation is in
/// flight so retransmitted SESSION_REQUESTs keep deriving the same secret.
pub struct EcdheContext {
    curve: EllipticCurve,
    private_key: agreement::PrivateKey,
    public_key: Vec<u8>,
}

impl EcdheContext {
    pub fn generate(curve: EllipticCurve) -> Result<Self, Error> {
        let private_key = agreement::PrivateKey::generate(curve.algorithm())?;
        let public_key = private_key.compute_public_key()?.as_ref().to_vec();

        Ok(Self {
            curve,
            private_key,
            public_key,
        })
    }

    pub fn curve(&self) -> EllipticCurve {
        self.curve
    }

    /// The uncompressed point transmitted in SESSION_REQUEST/SESSION.
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    pub fn derive_shared_secret(&self, remote_public_key: &[u8]) -> Result<Vec<u8>, Error> {
        agreement::agree(
            &self.private_key,
            &UnparsedPublicKey::new(self.curve.algorithm(), remote_public_key),
            Error::CryptoFailed,
            |secret| Ok(secret.to_vec()),
        )
    }
}

/// The local node's signature identity: an opaque DER certificate published
/// in PRESENTATION and the ECDSA key pair that signs session negotiations.
pub struct SigningIdentity {
    key_pair: signature::EcdsaKeyPair,
    certificate: Vec<u8>,
    hash: CertificateHash,
}

impl SigningIdentity {
    /// Build an identity from a DER certificate and the matching PKCS#8
    /// ECDSA P-256 private key.
    pub fn from_parts(certificate_der: Vec<u8>, pkcs8: &[u8]) -> Result<Self, Error> {
        let key_pair = signature::EcdsaKeyPair::from_pkcs8(
            &signature::ECDSA_P256_SHA256_ASN1_SIGNING,
            pkcs8,
        )
        .map_err(|_| Error::CryptoFailed)?;

        let hash = CertificateHash::of(&certificate_der);
        Ok(Self {
            key_pair,
            certificate: certificate_der,
            hash,
        })
    }

    /// Generate a throwaway identity whose "certificate" is the bare public
    /// key. Only meaningful together with a verifier that accepts pinned raw
    /// public keys.
    pub fn generate_ephemeral() -> Result<Self, Error> {
        let document = signature::EcdsaKeyPair::generate_pkcs8(
            &signature::ECDSA_P256_SHA256_ASN1_SIGNING,
            &SystemRandom::new(),
        )?;
        let key_pair = signature::EcdsaKeyPair::from_pkcs8(
            &signature::ECDSA_P256_SHA256_ASN1_SIGNING,
            document.as_ref(),
        )
        .map_err(|_| Error::CryptoFailed)?;

        let certificate = key_pair.public_key().as_ref().to_vec();
        let hash = CertificateHash::of(&certificate);

        Ok(Self {
            key_pair,
            certificate,
            hash,
        })
    }

    pub fn certificate(&self) -> &[u8] {
        &self.certificate
    }

    pub fn certificate_hash(&self) -> CertificateHash {
        self.hash
    }

    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, Error> {
        Ok(self
            .key_pair
            .sign(&SystemRandom::new(), message)?
            .as_ref()
            .to_vec())
    }
}

/// Verify an ECDSA P-256 signature against a raw public key point.
pub fn verify_signature(public_key: &[u8], message: &[u8], sig: &[u8]) -> Result<(), Error> {
    signature::UnparsedPublicKey::new(&signature::ECDSA_P256_SHA256_ASN1, public_key)
        .verify(message, sig)
        .map_err(|_| Error::SignatureFailed)
}

/// Authenticate a session negotiation with a pre-shared key instead of a
/// signature.
pub fn psk_sign(psk: &[u8], message: &[u8]) -> Vec<u8> {
    let key = hmac::Key::new(hmac::HMAC_SHA256, psk);
    hmac::sign(&key, message).as_ref().to_vec()
}

pub fn psk_verify(psk: &[u8], message: &[u8], tag: &[u8]) -> Result<(), Error> {
    let key = hmac::Key::new(hmac::HMAC_SHA256, psk);
    hmac::verify(&key, message, tag).map_err(|_| Error::SignatureFailed)
}

/// Fill a buffer with random bytes (keep-alive padding, hello identifiers).
pub fn random_fill(bytes: &mut [u8]) -> Result<(), Error> {
    SystemRandom::new().fill(bytes)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_material_is_direction_asymmetric() {
        let suite = CipherSuite::EcdheRsaAes256GcmSha384;
        let a = HostIdentifier([0x11; 32]);
        let b = HostIdentifier([0x22; 32]);
        let secret = b"a shared ecdhe secret";

        let from_a = derive_key_material(suite, secret, &a);
        let from_b = derive_key_material(suite, secret, &b);

        assert_eq!(from_a.session_key.len(), suite.key_len());
        assert_ne!(from_a.session_key, from_b.session_key);
        assert_ne!(from_a.nonce_prefix, from_b.nonce_prefix);
    }

    #[test]
    fn seal_open_round_trip() {
        let suite = CipherSuite::EcdheRsaAes128GcmSha256;
        let material = derive_key_material(suite, b"secret", &HostIdentifier([7; 32]));
        let key = SessionKey::new(suite, &material).unwrap();

        let header = [3, 0x80, 0x00, 0x17];
        let sealed = key.seal(header, 42, b"hello world").unwrap();
        assert_eq!(sealed.len(), 11 + TAG_LEN);

        let opened = key.open(header, 42, &sealed).unwrap();
        assert_eq!(opened, b"hello world");

        // A different sequence number must not open.
        assert!(key.open(header, 43, &sealed).is_err());
    }

    #[test]
    fn reflected_ciphertext_does_not_open_with_the_sender_key() {
        let suite = CipherSuite::EcdheRsaAes256GcmSha384;
        let local = derive_key_material(suite, b"secret", &HostIdentifier([1; 32]));
        let remote = derive_key_material(suite, b"secret", &HostIdentifier([2; 32]));

        let sender = SessionKey::new(suite, &local).unwrap();
        let receiver = SessionKey::new(suite, &remote).unwrap();

        let header = [3, 0x80, 0x00, 0x14];
        let sealed = sender.seal(header, 1, b"data").unwrap();

        assert!(receiver.open(header, 1, &sealed).is_err());
        assert!(sender.open(header, 1, &sealed).is_ok());
    }

    #[test]
    fn ecdhe_agreement_matches() {
        for curve in EllipticCurve::ALL {
            let a = EcdheContext::generate(curve).unwrap();
            let b = EcdheContext::generate(curve).unwrap();

            let z1 = a.derive_shared_secret(b.public_key()).unwrap();
            let z2 = b.derive_shared_secret(a.public_key()).unwrap();
            assert_eq!(z1, z2);
        }
    }

    #[test]
    fn signature_round_trip() {
        let identity = SigningIdentity::generate_ephemeral().unwrap();
        let sig = identity.sign(b"negotiation payload").unwrap();

        verify_signature(identity.certificate(), b"negotiation payload", &sig).unwrap();
        assert!(verify_signature(identity.certificate(), b"tampered", &sig).is_err());
    }

    #[test]
    fn psk_round_trip() {
        let tag = psk_sign(b"swordfish", b"payload");

        psk_verify(b"swordfish", b"payload", &tag).unwrap();
        assert!(psk_verify(b"swordfish", b"other", &tag).is_err());
        assert!(psk_verify(b"marlin", b"payload", &tag).is_err());
    }
}
