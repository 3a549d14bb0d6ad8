//! Per-peer session state.
//!
//! A `PeerSession` tracks everything known about one remote endpoint: its
//! pinned host identifier, the verified identity material, the established
//! session keys and the negotiation that may currently be in flight. The
//! registry in [`crate::peer`] owns these exclusively behind its table
//! locks; nothing here is shared.

use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use codec::{
    Error,
    crypto::{
        CertificateHash, CipherSuite, EcdheContext, EllipticCurve, HostIdentifier, SessionKey,
        derive_key_material,
    },
    message::{Secure, SecureKind},
};

/// Renewal kicks in once either direction crosses half the sequence space.
pub const SEQUENCE_HALF: u32 = 1 << 31;

/// Established sessions tolerate this many failed decryptions inside
/// [`FAILURE_WINDOW_SECS`] before the peer is declared lost.
pub const MAX_DECRYPT_FAILURES: u32 = 16;
pub const FAILURE_WINDOW_SECS: u64 = 60;

/// The per-peer protocol state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Greeted,
    Presented,
    Negotiating,
    Established,
    Renewing,
    Lost,
}

/// Why a peer session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossReason {
    IdleTimeout,
    DecryptFailures,
    HostIdentifierMismatch,
    Cancelled,
}

impl std::fmt::Display for LossReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IdleTimeout => write!(f, "idle timeout"),
            Self::DecryptFailures => write!(f, "too many decryption failures"),
            Self::HostIdentifierMismatch => write!(f, "host identifier mismatch"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// An established session: negotiated parameters plus both directions of
/// key material.
pub struct CurrentSession {
    pub session_number: u32,
    pub cipher_suite: CipherSuite,
    pub elliptic_curve: EllipticCurve,
    local_key: SessionKey,
    remote_key: SessionKey,
    pub local_sequence_number: u32,
    pub remote_sequence_number: u32,
    /// Set once the peer has been heard on these keys; clearing the
    /// previous session's keys waits for this.
    pub seen_inbound: bool,
}

impl CurrentSession {
    /// Whether either direction has consumed half the sequence space.
    pub fn is_old(&self) -> bool {
        self.local_sequence_number > SEQUENCE_HALF || self.remote_sequence_number > SEQUENCE_HALF
    }
}

/// The inbound half of a replaced session, kept until the new one has seen
/// traffic so datagrams in flight across a renewal still decrypt.
struct PreviousSession {
    remote_key: SessionKey,
    remote_sequence_number: u32,
}

/// A session negotiation in flight, holding the ephemeral ECDHE key so
/// retransmissions keep deriving the same secret.
pub struct NextSession {
    pub session_number: u32,
    pub cipher_suite: CipherSuite,
    pub elliptic_curve: EllipticCurve,
    pub ecdhe: EcdheContext,
}

pub struct PeerSession {
    pub endpoint: SocketAddr,
    pub state: SessionState,
    remote_host_identifier: Option<HostIdentifier>,
    /// The peer's verified signature public key, from its PRESENTATION.
    pub remote_public_key: Option<Vec<u8>>,
    pub remote_certificate_hash: Option<CertificateHash>,
    /// Outstanding HELLO: the unique identifier and when it was sent.
    pub hello: Option<(u32, u64)>,
    /// Whether our PRESENTATION went out for this peer entry.
    pub presented: bool,
    /// Our last SESSION answer, replayed verbatim when the peer
    /// retransmits the request it belongs to.
    pub cached_session_reply: Option<Bytes>,
    /// Tick at which the current session was installed.
    pub established_at: u64,
    current: Option<CurrentSession>,
    previous: Option<PreviousSession>,
    next: Option<NextSession>,
    pub last_sign_of_life: u64,
    pub last_send: u64,
    decrypt_failures: u32,
    failure_window_start: u64,
}

impl PeerSession {
    pub fn new(endpoint: SocketAddr, now: u64) -> Self {
        Self {
            endpoint,
            state: SessionState::Idle,
            remote_host_identifier: None,
            remote_public_key: None,
            remote_certificate_hash: None,
            hello: None,
            presented: false,
            cached_session_reply: None,
            established_at: now,
            current: None,
            previous: None,
            next: None,
            last_sign_of_life: now,
            last_send: now,
            decrypt_failures: 0,
            failure_window_start: now,
        }
    }

    /// Pin the remote host identifier on first sight; afterwards only the
    /// same value is accepted, which tells apart a restarted peer from an
    /// impostor reusing its address.
    pub fn set_first_remote_host_identifier(&mut self, host_identifier: HostIdentifier) -> bool {
        match &self.remote_host_identifier {
            None => {
                self.remote_host_identifier = Some(host_identifier);
                true
            }
            Some(pinned) => *pinned == host_identifier,
        }
    }

    pub fn remote_host_identifier(&self) -> Option<&HostIdentifier> {
        self.remote_host_identifier.as_ref()
    }

    pub fn current_session(&self) -> Option<&CurrentSession> {
        self.current.as_ref()
    }

    pub fn next_session(&self) -> Option<&NextSession> {
        self.next.as_ref()
    }

    pub fn has_current_session(&self) -> bool {
        self.current.is_some()
    }

    /// The number a fresh negotiation should use.
    pub fn next_session_number(&self) -> u32 {
        match (&self.next, &self.current) {
            (Some(next), _) => next.session_number,
            (None, Some(current)) => current.session_number.wrapping_add(1),
            (None, None) => 0,
        }
    }

    /// Create (or keep) the in-flight negotiation state.
    ///
    /// A request matching the parameters already in flight keeps the
    /// existing ephemeral key, so a retransmitted SESSION_REQUEST cannot
    /// break a half-complete handshake. Returns whether a new ephemeral was
    /// created.
    pub fn prepare_session(
        &mut self,
        session_number: u32,
        cipher_suite: CipherSuite,
        elliptic_curve: EllipticCurve,
    ) -> Result<bool, Error> {
        if let Some(next) = &self.next {
            if next.session_number == session_number
                && next.cipher_suite == cipher_suite
                && next.elliptic_curve == elliptic_curve
            {
                return Ok(false);
            }
        }

        self.next = Some(NextSession {
            session_number,
            cipher_suite,
            elliptic_curve,
            ecdhe: EcdheContext::generate(elliptic_curve)?,
        });

        Ok(true)
    }

    /// Discard the in-flight negotiation (losing side of a simultaneous
    /// SESSION_REQUEST race).
    pub fn discard_next_session(&mut self) {
        self.next = None;
    }

    /// Finish the negotiation: derive the shared secret against the remote
    /// ephemeral public key and install the new session. The replaced
    /// session's inbound key is retained until the new one has seen
    /// traffic.
    pub fn complete_session(
        &mut self,
        remote_public_key: &[u8],
        local_host_identifier: &HostIdentifier,
    ) -> Result<(), Error> {
        let (Some(next), Some(remote_host_identifier)) = (&self.next, &self.remote_host_identifier)
        else {
            return Err(Error::InvalidInput);
        };

        let shared_secret = next.ecdhe.derive_shared_secret(remote_public_key)?;
        let suite = next.cipher_suite;

        let local = derive_key_material(suite, &shared_secret, local_host_identifier);
        let remote = derive_key_material(suite, &shared_secret, remote_host_identifier);

        let session = CurrentSession {
            session_number: next.session_number,
            cipher_suite: suite,
            elliptic_curve: next.elliptic_curve,
            local_key: SessionKey::new(suite, &local)?,
            remote_key: SessionKey::new(suite, &remote)?,
            local_sequence_number: 0,
            remote_sequence_number: 0,
            seen_inbound: false,
        };

        self.previous = self.current.take().map(|old| PreviousSession {
            remote_key: old.remote_key,
            remote_sequence_number: old.remote_sequence_number,
        });
        self.current = Some(session);
        self.next = None;
        self.state = SessionState::Established;

        Ok(())
    }

    /// Seal and frame an in-session message, consuming the next sequence
    /// number. Fails when no session is established or the sequence space
    /// is exhausted.
    pub fn seal(
        &mut self,
        buf: &mut BytesMut,
        kind: SecureKind,
        plaintext: &[u8],
        now: u64,
    ) -> Result<(), Error> {
        let current = self.current.as_mut().ok_or(Error::InvalidInput)?;
        let sequence_number = current
            .local_sequence_number
            .checked_add(1)
            .ok_or(Error::CryptoFailed)?;

        Secure::encode(buf, kind, sequence_number, plaintext, &current.local_key)?;
        current.local_sequence_number = sequence_number;
        self.last_send = now;

        Ok(())
    }

    /// Open an inbound sealed message.
    ///
    /// Only sequence numbers strictly greater than the highest accepted one
    /// are admitted (no reordering window). During a renewal the previous
    /// inbound key is tried as a fallback until the new session has proven
    /// itself.
    pub fn open(&mut self, secure: &Secure<'_>, now: u64) -> Result<Vec<u8>, Error> {
        let current = self.current.as_mut().ok_or(Error::InvalidInput)?;

        if secure.sequence_number > current.remote_sequence_number {
            if let Ok(plaintext) = secure.open(&current.remote_key) {
                current.remote_sequence_number = secure.sequence_number;
                current.seen_inbound = true;
                self.previous = None;
                self.last_sign_of_life = now;

                return Ok(plaintext);
            }
        }

        // Renewal grace: traffic sealed under the replaced session is still
        // accepted until the new keys have seen inbound data.
        if !current.seen_inbound {
            if let Some(previous) = self.previous.as_mut() {
                if secure.sequence_number > previous.remote_sequence_number {
                    if let Ok(plaintext) = secure.open(&previous.remote_key) {
                        previous.remote_sequence_number = secure.sequence_number;
                        self.last_sign_of_life = now;

                        return Ok(plaintext);
                    }
                }
            }
        }

        Err(Error::CryptoFailed)
    }

    /// Count a decryption failure; returns true once the loss threshold is
    /// crossed.
    pub fn register_decrypt_failure(&mut self, now: u64) -> bool {
        if now.saturating_sub(self.failure_window_start) >= FAILURE_WINDOW_SECS {
            self.failure_window_start = now;
            self.decrypt_failures = 0;
        }

        self.decrypt_failures += 1;
        self.decrypt_failures >= MAX_DECRYPT_FAILURES
    }

    pub fn is_current_session_old(&self) -> bool {
        self.current.as_ref().is_some_and(CurrentSession::is_old)
    }

    /// Tear down all session material; the peer entry is recreated from the
    /// next PRESENTATION.
    pub fn clear(&mut self) -> bool {
        let had_session = self.current.is_some();

        self.remote_host_identifier = None;
        self.remote_public_key = None;
        self.current = None;
        self.previous = None;
        self.next = None;
        self.state = SessionState::Lost;

        had_session
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::Decoder;
    use codec::Packet;

    fn established_pair() -> (PeerSession, PeerSession, HostIdentifier, HostIdentifier) {
        let a_id = HostIdentifier([1; 32]);
        let b_id = HostIdentifier([2; 32]);

        let mut a = PeerSession::new("127.0.0.1:12001".parse().unwrap(), 0);
        let mut b = PeerSession::new("127.0.0.1:12000".parse().unwrap(), 0);

        a.set_first_remote_host_identifier(b_id);
        b.set_first_remote_host_identifier(a_id);

        a.prepare_session(
            0,
            CipherSuite::EcdheRsaAes256GcmSha384,
            EllipticCurve::Secp256r1,
        )
        .unwrap();
        b.prepare_session(
            0,
            CipherSuite::EcdheRsaAes256GcmSha384,
            EllipticCurve::Secp256r1,
        )
        .unwrap();

        let a_public = a.next_session().unwrap().ecdhe.public_key().to_vec();
        let b_public = b.next_session().unwrap().ecdhe.public_key().to_vec();

        a.complete_session(&b_public, &a_id).unwrap();
        b.complete_session(&a_public, &b_id).unwrap();

        (a, b, a_id, b_id)
    }

    fn transfer(from: &mut PeerSession, to: &mut PeerSession, payload: &[u8]) -> Option<Vec<u8>> {
        let mut buf = BytesMut::new();
        from.seal(&mut buf, SecureKind::Data(0), payload, 1).unwrap();

        match Decoder::decode(&buf).unwrap() {
            Packet::Secure(secure) => to.open(&secure, 1).ok(),
            _ => unreachable!(),
        }
    }

    #[test]
    fn data_flows_both_ways() {
        let (mut a, mut b, _, _) = established_pair();

        assert_eq!(
            transfer(&mut a, &mut b, &[0xAA, 0xBB, 0xCC]),
            Some(vec![0xAA, 0xBB, 0xCC])
        );
        assert_eq!(transfer(&mut b, &mut a, b"pong"), Some(b"pong".to_vec()));
        assert_eq!(b.current_session().unwrap().remote_sequence_number, 1);
    }

    #[test]
    fn replayed_datagram_is_rejected() {
        let (mut a, mut b, _, _) = established_pair();

        let mut buf = BytesMut::new();
        a.seal(&mut buf, SecureKind::Data(0), b"once", 1).unwrap();

        let first = match Decoder::decode(&buf).unwrap() {
            Packet::Secure(secure) => b.open(&secure, 1),
            _ => unreachable!(),
        };
        assert!(first.is_ok());

        let replay = match Decoder::decode(&buf).unwrap() {
            Packet::Secure(secure) => b.open(&secure, 1),
            _ => unreachable!(),
        };
        assert!(replay.is_err());
    }

    #[test]
    fn host_identifier_is_pinned() {
        let mut session = PeerSession::new("127.0.0.1:12000".parse().unwrap(), 0);

        assert!(session.set_first_remote_host_identifier(HostIdentifier([1; 32])));
        assert!(session.set_first_remote_host_identifier(HostIdentifier([1; 32])));
        assert!(!session.set_first_remote_host_identifier(HostIdentifier([2; 32])));
    }

    #[test]
    fn prepare_session_is_idempotent_for_matching_parameters() {
        let mut session = PeerSession::new("127.0.0.1:12000".parse().unwrap(), 0);

        assert!(session
            .prepare_session(
                1,
                CipherSuite::EcdheRsaAes128GcmSha256,
                EllipticCurve::Secp256r1
            )
            .unwrap());
        let key = session.next_session().unwrap().ecdhe.public_key().to_vec();

        assert!(!session
            .prepare_session(
                1,
                CipherSuite::EcdheRsaAes128GcmSha256,
                EllipticCurve::Secp256r1
            )
            .unwrap());
        assert_eq!(session.next_session().unwrap().ecdhe.public_key(), key);

        assert!(session
            .prepare_session(
                2,
                CipherSuite::EcdheRsaAes128GcmSha256,
                EllipticCurve::Secp256r1
            )
            .unwrap());
        assert_ne!(session.next_session().unwrap().ecdhe.public_key(), key);
    }

    #[test]
    fn renewal_keeps_previous_inbound_keys_until_traffic_arrives() {
        let (mut a, mut b, a_id, b_id) = established_pair();

        // A datagram sealed on the old session, still in flight.
        let mut stale = BytesMut::new();
        a.seal(&mut stale, SecureKind::Data(0), b"in flight", 1)
            .unwrap();

        // Renew: both sides negotiate session 1.
        a.prepare_session(
            1,
            CipherSuite::EcdheRsaAes256GcmSha384,
            EllipticCurve::Secp256r1,
        )
        .unwrap();
        b.prepare_session(
            1,
            CipherSuite::EcdheRsaAes256GcmSha384,
            EllipticCurve::Secp256r1,
        )
        .unwrap();
        let a_public = a.next_session().unwrap().ecdhe.public_key().to_vec();
        let b_public = b.next_session().unwrap().ecdhe.public_key().to_vec();
        a.complete_session(&b_public, &a_id).unwrap();
        b.complete_session(&a_public, &b_id).unwrap();

        // The stale datagram still opens through the retained keys.
        match Decoder::decode(&stale).unwrap() {
            Packet::Secure(secure) => assert_eq!(b.open(&secure, 2).unwrap(), b"in flight"),
            _ => unreachable!(),
        }

        // New-session traffic drops the retained keys.
        assert!(transfer(&mut a, &mut b, b"fresh").is_some());
        assert!(b.previous.is_none());

        // And the stale keys are gone for good.
        let mut stale_again = BytesMut::new();
        stale_again.extend_from_slice(&stale);
        match Decoder::decode(&stale_again).unwrap() {
            Packet::Secure(secure) => assert!(b.open(&secure, 3).is_err()),
            _ => unreachable!(),
        }
    }

    #[test]
    fn session_reports_old_past_half_the_sequence_space() {
        let (mut a, _, _, _) = established_pair();
        assert!(!a.is_current_session_old());

        a.current.as_mut().unwrap().local_sequence_number = SEQUENCE_HALF + 1;
        assert!(a.is_current_session_old());

        // The next negotiation uses the incremented session number.
        assert_eq!(a.next_session_number(), 1);
    }

    #[test]
    fn decrypt_failure_threshold() {
        let (mut a, _, _, _) = established_pair();

        for _ in 0..MAX_DECRYPT_FAILURES - 1 {
            assert!(!a.register_decrypt_failure(10));
        }
        assert!(a.register_decrypt_failure(10));
    }
}
