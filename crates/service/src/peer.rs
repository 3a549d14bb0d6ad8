//! The peer registry and protocol engine.
//!
//! [`PeerManager`] owns every [`PeerSession`], maps inbound datagrams to
//! them and drives the greeting, presentation, negotiation and renewal
//! machinery. It is deliberately free of any I/O: `process` and `tick`
//! append datagrams to send onto an output queue the caller drains into its
//! socket, and decrypted application data comes back the same way.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use ahash::{HashMap, HashMapExt, HashSet, HashSetExt};
use bytes::{Bytes, BytesMut};
use codec::{
    Decoder, Error, Packet,
    crypto::{
        self, CertificateHash, CipherSuite, EllipticCurve, HostIdentifier, SigningIdentity,
    },
    message::{
        Contact, ContactRequest, Handshake, HandshakeKind, Hello, Presentation, Secure,
        SecureKind,
    },
};
use parking_lot::{Mutex, RwLock};
use rand::Rng;

use crate::{
    rate::{AdmissionControl, AdmissionOptions},
    session::{LossReason, PeerSession, SessionState},
};

/// Something the engine wants the driver to do.
#[derive(Debug)]
pub enum Output {
    /// Send a datagram on the UDP socket.
    Transmit(SocketAddr, Bytes),
    /// Decrypted application data for the relay layer.
    Deliver {
        source: SocketAddr,
        channel: u8,
        payload: Vec<u8>,
    },
}

/// Validates a presented certificate chain and hands back the peer's
/// signature public key. Full X.509 walking (including the
/// `none | last_only | all` revocation policies) lives behind this seam;
/// the built-in implementation only accepts pinned raw public key blobs.
pub trait CertificateVerifier: Send + Sync {
    fn verify(&self, certificate_der: &[u8]) -> Option<Vec<u8>>;
}

/// Accepts certificates whose raw bytes are a known public key. With no
/// pinned set it accepts anything, which is only sane when the PSK is what
/// actually authenticates the handshake.
#[derive(Default)]
pub struct PinnedKeyVerifier {
    pinned: Option<HashSet<Vec<u8>>>,
}

impl PinnedKeyVerifier {
    pub fn accept_any() -> Self {
        Self { pinned: None }
    }

    pub fn pinned(keys: impl IntoIterator<Item = Vec<u8>>) -> Self {
        Self {
            pinned: Some(keys.into_iter().collect()),
        }
    }
}

impl CertificateVerifier for PinnedKeyVerifier {
    fn verify(&self, certificate_der: &[u8]) -> Option<Vec<u8>> {
        match &self.pinned {
            None => Some(certificate_der.to_vec()),
            Some(keys) => keys
                .contains(certificate_der)
                .then(|| certificate_der.to_vec()),
        }
    }
}

/// Event sink implemented by the embedding application.
#[allow(unused_variables)]
pub trait ServiceHandler: Send + Sync {
    /// A session reached ESTABLISHED (first negotiation or renewal).
    fn on_session_established(&self, endpoint: SocketAddr, hash: Option<CertificateHash>) {}

    /// The peer entry was destroyed.
    fn on_session_lost(&self, endpoint: SocketAddr, reason: LossReason) {}

    /// A CONTACT taught us where a wanted certificate lives.
    fn on_contact_learned(&self, hash: CertificateHash, endpoint: SocketAddr) {}

    /// A datagram failed to parse or decrypt.
    fn on_wire_error(&self, source: SocketAddr, error: &Error) {}
}

/// The local identity material: a signature certificate, a pre-shared key,
/// or both.
pub struct IdentityStore {
    pub certificate: Option<SigningIdentity>,
    pub pre_shared_key: Option<Vec<u8>>,
}

impl IdentityStore {
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, Error> {
        if let Some(certificate) = &self.certificate {
            certificate.sign(message)
        } else if let Some(psk) = &self.pre_shared_key {
            Ok(crypto::psk_sign(psk, message))
        } else {
            Err(Error::SignatureFailed)
        }
    }

    fn verify(&self, remote_public_key: Option<&[u8]>, message: &[u8], tag: &[u8]) -> bool {
        match remote_public_key {
            Some(key) => crypto::verify_signature(key, message, tag).is_ok(),
            None => match &self.pre_shared_key {
                Some(psk) => crypto::psk_verify(psk, message, tag).is_ok(),
                None => false,
            },
        }
    }
}

pub struct FscpOptions {
    pub cipher_suites: Vec<CipherSuite>,
    pub elliptic_curves: Vec<EllipticCurve>,
    /// Unanswered HELLOs retry after this many seconds.
    pub hello_timeout_secs: u64,
    /// Period of the contact machinery: static peers are re-greeted and
    /// wanted hashes re-requested at this cadence.
    pub contact_period_secs: u64,
    pub keep_alive_period_secs: u64,
    pub idle_timeout_secs: u64,
    pub renew_period_secs: u64,
    pub accept_contact_requests: bool,
    pub accept_contacts: bool,
    pub admission: AdmissionOptions,
}

impl Default for FscpOptions {
    fn default() -> Self {
        Self {
            cipher_suites: CipherSuite::ALL.to_vec(),
            elliptic_curves: EllipticCurve::ALL.to_vec(),
            hello_timeout_secs: 3,
            contact_period_secs: 30,
            keep_alive_period_secs: 10,
            idle_timeout_secs: 90,
            renew_period_secs: 12 * 3600,
            accept_contact_requests: true,
            accept_contacts: true,
            admission: AdmissionOptions::default(),
        }
    }
}

/// A monotonic second counter advanced by the driver's tick task, so every
/// timeout in the engine is tick-relative and tests can steer time freely.
#[derive(Default)]
pub struct Timer(AtomicU64);

impl Timer {
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn add(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

pub struct PeerManagerOptions<T> {
    pub identity: IdentityStore,
    pub verifier: Arc<dyn CertificateVerifier>,
    pub fscp: FscpOptions,
    pub handler: T,
}

pub struct PeerManager<T> {
    identity: IdentityStore,
    verifier: Arc<dyn CertificateVerifier>,
    host_identifier: HostIdentifier,
    options: FscpOptions,
    peers: RwLock<HashMap<SocketAddr, Arc<Mutex<PeerSession>>>>,
    hash_index: RwLock<HashMap<CertificateHash, SocketAddr>>,
    static_peers: RwLock<HashSet<SocketAddr>>,
    wanted_contacts: RwLock<HashSet<CertificateHash>>,
    admission: Mutex<AdmissionControl>,
    timer: Timer,
    handler: T,
}

impl<T> PeerManager<T>
where
    T: ServiceHandler,
{
    pub fn new(options: PeerManagerOptions<T>) -> Result<Arc<Self>, Error> {
        Ok(Arc::new(Self {
            identity: options.identity,
            verifier: options.verifier,
            host_identifier: HostIdentifier::generate()?,
            admission: Mutex::new(AdmissionControl::new(AdmissionOptions {
                max_unauthenticated_messages_per_second: options
                    .fscp
                    .admission
                    .max_unauthenticated_messages_per_second,
                never_contact: options.fscp.admission.never_contact.clone(),
            })),
            options: options.fscp,
            peers: RwLock::new(HashMap::with_capacity(64)),
            hash_index: RwLock::new(HashMap::with_capacity(64)),
            static_peers: RwLock::new(HashSet::with_capacity(16)),
            wanted_contacts: RwLock::new(HashSet::with_capacity(16)),
            timer: Timer::default(),
            handler: options.handler,
        }))
    }

    pub fn host_identifier(&self) -> &HostIdentifier {
        &self.host_identifier
    }

    pub fn certificate_hash(&self) -> Option<CertificateHash> {
        self.identity
            .certificate
            .as_ref()
            .map(|it| it.certificate_hash())
    }

    /// Endpoints of every peer currently holding an established session.
    pub fn established_peers(&self) -> Vec<SocketAddr> {
        self.peers
            .read()
            .iter()
            .filter(|(_, session)| session.lock().has_current_session())
            .map(|(endpoint, _)| *endpoint)
            .collect()
    }

    pub fn endpoint_of(&self, hash: &CertificateHash) -> Option<SocketAddr> {
        self.hash_index.read().get(hash).copied()
    }

    /// Register a statically configured peer; it is greeted now and
    /// re-greeted every contact period until a session exists.
    pub fn add_static_peer(&self, endpoint: SocketAddr, outputs: &mut Vec<Output>) {
        self.static_peers.write().insert(endpoint);
        self.greet(endpoint, outputs);
    }

    /// Ask the mesh for the endpoint of a certificate we want to reach.
    pub fn add_wanted_contact(&self, hash: CertificateHash) {
        self.wanted_contacts.write().insert(hash);
    }

    /// Start (or restart) greeting an endpoint.
    pub fn greet(&self, endpoint: SocketAddr, outputs: &mut Vec<Output>) {
        if self.admission.lock().is_never_contact(endpoint.ip()) {
            return;
        }

        let now = self.timer.get();
        let session = self.session_entry(endpoint, now);
        let mut session = session.lock();

        if session.has_current_session() {
            return;
        }

        self.send_hello(&mut session, now, outputs);
    }

    /// Feed one received datagram through the engine.
    pub fn process(&self, bytes: &[u8], source: SocketAddr, outputs: &mut Vec<Output>) {
        let now = self.timer.get();

        match Decoder::decode(bytes) {
            Ok(Packet::HelloRequest(hello)) => self.on_hello_request(hello, source, now, outputs),
            Ok(Packet::HelloResponse(hello)) => {
                self.on_hello_response(hello, source, now, outputs)
            }
            Ok(Packet::Presentation(presentation)) => {
                self.on_presentation(&presentation, source, now, outputs)
            }
            Ok(Packet::SessionRequest(handshake)) => {
                self.on_session_request(&handshake, source, now, outputs)
            }
            Ok(Packet::Session(handshake)) => self.on_session(&handshake, source, now, outputs),
            Ok(Packet::Secure(secure)) => self.on_secure(&secure, source, now, outputs),
            Err(error) => {
                log::trace!("undecodable datagram from {}: {}", source, error);
                self.handler.on_wire_error(source, &error);
            }
        }
    }

    /// Seal application data onto a channel of an established session.
    pub fn send_data(
        &self,
        endpoint: SocketAddr,
        channel: u8,
        payload: &[u8],
        outputs: &mut Vec<Output>,
    ) -> Result<(), Error> {
        let session = self
            .peers
            .read()
            .get(&endpoint)
            .cloned()
            .ok_or(Error::InvalidInput)?;

        let now = self.timer.get();
        let mut session = session.lock();
        let mut buf = BytesMut::new();
        session.seal(&mut buf, SecureKind::Data(channel & 0x0F), payload, now)?;

        outputs.push(Output::Transmit(endpoint, buf.freeze()));
        Ok(())
    }

    /// Advance the engine clock by one second and run every periodic duty:
    /// hello retries, keep-alives, idle expiry, renewals and the contact
    /// machinery.
    pub fn tick(&self, outputs: &mut Vec<Output>) {
        let now = self.timer.add();

        if now % 30 == 0 {
            self.admission.lock().reclaim(now);
        }

        let snapshot: Vec<_> = self
            .peers
            .read()
            .iter()
            .map(|(endpoint, session)| (*endpoint, session.clone()))
            .collect();

        let mut lost = Vec::new();
        for (endpoint, session) in snapshot {
            let mut session = session.lock();

            // Entries that never produced a session expire like idle
            // established ones; a HELLO can always start them over.
            if now.saturating_sub(session.last_sign_of_life) >= self.options.idle_timeout_secs {
                lost.push((endpoint, LossReason::IdleTimeout));
                continue;
            }

            match session.state {
                SessionState::Greeted | SessionState::Presented => {
                    // Greeting timed out; try again with a fresh identifier.
                    if let Some((_, sent_at)) = session.hello {
                        if now.saturating_sub(sent_at) >= self.options.hello_timeout_secs {
                            self.send_hello(&mut session, now, outputs);
                        }
                    }
                }
                SessionState::Negotiating | SessionState::Established
                | SessionState::Renewing => {
                    if session.has_current_session() {
                        self.drive_established(&mut session, now, outputs);
                    } else if session.next_session().is_some()
                        && now.saturating_sub(session.last_send)
                            >= self.options.hello_timeout_secs
                    {
                        // The request may have been lost. The prepared
                        // ephemeral is reused, so this cannot fork a
                        // half-complete handshake.
                        if let Err(error) = self.send_session_request(&mut session, now, outputs)
                        {
                            log::warn!(
                                "session request retry towards {} failed: {}",
                                endpoint,
                                error
                            );
                        }
                    }
                }
                SessionState::Idle | SessionState::Lost => {}
            }
        }

        for (endpoint, reason) in lost {
            self.remove_peer(endpoint, reason);
        }

        if now % self.options.contact_period_secs.max(1) == 0 {
            self.contact_round(now, outputs);
        }
    }

    /// Tear everything down; pending peers report `Cancelled`.
    pub fn close(&self) {
        let endpoints: Vec<_> = self.peers.read().keys().copied().collect();
        for endpoint in endpoints {
            self.remove_peer(endpoint, LossReason::Cancelled);
        }
    }

    fn session_entry(&self, endpoint: SocketAddr, now: u64) -> Arc<Mutex<PeerSession>> {
        if let Some(session) = self.peers.read().get(&endpoint) {
            return session.clone();
        }

        self.peers
            .write()
            .entry(endpoint)
            .or_insert_with(|| Arc::new(Mutex::new(PeerSession::new(endpoint, now))))
            .clone()
    }

    fn existing_session(&self, endpoint: SocketAddr) -> Option<Arc<Mutex<PeerSession>>> {
        self.peers.read().get(&endpoint).cloned()
    }

    fn remove_peer(&self, endpoint: SocketAddr, reason: LossReason) {
        let removed = self.peers.write().remove(&endpoint);

        if let Some(session) = removed {
            let mut session = session.lock();
            if let Some(hash) = session.remote_certificate_hash {
                let mut index = self.hash_index.write();
                if index.get(&hash) == Some(&endpoint) {
                    index.remove(&hash);
                }
            }

            session.clear();
            drop(session);

            log::info!("peer {} lost: {}", endpoint, reason);
            self.handler.on_session_lost(endpoint, reason);
        }
    }

    fn send_hello(&self, session: &mut PeerSession, now: u64, outputs: &mut Vec<Output>) {
        let unique_id: u32 = rand::rng().random();
        session.hello = Some((unique_id, now));
        if session.state == SessionState::Idle {
            session.state = SessionState::Greeted;
        }

        let mut buf = BytesMut::new();
        Hello { unique_id }.encode_request(&mut buf);
        outputs.push(Output::Transmit(session.endpoint, buf.freeze()));
    }

    fn send_presentation(&self, session: &mut PeerSession, outputs: &mut Vec<Output>) {
        let mut buf = BytesMut::new();
        Presentation {
            certificate: self.identity.certificate.as_ref().map(|it| it.certificate()),
            host_identifier: self.host_identifier,
        }
        .encode(&mut buf);

        session.presented = true;
        outputs.push(Output::Transmit(session.endpoint, buf.freeze()));
    }

    fn send_session_request(
        &self,
        session: &mut PeerSession,
        now: u64,
        outputs: &mut Vec<Output>,
    ) -> Result<(), Error> {
        let session_number = session.next_session_number();
        session.prepare_session(
            session_number,
            self.options.cipher_suites[0],
            self.options.elliptic_curves[0],
        )?;

        let mut buf = BytesMut::new();
        let next = session.next_session().ok_or(Error::InvalidInput)?;
        Handshake::encode(
            &mut buf,
            HandshakeKind::SessionRequest,
            session_number,
            &self.options.cipher_suites,
            &self.options.elliptic_curves,
            next.ecdhe.public_key(),
            |signed| self.identity.sign(signed),
        )?;

        session.state = if session.has_current_session() {
            SessionState::Renewing
        } else {
            SessionState::Negotiating
        };
        session.last_send = now;

        outputs.push(Output::Transmit(session.endpoint, buf.freeze()));
        Ok(())
    }

    fn on_hello_request(
        &self,
        hello: Hello,
        source: SocketAddr,
        now: u64,
        outputs: &mut Vec<Output>,
    ) {
        if !self.admission.lock().allow_hello(source.ip(), now) {
            log::trace!("hello from {} dropped by admission control", source);
            return;
        }

        let mut buf = BytesMut::new();
        hello.encode_response(&mut buf);
        outputs.push(Output::Transmit(source, buf.freeze()));
    }

    fn on_hello_response(
        &self,
        hello: Hello,
        source: SocketAddr,
        now: u64,
        outputs: &mut Vec<Output>,
    ) {
        let Some(session) = self.existing_session(source) else {
            return;
        };

        let mut session = session.lock();
        match session.hello {
            Some((unique_id, _)) if unique_id == hello.unique_id => {
                session.hello = None;
                session.last_sign_of_life = now;
                if session.state == SessionState::Greeted {
                    session.state = SessionState::Presented;
                }

                self.send_presentation(&mut session, outputs);
            }
            _ => log::trace!("unexpected hello response from {}", source),
        }
    }

    fn on_presentation(
        &self,
        presentation: &Presentation<'_>,
        source: SocketAddr,
        now: u64,
        outputs: &mut Vec<Output>,
    ) {
        if !self.admission.lock().allow_presentation(source.ip(), now) {
            log::trace!("presentation from {} dropped by admission control", source);
            return;
        }

        // Authenticate the identity before touching any session state.
        let verified = match presentation.certificate {
            Some(certificate) => match self.verifier.verify(certificate) {
                Some(public_key) => Some((public_key, CertificateHash::of(certificate))),
                None => {
                    log::warn!("presentation from {} carries an untrusted certificate", source);
                    return;
                }
            },
            None => {
                if self.identity.pre_shared_key.is_none() {
                    log::warn!(
                        "presentation from {} has no certificate and no PSK is configured",
                        source
                    );
                    return;
                }

                None
            }
        };

        let session = self.session_entry(source, now);
        let mut session = session.lock();

        if !session.set_first_remote_host_identifier(presentation.host_identifier) {
            log::warn!("presentation from {} changed its host identifier", source);
            return;
        }

        if let Some((public_key, hash)) = verified {
            session.remote_public_key = Some(public_key);
            session.remote_certificate_hash = Some(hash);
            self.hash_index.write().insert(hash, source);

            let learned: Vec<_> = {
                let mut wanted = self.wanted_contacts.write();
                wanted.remove(&hash).then_some(hash).into_iter().collect()
            };
            for hash in learned {
                self.handler.on_contact_learned(hash, source);
            }
        }

        session.last_sign_of_life = now;

        // Make sure the peer knows who we are too.
        if !session.presented {
            self.send_presentation(&mut session, outputs);
        }

        // Receiving the peer's presentation is what moves us into
        // negotiation, unless a session already exists (a renewal will
        // rotate it when due).
        if !session.has_current_session() && session.next_session().is_none() {
            session.state = SessionState::Negotiating;
            if let Err(error) = self.send_session_request(&mut session, now, outputs) {
                log::warn!("session request towards {} failed: {}", source, error);
            }
        }
    }

    fn on_session_request(
        &self,
        handshake: &Handshake<'_>,
        source: SocketAddr,
        now: u64,
        outputs: &mut Vec<Output>,
    ) {
        let Some(session) = self.existing_session(source) else {
            log::trace!("session request from unknown peer {}", source);
            return;
        };

        let mut session = session.lock();
        if !self.verify_handshake(&session, handshake) {
            log::warn!("session request from {} failed authentication", source);
            return;
        }

        // Retransmission of a request we already answered: replay the
        // answer rather than rotating anything.
        if let Some(current) = session.current_session() {
            if handshake.session_number == current.session_number {
                if let Some(reply) = session.cached_session_reply.clone() {
                    outputs.push(Output::Transmit(source, reply));
                }

                return;
            }

            if handshake.session_number < current.session_number {
                log::trace!("stale session request from {}", source);
                return;
            }
        }

        // Simultaneous negotiation: the numerically greater host identifier
        // wins and the loser answers the winner's request.
        if session.next_session().is_some() {
            match session.remote_host_identifier() {
                Some(remote) if *remote > self.host_identifier => {
                    session.discard_next_session();
                }
                _ => return,
            }
        }

        let Some(cipher_suite) = handshake
            .cipher_suites
            .iter()
            .find(|it| self.options.cipher_suites.contains(it))
            .copied()
        else {
            log::warn!("no mutually supported cipher suite with {}", source);
            return;
        };

        let Some(elliptic_curve) =
            EllipticCurve::from_public_key_len(handshake.public_key.len())
                .filter(|it| {
                    self.options.elliptic_curves.contains(it)
                        && handshake.elliptic_curves.contains(it)
                })
        else {
            log::warn!("no mutually supported elliptic curve with {}", source);
            return;
        };

        if let Err(error) =
            session.prepare_session(handshake.session_number, cipher_suite, elliptic_curve)
        {
            log::warn!("preparing session for {} failed: {}", source, error);
            return;
        }

        // Answer with our ephemeral key, then derive.
        let mut buf = BytesMut::new();
        let encoded = {
            let next = match session.next_session() {
                Some(next) => next,
                None => return,
            };

            Handshake::encode(
                &mut buf,
                HandshakeKind::Session,
                handshake.session_number,
                &[cipher_suite],
                &[elliptic_curve],
                next.ecdhe.public_key(),
                |signed| self.identity.sign(signed),
            )
        };
        if let Err(error) = encoded {
            log::warn!("session answer towards {} failed: {}", source, error);
            return;
        }

        match session.complete_session(handshake.public_key, &self.host_identifier) {
            Ok(()) => {
                let reply = buf.freeze();
                session.cached_session_reply = Some(reply.clone());
                session.established_at = now;
                session.last_sign_of_life = now;
                session.last_send = now;

                outputs.push(Output::Transmit(source, reply));

                let hash = session.remote_certificate_hash;
                drop(session);
                log::info!("session with {} established (responder)", source);
                self.handler.on_session_established(source, hash);
            }
            Err(error) => {
                log::warn!("completing session with {} failed: {}", source, error);
            }
        }
    }

    fn on_session(
        &self,
        handshake: &Handshake<'_>,
        source: SocketAddr,
        now: u64,
        _outputs: &mut Vec<Output>,
    ) {
        let Some(session) = self.existing_session(source) else {
            return;
        };

        let mut session = session.lock();
        if !self.verify_handshake(&session, handshake) {
            log::warn!("session answer from {} failed authentication", source);
            return;
        }

        let Some(next) = session.next_session() else {
            log::trace!("unsolicited session answer from {}", source);
            return;
        };

        if next.session_number != handshake.session_number {
            log::trace!("session answer from {} for a different negotiation", source);
            return;
        }

        // The answer must confirm the parameters of our in-flight request;
        // a suite or curve change without a new negotiation is refused.
        if handshake.cipher_suites != [next.cipher_suite]
            || handshake.elliptic_curves != [next.elliptic_curve]
            || EllipticCurve::from_public_key_len(handshake.public_key.len())
                != Some(next.elliptic_curve)
        {
            log::warn!("session answer from {} altered the negotiated parameters", source);
            return;
        }

        match session.complete_session(handshake.public_key, &self.host_identifier) {
            Ok(()) => {
                session.cached_session_reply = None;
                session.established_at = now;
                session.last_sign_of_life = now;

                let hash = session.remote_certificate_hash;
                drop(session);
                log::info!("session with {} established (initiator)", source);
                self.handler.on_session_established(source, hash);
            }
            Err(error) => {
                log::warn!("completing session with {} failed: {}", source, error);
            }
        }
    }

    fn on_secure(
        &self,
        secure: &Secure<'_>,
        source: SocketAddr,
        now: u64,
        outputs: &mut Vec<Output>,
    ) {
        let Some(session) = self.existing_session(source) else {
            return;
        };

        let mut locked = session.lock();
        let plaintext = match locked.open(secure, now) {
            Ok(plaintext) => plaintext,
            Err(error) => {
                self.handler.on_wire_error(source, &error);
                if locked.register_decrypt_failure(now) {
                    drop(locked);
                    self.remove_peer(source, LossReason::DecryptFailures);
                }

                return;
            }
        };

        match secure.kind {
            SecureKind::Data(channel) => {
                drop(locked);
                outputs.push(Output::Deliver {
                    source,
                    channel,
                    payload: plaintext,
                });
            }
            SecureKind::KeepAlive => {
                // Opening it already refreshed the sign of life.
            }
            SecureKind::ContactRequest => {
                drop(locked);
                self.on_contact_request(&plaintext, source, now, outputs);
            }
            SecureKind::Contact => {
                drop(locked);
                self.on_contact(&plaintext, source, outputs);
            }
        }
    }

    fn on_contact_request(
        &self,
        plaintext: &[u8],
        source: SocketAddr,
        now: u64,
        outputs: &mut Vec<Output>,
    ) {
        if !self.options.accept_contact_requests {
            return;
        }

        let Ok(request) = ContactRequest::decode(plaintext) else {
            self.handler.on_wire_error(source, &Error::BadLength);
            return;
        };

        let entries: Vec<_> = {
            let index = self.hash_index.read();
            request
                .hashes
                .iter()
                .filter_map(|hash| {
                    index
                        .get(hash)
                        .filter(|endpoint| **endpoint != source)
                        .map(|endpoint| (*hash, *endpoint))
                })
                .collect()
        };

        if entries.is_empty() {
            return;
        }

        let Some(session) = self.existing_session(source) else {
            return;
        };

        let mut session = session.lock();
        let mut buf = BytesMut::new();
        let payload = Contact { entries }.encode();
        if session
            .seal(&mut buf, SecureKind::Contact, &payload, now)
            .is_ok()
        {
            outputs.push(Output::Transmit(source, buf.freeze()));
        }
    }

    fn on_contact(&self, plaintext: &[u8], source: SocketAddr, outputs: &mut Vec<Output>) {
        if !self.options.accept_contacts {
            return;
        }

        let Ok(contact) = Contact::decode(plaintext) else {
            self.handler.on_wire_error(source, &Error::BadLength);
            return;
        };

        for (hash, endpoint) in contact.entries {
            if self.admission.lock().is_never_contact(endpoint.ip()) {
                continue;
            }

            if !self.wanted_contacts.read().contains(&hash) {
                continue;
            }

            log::debug!("learned contact {} at {} (via {})", hash, endpoint, source);
            self.handler.on_contact_learned(hash, endpoint);
            self.greet(endpoint, outputs);
        }
    }

    fn drive_established(
        &self,
        session: &mut PeerSession,
        now: u64,
        outputs: &mut Vec<Output>,
    ) {
        // Renewal: when the sequence space runs low either side reacts; the
        // periodic rotation is initiated by the lexically smaller host
        // identifier so both sides don't race every twelve hours.
        let timer_due = now.saturating_sub(session.established_at) >= self.options.renew_period_secs
            && session
                .remote_host_identifier()
                .is_some_and(|remote| self.host_identifier < *remote);

        let renewal_in_flight = session.next_session().is_some();
        let retry_due =
            now.saturating_sub(session.last_send) >= self.options.hello_timeout_secs;

        if (renewal_in_flight && retry_due)
            || (!renewal_in_flight && (session.is_current_session_old() || timer_due))
        {
            if let Err(error) = self.send_session_request(session, now, outputs) {
                log::warn!("renewal towards {} failed: {}", session.endpoint, error);
            }

            return;
        }

        if now.saturating_sub(session.last_send) >= self.options.keep_alive_period_secs {
            let mut padding = [0u8; 32];
            rand::rng().fill(&mut padding);

            let mut buf = BytesMut::new();
            if session
                .seal(&mut buf, SecureKind::KeepAlive, &padding, now)
                .is_ok()
            {
                outputs.push(Output::Transmit(session.endpoint, buf.freeze()));
            }
        }
    }

    fn contact_round(&self, now: u64, outputs: &mut Vec<Output>) {
        // Re-greet static peers without a session.
        let static_peers: Vec<_> = self.static_peers.read().iter().copied().collect();
        for endpoint in static_peers {
            let established = self
                .existing_session(endpoint)
                .is_some_and(|session| session.lock().has_current_session());

            if !established {
                self.greet(endpoint, outputs);
            }
        }

        // Ask every established peer about the hashes still unresolved.
        let mut unresolved: Vec<_> = {
            let index = self.hash_index.read();
            self.wanted_contacts
                .read()
                .iter()
                .filter(|hash| !index.contains_key(hash))
                .copied()
                .collect()
        };

        if unresolved.is_empty() {
            return;
        }

        // The request carries a one byte count.
        unresolved.truncate(u8::MAX as usize);

        let payload = ContactRequest { hashes: unresolved }.encode();
        for endpoint in self.established_peers() {
            let Some(session) = self.existing_session(endpoint) else {
                continue;
            };

            let mut session = session.lock();
            let mut buf = BytesMut::new();
            if session
                .seal(&mut buf, SecureKind::ContactRequest, &payload, now)
                .is_ok()
            {
                outputs.push(Output::Transmit(endpoint, buf.freeze()));
            }
        }
    }

    fn verify_handshake(&self, session: &PeerSession, handshake: &Handshake<'_>) -> bool {
        self.identity.verify(
            session.remote_public_key.as_deref(),
            handshake.signed,
            handshake.signature,
        )
    }
}
