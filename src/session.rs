//! The caBLE session dispatcher.
//!
//! [Session] is a synchronous state machine: the owner feeds it tunnel
//! frames with [on_frame][Session::on_frame] and lifecycle events, and it
//! drives the advertisement, handshake, and CTAP phases through the
//! [Transport], [Advertiser], [CredentialStore] and [Signer] collaborators.
//!
//! ```text
//! Idle --(QR: transport open / state-assisted: client payload)--> Handshaking
//! Handshaking --(valid handshake)--> Established
//! Established --(SHUTDOWN)--> Idle
//! any --(transport closed / AEAD failure)--> Closed
//! ```

use openssl::ec::EcKey;
use openssl::pkey::Private;
use openssl::rand::rand_bytes;

use crate::{
    btle::{Advertiser, FIDO_CABLE_SERVICE_U16},
    crypter::Crypter,
    crypto::public_key_to_bytes,
    ctap::{CtapCommand, CtapStatusCode, GetInfoResponse},
    discovery::{derive_psk, ClientPayload, DiscoveryPayload, Eid},
    error::CableError,
    framing::{CableFrame, CableFrameType},
    handshake::{respond_qr_handshake, respond_state_assisted_handshake},
    link::{LinkData, LinkRecord},
    tunnel::get_domain,
    ContactId, EidKey, LinkId, LinkSecret, Psk, RoutingId,
};

/// Sends frames to the platform. [Tunnel][crate::tunnel::Tunnel] is the
/// production implementation.
pub trait Transport {
    /// Queues a binary frame for transmission. Must not block.
    fn send(&mut self, frame: Vec<u8>) -> Result<(), CableError>;

    /// Closes the connection.
    fn close(&mut self) -> Result<(), CableError>;
}

/// Persistent authenticator state: the identity key and stored links.
pub trait CredentialStore {
    /// The authenticator's long-term P-256 identity key.
    fn identity_key(&mut self) -> Result<EcKey<Private>, CableError>;

    /// The contact ID the tunnel server issued for this authenticator.
    fn contact_id(&mut self) -> Result<ContactId, CableError>;

    /// Human-readable device name, shown in the platform's device list.
    fn authenticator_name(&self) -> String;

    /// Persists a freshly generated link before it is offered to the
    /// platform.
    fn save_link(&mut self, link: &LinkRecord) -> Result<(), CableError>;

    /// Looks up the secret for a link named in a [ClientPayload].
    fn find_link(&mut self, link_id: &LinkId) -> Result<Option<LinkSecret>, CableError>;
}

/// A credential operation forwarded to the WebAuthn layer, with its raw
/// CBOR request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialRequest {
    MakeCredential(Vec<u8>),
    GetAssertion(Vec<u8>),
}

/// The WebAuthn ceremony layer: user interaction and credential
/// operations happen here, outside the protocol engine.
pub trait Signer {
    /// Begins a credential operation. The ceremony is asynchronous: the
    /// result is delivered later through
    /// [Session::complete_credential_op].
    ///
    /// Returning `Err` refuses the operation with that status (e.g.
    /// [CtapStatusCode::Ctap2ErrOperationDenied] when the user declined,
    /// [CtapStatusCode::Ctap2ErrUvInvalid] when verification failed).
    fn start(&mut self, request: CredentialRequest) -> Result<(), CtapStatusCode>;

    /// Abandons the pending operation; no response will be sent.
    fn cancel(&mut self, status: CtapStatusCode);

    /// Whether the device is currently unlocked, for `SELECTION`.
    fn is_device_unlocked(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for a trigger: transport open (QR) or client payload
    /// (state-assisted).
    Idle,
    /// Advertising, expecting exactly one handshake message.
    Handshaking,
    /// Traffic keys installed, serving CTAP.
    Established,
    /// Terminal: the transport closed or the session was poisoned.
    Closed,
}

enum Flow {
    Qr { payload: DiscoveryPayload },
    StateAssisted,
}

/// A single caBLE session over one tunnel connection.
pub struct Session<T, A, C, S> {
    transport: T,
    advertiser: A,
    store: C,
    signer: S,
    state: SessionState,
    flow: Flow,
    tunnel_server_id: u16,
    routing_id: RoutingId,
    psk: Option<Psk>,
    crypter: Option<Crypter>,
    handshake_hash: Option<[u8; 32]>,
    pending_op: Option<CtapCommand>,
    advertising: bool,
}

impl<T, A, C, S> Session<T, A, C, S>
where
    T: Transport,
    A: Advertiser,
    C: CredentialStore,
    S: Signer,
{
    /// Creates a session for a scanned QR code.
    ///
    /// The session picks a random routing ID; call
    /// [on_transport_open][Self::on_transport_open] once the tunnel is up.
    pub fn new_qr(
        payload: DiscoveryPayload,
        tunnel_server_id: u16,
        transport: T,
        advertiser: A,
        store: C,
        signer: S,
    ) -> Result<Self, CableError> {
        let mut routing_id: RoutingId = [0; 3];
        rand_bytes(&mut routing_id)?;
        Self::new(
            Flow::Qr { payload },
            tunnel_server_id,
            routing_id,
            transport,
            advertiser,
            store,
            signer,
        )
    }

    /// Creates a session for a state-assisted (`contact`) connection.
    ///
    /// The session stays [Idle][SessionState::Idle] until the tunnel
    /// relays the platform's [ClientPayload].
    pub fn new_state_assisted(
        tunnel_server_id: u16,
        transport: T,
        advertiser: A,
        store: C,
        signer: S,
    ) -> Result<Self, CableError> {
        let mut routing_id: RoutingId = [0; 3];
        rand_bytes(&mut routing_id)?;
        Self::new(
            Flow::StateAssisted,
            tunnel_server_id,
            routing_id,
            transport,
            advertiser,
            store,
            signer,
        )
    }

    fn new(
        flow: Flow,
        tunnel_server_id: u16,
        routing_id: RoutingId,
        transport: T,
        advertiser: A,
        store: C,
        signer: S,
    ) -> Result<Self, CableError> {
        if get_domain(tunnel_server_id).is_none() {
            return Err(CableError::UnknownTunnelServer);
        }

        Ok(Self {
            transport,
            advertiser,
            store,
            signer,
            state: SessionState::Idle,
            flow,
            tunnel_server_id,
            routing_id,
            psk: None,
            crypter: None,
            handshake_hash: None,
            pending_op: None,
            advertising: false,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn routing_id(&self) -> RoutingId {
        self.routing_id
    }

    /// The Noise channel binding, available once the handshake completed.
    pub fn handshake_hash(&self) -> Option<[u8; 32]> {
        self.handshake_hash
    }

    /// Notifies the session that the tunnel is connected.
    ///
    /// A QR session starts advertising immediately; a state-assisted
    /// session keeps waiting for the client payload.
    pub fn on_transport_open(&mut self) -> Result<(), CableError> {
        let (eid_key, secret) = match &self.flow {
            Flow::Qr { payload } => (payload.eid_key()?, payload.qr_secret.clone()),
            Flow::StateAssisted => return Ok(()),
        };

        self.begin_advertising(&eid_key, &secret)?;
        self.state = SessionState::Handshaking;
        Ok(())
    }

    /// Processes one inbound tunnel frame.
    ///
    /// Errors from [Handshaking][SessionState::Handshaking] or
    /// [Established][SessionState::Established] are fatal to the session;
    /// pre-handshake frames that don't parse are silently dropped (anyone
    /// can reach the contact endpoint, so they carry no signal).
    pub fn on_frame(&mut self, msg: &[u8]) -> Result<(), CableError> {
        match self.state {
            SessionState::Closed => {
                warn!("dropping frame on closed session");
                Ok(())
            }
            SessionState::Idle => match self.flow {
                Flow::StateAssisted => self.handle_client_payload(msg),
                Flow::Qr { .. } => {
                    warn!("dropping frame before transport open");
                    Ok(())
                }
            },
            SessionState::Handshaking => self.handle_handshake(msg),
            SessionState::Established => self.handle_established(msg),
        }
    }

    /// Delivers the result of a credential operation started through
    /// [Signer::start].
    pub fn complete_credential_op(
        &mut self,
        result: Result<Vec<u8>, CtapStatusCode>,
    ) -> Result<(), CableError> {
        if self.state != SessionState::Established || self.pending_op.is_none() {
            warn!("credential result with no pending operation");
            return Err(CableError::InvalidState);
        }
        self.pending_op = None;

        match result {
            Ok(response) => {
                self.send_frame(&CableFrame::ctap_response(CtapStatusCode::Ctap2Ok, &response))
            }
            Err(status) => self.send_status(status),
        }
    }

    /// Notifies the session that the tunnel closed.
    ///
    /// A pending credential operation is cancelled with
    /// [CtapStatusCode::Ctap2ErrKeepaliveCancel].
    pub fn on_transport_closed(&mut self) {
        self.wipe();
        self.state = SessionState::Closed;
    }

    fn handle_client_payload(&mut self, msg: &[u8]) -> Result<(), CableError> {
        let payload = match ClientPayload::from_hex_cbor(msg) {
            Ok(p) => p,
            Err(e) => {
                warn!("dropping malformed client payload: {:?}", e);
                return Ok(());
            }
        };

        let secret = match self.store.find_link(&payload.link_id)? {
            Some(s) => s,
            None => {
                warn!("client payload for unknown link, dropping");
                return Ok(());
            }
        };

        let eid_key = payload.eid_key(&secret)?;
        self.begin_advertising(&eid_key, &secret)?;
        self.state = SessionState::Handshaking;
        Ok(())
    }

    fn begin_advertising(&mut self, eid_key: &EidKey, secret: &[u8]) -> Result<(), CableError> {
        let eid = Eid::new(self.tunnel_server_id, self.routing_id)?;
        let plaintext = eid.to_bytes();
        // The PSK covers the advertisement we actually send, binding the
        // tunnel connection to this BLE proximity proof.
        self.psk = Some(derive_psk(secret, &plaintext)?);

        let advert = eid.encrypt_advert(eid_key)?;
        self.advertiser
            .start_advertising(FIDO_CABLE_SERVICE_U16, &advert)?;
        self.advertising = true;
        Ok(())
    }

    fn handle_handshake(&mut self, msg: &[u8]) -> Result<(), CableError> {
        let psk = self.psk.ok_or(CableError::InvalidState)?;
        let qr_peer = match &self.flow {
            Flow::Qr { payload } => Some(payload.public_key.clone()),
            Flow::StateAssisted => None,
        };

        let result = match &qr_peer {
            Some(peer) => respond_qr_handshake(peer, &psk, msg),
            None => {
                let identity = self.store.identity_key()?;
                respond_state_assisted_handshake(&identity, &psk, msg)
            }
        };

        let (response, hs) = match result {
            Ok(v) => v,
            Err(e) => {
                warn!("handshake failed: {:?}", e);
                self.wipe();
                self.state = SessionState::Idle;
                return Err(e);
            }
        };

        self.transport.send(response)?;
        // The handshake's own AEAD used counter 0 in each direction
        self.crypter = Some(Crypter::after_handshake(hs.read_key, hs.write_key));
        self.handshake_hash = Some(hs.handshake_hash);
        self.stop_advertising();
        self.state = SessionState::Established;

        let info = GetInfoResponse::default().to_cbor()?;
        self.send_frame(&CableFrame::ctap_response(CtapStatusCode::Ctap2Ok, &info))?;

        if let Some(peer) = qr_peer {
            self.offer_link(&peer, &hs.handshake_hash)?;
        }

        Ok(())
    }

    /// Generates, persists and sends the linking information for a
    /// QR-initiated session.
    fn offer_link(&mut self, qr_peer: &[u8], handshake_hash: &[u8; 32]) -> Result<(), CableError> {
        let record = LinkRecord::new()?;
        self.store.save_link(&record)?;

        let identity = self.store.identity_key()?;
        let identity_pub = public_key_to_bytes(&identity)?;
        let link = LinkData::new(
            self.store.contact_id()?,
            &record,
            &identity,
            identity_pub,
            qr_peer,
            self.store.authenticator_name(),
            handshake_hash,
        )?;

        self.send_frame(&CableFrame::update(link.to_cbor()?))
    }

    fn handle_established(&mut self, msg: &[u8]) -> Result<(), CableError> {
        let crypter = self.crypter.as_mut().ok_or(CableError::InvalidState)?;
        let payload = match crypter.decrypt(msg) {
            Ok(p) => p,
            Err(e) => {
                error!("undecryptable frame, poisoning session: {:?}", e);
                self.wipe();
                self.state = SessionState::Closed;
                return Err(e);
            }
        };

        let frame = match CableFrame::from_bytes(1, &payload) {
            Ok(f) => f,
            Err(_) => return self.send_status(CtapStatusCode::Ctap1ErrInvalidCommand),
        };

        match frame.message_type {
            CableFrameType::Shutdown => {
                trace!("received shutdown message");
                self.wipe();
                self.state = SessionState::Idle;
                // QR sessions advertise again immediately, so a fresh
                // handshake works without another transport-open event
                if matches!(self.flow, Flow::Qr { .. }) {
                    self.on_transport_open()?;
                }
                Ok(())
            }
            CableFrameType::Ctap => self.handle_ctap(&frame.data),
            CableFrameType::Update | CableFrameType::Unknown => {
                self.send_status(CtapStatusCode::Ctap1ErrInvalidCommand)
            }
        }
    }

    fn handle_ctap(&mut self, data: &[u8]) -> Result<(), CableError> {
        let cmd = match data.first().copied().and_then(CtapCommand::from_byte) {
            Some(c) => c,
            None => return self.send_status(CtapStatusCode::Ctap1ErrInvalidCommand),
        };
        let body = &data[1..];

        match cmd {
            CtapCommand::MakeCredential | CtapCommand::GetAssertion => {
                if self.pending_op.is_some() {
                    warn!("second credential operation on one session refused");
                    return self.send_status(CtapStatusCode::Ctap2ErrNotAllowed);
                }

                let request = if cmd == CtapCommand::MakeCredential {
                    CredentialRequest::MakeCredential(body.to_vec())
                } else {
                    CredentialRequest::GetAssertion(body.to_vec())
                };

                match self.signer.start(request) {
                    Ok(()) => {
                        self.pending_op = Some(cmd);
                        Ok(())
                    }
                    Err(status) => self.send_status(status),
                }
            }
            CtapCommand::Selection => {
                if self.signer.is_device_unlocked() {
                    self.send_status(CtapStatusCode::Ctap2Ok)
                } else {
                    self.send_status(CtapStatusCode::Ctap2ErrUpRequired)
                }
            }
            _ => self.send_status(CtapStatusCode::Ctap1ErrInvalidCommand),
        }
    }

    fn send_status(&mut self, status: CtapStatusCode) -> Result<(), CableError> {
        self.send_frame(&CableFrame::ctap_response(status, &[]))
    }

    fn send_frame(&mut self, frame: &CableFrame) -> Result<(), CableError> {
        let crypter = self.crypter.as_mut().ok_or(CableError::InvalidState)?;
        let ct = crypter.encrypt(&frame.to_bytes())?;
        self.transport.send(ct)
    }

    fn stop_advertising(&mut self) {
        if self.advertising {
            if let Err(e) = self.advertiser.stop_advertising() {
                warn!("failed to stop advertising: {:?}", e);
            }
            self.advertising = false;
        }
    }

    /// Overwrites all session key material and cancels any pending
    /// operation. The traffic keys are zeroed by [Crypter]'s `Drop` impl.
    fn wipe(&mut self) {
        if self.pending_op.take().is_some() {
            self.signer.cancel(CtapStatusCode::Ctap2ErrKeepaliveCancel);
        }
        self.stop_advertising();
        if let Some(psk) = self.psk.as_mut() {
            psk.fill(0);
        }
        if let Some(hash) = self.handshake_hash.as_mut() {
            hash.fill(0);
        }
        self.psk = None;
        self.crypter = None;
        self.handshake_hash = None;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::{Arc, Mutex};

    use crate::{
        crypto::{public_key_to_bytes, regenerate},
        discovery::OperationHint,
        framing::SHUTDOWN_COMMAND,
        handshake::{initiate_qr_handshake, initiate_state_assisted_handshake},
        link::verify_link_signature,
        BleAdvert,
    };
    use openssl::rand::rand_bytes;

    #[derive(Clone, Default)]
    struct TestTransport {
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl TestTransport {
        fn take(&self) -> Vec<Vec<u8>> {
            std::mem::take(&mut self.sent.lock().unwrap())
        }
    }

    impl Transport for TestTransport {
        fn send(&mut self, frame: Vec<u8>) -> Result<(), CableError> {
            self.sent.lock().unwrap().push(frame);
            Ok(())
        }

        fn close(&mut self) -> Result<(), CableError> {
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct TestAdvertiser {
        payloads: Arc<Mutex<Vec<Vec<u8>>>>,
        active: Arc<Mutex<bool>>,
    }

    impl TestAdvertiser {
        fn last_advert(&self) -> BleAdvert {
            let p = self.payloads.lock().unwrap();
            p.last().unwrap().as_slice().try_into().unwrap()
        }

        fn is_active(&self) -> bool {
            *self.active.lock().unwrap()
        }
    }

    impl Advertiser for TestAdvertiser {
        fn start_advertising(
            &mut self,
            service_uuid: u16,
            payload: &[u8],
        ) -> Result<(), CableError> {
            assert_eq!(service_uuid, FIDO_CABLE_SERVICE_U16);
            self.payloads.lock().unwrap().push(payload.to_vec());
            *self.active.lock().unwrap() = true;
            Ok(())
        }

        fn stop_advertising(&mut self) -> Result<(), CableError> {
            *self.active.lock().unwrap() = false;
            Ok(())
        }
    }

    #[derive(Clone)]
    struct TestStore {
        identity: EcKey<Private>,
        links: Arc<Mutex<Vec<LinkRecord>>>,
    }

    impl TestStore {
        fn new() -> Self {
            Self {
                identity: regenerate().unwrap(),
                links: Arc::new(Mutex::new(vec![])),
            }
        }
    }

    impl CredentialStore for TestStore {
        fn identity_key(&mut self) -> Result<EcKey<Private>, CableError> {
            Ok(self.identity.clone())
        }

        fn contact_id(&mut self) -> Result<ContactId, CableError> {
            Ok([9; 8])
        }

        fn authenticator_name(&self) -> String {
            "test authenticator".to_string()
        }

        fn save_link(&mut self, link: &LinkRecord) -> Result<(), CableError> {
            self.links.lock().unwrap().push(link.clone());
            Ok(())
        }

        fn find_link(&mut self, link_id: &LinkId) -> Result<Option<LinkSecret>, CableError> {
            Ok(self
                .links
                .lock()
                .unwrap()
                .iter()
                .find(|l| &l.link_id == link_id)
                .map(|l| l.link_secret))
        }
    }

    #[derive(Clone)]
    struct TestSigner {
        started: Arc<Mutex<Vec<CredentialRequest>>>,
        cancelled: Arc<Mutex<Vec<CtapStatusCode>>>,
        unlocked: bool,
    }

    impl TestSigner {
        fn new() -> Self {
            Self {
                started: Arc::new(Mutex::new(vec![])),
                cancelled: Arc::new(Mutex::new(vec![])),
                unlocked: true,
            }
        }
    }

    impl Signer for TestSigner {
        fn start(&mut self, request: CredentialRequest) -> Result<(), CtapStatusCode> {
            self.started.lock().unwrap().push(request);
            Ok(())
        }

        fn cancel(&mut self, status: CtapStatusCode) {
            self.cancelled.lock().unwrap().push(status);
        }

        fn is_device_unlocked(&self) -> bool {
            self.unlocked
        }
    }

    fn qr_payload(public_key: Vec<u8>) -> DiscoveryPayload {
        let mut qr_secret = vec![0; 16];
        rand_bytes(&mut qr_secret).unwrap();
        DiscoveryPayload {
            public_key,
            qr_secret,
            known_domains_count: 2,
            current_time: None,
            can_perform_transactions: None,
            operation_hint: OperationHint::GetAssertion,
        }
    }

    /// Decrypts an outbound frame as the platform and splits off the
    /// frame type byte.
    fn platform_recv(crypter: &mut Crypter, ct: &[u8]) -> (CableFrameType, Vec<u8>) {
        let payload = crypter.decrypt(ct).unwrap();
        let frame = CableFrame::from_bytes(1, &payload).unwrap();
        (frame.message_type, frame.data)
    }

    fn platform_send(crypter: &mut Crypter, frame: &CableFrame) -> Vec<u8> {
        crypter.encrypt(&frame.to_bytes()).unwrap()
    }

    #[test]
    fn qr_session_end_to_end() {
        let _ = tracing_subscriber::fmt::try_init();

        let qr_identity = regenerate().unwrap();
        let payload = qr_payload(public_key_to_bytes(&qr_identity).unwrap());

        let transport = TestTransport::default();
        let advertiser = TestAdvertiser::default();
        let store = TestStore::new();
        let signer = TestSigner::new();

        let mut session = Session::new_qr(
            payload.clone(),
            0,
            transport.clone(),
            advertiser.clone(),
            store.clone(),
            signer.clone(),
        )
        .unwrap();
        assert_eq!(session.state(), SessionState::Idle);

        session.on_transport_open().unwrap();
        assert_eq!(session.state(), SessionState::Handshaking);
        assert!(advertiser.is_active());

        // the platform decrypts the advertisement...
        let eid_key = payload.eid_key().unwrap();
        let eid = Eid::decrypt_advert(&advertiser.last_advert(), &eid_key)
            .unwrap()
            .unwrap();
        assert_eq!(eid.routing_id, session.routing_id());

        // ...derives the PSK and starts the handshake
        let psk = payload.psk(&eid.to_bytes()).unwrap();
        let initiator = initiate_qr_handshake(&qr_identity, &psk).unwrap();
        session.on_frame(&initiator.message).unwrap();
        assert_eq!(session.state(), SessionState::Established);
        assert!(!advertiser.is_active());

        let sent = transport.take();
        assert_eq!(sent.len(), 3);
        let established = initiator.finish(&sent[0]).unwrap();
        assert_eq!(
            Some(established.handshake_hash),
            session.handshake_hash()
        );

        let mut platform =
            Crypter::after_handshake(established.read_key, established.write_key);

        // unsolicited GetInfo (counter 1)
        let (t, data) = platform_recv(&mut platform, &sent[1]);
        assert_eq!(t, CableFrameType::Ctap);
        assert_eq!(data[0], CtapStatusCode::Ctap2Ok.to_byte());
        assert_eq!(&data[1..], GetInfoResponse::default().to_cbor().unwrap());

        // linking information (counter 2), persisted before sending
        let (t, data) = platform_recv(&mut platform, &sent[2]);
        assert_eq!(t, CableFrameType::Update);
        let link = LinkData::from_cbor(&data).unwrap();
        assert!(
            verify_link_signature(&qr_identity, &link, &established.handshake_hash).unwrap()
        );
        let saved = store.links.lock().unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].link_id, link.link_id);
        assert_eq!(saved[0].link_secret, link.link_secret);
    }

    /// Runs the platform side of a QR handshake against an advertising
    /// session and returns the platform-side crypter.
    fn establish_qr(
        session: &mut Session<TestTransport, TestAdvertiser, TestStore, TestSigner>,
        transport: &TestTransport,
        advertiser: &TestAdvertiser,
        qr_identity: &EcKey<Private>,
        payload: &DiscoveryPayload,
    ) -> Crypter {
        let eid_key = payload.eid_key().unwrap();
        let eid = Eid::decrypt_advert(&advertiser.last_advert(), &eid_key)
            .unwrap()
            .unwrap();
        let psk = payload.psk(&eid.to_bytes()).unwrap();

        let initiator = initiate_qr_handshake(qr_identity, &psk).unwrap();
        session.on_frame(&initiator.message).unwrap();
        assert_eq!(session.state(), SessionState::Established);

        // handshake response, GetInfo, link UPDATE
        let sent = transport.take();
        assert_eq!(sent.len(), 3);
        let established = initiator.finish(&sent[0]).unwrap();
        Crypter::after_handshake(established.read_key, established.write_key)
    }

    #[test]
    fn qr_session_rehandshakes_after_shutdown() {
        let _ = tracing_subscriber::fmt::try_init();

        let qr_identity = regenerate().unwrap();
        let payload = qr_payload(public_key_to_bytes(&qr_identity).unwrap());

        let transport = TestTransport::default();
        let advertiser = TestAdvertiser::default();
        let store = TestStore::new();

        let mut session = Session::new_qr(
            payload.clone(),
            0,
            transport.clone(),
            advertiser.clone(),
            store.clone(),
            TestSigner::new(),
        )
        .unwrap();
        session.on_transport_open().unwrap();
        let first_advert = advertiser.last_advert();
        let mut platform =
            establish_qr(&mut session, &transport, &advertiser, &qr_identity, &payload);

        session
            .on_frame(&platform_send(&mut platform, &SHUTDOWN_COMMAND))
            .unwrap();

        // advertising again with a fresh nonce, old keys wiped
        assert_eq!(session.state(), SessionState::Handshaking);
        assert!(advertiser.is_active());
        assert_ne!(advertiser.last_advert(), first_advert);
        assert!(session.crypter.is_none());
        assert_eq!(session.handshake_hash(), None);

        // a second handshake on the same transport succeeds
        establish_qr(&mut session, &transport, &advertiser, &qr_identity, &payload);
        assert_eq!(session.state(), SessionState::Established);
        // each pairing stored its own link
        assert_eq!(store.links.lock().unwrap().len(), 2);
    }

    #[test]
    fn qr_frame_before_transport_open_is_dropped() {
        let _ = tracing_subscriber::fmt::try_init();

        let qr_identity = regenerate().unwrap();
        let payload = qr_payload(public_key_to_bytes(&qr_identity).unwrap());

        let transport = TestTransport::default();
        let mut session = Session::new_qr(
            payload,
            0,
            transport.clone(),
            TestAdvertiser::default(),
            TestStore::new(),
            TestSigner::new(),
        )
        .unwrap();

        session.on_frame(b"junk").unwrap();
        assert_eq!(session.state(), SessionState::Idle);
        assert!(transport.take().is_empty());
    }

    /// Drives a state-assisted session to `Established` and returns the
    /// platform-side crypter.
    fn establish_state_assisted(
        session: &mut Session<TestTransport, TestAdvertiser, TestStore, TestSigner>,
        transport: &TestTransport,
        advertiser: &TestAdvertiser,
        link: &LinkRecord,
        identity_pub: &[u8],
    ) -> Crypter {
        let client_payload = ClientPayload {
            link_id: link.link_id,
            client_nonce: vec![0x5a; 16],
            operation_hint: OperationHint::GetAssertion,
        };
        session
            .on_frame(&client_payload.to_hex_cbor().unwrap())
            .unwrap();
        assert_eq!(session.state(), SessionState::Handshaking);

        let eid_key = client_payload.eid_key(&link.link_secret).unwrap();
        let eid = Eid::decrypt_advert(&advertiser.last_advert(), &eid_key)
            .unwrap()
            .unwrap();
        let psk = derive_psk(&link.link_secret, &eid.to_bytes()).unwrap();

        let initiator = initiate_state_assisted_handshake(identity_pub, &psk).unwrap();
        session.on_frame(&initiator.message).unwrap();
        assert_eq!(session.state(), SessionState::Established);

        let sent = transport.take();
        let established = initiator.finish(&sent[0]).unwrap();
        let mut platform =
            Crypter::after_handshake(established.read_key, established.write_key);

        // unsolicited GetInfo, no UPDATE on state-assisted sessions
        assert_eq!(sent.len(), 2);
        let (t, data) = platform_recv(&mut platform, &sent[1]);
        assert_eq!(t, CableFrameType::Ctap);
        assert_eq!(data[0], CtapStatusCode::Ctap2Ok.to_byte());

        platform
    }

    #[test]
    fn state_assisted_session_end_to_end() {
        let _ = tracing_subscriber::fmt::try_init();

        let transport = TestTransport::default();
        let advertiser = TestAdvertiser::default();
        let mut store = TestStore::new();
        let signer = TestSigner::new();

        let link = LinkRecord::new().unwrap();
        store.save_link(&link).unwrap();
        let identity_pub = public_key_to_bytes(&store.identity).unwrap();

        let mut session = Session::new_state_assisted(
            0,
            transport.clone(),
            advertiser.clone(),
            store.clone(),
            signer.clone(),
        )
        .unwrap();
        session.on_transport_open().unwrap();
        // still waiting for the client payload
        assert_eq!(session.state(), SessionState::Idle);
        assert!(!advertiser.is_active());

        let mut platform = establish_state_assisted(
            &mut session,
            &transport,
            &advertiser,
            &link,
            &identity_pub,
        );

        // MAKE_CREDENTIAL, encrypted by the platform under counter 1
        let body = vec![0xa1, 0x01, 0x02];
        let mut ctap = vec![CtapCommand::MakeCredential as u8];
        ctap.extend_from_slice(&body);
        let frame = CableFrame {
            protocol_version: 1,
            message_type: CableFrameType::Ctap,
            data: ctap,
        };
        session
            .on_frame(&platform_send(&mut platform, &frame))
            .unwrap();

        assert_eq!(
            signer.started.lock().unwrap().as_slice(),
            &[CredentialRequest::MakeCredential(body)]
        );

        // ceremony completes, response goes out under counter 2
        let response = vec![0x00, 0xa2, 0x01, 0x02, 0x03, 0x04];
        session.complete_credential_op(Ok(response.clone())).unwrap();

        let sent = transport.take();
        assert_eq!(sent.len(), 1);
        let (t, data) = platform_recv(&mut platform, &sent[0]);
        assert_eq!(t, CableFrameType::Ctap);
        assert_eq!(data[0], CtapStatusCode::Ctap2Ok.to_byte());
        assert_eq!(&data[1..], response);

        // SHUTDOWN resets to Idle for a fresh handshake
        session
            .on_frame(&platform_send(&mut platform, &SHUTDOWN_COMMAND))
            .unwrap();
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.handshake_hash(), None);
    }

    #[test]
    fn unknown_link_is_silently_dropped() {
        let _ = tracing_subscriber::fmt::try_init();

        let transport = TestTransport::default();
        let advertiser = TestAdvertiser::default();

        let mut session = Session::new_state_assisted(
            0,
            transport.clone(),
            advertiser.clone(),
            TestStore::new(),
            TestSigner::new(),
        )
        .unwrap();

        let client_payload = ClientPayload {
            link_id: [0xee; 8],
            client_nonce: vec![1; 16],
            operation_hint: OperationHint::GetAssertion,
        };
        session
            .on_frame(&client_payload.to_hex_cbor().unwrap())
            .unwrap();

        assert_eq!(session.state(), SessionState::Idle);
        assert!(!advertiser.is_active());
        assert!(transport.take().is_empty());

        // garbage doesn't move the state machine either
        session.on_frame(b"not hex cbor at all").unwrap();
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn second_operation_refused_while_pending() {
        let _ = tracing_subscriber::fmt::try_init();

        let transport = TestTransport::default();
        let advertiser = TestAdvertiser::default();
        let mut store = TestStore::new();
        let signer = TestSigner::new();

        let link = LinkRecord::new().unwrap();
        store.save_link(&link).unwrap();
        let identity_pub = public_key_to_bytes(&store.identity).unwrap();

        let mut session = Session::new_state_assisted(
            0,
            transport.clone(),
            advertiser.clone(),
            store,
            signer.clone(),
        )
        .unwrap();
        let mut platform = establish_state_assisted(
            &mut session,
            &transport,
            &advertiser,
            &link,
            &identity_pub,
        );

        let frame = CableFrame {
            protocol_version: 1,
            message_type: CableFrameType::Ctap,
            data: vec![CtapCommand::GetAssertion as u8, 0xa0],
        };
        session
            .on_frame(&platform_send(&mut platform, &frame))
            .unwrap();
        session
            .on_frame(&platform_send(&mut platform, &frame))
            .unwrap();

        // only the first reached the signer
        assert_eq!(signer.started.lock().unwrap().len(), 1);
        let sent = transport.take();
        assert_eq!(sent.len(), 1);
        let (_, data) = platform_recv(&mut platform, &sent[0]);
        assert_eq!(data, vec![CtapStatusCode::Ctap2ErrNotAllowed.to_byte()]);
    }

    #[test]
    fn selection_reports_device_lock_state() {
        let _ = tracing_subscriber::fmt::try_init();

        let transport = TestTransport::default();
        let advertiser = TestAdvertiser::default();
        let mut store = TestStore::new();
        let mut signer = TestSigner::new();
        signer.unlocked = false;

        let link = LinkRecord::new().unwrap();
        store.save_link(&link).unwrap();
        let identity_pub = public_key_to_bytes(&store.identity).unwrap();

        let mut session = Session::new_state_assisted(
            0,
            transport.clone(),
            advertiser.clone(),
            store,
            signer,
        )
        .unwrap();
        let mut platform = establish_state_assisted(
            &mut session,
            &transport,
            &advertiser,
            &link,
            &identity_pub,
        );

        let frame = CableFrame {
            protocol_version: 1,
            message_type: CableFrameType::Ctap,
            data: vec![CtapCommand::Selection as u8],
        };
        session
            .on_frame(&platform_send(&mut platform, &frame))
            .unwrap();

        let sent = transport.take();
        let (_, data) = platform_recv(&mut platform, &sent[0]);
        assert_eq!(data, vec![CtapStatusCode::Ctap2ErrUpRequired.to_byte()]);
    }

    #[test]
    fn tampered_traffic_poisons_session() {
        let _ = tracing_subscriber::fmt::try_init();

        let transport = TestTransport::default();
        let advertiser = TestAdvertiser::default();
        let mut store = TestStore::new();
        let signer = TestSigner::new();

        let link = LinkRecord::new().unwrap();
        store.save_link(&link).unwrap();
        let identity_pub = public_key_to_bytes(&store.identity).unwrap();

        let mut session = Session::new_state_assisted(
            0,
            transport.clone(),
            advertiser.clone(),
            store,
            signer,
        )
        .unwrap();
        let mut platform = establish_state_assisted(
            &mut session,
            &transport,
            &advertiser,
            &link,
            &identity_pub,
        );

        let frame = CableFrame {
            protocol_version: 1,
            message_type: CableFrameType::Ctap,
            data: vec![CtapCommand::Selection as u8],
        };
        let mut ct = platform_send(&mut platform, &frame);
        ct[3] ^= 0xff;

        assert_eq!(session.on_frame(&ct).unwrap_err(), CableError::Decryption);
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.handshake_hash(), None);

        // terminal: further frames are dropped without response
        session.on_frame(&[1, 2, 3]).unwrap();
        assert!(transport.take().is_empty());
    }

    #[test]
    fn transport_close_cancels_pending_operation() {
        let _ = tracing_subscriber::fmt::try_init();

        let transport = TestTransport::default();
        let advertiser = TestAdvertiser::default();
        let mut store = TestStore::new();
        let signer = TestSigner::new();

        let link = LinkRecord::new().unwrap();
        store.save_link(&link).unwrap();
        let identity_pub = public_key_to_bytes(&store.identity).unwrap();

        let mut session = Session::new_state_assisted(
            0,
            transport.clone(),
            advertiser.clone(),
            store,
            signer.clone(),
        )
        .unwrap();
        let mut platform = establish_state_assisted(
            &mut session,
            &transport,
            &advertiser,
            &link,
            &identity_pub,
        );

        let frame = CableFrame {
            protocol_version: 1,
            message_type: CableFrameType::Ctap,
            data: vec![CtapCommand::GetAssertion as u8, 0xa0],
        };
        session
            .on_frame(&platform_send(&mut platform, &frame))
            .unwrap();

        session.on_transport_closed();
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(
            signer.cancelled.lock().unwrap().as_slice(),
            &[CtapStatusCode::Ctap2ErrKeepaliveCancel]
        );
        // no key material survives the close
        assert!(session.psk.is_none());
        assert!(session.crypter.is_none());
        assert_eq!(session.handshake_hash(), None);

        // a late ceremony result has nowhere to go
        assert_eq!(
            session.complete_credential_op(Ok(vec![])).unwrap_err(),
            CableError::InvalidState
        );
    }

    #[test]
    fn bad_handshake_resets_to_idle() {
        let _ = tracing_subscriber::fmt::try_init();

        let qr_identity = regenerate().unwrap();
        let payload = qr_payload(public_key_to_bytes(&qr_identity).unwrap());

        let mut session = Session::new_qr(
            payload,
            0,
            TestTransport::default(),
            TestAdvertiser::default(),
            TestStore::new(),
            TestSigner::new(),
        )
        .unwrap();
        session.on_transport_open().unwrap();

        assert_eq!(
            session.on_frame(&[0xff; 81]).unwrap_err(),
            CableError::MalformedHandshake
        );
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn unknown_tunnel_server_refused() {
        let err = Session::new_state_assisted(
            200,
            TestTransport::default(),
            TestAdvertiser::default(),
            TestStore::new(),
            TestSigner::new(),
        )
        .err();
        assert_eq!(err, Some(CableError::UnknownTunnelServer));
    }
}
