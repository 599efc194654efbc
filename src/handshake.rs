//! caBLE Noise handshake patterns.
//!
//! Both patterns are one round trip, with the platform as initiator:
//!
//! * **QR-initiated** (`Noise_KNpsk0`): the initiator's static key was
//!   delivered in the QR code, the PSK is derived from the QR secret.
//!
//! * **State-assisted** (`Noise_NKpsk0`): the responder's static key (the
//!   authenticator identity) was delivered during a previous QR pairing,
//!   the PSK is derived from the link secret.
//!
//! The initiator sends `ephemeral(65) || ct`, the responder replies with
//! `ephemeral(65) || ct`, and both ends then switch to [Crypter]
//! [crate::crypter::Crypter] traffic keys.

use openssl::ec::EcKey;
use openssl::pkey::{Private, Public};

use crate::{
    crypto::{ecdh, public_key_from_bytes, public_key_to_bytes, regenerate},
    error::CableError,
    noise::{NoiseState, NOISE_KN_PROTOCOL, NOISE_NK_PROTOCOL},
    Psk,
};

/// Uncompressed P-256 point length.
const P256_POINT_LENGTH: usize = 65;
/// GCM tag length: the minimum handshake payload is an empty plaintext.
const TAG_LENGTH: usize = 16;

/// Keys and channel binding produced by a completed handshake.
///
/// `read_key` decrypts traffic from the peer, `write_key` encrypts traffic
/// to the peer.
#[derive(Debug)]
pub struct HandshakeResult {
    pub read_key: [u8; 32],
    pub write_key: [u8; 32],
    pub handshake_hash: [u8; 32],
}

fn split_message(message: &[u8]) -> Result<(&[u8], &[u8]), CableError> {
    if message.len() < P256_POINT_LENGTH + TAG_LENGTH {
        return Err(CableError::MessageTooShort);
    }
    Ok(message.split_at(P256_POINT_LENGTH))
}

fn dh(private_key: &EcKey<Private>, peer: &EcKey<Public>) -> Result<[u8; 32], CableError> {
    let mut secret = [0; 32];
    ecdh(private_key.to_owned(), peer.to_owned(), &mut secret)?;
    Ok(secret)
}

/// Responds to a QR-initiated (`Noise_KNpsk0`) handshake message.
///
/// `peer_identity` is the initiator's public key from the QR code, in
/// uncompressed form. Returns the response message to send back, and the
/// session keys.
pub fn respond_qr_handshake(
    peer_identity: &[u8],
    psk: &Psk,
    message: &[u8],
) -> Result<(Vec<u8>, HandshakeResult), CableError> {
    let peer_identity_key = public_key_from_bytes(peer_identity)?;
    let (peer_ephemeral, initiator_ct) = split_message(message)?;
    let peer_ephemeral_key = public_key_from_bytes(peer_ephemeral)?;

    let mut ns = NoiseState::new(NOISE_KN_PROTOCOL);
    ns.mix_hash(&[1]);
    ns.mix_hash(peer_identity);
    ns.mix_key_and_hash(psk)?;
    ns.mix_hash(peer_ephemeral);
    ns.mix_key(peer_ephemeral)?;
    ns.mix_hash(initiator_ct);

    let ephemeral = regenerate()?;
    let ephemeral_pub = public_key_to_bytes(&ephemeral)?;
    ns.mix_hash(&ephemeral_pub);
    ns.mix_key(&ephemeral_pub)?;
    ns.mix_key(&dh(&ephemeral, &peer_ephemeral_key)?)?;
    ns.mix_key(&dh(&ephemeral, &peer_identity_key)?)?;

    finish_response(ns, ephemeral_pub)
}

/// Responds to a state-assisted (`Noise_NKpsk0`) handshake message.
///
/// `local_identity` is the authenticator's long-term identity key, whose
/// public half the initiator holds from a previous QR pairing.
pub fn respond_state_assisted_handshake(
    local_identity: &EcKey<Private>,
    psk: &Psk,
    message: &[u8],
) -> Result<(Vec<u8>, HandshakeResult), CableError> {
    let local_identity_pub = public_key_to_bytes(local_identity)?;
    let (peer_ephemeral, initiator_ct) = split_message(message)?;
    let peer_ephemeral_key = public_key_from_bytes(peer_ephemeral)?;

    let mut ns = NoiseState::new(NOISE_NK_PROTOCOL);
    ns.mix_hash(&[0]);
    ns.mix_hash(&local_identity_pub);
    ns.mix_key_and_hash(psk)?;
    ns.mix_hash(peer_ephemeral);
    ns.mix_key(peer_ephemeral)?;
    ns.mix_key(&dh(local_identity, &peer_ephemeral_key)?)?;
    ns.mix_hash(initiator_ct);

    let ephemeral = regenerate()?;
    let ephemeral_pub = public_key_to_bytes(&ephemeral)?;
    ns.mix_hash(&ephemeral_pub);
    ns.mix_key(&ephemeral_pub)?;
    ns.mix_key(&dh(&ephemeral, &peer_ephemeral_key)?)?;

    finish_response(ns, ephemeral_pub)
}

fn finish_response(
    mut ns: NoiseState,
    ephemeral_pub: Vec<u8>,
) -> Result<(Vec<u8>, HandshakeResult), CableError> {
    let aad = ns.handshake_hash();
    let ct = ns.encrypt(&aad, &[])?;
    ns.mix_hash(&ct);

    let keys = ns.split()?;
    let mut response = ephemeral_pub;
    response.extend_from_slice(&ct);

    Ok((
        response,
        HandshakeResult {
            read_key: keys.k1,
            write_key: keys.k2,
            handshake_hash: ns.handshake_hash(),
        },
    ))
}

#[derive(PartialEq, Eq)]
enum Pattern {
    Kn,
    Nk,
}

/// An in-progress handshake on the initiator (platform) side.
///
/// Send [message][Self::message], then call [finish][Self::finish] with the
/// responder's reply.
pub struct InitiatorHandshake {
    ns: NoiseState,
    ephemeral: EcKey<Private>,
    local_identity: Option<EcKey<Private>>,
    pattern: Pattern,
    pub message: Vec<u8>,
}

/// Starts a QR-initiated handshake as the initiator.
///
/// `local_identity` is the key whose public half went into the QR code.
pub fn initiate_qr_handshake(
    local_identity: &EcKey<Private>,
    psk: &Psk,
) -> Result<InitiatorHandshake, CableError> {
    let local_identity_pub = public_key_to_bytes(local_identity)?;

    let mut ns = NoiseState::new(NOISE_KN_PROTOCOL);
    ns.mix_hash(&[1]);
    ns.mix_hash(&local_identity_pub);
    ns.mix_key_and_hash(psk)?;

    let ephemeral = regenerate()?;
    let ephemeral_pub = public_key_to_bytes(&ephemeral)?;
    ns.mix_hash(&ephemeral_pub);
    ns.mix_key(&ephemeral_pub)?;

    let aad = ns.handshake_hash();
    let ct = ns.encrypt(&aad, &[])?;
    ns.mix_hash(&ct);

    let mut message = ephemeral_pub;
    message.extend_from_slice(&ct);

    Ok(InitiatorHandshake {
        ns,
        ephemeral,
        local_identity: Some(local_identity.to_owned()),
        pattern: Pattern::Kn,
        message,
    })
}

/// Starts a state-assisted handshake as the initiator.
///
/// `peer_identity` is the authenticator's public identity key (65 bytes)
/// from the link record.
pub fn initiate_state_assisted_handshake(
    peer_identity: &[u8],
    psk: &Psk,
) -> Result<InitiatorHandshake, CableError> {
    let peer_identity_key = public_key_from_bytes(peer_identity)?;

    let mut ns = NoiseState::new(NOISE_NK_PROTOCOL);
    ns.mix_hash(&[0]);
    ns.mix_hash(peer_identity);
    ns.mix_key_and_hash(psk)?;

    let ephemeral = regenerate()?;
    let ephemeral_pub = public_key_to_bytes(&ephemeral)?;
    ns.mix_hash(&ephemeral_pub);
    ns.mix_key(&ephemeral_pub)?;
    ns.mix_key(&dh(&ephemeral, &peer_identity_key)?)?;

    let aad = ns.handshake_hash();
    let ct = ns.encrypt(&aad, &[])?;
    ns.mix_hash(&ct);

    let mut message = ephemeral_pub;
    message.extend_from_slice(&ct);

    Ok(InitiatorHandshake {
        ns,
        ephemeral,
        local_identity: None,
        pattern: Pattern::Nk,
        message,
    })
}

impl InitiatorHandshake {
    /// Processes the responder's reply and derives the session keys.
    pub fn finish(mut self, response: &[u8]) -> Result<HandshakeResult, CableError> {
        let (peer_ephemeral, responder_ct) = split_message(response)?;
        let peer_ephemeral_key = public_key_from_bytes(peer_ephemeral)?;

        self.ns.mix_hash(peer_ephemeral);
        self.ns.mix_key(peer_ephemeral)?;
        self.ns.mix_key(&dh(&self.ephemeral, &peer_ephemeral_key)?)?;
        if self.pattern == Pattern::Kn {
            let local_identity = self.local_identity.ok_or(CableError::Internal)?;
            self.ns.mix_key(&dh(&local_identity, &peer_ephemeral_key)?)?;
        }

        let aad = self.ns.handshake_hash();
        let pt = self.ns.decrypt(&aad, responder_ct)?;
        if !pt.is_empty() {
            return Err(CableError::MalformedHandshake);
        }
        self.ns.mix_hash(responder_ct);

        let keys = self.ns.split()?;
        Ok(HandshakeResult {
            read_key: keys.k2,
            write_key: keys.k1,
            handshake_hash: self.ns.handshake_hash(),
        })
    }
}
