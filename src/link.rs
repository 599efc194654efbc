//! Linking information for state-assisted ("remember this device")
//! sessions.
//!
//! At the end of a QR-initiated session the authenticator may offer the
//! platform a [LinkData] UPDATE message. The platform stores it, and can
//! later reach the authenticator through the tunnel server's `contact`
//! endpoint without a fresh QR scan.

use std::collections::BTreeMap;
use std::mem::size_of;

use openssl::ec::EcKey;
use openssl::pkey::Private;
use openssl::rand::rand_bytes;
use serde_cbor::{from_slice, to_vec, Value};

use crate::{
    crypto::{ecdh, hmac_sha_256, public_key_from_bytes},
    error::CableError,
    ContactId, LinkId, LinkSecret,
};

/// A stored link: the keys under which one platform may call us back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkRecord {
    pub link_id: LinkId,
    pub link_secret: LinkSecret,
}

impl LinkRecord {
    /// Generates a fresh random link.
    pub fn new() -> Result<Self, CableError> {
        let mut link_id: LinkId = [0; size_of::<LinkId>()];
        let mut link_secret: LinkSecret = [0; size_of::<LinkSecret>()];
        rand_bytes(&mut link_id)?;
        rand_bytes(&mut link_secret)?;
        Ok(Self {
            link_id,
            link_secret,
        })
    }
}

/// The UPDATE payload sent after a QR handshake, CBOR map keys 1 to 6,
/// wrapped in an outer `{1: ...}` map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkData {
    /// Opaque value the platform presents to the tunnel server to reach
    /// this authenticator.
    pub contact_id: ContactId,
    pub link_id: LinkId,
    pub link_secret: LinkSecret,
    /// The authenticator's public identity key, X9.62 uncompressed. Global
    /// to the authenticator, letting platforms deduplicate links.
    pub authenticator_public_key: Vec<u8>,
    pub authenticator_name: String,
    /// Channel binding: proves the link was offered by the party holding
    /// the identity key on *this* Noise session.
    pub signature: Vec<u8>,
}

impl LinkData {
    /// Assembles a signed [LinkData] for the session identified by
    /// `handshake_hash`.
    ///
    /// The signature is an HMAC-SHA256 of the handshake hash, keyed with
    /// `ECDH(identity, QR public key)`, so only the holder of the QR
    /// private key can verify it.
    pub fn new(
        contact_id: ContactId,
        record: &LinkRecord,
        identity: &EcKey<Private>,
        identity_public: Vec<u8>,
        peer_qr_key: &[u8],
        authenticator_name: String,
        handshake_hash: &[u8; 32],
    ) -> Result<Self, CableError> {
        let signature =
            link_signature(identity, peer_qr_key, handshake_hash)?.to_vec();

        Ok(Self {
            contact_id,
            link_id: record.link_id,
            link_secret: record.link_secret,
            authenticator_public_key: identity_public,
            authenticator_name,
            signature,
        })
    }

    pub fn to_cbor(&self) -> Result<Vec<u8>, CableError> {
        let mut inner = BTreeMap::new();
        inner.insert(Value::Integer(1), Value::Bytes(self.contact_id.to_vec()));
        inner.insert(Value::Integer(2), Value::Bytes(self.link_id.to_vec()));
        inner.insert(Value::Integer(3), Value::Bytes(self.link_secret.to_vec()));
        inner.insert(
            Value::Integer(4),
            Value::Bytes(self.authenticator_public_key.clone()),
        );
        inner.insert(
            Value::Integer(5),
            Value::Text(self.authenticator_name.clone()),
        );
        inner.insert(Value::Integer(6), Value::Bytes(self.signature.clone()));

        let mut outer = BTreeMap::new();
        outer.insert(Value::Integer(1), Value::Map(inner));
        Ok(to_vec(&Value::Map(outer))?)
    }

    /// Parses a [LinkData] message, as the platform would.
    pub fn from_cbor(cbor: &[u8]) -> Result<Self, CableError> {
        let outer = match from_slice(cbor)? {
            Value::Map(m) => m,
            _ => return Err(CableError::Cbor),
        };
        let inner = match outer.get(&Value::Integer(1)) {
            Some(Value::Map(m)) => m,
            _ => return Err(CableError::Cbor),
        };

        let get_bytes = |k: i128| match inner.get(&Value::Integer(k)) {
            Some(Value::Bytes(b)) => Ok(b.clone()),
            _ => Err(CableError::Cbor),
        };

        let contact_id: ContactId = get_bytes(1)?
            .as_slice()
            .try_into()
            .map_err(|_| CableError::Cbor)?;
        let link_id: LinkId = get_bytes(2)?
            .as_slice()
            .try_into()
            .map_err(|_| CableError::Cbor)?;
        let link_secret: LinkSecret = get_bytes(3)?
            .as_slice()
            .try_into()
            .map_err(|_| CableError::Cbor)?;
        let authenticator_public_key = get_bytes(4)?;
        let authenticator_name = match inner.get(&Value::Integer(5)) {
            Some(Value::Text(t)) => t.clone(),
            _ => return Err(CableError::Cbor),
        };
        let signature = get_bytes(6)?;

        Ok(Self {
            contact_id,
            link_id,
            link_secret,
            authenticator_public_key,
            authenticator_name,
            signature,
        })
    }
}

/// Computes the [LinkData] channel-binding signature.
fn link_signature(
    identity: &EcKey<Private>,
    peer_qr_key: &[u8],
    handshake_hash: &[u8; 32],
) -> Result<[u8; 32], CableError> {
    let peer = public_key_from_bytes(peer_qr_key)?;
    let mut dh_secret = [0; 32];
    ecdh(identity.to_owned(), peer, &mut dh_secret)?;
    hmac_sha_256(&dh_secret, handshake_hash)
}

/// Verifies a [LinkData] signature from the platform side, holding the QR
/// private key.
pub fn verify_link_signature(
    qr_identity: &EcKey<Private>,
    link: &LinkData,
    handshake_hash: &[u8; 32],
) -> Result<bool, CableError> {
    let expected = link_signature(qr_identity, &link.authenticator_public_key, handshake_hash)?;
    Ok(expected[..] == link.signature[..])
}
