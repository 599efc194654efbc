//! Session discovery: QR payloads, tunnel-relayed client payloads, and
//! encrypted BLE advertisements.

use std::collections::BTreeMap;
use std::mem::size_of;

use openssl::rand::rand_bytes;
use serde_cbor::{from_slice, to_vec, Value};

use crate::{
    base10,
    crypto::{decrypt, encrypt, hmac_sha_256},
    error::CableError,
    kdf::KeyPurpose,
    tunnel::get_domain,
    BleAdvert, BleNonce, CableEid, EidKey, LinkId, Psk, QrSecret, RoutingId, TunnelId,
};

const QR_PREFIX: &str = "FIDO:/";

/// What the platform intends to do with the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OperationHint {
    /// `"ga"`: get an assertion. Also the fallback for unknown hints.
    #[default]
    GetAssertion,
    /// `"mc"`: make a new credential.
    MakeCredential,
}

impl From<&str> for OperationHint {
    fn from(v: &str) -> Self {
        match v {
            "mc" => OperationHint::MakeCredential,
            _ => OperationHint::GetAssertion,
        }
    }
}

impl OperationHint {
    fn as_str(&self) -> &'static str {
        match self {
            OperationHint::GetAssertion => "ga",
            OperationHint::MakeCredential => "mc",
        }
    }
}

/// Decoded contents of a `FIDO:/` QR code, CBOR map keys 0 to 5.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryPayload {
    /// The initiator's P-256 public key, uncompressed (65 bytes).
    pub public_key: Vec<u8>,
    /// Shared secret, 16 to 32 bytes depending on the platform.
    pub qr_secret: QrSecret,
    /// Number of assigned tunnel server domains the initiator knows.
    pub known_domains_count: u32,
    /// Seconds since the epoch when the QR code was generated.
    pub current_time: Option<u64>,
    pub can_perform_transactions: Option<bool>,
    pub operation_hint: OperationHint,
}

impl DiscoveryPayload {
    /// Parses a scanned QR code, with or without the `FIDO:/` prefix.
    pub fn decode_qr_contents(contents: &str) -> Result<Self, CableError> {
        let digits = contents.strip_prefix(QR_PREFIX).unwrap_or(contents);
        let cbor = base10::decode(digits)?;
        Self::from_cbor(&cbor)
    }

    fn from_cbor(cbor: &[u8]) -> Result<Self, CableError> {
        let map = match from_slice(cbor)? {
            Value::Map(m) => m,
            _ => return Err(CableError::Cbor),
        };

        let public_key = match map.get(&Value::Integer(0)) {
            Some(Value::Bytes(b)) if b.len() == 65 => b.clone(),
            _ => return Err(CableError::Cbor),
        };
        let qr_secret: QrSecret = match map.get(&Value::Integer(1)) {
            Some(Value::Bytes(b)) if (16..=32).contains(&b.len()) => b.clone(),
            _ => return Err(CableError::Cbor),
        };
        let known_domains_count = match map.get(&Value::Integer(2)) {
            Some(Value::Integer(i)) => u32::try_from(*i).map_err(|_| CableError::Cbor)?,
            _ => return Err(CableError::Cbor),
        };
        let current_time = match map.get(&Value::Integer(3)) {
            Some(Value::Integer(i)) => Some(u64::try_from(*i).map_err(|_| CableError::Cbor)?),
            _ => None,
        };
        let can_perform_transactions = match map.get(&Value::Integer(4)) {
            Some(Value::Bool(b)) => Some(*b),
            _ => None,
        };
        let operation_hint = match map.get(&Value::Integer(5)) {
            Some(Value::Text(t)) => t.as_str().into(),
            _ => OperationHint::default(),
        };

        Ok(Self {
            public_key,
            qr_secret,
            known_domains_count,
            current_time,
            can_perform_transactions,
            operation_hint,
        })
    }

    /// Encodes this payload as a `FIDO:/` URL, as the platform would.
    pub fn to_qr_url(&self) -> Result<String, CableError> {
        let mut map = BTreeMap::new();
        map.insert(Value::Integer(0), Value::Bytes(self.public_key.clone()));
        map.insert(Value::Integer(1), Value::Bytes(self.qr_secret.clone()));
        map.insert(
            Value::Integer(2),
            Value::Integer(self.known_domains_count.into()),
        );
        if let Some(t) = self.current_time {
            map.insert(Value::Integer(3), Value::Integer(t.into()));
        }
        if let Some(t) = self.can_perform_transactions {
            map.insert(Value::Integer(4), Value::Bool(t));
        }
        map.insert(
            Value::Integer(5),
            Value::Text(self.operation_hint.as_str().to_string()),
        );

        let cbor = to_vec(&Value::Map(map))?;
        Ok(format!("{}{}", QR_PREFIX, base10::encode(&cbor)))
    }

    /// Derives the advertisement encryption key for a QR session.
    pub fn eid_key(&self) -> Result<EidKey, CableError> {
        let mut eid_key: EidKey = [0; size_of::<EidKey>()];
        KeyPurpose::EidKey.derive(&self.qr_secret, &[], &mut eid_key)?;
        Ok(eid_key)
    }

    /// Derives the tunnel ID for a QR session, hex-encoded into the
    /// `connect` URL.
    pub fn tunnel_id(&self) -> Result<TunnelId, CableError> {
        let mut tunnel_id: TunnelId = [0; size_of::<TunnelId>()];
        KeyPurpose::TunnelId.derive(&self.qr_secret, &[], &mut tunnel_id)?;
        Ok(tunnel_id)
    }

    /// Derives the Noise PSK for a QR session, bound to the advertisement
    /// we actually sent.
    pub fn psk(&self, advert_plaintext: &CableEid) -> Result<Psk, CableError> {
        derive_psk(&self.qr_secret, advert_plaintext)
    }
}

/// The first frame of a state-assisted connection: hex-encoded CBOR naming
/// the link the platform wants to use, map keys 1 to 3.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientPayload {
    pub link_id: LinkId,
    pub client_nonce: Vec<u8>,
    pub operation_hint: OperationHint,
}

impl ClientPayload {
    pub fn from_hex_cbor(data: &[u8]) -> Result<Self, CableError> {
        let cbor = hex::decode(data).map_err(|_| CableError::Cbor)?;
        let map = match from_slice(&cbor)? {
            Value::Map(m) => m,
            _ => return Err(CableError::Cbor),
        };

        let link_id: LinkId = match map.get(&Value::Integer(1)) {
            Some(Value::Bytes(b)) => b
                .as_slice()
                .try_into()
                .map_err(|_| CableError::Cbor)?,
            _ => return Err(CableError::Cbor),
        };
        let client_nonce = match map.get(&Value::Integer(2)) {
            Some(Value::Bytes(b)) => b.clone(),
            _ => return Err(CableError::Cbor),
        };
        let operation_hint = match map.get(&Value::Integer(3)) {
            Some(Value::Text(t)) => t.as_str().into(),
            _ => OperationHint::default(),
        };

        Ok(Self {
            link_id,
            client_nonce,
            operation_hint,
        })
    }

    /// Encodes this payload as the platform would send it.
    pub fn to_hex_cbor(&self) -> Result<Vec<u8>, CableError> {
        let mut map = BTreeMap::new();
        map.insert(Value::Integer(1), Value::Bytes(self.link_id.to_vec()));
        map.insert(Value::Integer(2), Value::Bytes(self.client_nonce.clone()));
        map.insert(
            Value::Integer(3),
            Value::Text(self.operation_hint.as_str().to_string()),
        );
        Ok(hex::encode(to_vec(&Value::Map(map))?).into_bytes())
    }

    /// Derives the advertisement encryption key for a state-assisted
    /// session.
    pub fn eid_key(&self, link_secret: &[u8]) -> Result<EidKey, CableError> {
        let mut eid_key: EidKey = [0; size_of::<EidKey>()];
        KeyPurpose::EidKey.derive(link_secret, &self.client_nonce, &mut eid_key)?;
        Ok(eid_key)
    }
}

/// Derives the Noise PSK from a session secret and the advertisement
/// plaintext, so the PSK is bound to this connection attempt.
pub fn derive_psk(secret: &[u8], advert_plaintext: &CableEid) -> Result<Psk, CableError> {
    let mut psk: Psk = [0; size_of::<Psk>()];
    KeyPurpose::Psk.derive(secret, advert_plaintext, &mut psk)?;
    Ok(psk)
}

/// Decrypted advertisement contents.
#[derive(Debug, PartialEq, Eq)]
pub struct Eid {
    pub tunnel_server_id: u16,
    pub routing_id: RoutingId,
    pub nonce: BleNonce,
}

impl Eid {
    /// Creates an [Eid] with a fresh random nonce.
    ///
    /// A new advertisement must be built for every connection attempt, so
    /// the nonce (and therefore the PSK) is never reused.
    pub fn new(tunnel_server_id: u16, routing_id: RoutingId) -> Result<Self, CableError> {
        let mut nonce: BleNonce = [0; size_of::<BleNonce>()];
        rand_bytes(&mut nonce)?;

        Ok(Self {
            tunnel_server_id,
            routing_id,
            nonce,
        })
    }

    pub fn to_bytes(&self) -> CableEid {
        let mut o: CableEid = [0; size_of::<CableEid>()];
        let mut p = 1;
        let mut q = p + size_of::<BleNonce>();
        o[p..q].copy_from_slice(&self.nonce);

        p = q;
        q += size_of::<RoutingId>();
        o[p..q].copy_from_slice(&self.routing_id);

        p = q;
        q += size_of::<u16>();
        o[p..q].copy_from_slice(&self.tunnel_server_id.to_le_bytes());

        o
    }

    fn from_bytes(eid: CableEid) -> Self {
        let mut p = 1;
        let mut nonce: BleNonce = [0; size_of::<BleNonce>()];
        let mut q = p + size_of::<BleNonce>();
        nonce.copy_from_slice(&eid[p..q]);

        p = q;
        q += size_of::<RoutingId>();
        let mut routing_id: RoutingId = [0; size_of::<RoutingId>()];
        routing_id.copy_from_slice(&eid[p..q]);

        p = q;
        q += size_of::<u16>();
        let tunnel_server_id = u16::from_le_bytes(eid[p..q].try_into().unwrap());

        Self {
            nonce,
            routing_id,
            tunnel_server_id,
        }
    }

    /// Encrypts this advertisement: AES-256-ECB over the single 16-byte
    /// block with the first half of `key`, then the first 4 bytes of an
    /// HMAC-SHA256 over the ciphertext with the second half.
    pub fn encrypt_advert(&self, key: &EidKey) -> Result<BleAdvert, CableError> {
        let eid = self.to_bytes();
        let c = encrypt(&key[..32], &eid)?;

        let mut crypted: BleAdvert = [0; size_of::<BleAdvert>()];
        crypted[..size_of::<CableEid>()].copy_from_slice(&c);

        let calculated_hmac = hmac_sha_256(&key[32..64], &crypted[..16])?;
        crypted[size_of::<CableEid>()..].copy_from_slice(&calculated_hmac[..4]);

        Ok(crypted)
    }

    /// Decrypts and validates an advertisement.
    ///
    /// Returns `Ok(None)` if the HMAC doesn't verify, reserved bits are
    /// set, or the tunnel server is unknown — any advertisement that isn't
    /// for us.
    pub fn decrypt_advert(advert: &BleAdvert, key: &EidKey) -> Result<Option<Eid>, CableError> {
        let calculated_hmac = hmac_sha_256(&key[32..64], &advert[..16])?;
        if calculated_hmac[..4] != advert[16..20] {
            warn!("incorrect HMAC when decrypting caBLE advertisement");
            return Ok(None);
        }

        // HMAC checks out, try to decrypt
        let plaintext = decrypt(&key[..32], &advert[..16])?;
        let plaintext: Option<CableEid> = plaintext.try_into().ok();

        Ok(match plaintext {
            Some(plaintext) => {
                if plaintext[0] != 0 {
                    warn!("reserved bits not 0 in decrypted caBLE advertisement");
                    return Ok(None);
                }

                let eid = Eid::from_bytes(plaintext);
                if get_domain(eid.tunnel_server_id).is_none() {
                    return Ok(None);
                }

                Some(eid)
            }
            None => {
                warn!("decrypt fail");
                None
            }
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crypto::{public_key_to_bytes, regenerate};

    fn sample_payload() -> DiscoveryPayload {
        let identity = regenerate().unwrap();
        DiscoveryPayload {
            public_key: public_key_to_bytes(&identity).unwrap(),
            qr_secret: vec![7; 16],
            known_domains_count: 2,
            current_time: Some(1_700_000_000),
            can_perform_transactions: Some(false),
            operation_hint: OperationHint::MakeCredential,
        }
    }

    #[test]
    fn qr_url_round_trip() {
        let _ = tracing_subscriber::fmt::try_init();

        let payload = sample_payload();
        let url = payload.to_qr_url().unwrap();
        assert!(url.starts_with("FIDO:/"));
        assert!(url[6..].bytes().all(|b| b.is_ascii_digit()));

        let decoded = DiscoveryPayload::decode_qr_contents(&url).unwrap();
        assert_eq!(decoded, payload);

        // also accepted without the scheme prefix
        let decoded = DiscoveryPayload::decode_qr_contents(&url[6..]).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn qr_secret_length_range() {
        let _ = tracing_subscriber::fmt::try_init();

        // 32-byte secrets are produced by some platforms
        let mut payload = sample_payload();
        payload.qr_secret = vec![0x2b; 32];
        let url = payload.to_qr_url().unwrap();
        let decoded = DiscoveryPayload::decode_qr_contents(&url).unwrap();
        assert_eq!(decoded, payload);
        assert_eq!(decoded.eid_key().unwrap().len(), 64);

        // under 16 bytes is not a valid secret
        payload.qr_secret = vec![0x2b; 8];
        let url = payload.to_qr_url().unwrap();
        assert_eq!(
            DiscoveryPayload::decode_qr_contents(&url).unwrap_err(),
            CableError::Cbor
        );
    }

    #[test]
    fn unknown_operation_hint_falls_back() {
        let mut payload = sample_payload();
        payload.operation_hint = OperationHint::GetAssertion;
        let url = payload.to_qr_url().unwrap();
        let decoded = DiscoveryPayload::decode_qr_contents(&url).unwrap();
        assert_eq!(decoded.operation_hint, OperationHint::GetAssertion);
    }

    #[test]
    fn qr_derivations_are_stable() {
        let payload = sample_payload();
        assert_eq!(payload.eid_key().unwrap(), payload.eid_key().unwrap());
        assert_eq!(payload.tunnel_id().unwrap(), payload.tunnel_id().unwrap());

        // different advertisements give different PSKs
        let a = Eid::new(0, [1, 2, 3]).unwrap();
        let b = Eid::new(0, [1, 2, 3]).unwrap();
        assert_ne!(
            payload.psk(&a.to_bytes()).unwrap(),
            payload.psk(&b.to_bytes()).unwrap()
        );
    }

    #[test]
    fn advert_encrypt_decrypt() {
        let _ = tracing_subscriber::fmt::try_init();

        let payload = sample_payload();
        let key = payload.eid_key().unwrap();
        let c = Eid {
            tunnel_server_id: 0x0001,
            routing_id: [9, 10, 11],
            nonce: [9, 139, 115, 107, 54, 169, 140, 185, 164, 47],
        };

        let mut advert = c.encrypt_advert(&key).unwrap();

        let c2 = Eid::decrypt_advert(&advert, &key).unwrap().unwrap();
        // decrypting gets back the original value
        assert_eq!(c, c2);

        // Changing bits fails
        advert[0] ^= 1;
        let decrypted = Eid::decrypt_advert(&advert, &key).unwrap();
        assert!(decrypted.is_none());
    }

    #[test]
    fn advert_with_unknown_tunnel_server_rejected() {
        let payload = sample_payload();
        let key = payload.eid_key().unwrap();
        // ids 2..255 are in the assigned range but not assigned
        let c = Eid::new(200, [0, 0, 0]).unwrap();

        let advert = c.encrypt_advert(&key).unwrap();
        assert!(Eid::decrypt_advert(&advert, &key).unwrap().is_none());
    }

    #[test]
    fn client_payload_round_trip() {
        let p = ClientPayload {
            link_id: [1, 2, 3, 4, 5, 6, 7, 8],
            client_nonce: vec![0xaa; 16],
            operation_hint: OperationHint::GetAssertion,
        };
        let encoded = p.to_hex_cbor().unwrap();
        // hex keeps the payload printable for the HTTP header it rides in
        assert!(encoded.iter().all(|b| b.is_ascii_hexdigit()));
        assert_eq!(ClientPayload::from_hex_cbor(&encoded).unwrap(), p);
    }

    #[test]
    fn client_payload_rejects_garbage() {
        assert!(ClientPayload::from_hex_cbor(b"zz").is_err());
        assert!(ClientPayload::from_hex_cbor(&hex::encode([0xa0]).into_bytes()).is_err());
    }

    #[test]
    fn state_assisted_eid_key_depends_on_nonce() {
        let secret = [3; 32];
        let a = ClientPayload {
            link_id: [0; 8],
            client_nonce: vec![1; 16],
            operation_hint: OperationHint::GetAssertion,
        };
        let mut b = a.clone();
        b.client_nonce = vec![2; 16];

        assert_ne!(a.eid_key(&secret).unwrap(), b.eid_key(&secret).unwrap());
    }
}
