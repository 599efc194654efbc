//! Noise symmetric state for the caBLE handshake.
//!
//! caBLE uses a slightly non-standard Noise: the prologue is a single "type
//! bit", and the initiator's static key is distributed out-of-band (QR code)
//! rather than transmitted. Only the symmetric-state half of Noise is needed
//! here; the message patterns live in [handshake][crate::handshake].

use std::mem::size_of;

use crate::{
    crypto::{aes_256_gcm_encrypt, aes_256_gcm_decrypt, compute_sha256, hkdf_sha_256},
    error::CableError,
};

pub const NOISE_KN_PROTOCOL: &[u8] = b"Noise_KNpsk0_P256_AESGCM_SHA256";
pub const NOISE_NK_PROTOCOL: &[u8] = b"Noise_NKpsk0_P256_AESGCM_SHA256";

type ChainingKey = [u8; 32];
type HandshakeHash = [u8; 32];
type CipherKey = [u8; 32];

/// The two directional keys produced by [NoiseState::split].
///
/// `k1` protects initiator-to-responder traffic, `k2` the reverse.
pub struct TrafficKeys {
    pub k1: CipherKey,
    pub k2: CipherKey,
}

/// Noise symmetric state (`ck`, `h` and the current cipher key).
pub struct NoiseState {
    ck: ChainingKey,
    h: HandshakeHash,
    key: Option<CipherKey>,
    n: u32,
}

impl NoiseState {
    /// Initialises the state from a protocol name.
    ///
    /// Names no longer than 32 bytes are zero-padded into `h` directly,
    /// longer names are hashed (both caBLE names are 31 bytes).
    pub fn new(protocol_name: &[u8]) -> Self {
        let mut h: HandshakeHash = [0; size_of::<HandshakeHash>()];
        if protocol_name.len() <= h.len() {
            h[..protocol_name.len()].copy_from_slice(protocol_name);
        } else {
            h = compute_sha256(protocol_name);
        }

        Self {
            ck: h,
            h,
            key: None,
            n: 0,
        }
    }

    /// `h = SHA-256(h || data)`
    pub fn mix_hash(&mut self, data: &[u8]) {
        let mut buf = Vec::with_capacity(self.h.len() + data.len());
        buf.extend_from_slice(&self.h);
        buf.extend_from_slice(data);
        self.h = compute_sha256(&buf);
    }

    /// Mixes key material into the chaining key and installs a new cipher
    /// key: `(ck, k) = HKDF(salt = ck, ikm)`.
    pub fn mix_key(&mut self, ikm: &[u8]) -> Result<(), CableError> {
        let mut okm = [0; 64];
        hkdf_sha_256(&self.ck, ikm, None, &mut okm)?;
        self.ck.copy_from_slice(&okm[..32]);
        self.install_key(&okm[32..64]);
        Ok(())
    }

    /// Mixes the pre-shared key into both the chaining key and the
    /// handshake hash: `(ck, h', k) = HKDF(salt = ck, ikm)`.
    pub fn mix_key_and_hash(&mut self, ikm: &[u8]) -> Result<(), CableError> {
        let mut okm = [0; 96];
        hkdf_sha_256(&self.ck, ikm, None, &mut okm)?;
        self.ck.copy_from_slice(&okm[..32]);
        let h_delta: [u8; 32] = okm[32..64].try_into().map_err(|_| CableError::Internal)?;
        self.mix_hash(&h_delta);
        self.install_key(&okm[64..96]);
        Ok(())
    }

    fn install_key(&mut self, k: &[u8]) {
        let mut key: CipherKey = [0; size_of::<CipherKey>()];
        key.copy_from_slice(k);
        self.key = Some(key);
        self.n = 0;
    }

    /// Encrypts a handshake payload under the current cipher key.
    pub fn encrypt(&mut self, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CableError> {
        let key = self.key.ok_or(CableError::InvalidState)?;
        let nonce = self.next_nonce()?;
        aes_256_gcm_encrypt(&key, &nonce, aad, plaintext)
    }

    /// Decrypts a handshake payload under the current cipher key.
    pub fn decrypt(&mut self, aad: &[u8], ct: &[u8]) -> Result<Vec<u8>, CableError> {
        let key = self.key.ok_or(CableError::InvalidState)?;
        let nonce = self.next_nonce()?;
        aes_256_gcm_decrypt(&key, &nonce, aad, ct)
    }

    fn next_nonce(&mut self) -> Result<[u8; 12], CableError> {
        let mut nonce = [0; 12];
        nonce[12 - size_of::<u32>()..].copy_from_slice(&self.n.to_be_bytes());
        self.n = self.n.checked_add(1).ok_or(CableError::CounterOverflow)?;
        Ok(nonce)
    }

    /// The current handshake hash. Only meaningful as a channel binding
    /// value once both sides have processed the same messages.
    pub fn handshake_hash(&self) -> HandshakeHash {
        self.h
    }

    /// Derives the directional traffic keys: `(k1, k2) = HKDF(salt = ck, [])`
    pub fn split(&self) -> Result<TrafficKeys, CableError> {
        let mut okm = [0; 64];
        hkdf_sha_256(&self.ck, &[], None, &mut okm)?;
        let mut k1: CipherKey = [0; size_of::<CipherKey>()];
        let mut k2: CipherKey = [0; size_of::<CipherKey>()];
        k1.copy_from_slice(&okm[..32]);
        k2.copy_from_slice(&okm[32..64]);
        Ok(TrafficKeys { k1, k2 })
    }
}
