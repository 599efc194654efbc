//! Post-handshake transport encryption.

use std::mem::size_of;

use crate::{
    crypto::{aes_256_gcm_decrypt, aes_256_gcm_encrypt},
    error::CableError,
};

pub type EncryptionKey = [u8; 32];
const PADDING_MUL: usize = 32;

/// Encrypts and decrypts caBLE messages on an established session.
///
/// Plaintext is padded to a multiple of 32 bytes to mask message lengths,
/// then sealed with AES-256-GCM under a per-direction key. The nonce is
/// eight zero bytes followed by a big-endian message counter, so each key
/// and counter pair is used exactly once; an AEAD failure or counter wrap
/// permanently poisons the session.
pub struct Crypter {
    read_key: EncryptionKey,
    write_key: EncryptionKey,
    read_seq: u32,
    write_seq: u32,
}

impl Crypter {
    pub fn new(read_key: EncryptionKey, write_key: EncryptionKey) -> Self {
        Self {
            read_key,
            write_key,
            read_seq: 0,
            write_seq: 0,
        }
    }

    /// Creates a [Crypter] for keys produced by a handshake whose final
    /// message was itself AEAD-sealed under counter 0: traffic continues
    /// from counter 1 in both directions.
    pub fn after_handshake(read_key: EncryptionKey, write_key: EncryptionKey) -> Self {
        Self {
            read_key,
            write_key,
            read_seq: 1,
            write_seq: 1,
        }
    }

    pub fn encrypt(&mut self, msg: &[u8]) -> Result<Vec<u8>, CableError> {
        let padded_len = (msg.len() + PADDING_MUL) & !(PADDING_MUL - 1);
        let zeros = padded_len - msg.len() - 1;

        let mut padded = vec![0; padded_len];
        padded[..msg.len()].copy_from_slice(msg);
        padded[padded_len - 1] = zeros as u8;

        let nonce = construct_nonce(self.write_seq);
        self.write_seq = self
            .write_seq
            .checked_add(1)
            .ok_or(CableError::CounterOverflow)?;

        aes_256_gcm_encrypt(&self.write_key, &nonce, &[], &padded)
    }

    pub fn decrypt(&mut self, ct: &[u8]) -> Result<Vec<u8>, CableError> {
        if ct.len() < 16 + PADDING_MUL || (ct.len() - 16) % PADDING_MUL != 0 {
            return Err(CableError::MessageTooShort);
        }

        let nonce = construct_nonce(self.read_seq);
        let mut decrypted = aes_256_gcm_decrypt(&self.read_key, &nonce, &[], ct)?;
        self.read_seq = self
            .read_seq
            .checked_add(1)
            .ok_or(CableError::CounterOverflow)?;

        let padding_len = (decrypted.last().copied().unwrap_or_default() as usize) + 1;
        if padding_len > decrypted.len() {
            error!(
                "invalid caBLE message (padding length {} > message length {})",
                padding_len,
                decrypted.len()
            );
            return Err(CableError::Decryption);
        }

        decrypted.truncate(decrypted.len() - padding_len);
        Ok(decrypted)
    }

    fn zeroize(&mut self) {
        self.read_key.fill(0);
        self.write_key.fill(0);
        self.read_seq = 0;
        self.write_seq = 0;
    }
}

impl Drop for Crypter {
    fn drop(&mut self) {
        self.zeroize();
    }
}

fn construct_nonce(counter: u32) -> [u8; 12] {
    let mut nonce = [0; 12];
    nonce[12 - size_of::<u32>()..].copy_from_slice(&counter.to_be_bytes());
    nonce
}
