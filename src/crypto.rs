//! Common cryptographic routines, backed by OpenSSL.

use openssl::{
    bn::BigNumContext,
    ec::{EcGroup, EcKey, EcPoint, PointConversionForm},
    hash::{hash, MessageDigest},
    md::Md,
    nid::Nid,
    pkey::{Id, PKey, Private, Public},
    pkey_ctx::PkeyCtx,
    sign::Signer,
    symm::{decrypt_aead, encrypt_aead, Cipher, Crypter, Mode},
};

use crate::error::CableError;

/// Gets an [EcGroup] for P-256
pub fn get_group() -> Result<EcGroup, CableError> {
    Ok(EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?)
}

/// Encrypts some data using AES-256-ECB, with no padding.
///
/// ECB takes no IV, which is fine here: the only use is the single-block
/// advertisement cipher, and each block contains a fresh random nonce.
/// `plaintext.len()` must be a multiple of the cipher's blocksize.
pub fn encrypt(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CableError> {
    let cipher = Cipher::aes_256_ecb();
    let mut ct = vec![0; plaintext.len() + cipher.block_size()];
    let mut c = Crypter::new(cipher, Mode::Encrypt, key, None)?;
    c.pad(false);
    let l = c.update(plaintext, &mut ct)?;
    let l = l + c.finalize(&mut ct[l..])?;
    ct.truncate(l);
    Ok(ct)
}

/// Decrypts some data using AES-256-ECB, with no padding.
pub fn decrypt(key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CableError> {
    let cipher = Cipher::aes_256_ecb();
    if ciphertext.len() % cipher.block_size() != 0 {
        error!(
            "ciphertext length {} is not a multiple of {} bytes",
            ciphertext.len(),
            cipher.block_size()
        );
        return Err(CableError::Internal);
    }

    let mut pt = vec![0; ciphertext.len() + cipher.block_size()];
    let mut c = Crypter::new(cipher, Mode::Decrypt, key, None)?;
    c.pad(false);
    let l = c.update(ciphertext, &mut pt)?;
    let l = l + c.finalize(&mut pt[l..])?;
    pt.truncate(l);
    Ok(pt)
}

/// Encrypts `plaintext` with AES-256-GCM, returning `ciphertext || tag`.
pub fn aes_256_gcm_encrypt(
    key: &[u8],
    nonce: &[u8],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CableError> {
    let mut tag = [0; 16];
    let mut ct = encrypt_aead(
        Cipher::aes_256_gcm(),
        key,
        Some(nonce),
        aad,
        plaintext,
        &mut tag,
    )?;
    ct.extend_from_slice(&tag);
    Ok(ct)
}

/// Decrypts `ciphertext || tag` with AES-256-GCM.
///
/// Returns [CableError::Decryption] if the tag does not verify.
pub fn aes_256_gcm_decrypt(
    key: &[u8],
    nonce: &[u8],
    aad: &[u8],
    ct: &[u8],
) -> Result<Vec<u8>, CableError> {
    if ct.len() < 16 {
        return Err(CableError::MessageTooShort);
    }
    let msg_len = ct.len() - 16;
    decrypt_aead(
        Cipher::aes_256_gcm(),
        key,
        Some(nonce),
        aad,
        &ct[..msg_len],
        &ct[msg_len..],
    )
    .map_err(|e| {
        trace!("decrypt_aead failed: {:?}", e);
        CableError::Decryption
    })
}

pub fn hkdf_sha_256(
    salt: &[u8],
    ikm: &[u8],
    info: Option<&[u8]>,
    output: &mut [u8],
) -> Result<(), CableError> {
    let mut ctx = PkeyCtx::new_id(Id::HKDF)?;
    ctx.derive_init()?;
    ctx.set_hkdf_md(Md::sha256())?;
    ctx.set_hkdf_salt(salt)?;
    ctx.set_hkdf_key(ikm)?;
    if let Some(info) = info {
        ctx.add_hkdf_info(info)?;
    }
    ctx.derive(Some(output))?;
    Ok(())
}

pub fn compute_sha256(data: &[u8]) -> [u8; 32] {
    let mut o = [0; 32];
    // SHA-256 never fails for in-memory input
    if let Ok(d) = hash(MessageDigest::sha256(), data) {
        o.copy_from_slice(&d);
    }
    o
}

/// Computes HMAC-SHA256 over `data`.
pub fn hmac_sha_256(key: &[u8], data: &[u8]) -> Result<[u8; 32], CableError> {
    let signing_key = PKey::hmac(key)?;
    let mut signer = Signer::new(MessageDigest::sha256(), &signing_key)?;
    let mut o: [u8; 32] = [0; 32];
    signer.update(data)?;
    signer.sign(&mut o)?;
    Ok(o)
}

/// Generate a fresh, random P-256 private key
pub fn regenerate() -> Result<EcKey<Private>, CableError> {
    let ecgroup = get_group()?;
    let eckey = EcKey::generate(&ecgroup)?;
    Ok(eckey)
}

pub fn ecdh(
    private_key: EcKey<Private>,
    peer_key: EcKey<Public>,
    output: &mut [u8],
) -> Result<(), CableError> {
    let peer_key = PKey::from_ec_key(peer_key)?;
    let pkey = PKey::from_ec_key(private_key)?;
    let mut ctx = PkeyCtx::new(&pkey)?;
    ctx.derive_init()?;
    ctx.derive_set_peer(&peer_key)?;
    ctx.derive(Some(output))?;
    Ok(())
}

/// Parses an uncompressed (`0x04 || x || y`) P-256 point into a public key.
///
/// Returns [CableError::MalformedHandshake] if the bytes are not a valid
/// point on the curve.
pub fn public_key_from_bytes(bytes: &[u8]) -> Result<EcKey<Public>, CableError> {
    let group = get_group()?;
    let mut ctx = BigNumContext::new()?;
    let point =
        EcPoint::from_bytes(&group, bytes, &mut ctx).map_err(|_| CableError::MalformedHandshake)?;
    EcKey::from_public_key(&group, &point).map_err(|_| CableError::MalformedHandshake)
}

/// Serialises a P-256 public key in uncompressed form (65 bytes).
pub fn public_key_to_bytes<T: openssl::pkey::HasPublic>(
    key: &EcKey<T>,
) -> Result<Vec<u8>, CableError> {
    let group = get_group()?;
    let mut ctx = BigNumContext::new()?;
    Ok(key
        .public_key()
        .to_bytes(&group, PointConversionForm::UNCOMPRESSED, &mut ctx)?)
}
