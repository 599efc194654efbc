//! Key derivation for caBLE shared secrets.

use num_traits::ToPrimitive;

use crate::{crypto::hkdf_sha_256, error::CableError};

/// Purpose identifiers for keys derived from a caBLE shared secret.
///
/// The purpose is mixed into HKDF as the `info` parameter, so a key derived
/// for one purpose can never collide with a key derived for another.
#[derive(FromPrimitive, ToPrimitive, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum KeyPurpose {
    /// Advertisement encryption key ([EidKey][crate::EidKey], 64 bytes).
    EidKey = 1,
    /// Tunnel ID ([TunnelId][crate::TunnelId], 16 bytes).
    TunnelId = 2,
    /// Noise pre-shared key ([Psk][crate::Psk], 32 bytes).
    Psk = 3,
}

impl KeyPurpose {
    /// Derives `output.len()` bytes from `ikm` with HKDF-SHA256, using this
    /// purpose (32-bit little-endian) as the `info` parameter.
    ///
    /// Purpose values must stay below 0x100 for compatibility with
    /// implementations which only reserve a single byte.
    pub fn derive(&self, ikm: &[u8], salt: &[u8], output: &mut [u8]) -> Result<(), CableError> {
        let typ = self.to_u32().ok_or(CableError::Internal)?;
        if typ >= 0x100 {
            return Err(CableError::InvalidPurpose);
        }
        hkdf_sha_256(salt, ikm, Some(&typ.to_le_bytes()), output)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn derive_is_deterministic() {
        let _ = tracing_subscriber::fmt::try_init();
        let ikm = [0x42; 16];

        let mut a = [0; 64];
        let mut b = [0; 64];
        KeyPurpose::EidKey.derive(&ikm, &[], &mut a).unwrap();
        KeyPurpose::EidKey.derive(&ikm, &[], &mut b).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn purposes_are_domain_separated() {
        let _ = tracing_subscriber::fmt::try_init();
        let ikm = [0x42; 16];

        let mut eid = [0; 32];
        let mut tun = [0; 32];
        let mut psk = [0; 32];
        KeyPurpose::EidKey.derive(&ikm, &[], &mut eid).unwrap();
        KeyPurpose::TunnelId.derive(&ikm, &[], &mut tun).unwrap();
        KeyPurpose::Psk.derive(&ikm, &[], &mut psk).unwrap();

        assert_ne!(eid, tun);
        assert_ne!(tun, psk);
        assert_ne!(eid, psk);
    }

    #[test]
    fn salt_changes_output() {
        let _ = tracing_subscriber::fmt::try_init();
        let ikm = [0x42; 16];

        let mut a = [0; 32];
        let mut b = [0; 32];
        KeyPurpose::Psk.derive(&ikm, &[], &mut a).unwrap();
        KeyPurpose::Psk.derive(&ikm, &[1, 2, 3], &mut b).unwrap();
        assert_ne!(a, b);
    }
}
