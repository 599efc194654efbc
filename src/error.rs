//! Error types.

/// Errors which may occur while running a caBLE session.
#[derive(Debug, PartialEq, Eq)]
pub enum CableError {
    /// CBOR parse or encode failure.
    Cbor,
    /// A QR digit string could not be decoded.
    Base10(crate::base10::DecodeError),
    /// A derived-key purpose identifier was out of range (>= 0x100).
    InvalidPurpose,
    /// A public key point was not a valid P-256 point, or a handshake
    /// message was structurally wrong.
    MalformedHandshake,
    /// An AEAD open failed: the peer's keys don't match ours, or the
    /// message was tampered with. Fatal to the session.
    Decryption,
    /// A per-direction message counter would wrap.
    CounterOverflow,
    /// A message was shorter than its fixed framing requires.
    MessageTooShort,
    /// The operation is not valid in the session's current state.
    InvalidState,
    /// The advertised tunnel server ID does not decode to a known domain.
    UnknownTunnelServer,
    /// Websocket or transport-layer failure.
    Transport,
    OpenSSL,
    Internal,
}

impl From<openssl::error::ErrorStack> for CableError {
    fn from(v: openssl::error::ErrorStack) -> Self {
        error!("openssl error: {:?}", v);
        CableError::OpenSSL
    }
}

impl From<serde_cbor::Error> for CableError {
    fn from(v: serde_cbor::Error) -> Self {
        error!("cbor error: {:?}", v);
        CableError::Cbor
    }
}

impl From<crate::base10::DecodeError> for CableError {
    fn from(v: crate::base10::DecodeError) -> Self {
        CableError::Base10(v)
    }
}
