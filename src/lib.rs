//! # cable-authenticator
//!
//! Authenticator-side protocol engine for caBLE v2 (the CTAP 2.2 "hybrid"
//! transport): a mobile device proves physical proximity to a platform with an
//! encrypted BLE advertisement, then speaks CTAP 2.x over a doubly-encrypted
//! (TLS and Noise) WebSocket tunnel.
//!
//! ## Protocol overview
//!
//! There are two ways a session starts:
//!
//! * **QR-initiated**: the platform displays a `FIDO:/` QR code carrying its
//!   public key and a shared secret ([DiscoveryPayload]). The authenticator
//!   scans it, connects to a tunnel server of its choosing, broadcasts an
//!   encrypted [Eid] advertisement, and answers a `Noise_KNpsk0` handshake.
//!
//! * **State-assisted**: the platform contacts the tunnel server using linking
//!   information ([LinkRecord]) from an earlier QR session. The tunnel relays
//!   a [ClientPayload] naming the link; the authenticator advertises and
//!   answers a `Noise_NKpsk0` handshake with its long-term identity key.
//!
//! After the handshake, all traffic is padded and AES-256-GCM encrypted
//! ([Crypter]), framed as [CableFrame]s. The authenticator immediately sends
//! an unsolicited `GetInfo` response, then serves a single credential
//! operation dispatched through the [Session] state machine.
//!
//! This crate deliberately stops at the protocol boundary: BLE radios,
//! WebSocket sockets, credential storage and WebAuthn ceremony logic live
//! behind the [Advertiser], [Transport], [CredentialStore] and [Signer]
//! traits.

#[macro_use]
extern crate tracing;
#[macro_use]
extern crate num_derive;

mod base10;
mod btle;
mod crypter;
pub mod crypto;
mod ctap;
mod discovery;
mod error;
mod framing;
mod handshake;
mod kdf;
mod link;
mod noise;
mod session;
mod tunnel;

pub use self::base10::DecodeError;
pub use self::btle::{Advertiser, FIDO_CABLE_SERVICE, FIDO_CABLE_SERVICE_U16};
pub use self::crypter::Crypter;
pub use self::ctap::{CtapCommand, CtapStatusCode, GetInfoResponse};
pub use self::discovery::{ClientPayload, DiscoveryPayload, Eid, OperationHint};
pub use self::error::CableError;
pub use self::framing::{CableFrame, CableFrameType, SHUTDOWN_COMMAND};
pub use self::handshake::{
    initiate_qr_handshake, initiate_state_assisted_handshake, respond_qr_handshake,
    respond_state_assisted_handshake, HandshakeResult, InitiatorHandshake,
};
pub use self::kdf::KeyPurpose;
pub use self::link::{verify_link_signature, LinkData, LinkRecord};
pub use self::session::{
    CredentialRequest, CredentialStore, Session, SessionState, Signer, Transport,
};
pub use self::tunnel::{get_connect_uri, get_contact_uri, get_domain, Tunnel};

/// Encrypted BLE service data payload: 16 byte ciphertext + 4 byte HMAC tag.
pub type BleAdvert = [u8; 16 + 4];
/// Routing ID for the tunnel server's internal load balancing.
pub type RoutingId = [u8; 3];
/// Per-advertisement connection nonce.
pub type BleNonce = [u8; 10];
/// Decrypted advertisement plaintext.
pub type CableEid = [u8; 16];
/// Shared secret from the QR code, 16 to 32 bytes.
pub type QrSecret = Vec<u8>;
/// EID encryption key: 32 bytes AES-256 + 32 bytes HMAC-SHA256.
pub type EidKey = [u8; 32 + 32];
/// Tunnel ID, hex-encoded into the `connect` URL path.
pub type TunnelId = [u8; 16];
/// Noise pre-shared key.
pub type Psk = [u8; 32];
/// Link identifier sent back by the platform on state-assisted connects.
pub type LinkId = [u8; 8];
/// Long-term link secret shared during QR pairing.
pub type LinkSecret = [u8; 32];
/// Contact ID issued by the tunnel server for state-assisted rendezvous.
pub type ContactId = [u8; 8];
