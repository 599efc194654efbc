//! CTAP 2.x command and status types used over the hybrid transport.

use std::collections::BTreeMap;

use num_traits::{FromPrimitive, ToPrimitive};
use serde::Serialize;
use serde_cbor::{to_vec, Value};

use crate::error::CableError;

/// CTAP 2.x command bytes.
///
/// Reference: <https://fidoalliance.org/specs/fido-v2.1-ps-20210615/fido-client-to-authenticator-protocol-v2.1-ps-20210615.html#commands>
#[derive(FromPrimitive, ToPrimitive, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CtapCommand {
    MakeCredential = 0x01,
    GetAssertion = 0x02,
    GetInfo = 0x04,
    ClientPin = 0x06,
    Reset = 0x07,
    GetNextAssertion = 0x08,
    Selection = 0x0b,
}

impl CtapCommand {
    pub fn from_byte(v: u8) -> Option<Self> {
        Self::from_u8(v)
    }
}

/// CTAP 2.x status bytes, sent as the first byte of every response.
///
/// Reference: <https://fidoalliance.org/specs/fido-v2.1-ps-20210615/fido-client-to-authenticator-protocol-v2.1-ps-20210615.html#error-responses>
#[derive(FromPrimitive, ToPrimitive, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CtapStatusCode {
    Ctap2Ok = 0x00,
    Ctap1ErrInvalidCommand = 0x01,
    Ctap1ErrInvalidParameter = 0x02,
    Ctap1ErrInvalidLength = 0x03,
    Ctap2ErrCborUnexpectedType = 0x11,
    Ctap2ErrInvalidCbor = 0x12,
    Ctap2ErrMissingParameter = 0x14,
    Ctap2ErrUnsupportedAlgorithm = 0x26,
    Ctap2ErrOperationDenied = 0x27,
    Ctap2ErrNoCredentials = 0x2e,
    Ctap2ErrUserActionTimeout = 0x2f,
    Ctap2ErrKeepaliveCancel = 0x2d,
    Ctap2ErrNotAllowed = 0x30,
    Ctap2ErrPinInvalid = 0x31,
    Ctap2ErrPinAuthInvalid = 0x33,
    Ctap2ErrRequestTooLarge = 0x39,
    Ctap2ErrActionTimeout = 0x3a,
    Ctap2ErrUpRequired = 0x3b,
    Ctap2ErrUvBlocked = 0x3c,
    Ctap2ErrUvInvalid = 0x3f,
    Ctap1ErrOther = 0x7f,
}

impl CtapStatusCode {
    pub fn to_byte(&self) -> u8 {
        self.to_u8().unwrap_or(0x7f)
    }
}

#[derive(Serialize, Debug)]
struct GetInfoResponseRawDict {
    #[serde(flatten)]
    pub keys: BTreeMap<u32, Value>,
}

/// `authenticatorGetInfo` response payload.
///
/// Sent unsolicited immediately after the handshake, so the platform knows
/// our capabilities without a request round trip.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(into = "GetInfoResponseRawDict")]
pub struct GetInfoResponse {
    pub versions: Vec<String>,
    pub extensions: Vec<String>,
    pub aaguid: [u8; 16],
    pub options: BTreeMap<String, bool>,
    pub transports: Vec<String>,
}

impl Default for GetInfoResponse {
    fn default() -> Self {
        let mut options = BTreeMap::new();
        options.insert("rk".to_string(), true);
        options.insert("up".to_string(), true);
        options.insert("uv".to_string(), true);
        options.insert("plat".to_string(), false);

        Self {
            versions: vec!["FIDO_2_0".to_string(), "FIDO_2_1".to_string()],
            extensions: vec!["uvm".to_string()],
            aaguid: [0; 16],
            options,
            transports: vec!["hybrid".to_string(), "internal".to_string()],
        }
    }
}

impl From<GetInfoResponse> for GetInfoResponseRawDict {
    fn from(value: GetInfoResponse) -> Self {
        let GetInfoResponse {
            versions,
            extensions,
            aaguid,
            options,
            transports,
        } = value;

        let mut keys = BTreeMap::new();
        keys.insert(
            0x1,
            Value::Array(versions.into_iter().map(Value::Text).collect()),
        );
        keys.insert(
            0x2,
            Value::Array(extensions.into_iter().map(Value::Text).collect()),
        );
        keys.insert(0x3, Value::Bytes(aaguid.to_vec()));
        keys.insert(
            0x4,
            Value::Map(
                options
                    .into_iter()
                    .map(|(k, v)| (Value::Text(k), Value::Bool(v)))
                    .collect(),
            ),
        );
        keys.insert(
            0x9,
            Value::Array(transports.into_iter().map(Value::Text).collect()),
        );

        GetInfoResponseRawDict { keys }
    }
}

impl GetInfoResponse {
    pub fn to_cbor(&self) -> Result<Vec<u8>, CableError> {
        Ok(to_vec(self)?)
    }
}
