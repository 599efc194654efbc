//! caBLE message framing types

use crate::{ctap::CtapStatusCode, error::CableError};

/// Prefix byte for messages on an established session
///
/// Not used for protocol version 0
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CableFrameType {
    /// caBLE shutdown message
    Shutdown = 0,
    /// CTAP 2.x command
    Ctap = 1,
    /// Linking information
    Update = 2,
    Unknown,
}

impl From<u8> for CableFrameType {
    fn from(v: u8) -> Self {
        use CableFrameType::*;
        match v {
            0 => Shutdown,
            1 => Ctap,
            2 => Update,
            _ => Unknown,
        }
    }
}

pub const SHUTDOWN_COMMAND: CableFrame = CableFrame {
    protocol_version: 1,
    message_type: CableFrameType::Shutdown,
    data: vec![],
};

/// caBLE request and response framing.
///
/// These frames are encrypted ([Crypter][crate::crypter::Crypter]) and sent
/// as binary Websocket messages.
///
/// ## Protocol description
///
/// ### Version 0
///
/// All frames are of the type [CableFrameType::Ctap], and the wire format is
/// the same as CTAP 2.0.
///
/// ### Version 1
///
/// Version 1 adds an initial [CableFrameType] byte before the payload
/// (`data`):
///
/// * [CableFrameType::Shutdown]: no payload
/// * [CableFrameType::Ctap]: payload is CTAP 2.0 command / response
/// * [CableFrameType::Update]: payload is linking information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CableFrame {
    pub protocol_version: u32,
    pub message_type: CableFrameType,
    pub data: Vec<u8>,
}

impl CableFrame {
    /// Builds a CTAP response frame: a status byte, then an optional CBOR
    /// payload.
    pub fn ctap_response(status: CtapStatusCode, cbor: &[u8]) -> Self {
        let mut data = Vec::with_capacity(1 + cbor.len());
        data.push(status.to_byte());
        data.extend_from_slice(cbor);
        Self {
            protocol_version: 1,
            message_type: CableFrameType::Ctap,
            data,
        }
    }

    /// Builds a linking-information frame.
    pub fn update(data: Vec<u8>) -> Self {
        Self {
            protocol_version: 1,
            message_type: CableFrameType::Update,
            data,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        if self.protocol_version == 0 {
            return self.data.to_owned();
        }

        let mut o = self.data.to_owned();
        o.insert(0, self.message_type as u8);
        o
    }

    pub fn from_bytes(protocol_version: u32, i: &[u8]) -> Result<Self, CableError> {
        if protocol_version > 0 && i.is_empty() {
            return Err(CableError::MessageTooShort);
        }

        let message_type: CableFrameType = if protocol_version > 0 {
            i[0].into()
        } else {
            CableFrameType::Ctap
        };

        let data = if protocol_version == 0 { i } else { &i[1..] }.to_vec();

        Ok(Self {
            protocol_version,
            message_type,
            data,
        })
    }
}
