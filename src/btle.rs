//! Bluetooth Low Energy advertising.
//!
//! An authenticator proves its physical proximity to the platform and shares
//! connection metadata by transmitting an encrypted service data payload.
//! The radio itself is platform-specific and lives behind [Advertiser].

use uuid::Uuid;

use crate::error::CableError;

/// 16-bit Service Data UUID for caBLE assigned to FIDO2 (0xfff9).
///
/// Reference: [Bluetooth Assigned Numbers][], Section 3.10 (SDO Services)
///
/// [Bluetooth Assigned Numbers]: https://www.bluetooth.com/specifications/assigned-numbers/
pub const FIDO_CABLE_SERVICE_U16: u16 = 0xfff9;

/// Service Data UUID for caBLE assigned to FIDO2 (0xfff9), in 128-bit form.
///
/// Reference: [Bluetooth Assigned Numbers][], Section 3.10 (SDO Services)
///
/// [Bluetooth Assigned Numbers]: https://www.bluetooth.com/specifications/assigned-numbers/
pub const FIDO_CABLE_SERVICE: Uuid = Uuid::from_u128(0x0000fff9_0000_1000_8000_00805f9b34fb);

/// Bluetooth Low Energy advertising trait.
///
/// A caBLE authenticator needs to be able to send arbitrary service data
/// advertisements to be discoverable by the initiator (platform).
pub trait Advertiser {
    /// Start sending service data advertisements.
    ///
    /// Arguments:
    /// * `service_uuid`: a 16-bit service UUID to send advertising data for.
    /// * `payload`: the advertisement payload.
    ///
    /// Advertisements are of the type "Service Data - 16-bit UUID" (0x16).
    ///
    /// This should continue until [stop_advertising][Self::stop_advertising]
    /// is called.
    fn start_advertising(&mut self, service_uuid: u16, payload: &[u8]) -> Result<(), CableError>;

    /// Stop sending service data advertisements.
    fn stop_advertising(&mut self) -> Result<(), CableError>;
}
