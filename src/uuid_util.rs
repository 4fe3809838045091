//! Short-form Bluetooth UUID helpers
//!
//! 16- and 32-bit assigned numbers expand into the Bluetooth base UUID
//! `0000XXXX-0000-1000-8000-00805F9B34FB`.

use uuid::Uuid;

use crate::ble::BleError;

const BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5F9B_34FB;

/// Client characteristic configuration descriptor (0x2902).
pub const CLIENT_CHARACTERISTIC_CONFIG: Uuid = from_short(0x2902);

/// Device information service (0x180A).
pub const DEVICE_INFORMATION_SERVICE: Uuid = from_short(0x180A);

/// Expand a 16/32-bit assigned number into a full UUID.
pub const fn from_short(short: u32) -> Uuid {
    Uuid::from_u128(BASE_UUID | ((short as u128) << 96))
}

/// Expand a short UUID string such as `"FFE2"`.
///
/// Up to eight hex digits are accepted and left-padded with zeros. Anything
/// longer is parsed as a full UUID.
pub fn expand_short_uuid(short: &str) -> Result<Uuid, BleError> {
    let trimmed = short.trim();
    if trimmed.is_empty() {
        return Err(BleError::InvalidUuid(short.to_string()));
    }
    if trimmed.len() <= 8 {
        let value = u32::from_str_radix(trimmed, 16)
            .map_err(|_| BleError::InvalidUuid(short.to_string()))?;
        return Ok(from_short(value));
    }
    Uuid::parse_str(trimmed).map_err(|_| BleError::InvalidUuid(short.to_string()))
}
