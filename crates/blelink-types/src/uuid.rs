//! Standard Bluetooth UUIDs and short-form helpers.
//!
//! Only the handful of attributes the lifecycle core itself touches live
//! here. Named service and characteristic catalogs are out of scope.

use uuid::{Uuid, uuid};

const BLUETOOTH_BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;
const BLUETOOTH_BASE_MASK: u128 = 0x00000000_ffff_ffff_ffff_ffffffffffff;
const BLUETOOTH_BASE_MASK_16: u128 = 0xffff0000_ffff_ffff_ffff_ffffffffffff;

// --- Standard GATT Service UUIDs ---

/// Generic Access Profile (GAP) service.
pub const GAP_SERVICE: Uuid = uuid!("00001800-0000-1000-8000-00805f9b34fb");

/// Generic Attribute Profile (GATT) service.
pub const GATT_SERVICE: Uuid = uuid!("00001801-0000-1000-8000-00805f9b34fb");

/// Device Information service.
pub const DEVICE_INFO_SERVICE: Uuid = uuid!("0000180a-0000-1000-8000-00805f9b34fb");

/// Battery service.
pub const BATTERY_SERVICE: Uuid = uuid!("0000180f-0000-1000-8000-00805f9b34fb");

// --- Standard Descriptor UUIDs ---

/// Client Characteristic Configuration descriptor (CCCD).
///
/// Toggling notifications or indications is a write to this descriptor.
pub const CLIENT_CHARACTERISTIC_CONFIGURATION: Uuid =
    uuid!("00002902-0000-1000-8000-00805f9b34fb");

/// Convert a 32-bit BLE short UUID to a full 128-bit UUID.
pub const fn uuid_from_u32(short: u32) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// Convert a 16-bit BLE short UUID to a full 128-bit UUID.
pub const fn uuid_from_u16(short: u16) -> Uuid {
    uuid_from_u32(short as u32)
}

/// Return the 16-bit short form when the UUID sits on the Bluetooth base.
pub fn to_short_u16(uuid: &Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    if value & BLUETOOTH_BASE_MASK_16 == BLUETOOTH_BASE_UUID {
        Some((value >> 96) as u16)
    } else {
        None
    }
}

/// Render a UUID in short form where possible (`0x180f`), long form otherwise.
pub fn to_short_string(uuid: &Uuid) -> String {
    let value = uuid.as_u128();
    if let Some(short) = to_short_u16(uuid) {
        format!("{:#06x}", short)
    } else if value & BLUETOOTH_BASE_MASK == BLUETOOTH_BASE_UUID {
        format!("{:#010x}", (value >> 96) as u32)
    } else {
        uuid.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_uuid_round_trip() {
        assert_eq!(uuid_from_u16(0x180f), BATTERY_SERVICE);
        assert_eq!(to_short_u16(&BATTERY_SERVICE), Some(0x180f));
        assert_eq!(to_short_u16(&uuid!("f0cd1400-95da-4f4b-9ac8-aa55d312af0c")), None);
    }

    #[test]
    fn test_short_string() {
        assert_eq!(to_short_string(&CLIENT_CHARACTERISTIC_CONFIGURATION), "0x2902");
        assert_eq!(to_short_string(&uuid_from_u32(0x1234_5678)), "0x12345678");
        let custom = uuid!("f0cd1400-95da-4f4b-9ac8-aa55d312af0c");
        assert_eq!(to_short_string(&custom), custom.to_string());
    }
}
