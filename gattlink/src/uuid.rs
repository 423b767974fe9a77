use uuid::Uuid;

const BLUETOOTH_BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;
const BLUETOOTH_BASE_MASK_32: u128 = 0x00000000_ffff_ffff_ffff_ffffffffffff;
const BLUETOOTH_BASE_MASK_16: u128 = 0xffff0000_ffff_ffff_ffff_ffffffffffff;

pub trait BluetoothUuid {
    fn as_u16(&self) -> Option<u16>;
    fn as_u32(&self) -> Option<u32>;
    fn from_u16(v: u16) -> Uuid;
    fn from_u32(v: u32) -> Uuid;
}

impl BluetoothUuid for Uuid {
    fn as_u16(&self) -> Option<u16> {
        let value = self.as_u128();
        if value & BLUETOOTH_BASE_MASK_16 == BLUETOOTH_BASE_UUID {
            Some((value >> 96) as u16)
        } else {
            None
        }
    }

    fn as_u32(&self) -> Option<u32> {
        let value = self.as_u128();
        if value & BLUETOOTH_BASE_MASK_32 == BLUETOOTH_BASE_UUID {
            Some((value >> 96) as u32)
        } else {
            None
        }
    }

    fn from_u16(v: u16) -> Uuid {
        uuid_from_u16(v)
    }

    fn from_u32(v: u32) -> Uuid {
        uuid_from_u32(v)
    }
}

// It's useful to have const functions so apps can declare const Uuids but
// unfortunately we can't have const functions in traits yet

pub const fn uuid_from_u16(v: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((v as u128) << 96))
}
pub const fn uuid_from_u32(v: u32) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((v as u128) << 96))
}

/// The Generic Attribute service, home of the Service Changed characteristic
pub const GENERIC_ATTRIBUTE_SERVICE_UUID: Uuid = uuid_from_u16(0x1801);
pub const SERVICE_CHANGED_CHARACTERISTIC_UUID: Uuid = uuid_from_u16(0x2A05);

/// Vendor-reserved service whose table is rebuilt by the remote at runtime
pub const DYNAMIC_SERVICE_UUID: Uuid = Uuid::from_u128(0x8e0f7b6a_3c2d_4e1f_9a5b_0c1d2e3f4a5b);
pub const DYNAMIC_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x8e0f7b6b_3c2d_4e1f_9a5b_0c1d2e3f4a5b);

/// (service, characteristic) pairs whose presence means the radio stack's own
/// service cache may be stale and must be refreshed before re-discovery.
pub const SERVICE_CHANGE_INDICATORS: [(Uuid, Uuid); 2] = [
    (GENERIC_ATTRIBUTE_SERVICE_UUID, SERVICE_CHANGED_CHARACTERISTIC_UUID),
    (DYNAMIC_SERVICE_UUID, DYNAMIC_CHARACTERISTIC_UUID),
];

pub const CLIENT_CHARACTERISTIC_CONFIGURATION_UUID: Uuid = uuid_from_u16(0x2902);

pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];
pub const ENABLE_INDICATION_VALUE: [u8; 2] = [0x02, 0x00];
pub const DISABLE_NOTIFICATION_VALUE: [u8; 2] = [0x00, 0x00];
pub const DISABLE_INDICATION_VALUE: [u8; 2] = [0x00, 0x00];
