//! GATT attribute types shared by both roles
//!
//! Describes the services a peer exposes, the client characteristic
//! configuration values used for the notification handshake, and the
//! status codes carried by link state changes.

use uuid::Uuid;

/// ATT status reported with a successful operation.
pub const GATT_SUCCESS: i32 = 0;

/// Generic GATT error (vendor stacks report it for failed connects).
pub const GATT_ERROR: i32 = 133;

/// Status a central sees when the peripheral terminated the link.
pub const REMOTE_TERMINATED: i32 = 19;

/// Disconnect statuses that abort a connection attempt outright.
pub const FATAL_CONNECT_STATUSES: [i32; 3] = [GATT_ERROR, 62, 129];

/// Whether a disconnect status is one of the known-unrecoverable codes.
pub fn is_fatal_status(status: i32) -> bool {
    FATAL_CONNECT_STATUSES.contains(&status)
}

/// A characteristic as discovered on a remote peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    pub descriptors: Vec<Uuid>,
}

/// A service as discovered on a remote peer, or as registered locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<GattCharacteristic>,
}

impl GattService {
    pub fn characteristic(&self, uuid: &Uuid) -> Option<&GattCharacteristic> {
        self.characteristics.iter().find(|c| &c.uuid == uuid)
    }
}

/// Value of the client characteristic configuration descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorValue {
    EnableNotification,
    EnableIndication,
    Disable,
}

impl DescriptorValue {
    pub fn as_bytes(&self) -> [u8; 2] {
        match self {
            Self::EnableNotification => [0x01, 0x00],
            Self::EnableIndication => [0x02, 0x00],
            Self::Disable => [0x00, 0x00],
        }
    }

    /// Parse a descriptor payload. Unknown values yield `None`.
    pub fn from_bytes(value: &[u8]) -> Option<Self> {
        match value {
            [0x01, 0x00] => Some(Self::EnableNotification),
            [0x02, 0x00] => Some(Self::EnableIndication),
            [0x00, 0x00] => Some(Self::Disable),
            _ => None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, Self::Disable)
    }
}

/// Outcome a peripheral reports back for a read/write request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattStatus {
    Success,
    Failure,
}
