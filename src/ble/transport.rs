//! BLE transport trait definitions and core types
//!
//! Defines the platform binding both roles are written against. A binding
//! turns its platform's GATT callbacks into [`CentralEvent`] /
//! [`PeripheralEvent`] values delivered over one channel, and exposes the
//! platform operations as async methods. Operations that the platform
//! confirms later (connect, characteristic write, descriptor write) return
//! immediately with "accepted" and report completion as an event.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::gatt::{GattService, GattStatus};
use super::BleError;

/// A BLE device address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerAddress {
    /// A real 6-byte BLE MAC address.
    Real([u8; 6]),
    /// A simulated address identified by UUID.
    Simulated(Uuid),
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Real(b) => write!(
                f,
                "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
                b[0], b[1], b[2], b[3], b[4], b[5]
            ),
            Self::Simulated(id) => write!(f, "{}", id),
        }
    }
}

impl FromStr for PeerAddress {
    type Err = BleError;

    /// Parses `AA:BB:CC:DD:EE:FF` into a real address, or a UUID into a
    /// simulated one.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() == 6 {
            let mut bytes = [0u8; 6];
            for (slot, part) in bytes.iter_mut().zip(parts) {
                *slot = u8::from_str_radix(part, 16)
                    .map_err(|_| BleError::Config(format!("invalid peer address {:?}", s)))?;
            }
            return Ok(Self::Real(bytes));
        }
        Uuid::parse_str(s)
            .map(Self::Simulated)
            .map_err(|_| BleError::Config(format!("invalid peer address {:?}", s)))
    }
}

impl PeerAddress {
    /// Case-insensitive comparison against a configured address string.
    pub fn matches(&self, target: &str) -> bool {
        self.to_string().eq_ignore_ascii_case(target.trim())
    }
}

/// A peer seen while scanning.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerInfo {
    pub address: PeerAddress,
    /// Advertised local name, if the advertisement carried one.
    pub name: Option<String>,
    /// Service UUIDs listed in the advertisement.
    pub services: Vec<Uuid>,
    pub rssi: Option<i16>,
}

/// What a peripheral puts on the air while waiting for a central.
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    pub local_name: String,
    pub service_uuids: Vec<Uuid>,
}

/// Physical link state reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Disconnected,
}

/// Callbacks delivered to the central role.
#[derive(Debug, Clone, PartialEq)]
pub enum CentralEvent {
    PeerDiscovered(PeerInfo),
    LinkStateChanged {
        peer: PeerAddress,
        state: LinkState,
        status: i32,
    },
    ServicesDiscovered {
        peer: PeerAddress,
        services: Vec<GattService>,
    },
    /// A notification carrying the next inbound chunk.
    CharacteristicChanged {
        peer: PeerAddress,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    /// The previous characteristic write was acknowledged by the peer.
    CharacteristicWritten {
        peer: PeerAddress,
        characteristic: Uuid,
        status: i32,
    },
    DescriptorWritten {
        peer: PeerAddress,
        characteristic: Uuid,
        descriptor: Uuid,
        value: Vec<u8>,
        status: i32,
    },
}

/// Target of a read/write request received by the peripheral role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeRequest {
    pub peer: PeerAddress,
    pub request_id: u32,
    pub offset: usize,
    pub service: Uuid,
    pub characteristic: Uuid,
    /// Set when the request targets a descriptor of `characteristic`.
    pub descriptor: Option<Uuid>,
}

/// Callbacks delivered to the peripheral role.
#[derive(Debug, Clone, PartialEq)]
pub enum PeripheralEvent {
    Connected {
        peer: PeerAddress,
    },
    Disconnected {
        peer: PeerAddress,
        status: i32,
    },
    ReadRequest(AttributeRequest),
    WriteRequest {
        request: AttributeRequest,
        value: Vec<u8>,
    },
    /// Platform confirmation that a notification left the radio.
    NotificationSent {
        peer: PeerAddress,
        status: i32,
    },
}

/// BLE central role: scanning, connecting, and driving a remote GATT server.
#[async_trait]
pub trait CentralTransport: Send + Sync {
    /// Take the event stream. Each call replaces the previous receiver.
    fn events(&self) -> mpsc::UnboundedReceiver<CentralEvent>;

    /// Start scanning for peers advertising `service`.
    async fn start_scan(&self, service: Uuid) -> Result<(), BleError>;

    async fn stop_scan(&self) -> Result<(), BleError>;

    /// Initiate a link. Completion arrives as `LinkStateChanged`.
    async fn connect(&self, peer: &PeerAddress) -> Result<(), BleError>;

    /// Completion arrives as `ServicesDiscovered`.
    async fn discover_services(&self, peer: &PeerAddress) -> Result<(), BleError>;

    /// Enable or disable local delivery of notifications for a characteristic.
    async fn set_notify(&self, peer: &PeerAddress, characteristic: Uuid, enabled: bool) -> bool;

    /// Returns whether the platform accepted the write. The acknowledgment
    /// arrives as `CharacteristicWritten`.
    async fn write_characteristic(
        &self,
        peer: &PeerAddress,
        characteristic: Uuid,
        value: &[u8],
    ) -> bool;

    /// Returns whether the platform accepted the write. The acknowledgment
    /// arrives as `DescriptorWritten`.
    async fn write_descriptor(
        &self,
        peer: &PeerAddress,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> bool;

    async fn disconnect(&self, peer: &PeerAddress) -> Result<(), BleError>;

    /// Release every platform resource held for the link.
    async fn close(&self, peer: &PeerAddress);
}

/// BLE peripheral role: hosting a GATT service and accepting centrals.
#[async_trait]
pub trait PeripheralTransport: Send + Sync {
    /// Take the event stream. Each call replaces the previous receiver.
    fn events(&self) -> mpsc::UnboundedReceiver<PeripheralEvent>;

    async fn add_service(&self, service: GattService) -> Result<(), BleError>;

    async fn start_advertising(&self, advertisement: &Advertisement) -> Result<(), BleError>;

    async fn stop_advertising(&self) -> Result<(), BleError>;

    /// Push a characteristic value to one connected central. Returns
    /// whether the platform accepted the notification.
    async fn notify_characteristic_changed(
        &self,
        peer: &PeerAddress,
        characteristic: Uuid,
        value: &[u8],
        confirm: bool,
    ) -> bool;

    /// Answer a read/write request.
    async fn send_response(
        &self,
        peer: &PeerAddress,
        request_id: u32,
        status: GattStatus,
        offset: usize,
        value: &[u8],
    ) -> Result<(), BleError>;

    /// Force a connected central off the link.
    async fn cancel_connection(&self, peer: &PeerAddress) -> Result<(), BleError>;

    /// Shut the GATT server down.
    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_address_equality() {
        let addr1 = PeerAddress::Real([0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
        let addr2 = PeerAddress::Real([0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
        let addr3 = PeerAddress::Real([0xFF, 0x02, 0x03, 0x04, 0x05, 0x06]);
        assert_eq!(addr1, addr2);
        assert_ne!(addr1, addr3);

        let sim1 = PeerAddress::Simulated(Uuid::nil());
        let sim2 = PeerAddress::Simulated(Uuid::nil());
        assert_eq!(sim1, sim2);

        // Real and Simulated are never equal
        assert_ne!(addr1, sim1);
    }

    #[test]
    fn test_peer_address_display_and_parse() {
        let addr = PeerAddress::Real([0xAA, 0xBB, 0xCC, 0x01, 0x02, 0x03]);
        assert_eq!(addr.to_string(), "AA:BB:CC:01:02:03");
        assert_eq!("aa:bb:cc:01:02:03".parse::<PeerAddress>().unwrap(), addr);
        assert!(addr.matches("aa:bb:cc:01:02:03"));
        assert!(!addr.matches("AA:BB:CC:01:02:04"));

        let sim = PeerAddress::Simulated(Uuid::new_v4());
        assert_eq!(sim.to_string().parse::<PeerAddress>().unwrap(), sim);
        assert!("AA:BB".parse::<PeerAddress>().is_err());
        assert!("GG:BB:CC:01:02:03".parse::<PeerAddress>().is_err());
    }
}
