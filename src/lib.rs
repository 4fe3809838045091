// blerpc - RPC transport over Bluetooth Low Energy GATT

pub mod ble;
pub mod central;
pub mod config;
pub mod connection;
pub mod peripheral;
pub mod stream;
pub mod uuid_util;

pub use ble::BleError;
pub use central::{CentralConnection, CentralConnector, CentralState, DiscoveryFilter};
pub use config::{CentralConfig, PeripheralConfig};
pub use connection::{Connection, Framing};
pub use peripheral::{PeripheralConnection, PeripheralRegistry};
