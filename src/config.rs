//! Connection settings for both roles
//!
//! Both structs deserialize from JSON with every field optional; missing
//! fields take the defaults below. UUID fields accept either a full UUID or
//! a short form such as `"FFE2"`.

use std::path::Path;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::ble::BleError;
use crate::connection::Framing;
use crate::uuid_util::{expand_short_uuid, from_short};

pub const DEFAULT_DISCOVERY_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_UNSUBSCRIBED_GRACE_MS: u64 = 3_000;
pub const DEFAULT_SYNTHETIC_ACK_DELAY_MS: u64 = 2;

pub const DEFAULT_SERVICE_UUID: Uuid = from_short(0xFFE2);
pub const DEFAULT_READ_CHARACTERISTIC_UUID: Uuid = from_short(0xFFE3);
pub const DEFAULT_WRITE_CHARACTERISTIC_UUID: Uuid = from_short(0xFFE4);

fn deserialize_uuid<'de, D>(deserializer: D) -> Result<Uuid, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    expand_short_uuid(&raw).map_err(serde::de::Error::custom)
}

fn parse<T: DeserializeOwned>(json: &str) -> Result<T, BleError> {
    serde_json::from_str(json).map_err(|e| BleError::Config(e.to_string()))
}

fn read_file(path: &Path) -> Result<String, BleError> {
    std::fs::read_to_string(path)
        .map_err(|e| BleError::Config(format!("failed to read {}: {}", path.display(), e)))
}

/// Settings of the connecting (central) side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CentralConfig {
    /// Bounds the whole discover-connect-subscribe sequence.
    pub discovery_timeout_ms: u64,
    pub read_timeout_ms: u64,
    /// Only connect to the peer with this address.
    pub target_address: Option<String>,
    /// Only connect to a peer advertising this local name.
    pub target_name: Option<String>,
    #[serde(deserialize_with = "deserialize_uuid")]
    pub service_uuid: Uuid,
    /// Characteristic the central subscribes to for inbound chunks.
    #[serde(deserialize_with = "deserialize_uuid")]
    pub read_characteristic_uuid: Uuid,
    /// Characteristic the central writes outbound chunks to.
    #[serde(deserialize_with = "deserialize_uuid")]
    pub write_characteristic_uuid: Uuid,
    pub delimited: bool,
}

impl Default for CentralConfig {
    fn default() -> Self {
        Self {
            discovery_timeout_ms: DEFAULT_DISCOVERY_TIMEOUT_MS,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            target_address: None,
            target_name: None,
            service_uuid: DEFAULT_SERVICE_UUID,
            read_characteristic_uuid: DEFAULT_READ_CHARACTERISTIC_UUID,
            write_characteristic_uuid: DEFAULT_WRITE_CHARACTERISTIC_UUID,
            delimited: true,
        }
    }
}

impl CentralConfig {
    pub fn from_json_str(json: &str) -> Result<Self, BleError> {
        let config: Self = parse(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, BleError> {
        Self::from_json_str(&read_file(path.as_ref())?)
    }

    pub fn validate(&self) -> Result<(), BleError> {
        if self.discovery_timeout_ms == 0 {
            return Err(BleError::Config("discovery_timeout_ms must be positive".into()));
        }
        if self.read_timeout_ms == 0 {
            return Err(BleError::Config("read_timeout_ms must be positive".into()));
        }
        if self.read_characteristic_uuid == self.write_characteristic_uuid {
            return Err(BleError::Config(
                "read and write characteristics must differ".into(),
            ));
        }
        Ok(())
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn framing(&self) -> Framing {
        Framing::from_delimited_flag(self.delimited)
    }
}

/// Settings of the accepting (peripheral) side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeripheralConfig {
    /// Local name put in the advertisement.
    pub advertised_name: String,
    pub read_timeout_ms: u64,
    #[serde(deserialize_with = "deserialize_uuid")]
    pub service_uuid: Uuid,
    /// Characteristic centrals subscribe to; outbound chunks go here.
    #[serde(deserialize_with = "deserialize_uuid")]
    pub read_characteristic_uuid: Uuid,
    /// Characteristic centrals write inbound chunks to.
    #[serde(deserialize_with = "deserialize_uuid")]
    pub write_characteristic_uuid: Uuid,
    pub delimited: bool,
    /// Force a peer off the link when it unsubscribes without disconnecting.
    pub disconnect_unsubscribed: bool,
    pub unsubscribed_grace_ms: u64,
    /// Delay of the acknowledgment synthesized after each accepted
    /// notification. `None` waits for the platform's own confirmation.
    pub synthetic_ack_delay_ms: Option<u64>,
}

impl Default for PeripheralConfig {
    fn default() -> Self {
        Self {
            advertised_name: "blerpc".to_string(),
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            service_uuid: DEFAULT_SERVICE_UUID,
            read_characteristic_uuid: DEFAULT_READ_CHARACTERISTIC_UUID,
            write_characteristic_uuid: DEFAULT_WRITE_CHARACTERISTIC_UUID,
            delimited: true,
            disconnect_unsubscribed: false,
            unsubscribed_grace_ms: DEFAULT_UNSUBSCRIBED_GRACE_MS,
            synthetic_ack_delay_ms: Some(DEFAULT_SYNTHETIC_ACK_DELAY_MS),
        }
    }
}

impl PeripheralConfig {
    pub fn from_json_str(json: &str) -> Result<Self, BleError> {
        let config: Self = parse(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, BleError> {
        Self::from_json_str(&read_file(path.as_ref())?)
    }

    pub fn validate(&self) -> Result<(), BleError> {
        if self.read_timeout_ms == 0 {
            return Err(BleError::Config("read_timeout_ms must be positive".into()));
        }
        if self.read_characteristic_uuid == self.write_characteristic_uuid {
            return Err(BleError::Config(
                "read and write characteristics must differ".into(),
            ));
        }
        Ok(())
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn unsubscribed_grace(&self) -> Duration {
        Duration::from_millis(self.unsubscribed_grace_ms)
    }

    pub fn synthetic_ack_delay(&self) -> Option<Duration> {
        self.synthetic_ack_delay_ms.map(Duration::from_millis)
    }

    pub fn framing(&self) -> Framing {
        Framing::from_delimited_flag(self.delimited)
    }
}
