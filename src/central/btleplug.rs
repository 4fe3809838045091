//! Central transport backed by btleplug (Mac/Linux/Windows)
//!
//! btleplug exposes an async request/response API. Each operation is
//! awaited here and its completion is re-emitted as the [`CentralEvent`]
//! the connector expects. The subscription descriptor is not written
//! directly: btleplug's `subscribe`/`unsubscribe` write it for us.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use btleplug::api::{
    Central as _, CentralEvent as AdapterEvent, Characteristic, Manager as _,
    Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::ble::gatt::{
    DescriptorValue, GattCharacteristic, GattService, GATT_ERROR, GATT_SUCCESS, REMOTE_TERMINATED,
};
use crate::ble::transport::{CentralEvent, CentralTransport, LinkState, PeerAddress, PeerInfo};
use crate::ble::BleError;

struct Shared {
    events: Mutex<mpsc::UnboundedSender<CentralEvent>>,
    peripherals: Mutex<HashMap<PeerAddress, Peripheral>>,
    notification_pumps: Mutex<HashMap<PeerAddress, JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn emit(&self, event: CentralEvent) {
        let _ = lock(&self.events).send(event);
    }
}

pub struct BtleplugCentral {
    adapter: Adapter,
    shared: Arc<Shared>,
    adapter_events: JoinHandle<()>,
}

impl BtleplugCentral {
    /// Bind to the first Bluetooth adapter of the host.
    pub async fn new() -> Result<Self, BleError> {
        let manager = Manager::new()
            .await
            .map_err(|e| BleError::ConnectionError(format!("Failed to initialize BLE manager: {}", e)))?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|e| BleError::ConnectionError(format!("Failed to get BLE adapters: {}", e)))?
            .into_iter()
            .next()
            .ok_or_else(|| BleError::ConnectionError("No BLE adapter found".into()))?;

        let (events, _) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            events: Mutex::new(events),
            peripherals: Mutex::new(HashMap::new()),
            notification_pumps: Mutex::new(HashMap::new()),
        });

        let mut stream = adapter
            .events()
            .await
            .map_err(|e| BleError::ScanError(format!("Failed to get adapter events: {}", e)))?;
        let pump_adapter = adapter.clone();
        let pump_shared = Arc::clone(&shared);
        let adapter_events = tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                match event {
                    AdapterEvent::DeviceDiscovered(id) | AdapterEvent::DeviceUpdated(id) => {
                        if let Some(info) = peer_info(&pump_adapter, &pump_shared, &id).await {
                            pump_shared.emit(CentralEvent::PeerDiscovered(info));
                        }
                    }
                    AdapterEvent::DeviceDisconnected(id) => {
                        if let Ok(peripheral) = pump_adapter.peripheral(&id).await {
                            pump_shared.emit(CentralEvent::LinkStateChanged {
                                peer: PeerAddress::Real(peripheral.address().into_inner()),
                                state: LinkState::Disconnected,
                                status: REMOTE_TERMINATED,
                            });
                        }
                    }
                    _ => {}
                }
            }
            log::debug!("Adapter event stream ended");
        });

        Ok(Self {
            adapter,
            shared,
            adapter_events,
        })
    }

    fn peripheral(&self, peer: &PeerAddress) -> Result<Peripheral, BleError> {
        lock(&self.shared.peripherals)
            .get(peer)
            .cloned()
            .ok_or_else(|| BleError::ConnectionError(format!("Unknown peripheral {}", peer)))
    }

    fn characteristic(peripheral: &Peripheral, uuid: Uuid) -> Option<Characteristic> {
        peripheral.characteristics().into_iter().find(|c| c.uuid == uuid)
    }

    fn start_notification_pump(&self, peer: PeerAddress, peripheral: Peripheral) {
        let shared = Arc::clone(&self.shared);
        let pump_peer = peer.clone();
        let handle = tokio::spawn(async move {
            let mut notifications = match peripheral.notifications().await {
                Ok(stream) => stream,
                Err(e) => {
                    log::warn!("No notification stream for {}: {}", pump_peer, e);
                    return;
                }
            };
            while let Some(notification) = notifications.next().await {
                shared.emit(CentralEvent::CharacteristicChanged {
                    peer: pump_peer.clone(),
                    characteristic: notification.uuid,
                    value: notification.value,
                });
            }
        });
        if let Some(previous) = lock(&self.shared.notification_pumps).insert(peer, handle) {
            previous.abort();
        }
    }
}

async fn peer_info(adapter: &Adapter, shared: &Shared, id: &PeripheralId) -> Option<PeerInfo> {
    let peripheral = adapter.peripheral(id).await.ok()?;
    let properties = peripheral.properties().await.ok()??;
    let address = PeerAddress::Real(properties.address.into_inner());
    lock(&shared.peripherals).insert(address.clone(), peripheral);
    Some(PeerInfo {
        address,
        name: properties.local_name,
        services: properties.services,
        rssi: properties.rssi,
    })
}

#[async_trait]
impl CentralTransport for BtleplugCentral {
    fn events(&self) -> mpsc::UnboundedReceiver<CentralEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.shared.events) = tx;
        rx
    }

    async fn start_scan(&self, service: Uuid) -> Result<(), BleError> {
        self.adapter
            .start_scan(ScanFilter {
                services: vec![service],
            })
            .await
            .map_err(|e| BleError::ScanError(format!("Failed to start BLE scan: {}", e)))
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        self.adapter
            .stop_scan()
            .await
            .map_err(|e| BleError::ScanError(format!("Failed to stop BLE scan: {}", e)))
    }

    async fn connect(&self, peer: &PeerAddress) -> Result<(), BleError> {
        let peripheral = self.peripheral(peer)?;
        match peripheral.connect().await {
            Ok(()) => {
                self.start_notification_pump(peer.clone(), peripheral);
                self.shared.emit(CentralEvent::LinkStateChanged {
                    peer: peer.clone(),
                    state: LinkState::Connected,
                    status: GATT_SUCCESS,
                });
            }
            Err(e) => {
                log::warn!("Failed to connect to {}: {}", peer, e);
                self.shared.emit(CentralEvent::LinkStateChanged {
                    peer: peer.clone(),
                    state: LinkState::Disconnected,
                    status: GATT_ERROR,
                });
            }
        }
        Ok(())
    }

    async fn discover_services(&self, peer: &PeerAddress) -> Result<(), BleError> {
        let peripheral = self.peripheral(peer)?;
        peripheral
            .discover_services()
            .await
            .map_err(|e| BleError::GattError(format!("Failed to discover services: {}", e)))?;

        let services = peripheral
            .services()
            .into_iter()
            .map(|service| GattService {
                uuid: service.uuid,
                characteristics: service
                    .characteristics
                    .into_iter()
                    .map(|c| GattCharacteristic {
                        uuid: c.uuid,
                        descriptors: c.descriptors.into_iter().map(|d| d.uuid).collect(),
                    })
                    .collect(),
            })
            .collect();
        self.shared.emit(CentralEvent::ServicesDiscovered {
            peer: peer.clone(),
            services,
        });
        Ok(())
    }

    async fn set_notify(&self, peer: &PeerAddress, _characteristic: Uuid, _enabled: bool) -> bool {
        // Delivery follows the subscription descriptor, written below.
        lock(&self.shared.peripherals).contains_key(peer)
    }

    async fn write_characteristic(
        &self,
        peer: &PeerAddress,
        characteristic: Uuid,
        value: &[u8],
    ) -> bool {
        let Ok(peripheral) = self.peripheral(peer) else {
            return false;
        };
        let Some(target) = Self::characteristic(&peripheral, characteristic) else {
            return false;
        };
        match peripheral.write(&target, value, WriteType::WithResponse).await {
            Ok(()) => {
                self.shared.emit(CentralEvent::CharacteristicWritten {
                    peer: peer.clone(),
                    characteristic,
                    status: GATT_SUCCESS,
                });
                true
            }
            Err(e) => {
                log::warn!("Write to {} failed: {}", characteristic, e);
                false
            }
        }
    }

    async fn write_descriptor(
        &self,
        peer: &PeerAddress,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> bool {
        let Ok(peripheral) = self.peripheral(peer) else {
            return false;
        };
        let Some(target) = Self::characteristic(&peripheral, characteristic) else {
            return false;
        };
        let Some(requested) = DescriptorValue::from_bytes(value) else {
            return false;
        };
        let result = if requested.is_enabled() {
            peripheral.subscribe(&target).await
        } else {
            peripheral.unsubscribe(&target).await
        };
        let status = match result {
            Ok(()) => GATT_SUCCESS,
            Err(e) => {
                log::warn!("Subscription change on {} failed: {}", characteristic, e);
                GATT_ERROR
            }
        };
        self.shared.emit(CentralEvent::DescriptorWritten {
            peer: peer.clone(),
            characteristic,
            descriptor,
            value: value.to_vec(),
            status,
        });
        true
    }

    async fn disconnect(&self, peer: &PeerAddress) -> Result<(), BleError> {
        let peripheral = self.peripheral(peer)?;
        peripheral
            .disconnect()
            .await
            .map_err(|e| BleError::ConnectionError(format!("Failed to disconnect: {}", e)))?;
        self.shared.emit(CentralEvent::LinkStateChanged {
            peer: peer.clone(),
            state: LinkState::Disconnected,
            status: GATT_SUCCESS,
        });
        Ok(())
    }

    async fn close(&self, peer: &PeerAddress) {
        if let Some(pump) = lock(&self.shared.notification_pumps).remove(peer) {
            pump.abort();
        }
    }
}

impl Drop for BtleplugCentral {
    fn drop(&mut self) {
        self.adapter_events.abort();
        for (_, pump) in lock(&self.shared.notification_pumps).drain() {
            pump.abort();
        }
    }
}
