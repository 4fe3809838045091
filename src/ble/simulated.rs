//! In-process BLE simulator
//!
//! Provides a simulated BLE network where centrals scan, connect, and drive
//! the GATT services of simulated peripherals entirely in-process. Every
//! platform callback is delivered as a [`CentralEvent`] or
//! [`PeripheralEvent`] on the device's event channel, in the order a real
//! stack would report them. Used for integration testing without requiring
//! real BLE hardware.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use super::gatt::{GattService, GattStatus, GATT_ERROR, GATT_SUCCESS, REMOTE_TERMINATED};
use super::transport::{
    Advertisement, AttributeRequest, CentralEvent, CentralTransport, LinkState, PeerAddress,
    PeerInfo, PeripheralEvent, PeripheralTransport,
};
use super::BleError;

const SIMULATED_RSSI: i16 = -50;

struct SimCentralState {
    events: mpsc::UnboundedSender<CentralEvent>,
    scan_filter: Option<Uuid>,
    /// (peripheral, characteristic) pairs with local notification delivery on.
    notifying: HashSet<(PeerAddress, Uuid)>,
    fail_next_connect: Option<i32>,
    reject_next_connect: Option<String>,
}

struct SimPeripheralState {
    events: mpsc::UnboundedSender<PeripheralEvent>,
    advertisement: Option<Advertisement>,
    services: Vec<GattService>,
    report_notification_sent: bool,
}

enum PendingRequest {
    Read {
        central: PeerAddress,
        reply: oneshot::Sender<Result<Vec<u8>, BleError>>,
    },
    Write {
        central: PeerAddress,
        characteristic: Uuid,
        descriptor: Option<Uuid>,
        value: Vec<u8>,
    },
}

#[derive(Default)]
struct NetworkState {
    centrals: HashMap<PeerAddress, SimCentralState>,
    peripherals: HashMap<PeerAddress, SimPeripheralState>,
    /// Established links as (central, peripheral).
    links: HashSet<(PeerAddress, PeerAddress)>,
    pending: HashMap<u32, PendingRequest>,
    next_request_id: u32,
}

impl NetworkState {
    fn emit_central(&self, central: &PeerAddress, event: CentralEvent) {
        if let Some(state) = self.centrals.get(central) {
            let _ = state.events.send(event);
        }
    }

    fn emit_peripheral(&self, peripheral: &PeerAddress, event: PeripheralEvent) {
        if let Some(state) = self.peripherals.get(peripheral) {
            let _ = state.events.send(event);
        }
    }

    fn peer_info(address: &PeerAddress, advertisement: &Advertisement) -> PeerInfo {
        PeerInfo {
            address: address.clone(),
            name: Some(advertisement.local_name.clone()),
            services: advertisement.service_uuids.clone(),
            rssi: Some(SIMULATED_RSSI),
        }
    }

    fn service_of(&self, peripheral: &PeerAddress, characteristic: Uuid) -> Option<Uuid> {
        self.peripherals.get(peripheral).and_then(|p| {
            p.services
                .iter()
                .find(|s| s.characteristic(&characteristic).is_some())
                .map(|s| s.uuid)
        })
    }

    fn allocate_request(&mut self, request: PendingRequest) -> u32 {
        let id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);
        self.pending.insert(id, request);
        id
    }

    /// Tear a link down, reporting it to both ends.
    fn drop_link(&mut self, central: &PeerAddress, peripheral: &PeerAddress, central_status: i32) {
        if !self.links.remove(&(central.clone(), peripheral.clone())) {
            return;
        }
        self.pending.retain(|_, request| match request {
            PendingRequest::Read { central: c, .. } | PendingRequest::Write { central: c, .. } => {
                c != central
            }
        });
        if let Some(state) = self.centrals.get_mut(central) {
            state.notifying.retain(|(p, _)| p != peripheral);
        }
        self.emit_central(
            central,
            CentralEvent::LinkStateChanged {
                peer: peripheral.clone(),
                state: LinkState::Disconnected,
                status: central_status,
            },
        );
        self.emit_peripheral(
            peripheral,
            PeripheralEvent::Disconnected {
                peer: central.clone(),
                status: GATT_SUCCESS,
            },
        );
    }
}

/// The simulated "air" shared by every simulated device.
pub struct SimBleNetwork {
    state: Mutex<NetworkState>,
}

impl SimBleNetwork {
    /// Create a new simulated BLE network.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(NetworkState::default()),
        })
    }

    fn state(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a simulated device acting in the central role.
    pub fn create_central(self: &Arc<Self>) -> SimCentral {
        let address = PeerAddress::Simulated(Uuid::new_v4());
        let (events, _) = mpsc::unbounded_channel();
        self.state().centrals.insert(
            address.clone(),
            SimCentralState {
                events,
                scan_filter: None,
                notifying: HashSet::new(),
                fail_next_connect: None,
                reject_next_connect: None,
            },
        );
        SimCentral {
            address,
            network: Arc::clone(self),
        }
    }

    /// Create a simulated device acting in the peripheral role.
    pub fn create_peripheral(self: &Arc<Self>) -> SimPeripheral {
        let address = PeerAddress::Simulated(Uuid::new_v4());
        let (events, _) = mpsc::unbounded_channel();
        self.state().peripherals.insert(
            address.clone(),
            SimPeripheralState {
                events,
                advertisement: None,
                services: Vec::new(),
                report_notification_sent: true,
            },
        );
        SimPeripheral {
            address,
            network: Arc::clone(self),
        }
    }

    /// Number of established links.
    pub fn link_count(&self) -> usize {
        self.state().links.len()
    }
}

/// A simulated central device.
pub struct SimCentral {
    address: PeerAddress,
    network: Arc<SimBleNetwork>,
}

impl SimCentral {
    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    /// Make the next `connect` fail with a disconnect carrying `status`.
    pub fn fail_next_connect(&self, status: i32) {
        let mut state = self.network.state();
        if let Some(central) = state.centrals.get_mut(&self.address) {
            central.fail_next_connect = Some(status);
        }
    }

    /// Make the next `connect` call itself return an error.
    pub fn reject_next_connect(&self, reason: &str) {
        let mut state = self.network.state();
        if let Some(central) = state.centrals.get_mut(&self.address) {
            central.reject_next_connect = Some(reason.to_string());
        }
    }

    pub fn is_connected_to(&self, peer: &PeerAddress) -> bool {
        self.network
            .state()
            .links
            .contains(&(self.address.clone(), peer.clone()))
    }

    /// Read a characteristic (or one of its descriptors) from a connected
    /// peripheral, waiting for its response.
    pub async fn read_attribute(
        &self,
        peer: &PeerAddress,
        characteristic: Uuid,
        descriptor: Option<Uuid>,
    ) -> Result<Vec<u8>, BleError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut state = self.network.state();
            if !state.links.contains(&(self.address.clone(), peer.clone())) {
                return Err(BleError::Disconnected);
            }
            let service = state
                .service_of(peer, characteristic)
                .ok_or_else(|| BleError::GattError(format!("no characteristic {}", characteristic)))?;
            let request_id = state.allocate_request(PendingRequest::Read {
                central: self.address.clone(),
                reply: reply_tx,
            });
            state.emit_peripheral(
                peer,
                PeripheralEvent::ReadRequest(AttributeRequest {
                    peer: self.address.clone(),
                    request_id,
                    offset: 0,
                    service,
                    characteristic,
                    descriptor,
                }),
            );
        }
        reply_rx.await.map_err(|_| BleError::Disconnected)?
    }

    fn write_attribute(
        &self,
        peer: &PeerAddress,
        characteristic: Uuid,
        descriptor: Option<Uuid>,
        value: &[u8],
    ) -> bool {
        let mut state = self.network.state();
        if !state.links.contains(&(self.address.clone(), peer.clone())) {
            return false;
        }
        let Some(service) = state.service_of(peer, characteristic) else {
            return false;
        };
        let request_id = state.allocate_request(PendingRequest::Write {
            central: self.address.clone(),
            characteristic,
            descriptor,
            value: value.to_vec(),
        });
        state.emit_peripheral(
            peer,
            PeripheralEvent::WriteRequest {
                request: AttributeRequest {
                    peer: self.address.clone(),
                    request_id,
                    offset: 0,
                    service,
                    characteristic,
                    descriptor,
                },
                value: value.to_vec(),
            },
        );
        true
    }
}

#[async_trait]
impl CentralTransport for SimCentral {
    fn events(&self) -> mpsc::UnboundedReceiver<CentralEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(central) = self.network.state().centrals.get_mut(&self.address) {
            central.events = tx;
        }
        rx
    }

    async fn start_scan(&self, service: Uuid) -> Result<(), BleError> {
        let mut state = self.network.state();
        let central = state
            .centrals
            .get_mut(&self.address)
            .ok_or_else(|| BleError::ScanError("central removed from network".into()))?;
        central.scan_filter = Some(service);

        let seen: Vec<PeerInfo> = state
            .peripherals
            .iter()
            .filter_map(|(address, p)| p.advertisement.as_ref().map(|adv| (address, adv)))
            .filter(|(_, adv)| adv.service_uuids.contains(&service))
            .map(|(address, adv)| NetworkState::peer_info(address, adv))
            .collect();
        for info in seen {
            state.emit_central(&self.address, CentralEvent::PeerDiscovered(info));
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        if let Some(central) = self.network.state().centrals.get_mut(&self.address) {
            central.scan_filter = None;
        }
        Ok(())
    }

    async fn connect(&self, peer: &PeerAddress) -> Result<(), BleError> {
        let mut state = self.network.state();
        let rejected = state
            .centrals
            .get_mut(&self.address)
            .and_then(|c| c.reject_next_connect.take());
        if let Some(reason) = rejected {
            return Err(BleError::ConnectionError(reason));
        }
        let failure = state
            .centrals
            .get_mut(&self.address)
            .and_then(|c| c.fail_next_connect.take());
        if let Some(status) = failure {
            state.emit_central(
                &self.address,
                CentralEvent::LinkStateChanged {
                    peer: peer.clone(),
                    state: LinkState::Disconnected,
                    status,
                },
            );
            return Ok(());
        }

        let connectable = state
            .peripherals
            .get(peer)
            .map_or(false, |p| p.advertisement.is_some());
        if !connectable {
            return Err(BleError::ConnectionError(format!(
                "No connectable peripheral at {}",
                peer
            )));
        }

        state.links.insert((self.address.clone(), peer.clone()));
        state.emit_central(
            &self.address,
            CentralEvent::LinkStateChanged {
                peer: peer.clone(),
                state: LinkState::Connected,
                status: GATT_SUCCESS,
            },
        );
        state.emit_peripheral(
            peer,
            PeripheralEvent::Connected {
                peer: self.address.clone(),
            },
        );
        Ok(())
    }

    async fn discover_services(&self, peer: &PeerAddress) -> Result<(), BleError> {
        let state = self.network.state();
        if !state.links.contains(&(self.address.clone(), peer.clone())) {
            return Err(BleError::Disconnected);
        }
        let services = state
            .peripherals
            .get(peer)
            .map(|p| p.services.clone())
            .unwrap_or_default();
        state.emit_central(
            &self.address,
            CentralEvent::ServicesDiscovered {
                peer: peer.clone(),
                services,
            },
        );
        Ok(())
    }

    async fn set_notify(&self, peer: &PeerAddress, characteristic: Uuid, enabled: bool) -> bool {
        let mut state = self.network.state();
        if !state.links.contains(&(self.address.clone(), peer.clone())) {
            return false;
        }
        match state.centrals.get_mut(&self.address) {
            Some(central) => {
                if enabled {
                    central.notifying.insert((peer.clone(), characteristic));
                } else {
                    central.notifying.remove(&(peer.clone(), characteristic));
                }
                true
            }
            None => false,
        }
    }

    async fn write_characteristic(
        &self,
        peer: &PeerAddress,
        characteristic: Uuid,
        value: &[u8],
    ) -> bool {
        self.write_attribute(peer, characteristic, None, value)
    }

    async fn write_descriptor(
        &self,
        peer: &PeerAddress,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> bool {
        self.write_attribute(peer, characteristic, Some(descriptor), value)
    }

    async fn disconnect(&self, peer: &PeerAddress) -> Result<(), BleError> {
        self.network
            .state()
            .drop_link(&self.address, peer, GATT_SUCCESS);
        Ok(())
    }

    async fn close(&self, peer: &PeerAddress) {
        if let Some(central) = self.network.state().centrals.get_mut(&self.address) {
            central.notifying.retain(|(p, _)| p != peer);
        }
    }
}

/// A simulated peripheral device hosting GATT services.
pub struct SimPeripheral {
    address: PeerAddress,
    network: Arc<SimBleNetwork>,
}

impl SimPeripheral {
    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    /// Whether notifications are followed by a `NotificationSent` event.
    /// Some platforms never report it.
    pub fn set_report_notification_sent(&self, report: bool) {
        if let Some(p) = self.network.state().peripherals.get_mut(&self.address) {
            p.report_notification_sent = report;
        }
    }

    pub fn is_advertising(&self) -> bool {
        self.network
            .state()
            .peripherals
            .get(&self.address)
            .map_or(false, |p| p.advertisement.is_some())
    }

    /// Centrals currently linked to this peripheral.
    pub fn connected_centrals(&self) -> Vec<PeerAddress> {
        self.network
            .state()
            .links
            .iter()
            .filter(|(_, p)| p == &self.address)
            .map(|(c, _)| c.clone())
            .collect()
    }
}

#[async_trait]
impl PeripheralTransport for SimPeripheral {
    fn events(&self) -> mpsc::UnboundedReceiver<PeripheralEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(p) = self.network.state().peripherals.get_mut(&self.address) {
            p.events = tx;
        }
        rx
    }

    async fn add_service(&self, service: GattService) -> Result<(), BleError> {
        let mut state = self.network.state();
        let p = state
            .peripherals
            .get_mut(&self.address)
            .ok_or_else(|| BleError::GattError("peripheral removed from network".into()))?;
        p.services.retain(|s| s.uuid != service.uuid);
        p.services.push(service);
        Ok(())
    }

    async fn start_advertising(&self, advertisement: &Advertisement) -> Result<(), BleError> {
        let mut state = self.network.state();
        let p = state
            .peripherals
            .get_mut(&self.address)
            .ok_or_else(|| BleError::AdvertisingError("peripheral removed from network".into()))?;
        p.advertisement = Some(advertisement.clone());

        let info = NetworkState::peer_info(&self.address, advertisement);
        for central in state.centrals.values() {
            if let Some(filter) = central.scan_filter {
                if advertisement.service_uuids.contains(&filter) {
                    let _ = central
                        .events
                        .send(CentralEvent::PeerDiscovered(info.clone()));
                }
            }
        }
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<(), BleError> {
        if let Some(p) = self.network.state().peripherals.get_mut(&self.address) {
            p.advertisement = None;
        }
        Ok(())
    }

    async fn notify_characteristic_changed(
        &self,
        peer: &PeerAddress,
        characteristic: Uuid,
        value: &[u8],
        _confirm: bool,
    ) -> bool {
        let state = self.network.state();
        if !state.links.contains(&(peer.clone(), self.address.clone())) {
            return false;
        }
        let delivered = state
            .centrals
            .get(peer)
            .map_or(false, |c| c.notifying.contains(&(self.address.clone(), characteristic)));
        if delivered {
            state.emit_central(
                peer,
                CentralEvent::CharacteristicChanged {
                    peer: self.address.clone(),
                    characteristic,
                    value: value.to_vec(),
                },
            );
        }
        let report = state
            .peripherals
            .get(&self.address)
            .map_or(false, |p| p.report_notification_sent);
        if report {
            state.emit_peripheral(
                &self.address,
                PeripheralEvent::NotificationSent {
                    peer: peer.clone(),
                    status: GATT_SUCCESS,
                },
            );
        }
        true
    }

    async fn send_response(
        &self,
        peer: &PeerAddress,
        request_id: u32,
        status: GattStatus,
        _offset: usize,
        value: &[u8],
    ) -> Result<(), BleError> {
        let mut state = self.network.state();
        let request = state
            .pending
            .remove(&request_id)
            .ok_or_else(|| BleError::GattError(format!("no pending request {}", request_id)))?;

        match request {
            PendingRequest::Read { central, reply } => {
                if &central != peer {
                    return Err(BleError::GattError(format!(
                        "request {} belongs to {}",
                        request_id, central
                    )));
                }
                let result = match status {
                    GattStatus::Success => Ok(value.to_vec()),
                    GattStatus::Failure => Err(BleError::GattError("read rejected".into())),
                };
                let _ = reply.send(result);
            }
            PendingRequest::Write {
                central,
                characteristic,
                descriptor,
                value: written,
            } => {
                if &central != peer {
                    return Err(BleError::GattError(format!(
                        "request {} belongs to {}",
                        request_id, central
                    )));
                }
                let status = match status {
                    GattStatus::Success => GATT_SUCCESS,
                    GattStatus::Failure => GATT_ERROR,
                };
                let event = match descriptor {
                    Some(descriptor) => CentralEvent::DescriptorWritten {
                        peer: self.address.clone(),
                        characteristic,
                        descriptor,
                        value: written,
                        status,
                    },
                    None => CentralEvent::CharacteristicWritten {
                        peer: self.address.clone(),
                        characteristic,
                        status,
                    },
                };
                state.emit_central(&central, event);
            }
        }
        Ok(())
    }

    async fn cancel_connection(&self, peer: &PeerAddress) -> Result<(), BleError> {
        self.network
            .state()
            .drop_link(peer, &self.address, REMOTE_TERMINATED);
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.network.state();
        let centrals: Vec<PeerAddress> = state
            .links
            .iter()
            .filter(|(_, p)| p == &self.address)
            .map(|(c, _)| c.clone())
            .collect();
        for central in centrals {
            state.drop_link(&central, &self.address, REMOTE_TERMINATED);
        }
        if let Some(p) = state.peripherals.get_mut(&self.address) {
            p.advertisement = None;
            p.services.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::gatt::{DescriptorValue, GattCharacteristic};
    use crate::uuid_util::{from_short, CLIENT_CHARACTERISTIC_CONFIG};

    const SERVICE: Uuid = from_short(0xFFE2);
    const READ: Uuid = from_short(0xFFE3);
    const WRITE: Uuid = from_short(0xFFE4);

    fn advertisement(name: &str) -> Advertisement {
        Advertisement {
            local_name: name.to_string(),
            service_uuids: vec![SERVICE],
        }
    }

    async fn hosting_peripheral(network: &Arc<SimBleNetwork>) -> SimPeripheral {
        let peripheral = network.create_peripheral();
        peripheral
            .add_service(GattService {
                uuid: SERVICE,
                characteristics: vec![
                    GattCharacteristic {
                        uuid: READ,
                        descriptors: vec![CLIENT_CHARACTERISTIC_CONFIG],
                    },
                    GattCharacteristic {
                        uuid: WRITE,
                        descriptors: vec![],
                    },
                ],
            })
            .await
            .unwrap();
        peripheral
    }

    #[tokio::test]
    async fn test_scan_sees_matching_advertisers_only() {
        let network = SimBleNetwork::new();
        let central = network.create_central();
        let mut events = central.events();

        let matching = hosting_peripheral(&network).await;
        matching.start_advertising(&advertisement("match")).await.unwrap();

        let other = network.create_peripheral();
        other
            .start_advertising(&Advertisement {
                local_name: "other".into(),
                service_uuids: vec![from_short(0x180D)],
            })
            .await
            .unwrap();

        central.start_scan(SERVICE).await.unwrap();
        match events.recv().await.unwrap() {
            CentralEvent::PeerDiscovered(info) => {
                assert_eq!(&info.address, matching.address());
                assert_eq!(info.name.as_deref(), Some("match"));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(events.try_recv().is_err());

        // Advertising after the scan started is reported too.
        let late = hosting_peripheral(&network).await;
        late.start_advertising(&advertisement("late")).await.unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            CentralEvent::PeerDiscovered(info) if &info.address == late.address()
        ));
    }

    #[tokio::test]
    async fn test_connect_requires_advertising() {
        let network = SimBleNetwork::new();
        let central = network.create_central();
        let peripheral = hosting_peripheral(&network).await;

        assert!(central.connect(peripheral.address()).await.is_err());

        let mut central_events = central.events();
        let mut peripheral_events = peripheral.events();
        peripheral.start_advertising(&advertisement("p")).await.unwrap();
        central.connect(peripheral.address()).await.unwrap();

        assert_eq!(
            central_events.recv().await.unwrap(),
            CentralEvent::LinkStateChanged {
                peer: peripheral.address().clone(),
                state: LinkState::Connected,
                status: GATT_SUCCESS,
            }
        );
        assert_eq!(
            peripheral_events.recv().await.unwrap(),
            PeripheralEvent::Connected {
                peer: central.address().clone()
            }
        );
        assert_eq!(peripheral.connected_centrals(), vec![central.address().clone()]);
    }

    #[tokio::test]
    async fn test_injected_connect_failure() {
        let network = SimBleNetwork::new();
        let central = network.create_central();
        let peripheral = hosting_peripheral(&network).await;
        peripheral.start_advertising(&advertisement("p")).await.unwrap();
        let mut events = central.events();

        central.fail_next_connect(133);
        central.connect(peripheral.address()).await.unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            CentralEvent::LinkStateChanged {
                peer: peripheral.address().clone(),
                state: LinkState::Disconnected,
                status: 133,
            }
        );
        assert_eq!(network.link_count(), 0);

        // Only the next attempt fails.
        central.connect(peripheral.address()).await.unwrap();
        assert_eq!(network.link_count(), 1);
    }

    #[tokio::test]
    async fn test_rejected_connect_call() {
        let network = SimBleNetwork::new();
        let central = network.create_central();
        let peripheral = hosting_peripheral(&network).await;
        peripheral.start_advertising(&advertisement("p")).await.unwrap();

        central.reject_next_connect("radio busy");
        assert_eq!(
            central.connect(peripheral.address()).await,
            Err(BleError::ConnectionError("radio busy".into()))
        );
        assert_eq!(network.link_count(), 0);

        central.connect(peripheral.address()).await.unwrap();
        assert_eq!(network.link_count(), 1);
    }

    #[tokio::test]
    async fn test_write_is_acknowledged_by_response() {
        let network = SimBleNetwork::new();
        let central = network.create_central();
        let peripheral = hosting_peripheral(&network).await;
        peripheral.start_advertising(&advertisement("p")).await.unwrap();
        let mut central_events = central.events();
        let mut peripheral_events = peripheral.events();

        central.connect(peripheral.address()).await.unwrap();
        central_events.recv().await.unwrap();
        peripheral_events.recv().await.unwrap();

        assert!(central.write_characteristic(peripheral.address(), WRITE, b"chunk").await);
        let (request, value) = match peripheral_events.recv().await.unwrap() {
            PeripheralEvent::WriteRequest { request, value } => (request, value),
            other => panic!("unexpected event {:?}", other),
        };
        assert_eq!(value, b"chunk");
        assert_eq!(request.service, SERVICE);
        assert_eq!(request.descriptor, None);

        peripheral
            .send_response(central.address(), request.request_id, GattStatus::Success, 0, &[])
            .await
            .unwrap();
        assert_eq!(
            central_events.recv().await.unwrap(),
            CentralEvent::CharacteristicWritten {
                peer: peripheral.address().clone(),
                characteristic: WRITE,
                status: GATT_SUCCESS,
            }
        );

        // Each request is answered once.
        assert!(peripheral
            .send_response(central.address(), request.request_id, GattStatus::Success, 0, &[])
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_notifications_need_local_subscription() {
        let network = SimBleNetwork::new();
        let central = network.create_central();
        let peripheral = hosting_peripheral(&network).await;
        peripheral.start_advertising(&advertisement("p")).await.unwrap();
        let mut central_events = central.events();
        let mut peripheral_events = peripheral.events();

        central.connect(peripheral.address()).await.unwrap();
        central_events.recv().await.unwrap();
        peripheral_events.recv().await.unwrap();

        assert!(
            peripheral
                .notify_characteristic_changed(central.address(), READ, b"dropped", false)
                .await
        );
        assert!(matches!(
            peripheral_events.recv().await.unwrap(),
            PeripheralEvent::NotificationSent { .. }
        ));
        assert!(central_events.try_recv().is_err());

        assert!(central.set_notify(peripheral.address(), READ, true).await);
        peripheral.set_report_notification_sent(false);
        peripheral
            .notify_characteristic_changed(central.address(), READ, b"seen", false)
            .await;
        assert_eq!(
            central_events.recv().await.unwrap(),
            CentralEvent::CharacteristicChanged {
                peer: peripheral.address().clone(),
                characteristic: READ,
                value: b"seen".to_vec(),
            }
        );
        assert!(peripheral_events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_descriptor_read_and_write() {
        let network = SimBleNetwork::new();
        let central = network.create_central();
        let peripheral = hosting_peripheral(&network).await;
        peripheral.start_advertising(&advertisement("p")).await.unwrap();
        let mut peripheral_events = peripheral.events();
        central.connect(peripheral.address()).await.unwrap();
        peripheral_events.recv().await.unwrap();

        let enable = DescriptorValue::EnableNotification.as_bytes();
        assert!(
            central
                .write_descriptor(peripheral.address(), READ, CLIENT_CHARACTERISTIC_CONFIG, &enable)
                .await
        );
        match peripheral_events.recv().await.unwrap() {
            PeripheralEvent::WriteRequest { request, value } => {
                assert_eq!(request.descriptor, Some(CLIENT_CHARACTERISTIC_CONFIG));
                assert_eq!(value, enable);
            }
            other => panic!("unexpected event {:?}", other),
        }

        let peer = peripheral.address().clone();
        let reader = tokio::spawn(async move {
            central
                .read_attribute(&peer, READ, Some(CLIENT_CHARACTERISTIC_CONFIG))
                .await
        });
        let request = match peripheral_events.recv().await.unwrap() {
            PeripheralEvent::ReadRequest(request) => request,
            other => panic!("unexpected event {:?}", other),
        };
        peripheral
            .send_response(&request.peer, request.request_id, GattStatus::Success, 0, &enable)
            .await
            .unwrap();
        assert_eq!(reader.await.unwrap().unwrap(), enable.to_vec());
    }

    #[tokio::test]
    async fn test_disconnect_reported_to_both_ends() {
        let network = SimBleNetwork::new();
        let central = network.create_central();
        let peripheral = hosting_peripheral(&network).await;
        peripheral.start_advertising(&advertisement("p")).await.unwrap();
        let mut central_events = central.events();
        let mut peripheral_events = peripheral.events();

        central.connect(peripheral.address()).await.unwrap();
        central_events.recv().await.unwrap();
        peripheral_events.recv().await.unwrap();

        peripheral.cancel_connection(central.address()).await.unwrap();
        assert_eq!(
            central_events.recv().await.unwrap(),
            CentralEvent::LinkStateChanged {
                peer: peripheral.address().clone(),
                state: LinkState::Disconnected,
                status: REMOTE_TERMINATED,
            }
        );
        assert!(matches!(
            peripheral_events.recv().await.unwrap(),
            PeripheralEvent::Disconnected { .. }
        ));
        assert!(!central.is_connected_to(peripheral.address()));
        assert!(!central.write_characteristic(peripheral.address(), WRITE, b"x").await);

        // A second disconnect has nothing left to report.
        central.disconnect(peripheral.address()).await.unwrap();
        assert!(central_events.try_recv().is_err());
    }
}
