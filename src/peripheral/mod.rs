//! Peripheral role: advertise the RPC service and accept centrals
//!
//! [`PeripheralRegistry`] hosts the GATT service, keeps one entry per
//! connected central (its reader/writer pair and subscription state) and
//! hands accepted links out through [`PeripheralRegistry::create_connection`].
//! Advertising runs only while no central is connected.

pub mod connection;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::ble::gatt::{DescriptorValue, GattCharacteristic, GattService, GattStatus, GATT_SUCCESS};
use crate::ble::transport::{
    Advertisement, AttributeRequest, PeerAddress, PeripheralEvent, PeripheralTransport,
};
use crate::ble::BleError;
use crate::config::PeripheralConfig;
use crate::stream::RetryPolicy;
use crate::uuid_util::CLIENT_CHARACTERISTIC_CONFIG;

pub use connection::PeripheralConnection;

/// One connected central.
struct PeerLink {
    connection: Arc<PeripheralConnection>,
    subscription: DescriptorValue,
    forced_disconnect: Option<JoinHandle<()>>,
}

impl PeerLink {
    fn new(connection: Arc<PeripheralConnection>) -> Self {
        Self {
            connection,
            subscription: DescriptorValue::Disable,
            forced_disconnect: None,
        }
    }

    fn cancel_forced_disconnect(&mut self) {
        if let Some(timer) = self.forced_disconnect.take() {
            timer.abort();
        }
    }

    fn release(mut self) {
        self.cancel_forced_disconnect();
        self.connection.notify_disconnected();
    }
}

/// Attribute answered from a fixed value, keyed by service, characteristic
/// and optional descriptor.
type StaticKey = (Uuid, Uuid, Option<Uuid>);

#[derive(Default)]
struct RegistryState {
    links: HashMap<PeerAddress, PeerLink>,
    /// Accepted link not yet handed out. A newer link replaces it.
    pending: Option<Arc<PeripheralConnection>>,
    static_attributes: HashMap<StaticKey, Vec<u8>>,
    advertising: bool,
    shut_down: bool,
}

pub struct PeripheralRegistry {
    config: PeripheralConfig,
    transport: Arc<dyn PeripheralTransport>,
    state: Mutex<RegistryState>,
    changed: Notify,
    /// Serializes advertising start/stop against each other.
    advertising_guard: tokio::sync::Mutex<()>,
    shutdown_tx: broadcast::Sender<()>,
}

async fn respond(
    transport: &dyn PeripheralTransport,
    request: &AttributeRequest,
    status: GattStatus,
    value: &[u8],
) {
    if let Err(e) = transport
        .send_response(&request.peer, request.request_id, status, request.offset, value)
        .await
    {
        log::warn!("Failed to answer request {} of {}: {}", request.request_id, request.peer, e);
    }
}

impl PeripheralRegistry {
    /// Publish the RPC service, start advertising and begin accepting
    /// centrals.
    pub async fn start(
        config: PeripheralConfig,
        transport: Arc<dyn PeripheralTransport>,
    ) -> Result<Arc<Self>, BleError> {
        config.validate()?;
        let events = transport.events();
        let (shutdown_tx, _) = broadcast::channel(1);
        let registry = Arc::new(Self {
            config,
            transport,
            state: Mutex::new(RegistryState::default()),
            changed: Notify::new(),
            advertising_guard: tokio::sync::Mutex::new(()),
            shutdown_tx,
        });
        registry.start_dispatch(events);

        registry.transport.add_service(registry.service()).await?;
        registry.sync_advertising().await?;
        log::info!(
            "Peripheral registry started: service {}, name {:?}",
            registry.config.service_uuid,
            registry.config.advertised_name
        );
        Ok(registry)
    }

    fn start_dispatch(self: &Arc<Self>, mut events: mpsc::UnboundedReceiver<PeripheralEvent>) {
        let registry = Arc::downgrade(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => {
                        let Some(event) = event else { break };
                        let Some(registry) = registry.upgrade() else { break };
                        if let Err(e) = registry.handle(event) {
                            log::error!("{}", e);
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
            log::debug!("Peripheral event dispatcher stopped");
        });
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn service(&self) -> GattService {
        GattService {
            uuid: self.config.service_uuid,
            characteristics: vec![
                GattCharacteristic {
                    uuid: self.config.read_characteristic_uuid,
                    descriptors: vec![CLIENT_CHARACTERISTIC_CONFIG],
                },
                GattCharacteristic {
                    uuid: self.config.write_characteristic_uuid,
                    descriptors: Vec::new(),
                },
            ],
        }
    }

    fn advertisement(&self) -> Advertisement {
        Advertisement {
            local_name: self.config.advertised_name.clone(),
            service_uuids: vec![self.config.service_uuid],
        }
    }

    pub fn config(&self) -> &PeripheralConfig {
        &self.config
    }

    pub fn is_advertising(&self) -> bool {
        self.state().advertising
    }

    pub fn connected_peers(&self) -> Vec<PeerAddress> {
        self.state().links.keys().cloned().collect()
    }

    /// Last subscription value a connected peer wrote.
    pub fn subscription(&self, peer: &PeerAddress) -> Option<DescriptorValue> {
        self.state().links.get(peer).map(|link| link.subscription)
    }

    pub fn is_subscribed(&self, peer: &PeerAddress) -> bool {
        self.subscription(peer).map_or(false, |s| s.is_enabled())
    }

    pub fn has_pending_connection(&self) -> bool {
        self.state().pending.is_some()
    }

    /// Advertise exactly while no central is connected.
    async fn sync_advertising(&self) -> Result<(), BleError> {
        let _guard = self.advertising_guard.lock().await;
        let (wanted, current) = {
            let state = self.state();
            (!state.shut_down && state.links.is_empty(), state.advertising)
        };
        if wanted == current {
            return Ok(());
        }
        if wanted {
            self.transport.start_advertising(&self.advertisement()).await?;
            log::info!("Advertising {:?}", self.config.advertised_name);
        } else {
            self.transport.stop_advertising().await?;
            log::info!("Advertising stopped");
        }
        self.state().advertising = wanted;
        Ok(())
    }

    fn spawn_sync_advertising(self: &Arc<Self>) {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = registry.sync_advertising().await {
                log::warn!("Failed to update advertising: {}", e);
            }
        });
    }

    fn spawn_response(&self, request: AttributeRequest, status: GattStatus, value: Vec<u8>) {
        let transport = Arc::clone(&self.transport);
        tokio::spawn(async move {
            respond(&*transport, &request, status, &value).await;
        });
    }

    /// Apply one transport event to the registry.
    ///
    /// Requests from a central with no registered link are answered with a
    /// failure and reported as [`BleError::InternalInvariantViolation`].
    pub fn handle(self: &Arc<Self>, event: PeripheralEvent) -> Result<(), BleError> {
        match event {
            PeripheralEvent::Connected { peer } => {
                self.on_connected(peer);
                Ok(())
            }
            PeripheralEvent::Disconnected { peer, status } => {
                self.on_disconnected(&peer, status);
                Ok(())
            }
            PeripheralEvent::ReadRequest(request) => self.on_read_request(request),
            PeripheralEvent::WriteRequest { request, value } => {
                self.on_write_request(request, value)
            }
            PeripheralEvent::NotificationSent { peer, status } => {
                self.on_notification_sent(&peer, status);
                Ok(())
            }
        }
    }

    fn on_connected(self: &Arc<Self>, peer: PeerAddress) {
        let connection = Arc::new(PeripheralConnection::new(
            peer.clone(),
            Arc::downgrade(self),
            Arc::clone(&self.transport),
            self.config.framing(),
            self.config.read_timeout(),
        ));

        let mut state = self.state();
        if state.shut_down {
            drop(state);
            log::debug!("Refusing {} after shutdown", peer);
            let transport = Arc::clone(&self.transport);
            tokio::spawn(async move {
                let _ = transport.cancel_connection(&peer).await;
            });
            return;
        }
        if let Some(previous) = state
            .links
            .insert(peer.clone(), PeerLink::new(Arc::clone(&connection)))
        {
            previous.release();
        }
        if state.pending.replace(connection).is_some() {
            log::warn!("Unconsumed inbound connection replaced by {}", peer);
        }
        drop(state);

        log::info!("Central {} connected", peer);
        self.changed.notify_waiters();
        self.spawn_sync_advertising();
    }

    fn on_disconnected(self: &Arc<Self>, peer: &PeerAddress, status: i32) {
        let mut state = self.state();
        let Some(link) = state.links.remove(peer) else {
            log::debug!("Disconnect of unregistered central {}", peer);
            return;
        };
        let was_pending = state
            .pending
            .as_ref()
            .map_or(false, |p| Arc::ptr_eq(p, &link.connection));
        if was_pending {
            state.pending = None;
        }
        drop(state);

        link.release();
        log::info!("Central {} disconnected (status {})", peer, status);
        self.spawn_sync_advertising();
    }

    fn registered_connection(
        &self,
        request: &AttributeRequest,
    ) -> Result<Arc<PeripheralConnection>, BleError> {
        let connection = self
            .state()
            .links
            .get(&request.peer)
            .map(|link| Arc::clone(&link.connection));
        connection.ok_or_else(|| {
            self.spawn_response(request.clone(), GattStatus::Failure, Vec::new());
            BleError::InternalInvariantViolation(format!(
                "request {} for {} from unregistered central {}",
                request.request_id, request.characteristic, request.peer
            ))
        })
    }

    fn on_read_request(&self, request: AttributeRequest) -> Result<(), BleError> {
        let connection = self.registered_connection(&request)?;
        if request.service != self.config.service_uuid {
            self.answer_static(request);
            return Ok(());
        }
        if request.characteristic != self.config.read_characteristic_uuid {
            log::warn!("Read of unsupported characteristic {}", request.characteristic);
            self.spawn_response(request, GattStatus::Failure, Vec::new());
            return Ok(());
        }

        match request.descriptor {
            None => {
                // A read fetches the staged chunk and counts as its delivery.
                let writer = Arc::clone(connection.stream().writer());
                let chunk = writer.current_chunk().unwrap_or_default();
                let sequence = writer.in_flight_sequence(&chunk);
                let transport = Arc::clone(&self.transport);
                tokio::spawn(async move {
                    respond(&*transport, &request, GattStatus::Success, &chunk).await;
                    if let Some(sequence) = sequence {
                        writer.notify_chunk_written(sequence);
                    }
                });
            }
            Some(descriptor) if descriptor == CLIENT_CHARACTERISTIC_CONFIG => {
                let value = self
                    .subscription(&request.peer)
                    .unwrap_or(DescriptorValue::Disable);
                self.spawn_response(request, GattStatus::Success, value.as_bytes().to_vec());
            }
            Some(descriptor) => {
                log::warn!("Read of unsupported descriptor {}", descriptor);
                self.spawn_response(request, GattStatus::Failure, Vec::new());
            }
        }
        Ok(())
    }

    fn on_write_request(
        self: &Arc<Self>,
        request: AttributeRequest,
        value: Vec<u8>,
    ) -> Result<(), BleError> {
        let connection = self.registered_connection(&request)?;
        if request.service != self.config.service_uuid {
            log::warn!("Write to read-only service {}", request.service);
            self.spawn_response(request, GattStatus::Failure, Vec::new());
            return Ok(());
        }

        match request.descriptor {
            None if request.characteristic == self.config.write_characteristic_uuid => {
                log::debug!("Received chunk: {} bytes from {}", value.len(), request.peer);
                connection.stream().reader().feed(&value);
                self.spawn_response(request, GattStatus::Success, Vec::new());
                Ok(())
            }
            Some(descriptor)
                if request.characteristic == self.config.read_characteristic_uuid
                    && descriptor == CLIENT_CHARACTERISTIC_CONFIG =>
            {
                self.on_subscription_write(request, value)
            }
            _ => {
                log::warn!(
                    "Write to unsupported attribute {} {:?}",
                    request.characteristic,
                    request.descriptor
                );
                self.spawn_response(request, GattStatus::Failure, Vec::new());
                Ok(())
            }
        }
    }

    fn on_subscription_write(
        self: &Arc<Self>,
        request: AttributeRequest,
        value: Vec<u8>,
    ) -> Result<(), BleError> {
        let Some(requested) = DescriptorValue::from_bytes(&value) else {
            log::warn!("Invalid subscription value {:02X?} from {}", value, request.peer);
            self.spawn_response(request, GattStatus::Failure, Vec::new());
            return Ok(());
        };

        {
            let mut state = self.state();
            let Some(link) = state.links.get_mut(&request.peer) else {
                return Err(BleError::InternalInvariantViolation(format!(
                    "central {} vanished during its subscription write",
                    request.peer
                )));
            };
            link.subscription = requested;
            link.cancel_forced_disconnect();
            if !requested.is_enabled() && self.config.disconnect_unsubscribed {
                link.forced_disconnect = Some(self.spawn_forced_disconnect(request.peer.clone()));
            }
        }

        match requested {
            DescriptorValue::EnableNotification => {
                log::info!("Central {} subscribed to notifications", request.peer)
            }
            DescriptorValue::EnableIndication => {
                log::info!("Central {} subscribed to indications", request.peer)
            }
            DescriptorValue::Disable => log::info!("Central {} unsubscribed", request.peer),
        }
        self.spawn_response(request, GattStatus::Success, value);
        Ok(())
    }

    /// Force `peer` off the link unless it resubscribes or leaves within
    /// the grace interval.
    fn spawn_forced_disconnect(self: &Arc<Self>, peer: PeerAddress) -> JoinHandle<()> {
        let registry = Arc::downgrade(self);
        let grace = self.config.unsubscribed_grace();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let Some(registry) = registry.upgrade() else {
                return;
            };
            let unsubscribed = registry
                .subscription(&peer)
                .map_or(false, |s| !s.is_enabled());
            if unsubscribed {
                log::info!(
                    "Disconnecting {}: unsubscribed for {} ms",
                    peer,
                    grace.as_millis()
                );
                if let Err(e) = registry.transport.cancel_connection(&peer).await {
                    log::warn!("Failed to disconnect {}: {}", peer, e);
                }
            }
        })
    }

    fn answer_static(&self, request: AttributeRequest) {
        let key = (request.service, request.characteristic, request.descriptor);
        let value = self.state().static_attributes.get(&key).cloned();
        match value {
            Some(value) => {
                let value = value.get(request.offset..).unwrap_or_default().to_vec();
                self.spawn_response(request, GattStatus::Success, value);
            }
            None => {
                log::warn!(
                    "No static value for {} {:?} in service {}",
                    request.characteristic,
                    request.descriptor,
                    request.service
                );
                self.spawn_response(request, GattStatus::Failure, Vec::new());
            }
        }
    }

    fn on_notification_sent(&self, peer: &PeerAddress, status: i32) {
        if self.config.synthetic_ack_delay().is_some() {
            return;
        }
        if status != GATT_SUCCESS {
            log::warn!("Notification to {} failed with status {}", peer, status);
            return;
        }
        let writer = self
            .state()
            .links
            .get(peer)
            .map(|link| Arc::clone(link.connection.stream().writer()));
        match writer {
            Some(writer) => writer.notify_written(),
            None => log::debug!("Notification confirmed for unregistered central {}", peer),
        }
    }

    /// Register a fixed value answered for reads of an attribute outside
    /// the RPC service, and publish its service.
    pub async fn add_static_attribute(
        &self,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Option<Uuid>,
        value: Vec<u8>,
    ) -> Result<(), BleError> {
        if service == self.config.service_uuid {
            return Err(BleError::Config(format!(
                "static attributes cannot live in the RPC service {}",
                service
            )));
        }
        let gatt = {
            let mut state = self.state();
            state
                .static_attributes
                .insert((service, characteristic, descriptor), value);

            let mut characteristics: BTreeMap<Uuid, Vec<Uuid>> = BTreeMap::new();
            for (s, c, d) in state.static_attributes.keys() {
                if *s != service {
                    continue;
                }
                let descriptors = characteristics.entry(*c).or_default();
                if let Some(d) = d {
                    descriptors.push(*d);
                }
            }
            GattService {
                uuid: service,
                characteristics: characteristics
                    .into_iter()
                    .map(|(uuid, descriptors)| GattCharacteristic { uuid, descriptors })
                    .collect(),
            }
        };
        self.transport.add_service(gatt).await
    }

    /// Push one value to a subscribed central, retrying rejected attempts.
    pub(crate) async fn notify_peer(&self, peer: &PeerAddress, value: &[u8]) -> bool {
        if !self.is_subscribed(peer) {
            log::warn!("Central {} is not subscribed, dropping {} bytes", peer, value.len());
            return false;
        }
        let retry = RetryPolicy::default();
        for attempt in 1..=retry.attempts {
            if self
                .transport
                .notify_characteristic_changed(
                    peer,
                    self.config.read_characteristic_uuid,
                    value,
                    false,
                )
                .await
            {
                log::debug!("Notified {} bytes to {}", value.len(), peer);
                self.schedule_synthetic_ack(peer, value);
                return true;
            }
            log::warn!(
                "Notification to {} rejected (attempt {}/{})",
                peer,
                attempt,
                retry.attempts
            );
            if attempt < retry.attempts {
                tokio::time::sleep(retry.backoff).await;
            }
        }
        false
    }

    fn schedule_synthetic_ack(&self, peer: &PeerAddress, value: &[u8]) {
        let Some(delay) = self.config.synthetic_ack_delay() else {
            return;
        };
        let writer = self
            .state()
            .links
            .get(peer)
            .map(|link| Arc::clone(link.connection.stream().writer()));
        let Some(writer) = writer else { return };
        let Some(sequence) = writer.in_flight_sequence(value) else {
            return;
        };
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            writer.notify_chunk_written(sequence);
        });
    }

    /// Notify `value` to every subscribed central. True only if each of
    /// them accepted it.
    pub async fn notify_outbound_change(&self, value: &[u8]) -> bool {
        let subscribed: Vec<PeerAddress> = self
            .state()
            .links
            .iter()
            .filter(|(_, link)| link.subscription.is_enabled())
            .map(|(peer, _)| peer.clone())
            .collect();

        let mut delivered = true;
        for peer in &subscribed {
            if !self.notify_peer(peer, value).await {
                log::warn!("Failed to notify {}", peer);
                delivered = false;
            }
        }
        delivered
    }

    /// Wait for the next inbound central.
    pub async fn create_connection(&self) -> Result<Arc<PeripheralConnection>, BleError> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state();
                if let Some(connection) = state.pending.take() {
                    log::info!("Accepted connection from {}", connection.peer());
                    return Ok(connection);
                }
                if state.shut_down {
                    return Err(BleError::Closed);
                }
            }
            notified.await;
        }
    }

    /// Drop every central, stop advertising and release the GATT server.
    /// Idempotent.
    pub async fn shutdown(&self) {
        let links = {
            let mut state = self.state();
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            state.pending = None;
            std::mem::take(&mut state.links)
        };
        self.changed.notify_waiters();
        let _ = self.shutdown_tx.send(());

        for (peer, link) in links {
            link.release();
            if let Err(e) = self.transport.cancel_connection(&peer).await {
                log::warn!("Failed to disconnect {}: {}", peer, e);
            }
        }
        if let Err(e) = self.sync_advertising().await {
            log::warn!("Failed to stop advertising: {}", e);
        }
        self.transport.close().await;
        log::info!("Peripheral registry shut down");
    }
}

impl Drop for PeripheralRegistry {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}
