//! Central role: discover a peripheral, connect, subscribe
//!
//! [`CentralConnector`] drives one connection attempt at a time through
//! discovery, link establishment, service resolution and the notification
//! subscription handshake, all bounded by one discovery deadline. Transport
//! events are consumed by a dispatcher task that feeds them to
//! [`CentralConnector::handle`].

pub mod connection;

#[cfg(feature = "ble-central")]
pub mod btleplug;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{broadcast, mpsc, Notify};
use tokio::time::{timeout_at, Instant};
use uuid::Uuid;

use crate::ble::gatt::{is_fatal_status, DescriptorValue, GattService};
use crate::ble::transport::{CentralEvent, CentralTransport, LinkState, PeerAddress, PeerInfo};
use crate::ble::BleError;
use crate::config::CentralConfig;
use crate::connection::Connection;

pub use connection::CentralConnection;

/// Where the connector is in its connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CentralState {
    #[default]
    Idle,
    Discovering,
    DeviceMatched,
    LinkConnecting,
    ServiceResolving,
    Subscribing,
    Ready,
    DiscoveryTimedOut,
    CharacteristicsMissing,
    FatalLinkError(i32),
    SubscribeFailed,
}

impl CentralState {
    /// Between the first match and `Ready`.
    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            Self::DeviceMatched | Self::LinkConnecting | Self::ServiceResolving | Self::Subscribing
        )
    }
}

/// Which advertisements a discovery attempt accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryFilter {
    pub service: Uuid,
    pub address: Option<String>,
    pub name: Option<String>,
}

impl DiscoveryFilter {
    pub fn from_config(config: &CentralConfig) -> Self {
        Self {
            service: config.service_uuid,
            address: config.target_address.clone(),
            name: config.target_name.clone(),
        }
    }

    pub fn matches(&self, peer: &PeerInfo) -> bool {
        // Not every platform filters scan results by service.
        if !peer.services.contains(&self.service) {
            return false;
        }
        if let Some(address) = &self.address {
            if !peer.address.matches(address) {
                return false;
            }
        }
        if let Some(name) = &self.name {
            if peer.name.as_deref() != Some(name.as_str()) {
                return false;
            }
        }
        true
    }
}

/// What [`CentralConnector::handle`] did with an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handled {
    Ignored,
    /// Recorded by a running [`CentralConnector::discover`].
    PeerListed(PeerAddress),
    PeerMatched(PeerAddress),
    LinkUp,
    LinkLost { fatal: bool },
    ServicesResolved,
    Subscription(DescriptorValue),
    Data,
    Acked,
}

#[derive(Default)]
struct ConnectorState {
    phase: CentralState,
    matched: Option<PeerInfo>,
    /// Peer a platform connect was issued to in the current attempt.
    connecting_to: Option<PeerAddress>,
    services: Option<Vec<GattService>>,
    fault: Option<BleError>,
    connection: Option<Arc<CentralConnection>>,
    /// Peers collected by `discover()` while it runs.
    listed: Option<Vec<PeerInfo>>,
}

pub struct CentralConnector {
    config: CentralConfig,
    filter: DiscoveryFilter,
    transport: Arc<dyn CentralTransport>,
    state: Mutex<ConnectorState>,
    changed: Notify,
    shutdown_tx: broadcast::Sender<()>,
}

impl CentralConnector {
    /// Create a connector and start dispatching the transport's events.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(
        config: CentralConfig,
        transport: Arc<dyn CentralTransport>,
    ) -> Result<Arc<Self>, BleError> {
        config.validate()?;
        let events = transport.events();
        let (shutdown_tx, _) = broadcast::channel(1);
        let connector = Arc::new(Self {
            filter: DiscoveryFilter::from_config(&config),
            config,
            transport,
            state: Mutex::new(ConnectorState::default()),
            changed: Notify::new(),
            shutdown_tx,
        });
        connector.start_dispatch(events);
        Ok(connector)
    }

    fn start_dispatch(self: &Arc<Self>, mut events: mpsc::UnboundedReceiver<CentralEvent>) {
        let connector = Arc::downgrade(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => {
                        let Some(event) = event else { break };
                        let Some(connector) = connector.upgrade() else { break };
                        connector.handle(event);
                    }
                    _ = shutdown.recv() => break,
                }
            }
            log::debug!("Central event dispatcher stopped");
        });
    }

    /// Stop dispatching transport events.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }

    fn state(&self) -> MutexGuard<'_, ConnectorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &CentralConfig {
        &self.config
    }

    pub fn filter(&self) -> &DiscoveryFilter {
        &self.filter
    }

    pub fn phase(&self) -> CentralState {
        self.state().phase
    }

    /// The peer accepted by the current attempt, if any.
    pub fn matched_peer(&self) -> Option<PeerInfo> {
        self.state().matched.clone()
    }

    /// Apply one transport event to the connector.
    pub fn handle(&self, event: CentralEvent) -> Handled {
        match event {
            CentralEvent::PeerDiscovered(info) => self.on_peer_discovered(info),
            CentralEvent::LinkStateChanged {
                peer,
                state: LinkState::Connected,
                ..
            } => self.on_link_up(&peer),
            CentralEvent::LinkStateChanged {
                peer,
                state: LinkState::Disconnected,
                status,
            } => self.on_link_lost(&peer, status),
            CentralEvent::ServicesDiscovered { peer, services } => {
                self.on_services_discovered(&peer, services)
            }
            CentralEvent::CharacteristicChanged {
                peer,
                characteristic,
                value,
            } => match self.connection_for(&peer) {
                Some(c) if c.on_characteristic_changed(characteristic, &value) => Handled::Data,
                _ => {
                    log::debug!("Dropping {} bytes from {}: no active link", value.len(), peer);
                    Handled::Ignored
                }
            },
            CentralEvent::CharacteristicWritten {
                peer,
                characteristic,
                status,
            } => match self.connection_for(&peer) {
                Some(c) if c.on_characteristic_written(characteristic, status) => Handled::Acked,
                _ => Handled::Ignored,
            },
            CentralEvent::DescriptorWritten {
                peer,
                characteristic,
                descriptor,
                value,
                status,
            } => self
                .connection_for(&peer)
                .and_then(|c| c.on_descriptor_written(characteristic, descriptor, &value, status))
                .map_or(Handled::Ignored, Handled::Subscription),
        }
    }

    fn connection_for(&self, peer: &PeerAddress) -> Option<Arc<CentralConnection>> {
        self.state()
            .connection
            .as_ref()
            .filter(|c| c.peer() == peer)
            .cloned()
    }

    fn on_peer_discovered(&self, info: PeerInfo) -> Handled {
        let mut state = self.state();
        if let Some(listed) = state.listed.as_mut() {
            if self.filter.matches(&info) && !listed.iter().any(|p| p.address == info.address) {
                log::info!("Discovered peer {} ({:?})", info.address, info.name);
                let address = info.address.clone();
                listed.push(info);
                return Handled::PeerListed(address);
            }
            return Handled::Ignored;
        }

        if state.phase != CentralState::Discovering {
            log::debug!("Already discovered, skipping peer {}", info.address);
            return Handled::Ignored;
        }
        if !self.filter.matches(&info) {
            log::debug!("Peer {} ({:?}) does not match the filter", info.address, info.name);
            return Handled::Ignored;
        }

        log::info!("Found and accepted peer {} ({:?})", info.address, info.name);
        let address = info.address.clone();
        state.matched = Some(info);
        state.phase = CentralState::DeviceMatched;
        drop(state);
        self.changed.notify_waiters();
        Handled::PeerMatched(address)
    }

    fn on_link_up(&self, peer: &PeerAddress) -> Handled {
        let mut state = self.state();
        if state.phase != CentralState::LinkConnecting || state.connecting_to.as_ref() != Some(peer)
        {
            log::debug!("Ignoring link up for {}", peer);
            return Handled::Ignored;
        }
        log::info!("Connected to {}, discovering services", peer);
        state.phase = CentralState::ServiceResolving;
        drop(state);
        self.changed.notify_waiters();
        Handled::LinkUp
    }

    fn on_link_lost(&self, peer: &PeerAddress, status: i32) -> Handled {
        let mut state = self.state();
        let connection = state
            .connection
            .as_ref()
            .filter(|c| c.peer() == peer)
            .cloned();
        if let Some(connection) = &connection {
            connection.notify_disconnected();
        }

        if state.phase == CentralState::Ready {
            if connection.is_some() {
                log::info!("Disconnected from {} (status {})", peer, status);
                state.connection = None;
                state.matched = None;
                state.connecting_to = None;
                state.phase = CentralState::Idle;
                drop(state);
                self.changed.notify_waiters();
                return Handled::LinkLost { fatal: false };
            }
            return Handled::Ignored;
        }

        let ours = state.matched.as_ref().map_or(false, |m| &m.address == peer);
        if !state.phase.is_connecting() || !ours {
            log::debug!("Ignoring disconnect of {} (status {})", peer, status);
            return Handled::Ignored;
        }

        let fatal = is_fatal_status(status);
        if fatal {
            log::error!("Fatal BLE connect error, status {}", status);
            state.phase = CentralState::FatalLinkError(status);
            state.fault = Some(BleError::FatalLinkError { status });
        } else {
            log::warn!("Link to {} dropped while connecting (status {})", peer, status);
            state.matched = None;
            state.connecting_to = None;
            state.services = None;
            state.connection = None;
            state.phase = CentralState::Discovering;
        }
        drop(state);
        self.changed.notify_waiters();
        Handled::LinkLost { fatal }
    }

    fn on_services_discovered(&self, peer: &PeerAddress, services: Vec<GattService>) -> Handled {
        let mut state = self.state();
        if state.phase != CentralState::ServiceResolving
            || state.connecting_to.as_ref() != Some(peer)
        {
            return Handled::Ignored;
        }
        log::debug!("{} services discovered on {}", services.len(), peer);
        state.services = Some(services);
        drop(state);
        self.changed.notify_waiters();
        Handled::ServicesResolved
    }

    /// Move from `from` to `to`; false if the attempt moved elsewhere.
    fn advance(&self, from: CentralState, to: CentralState) -> bool {
        let mut state = self.state();
        if state.phase != from {
            return false;
        }
        state.phase = to;
        true
    }

    fn begin_attempt(&self) {
        let mut state = self.state();
        state.phase = CentralState::Discovering;
        state.matched = None;
        state.connecting_to = None;
        state.services = None;
        state.fault = None;
        state.connection = None;
    }

    async fn wait_for<T>(&self, mut check: impl FnMut(&mut ConnectorState) -> Option<T>) -> T {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let ready = {
                let mut state = self.state();
                check(&mut *state)
            };
            if let Some(value) = ready {
                return value;
            }
            notified.await;
        }
    }

    fn cached_connection(&self) -> Option<Arc<CentralConnection>> {
        let state = self.state();
        if state.phase != CentralState::Ready {
            return None;
        }
        state.connection.as_ref().filter(|c| !c.is_closed()).cloned()
    }

    /// Connect to the first peer matching the filter.
    ///
    /// Returns the existing connection while it is up. The whole sequence
    /// is bounded by the discovery timeout.
    pub async fn create_connection(&self) -> Result<Arc<CentralConnection>, BleError> {
        if let Some(connection) = self.cached_connection() {
            log::debug!("Reusing connection to {}", connection.peer());
            return Ok(connection);
        }
        if self.phase().is_connecting() || self.phase() == CentralState::Discovering {
            return Err(BleError::ConnectionError(
                "a connection attempt is already running".into(),
            ));
        }

        let timeout = self.config.discovery_timeout();
        let started = Instant::now();
        let deadline = started + timeout;
        self.begin_attempt();

        log::info!("Start discovery for service {}", self.filter.service);
        if let Err(e) = self.transport.start_scan(self.filter.service).await {
            self.state().phase = CentralState::Idle;
            return Err(e);
        }

        match timeout_at(deadline, self.establish()).await {
            Ok(Ok(connection)) => {
                log::info!(
                    "Created connection to {} in {} ms",
                    connection.peer(),
                    started.elapsed().as_millis()
                );
                Ok(connection)
            }
            Ok(Err(e)) => {
                log::error!(
                    "Connection not created in {} ms: {}",
                    started.elapsed().as_millis(),
                    e
                );
                self.release_attempt().await;
                Err(e)
            }
            Err(_) => {
                log::warn!("Discovery timeout exceeded ({} ms)", timeout.as_millis());
                self.state().phase = CentralState::DiscoveryTimedOut;
                self.release_attempt().await;
                Err(BleError::DiscoveryTimeout {
                    address: self.filter.address.clone(),
                    name: self.filter.name.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Stop scanning and drop whatever link the failed attempt held.
    async fn release_attempt(&self) {
        let (peer, connection) = {
            let mut state = self.state();
            // An attempt that fails mid-way must not look like it is still running.
            if state.phase == CentralState::Discovering || state.phase.is_connecting() {
                state.phase = CentralState::Idle;
            }
            state.matched = None;
            state.services = None;
            (state.connecting_to.take(), state.connection.take())
        };
        if let Err(e) = self.transport.stop_scan().await {
            log::warn!("Failed to stop scan: {}", e);
        }
        if let Some(connection) = connection {
            connection.abandon();
        }
        if let Some(peer) = peer {
            if let Err(e) = self.transport.disconnect(&peer).await {
                log::warn!("Failed to disconnect from {}: {}", peer, e);
            }
            self.transport.close(&peer).await;
        }
    }

    async fn establish(&self) -> Result<Arc<CentralConnection>, BleError> {
        let mut first_pass = true;
        loop {
            // Every later pass follows a lost link, and the scan was stopped
            // when the lost peer matched.
            if !first_pass {
                log::info!("Restarting discovery for service {}", self.filter.service);
                self.transport.start_scan(self.filter.service).await?;
            }
            first_pass = false;

            let peer = self
                .wait_for(|s| match s.phase {
                    CentralState::DeviceMatched => s.matched.as_ref().map(|m| m.address.clone()),
                    _ => None,
                })
                .await;

            log::debug!("Stopping discovery");
            if let Err(e) = self.transport.stop_scan().await {
                log::warn!("Failed to stop scan: {}", e);
            }

            {
                let mut state = self.state();
                if state.phase != CentralState::DeviceMatched {
                    continue;
                }
                state.phase = CentralState::LinkConnecting;
                state.connecting_to = Some(peer.clone());
            }
            log::info!("Connecting to {}", peer);
            self.transport.connect(&peer).await?;

            let linked = self
                .wait_for(|s| {
                    if let Some(fault) = &s.fault {
                        return Some(Err(fault.clone()));
                    }
                    match s.phase {
                        CentralState::ServiceResolving => Some(Ok(true)),
                        CentralState::Discovering => Some(Ok(false)),
                        _ => None,
                    }
                })
                .await?;
            if !linked {
                continue;
            }

            self.transport.discover_services(&peer).await?;
            let services = self
                .wait_for(|s| {
                    if let Some(fault) = &s.fault {
                        return Some(Err(fault.clone()));
                    }
                    if s.phase == CentralState::Discovering {
                        return Some(Ok(None));
                    }
                    s.services.take().map(|services| Ok(Some(services)))
                })
                .await?;
            let Some(services) = services else { continue };

            let (read, write) = match self.resolve_characteristics(&services) {
                Some(pair) => pair,
                None => {
                    log::error!("Failed to find read/write characteristics, disconnecting");
                    self.state().phase = CentralState::CharacteristicsMissing;
                    return Err(BleError::CharacteristicsMissing {
                        service: self.filter.service,
                        read: self.config.read_characteristic_uuid,
                        write: self.config.write_characteristic_uuid,
                    });
                }
            };

            let connection = Arc::new(CentralConnection::new(
                peer.clone(),
                read,
                write,
                Arc::clone(&self.transport),
                self.config.framing(),
                self.config.read_timeout(),
            ));
            {
                let mut state = self.state();
                if state.phase != CentralState::ServiceResolving {
                    continue;
                }
                state.phase = CentralState::Subscribing;
                state.connection = Some(Arc::clone(&connection));
            }

            match connection.subscribe().await {
                Ok(()) => {}
                Err(BleError::Disconnected) => {
                    if let Some(fault) = self.state().fault.clone() {
                        return Err(fault);
                    }
                    continue;
                }
                Err(e) => {
                    self.state().phase = CentralState::SubscribeFailed;
                    return Err(e);
                }
            }

            if self.advance(CentralState::Subscribing, CentralState::Ready) {
                return Ok(connection);
            }
            if let Some(fault) = self.state().fault.clone() {
                return Err(fault);
            }
        }
    }

    fn resolve_characteristics(&self, services: &[GattService]) -> Option<(Uuid, Uuid)> {
        let service = services.iter().find(|s| s.uuid == self.filter.service)?;
        let read = service.characteristic(&self.config.read_characteristic_uuid)?;
        let write = service.characteristic(&self.config.write_characteristic_uuid)?;
        Some((read.uuid, write.uuid))
    }

    /// Scan for the discovery timeout and return every distinct peer that
    /// matched the filter.
    pub async fn discover(&self) -> Result<Vec<PeerInfo>, BleError> {
        {
            let mut state = self.state();
            if state.phase.is_connecting() || state.phase == CentralState::Discovering {
                return Err(BleError::ScanError(
                    "a connection attempt is already scanning".into(),
                ));
            }
            if state.listed.is_some() {
                return Err(BleError::ScanError("discovery already running".into()));
            }
            state.listed = Some(Vec::new());
        }

        log::info!("Starting discovery for service {}", self.filter.service);
        if let Err(e) = self.transport.start_scan(self.filter.service).await {
            self.state().listed = None;
            return Err(e);
        }
        tokio::time::sleep(self.config.discovery_timeout()).await;
        log::info!(
            "Discovery timeout fired: {} ms",
            self.config.discovery_timeout_ms
        );
        if let Err(e) = self.transport.stop_scan().await {
            log::warn!("Failed to stop scan: {}", e);
        }
        Ok(self.state().listed.take().unwrap_or_default())
    }
}

impl Drop for CentralConnector {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::gatt::{GattCharacteristic, GattStatus};
    use crate::ble::simulated::{SimBleNetwork, SimCentral, SimPeripheral};
    use crate::ble::transport::{Advertisement, PeripheralEvent, PeripheralTransport};
    use crate::config::{DEFAULT_READ_CHARACTERISTIC_UUID, DEFAULT_SERVICE_UUID};
    use crate::uuid_util::CLIENT_CHARACTERISTIC_CONFIG;
    use std::time::Duration;

    fn peer(address: [u8; 6], name: &str) -> PeerInfo {
        PeerInfo {
            address: PeerAddress::Real(address),
            name: Some(name.to_string()),
            services: vec![DEFAULT_SERVICE_UUID],
            rssi: Some(-60),
        }
    }

    fn connector(network: &Arc<SimBleNetwork>, config: CentralConfig) -> Arc<CentralConnector> {
        CentralConnector::new(config, Arc::new(network.create_central())).unwrap()
    }

    #[tokio::test]
    async fn test_filter_accepts_first_address_match_once() {
        let network = SimBleNetwork::new();
        let config = CentralConfig {
            target_address: Some("AA:BB:CC:00:00:02".into()),
            ..CentralConfig::default()
        };
        let connector = connector(&network, config);
        connector.begin_attempt();

        let no_match = peer([0xAA, 0xBB, 0xCC, 0, 0, 1], "other");
        let by_address = peer([0xAA, 0xBB, 0xCC, 0, 0, 2], "other");
        let by_name = peer([0xAA, 0xBB, 0xCC, 0, 0, 3], "target");

        assert_eq!(
            connector.handle(CentralEvent::PeerDiscovered(no_match)),
            Handled::Ignored
        );
        assert_eq!(
            connector.handle(CentralEvent::PeerDiscovered(by_address.clone())),
            Handled::PeerMatched(by_address.address.clone())
        );
        assert_eq!(
            connector.handle(CentralEvent::PeerDiscovered(by_name)),
            Handled::Ignored
        );
        // Duplicate advertisement of the accepted peer.
        assert_eq!(
            connector.handle(CentralEvent::PeerDiscovered(by_address.clone())),
            Handled::Ignored
        );
        assert_eq!(connector.phase(), CentralState::DeviceMatched);
        assert_eq!(connector.matched_peer(), Some(by_address));
    }

    #[test]
    fn test_filter_requires_service_and_name() {
        let filter = DiscoveryFilter {
            service: DEFAULT_SERVICE_UUID,
            address: None,
            name: Some("target".into()),
        };
        assert!(filter.matches(&peer([1; 6], "target")));
        assert!(!filter.matches(&peer([1; 6], "other")));

        let mut without_service = peer([1; 6], "target");
        without_service.services.clear();
        assert!(!filter.matches(&without_service));
    }

    fn disconnect(address: &PeerAddress, status: i32) -> CentralEvent {
        CentralEvent::LinkStateChanged {
            peer: address.clone(),
            state: LinkState::Disconnected,
            status,
        }
    }

    #[tokio::test]
    async fn test_fatal_disconnect_status_aborts_attempt() {
        let network = SimBleNetwork::new();
        let connector = connector(&network, CentralConfig::default());
        connector.begin_attempt();

        let target = peer([2; 6], "p");
        connector.handle(CentralEvent::PeerDiscovered(target.clone()));
        assert!(connector.advance(CentralState::DeviceMatched, CentralState::LinkConnecting));

        assert_eq!(
            connector.handle(disconnect(&target.address, 133)),
            Handled::LinkLost { fatal: true }
        );
        assert_eq!(connector.phase(), CentralState::FatalLinkError(133));
        assert_eq!(
            connector.state().fault,
            Some(BleError::FatalLinkError { status: 133 })
        );
    }

    #[tokio::test]
    async fn test_generic_disconnect_status_clears_match() {
        let network = SimBleNetwork::new();
        let connector = connector(&network, CentralConfig::default());
        connector.begin_attempt();

        let target = peer([2; 6], "p");
        connector.handle(CentralEvent::PeerDiscovered(target.clone()));
        assert!(connector.advance(CentralState::DeviceMatched, CentralState::LinkConnecting));

        assert_eq!(
            connector.handle(disconnect(&target.address, 19)),
            Handled::LinkLost { fatal: false }
        );
        assert_eq!(connector.phase(), CentralState::Discovering);
        assert_eq!(connector.matched_peer(), None);
        assert!(connector.state().fault.is_none());

        // A disconnect for a peer we are not connecting to changes nothing.
        assert_eq!(
            connector.handle(disconnect(&PeerAddress::Real([9; 6]), 133)),
            Handled::Ignored
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_timeout_carries_filter() {
        let network = SimBleNetwork::new();
        let config = CentralConfig {
            discovery_timeout_ms: 100,
            target_name: Some("missing".into()),
            ..CentralConfig::default()
        };
        let connector = connector(&network, config);

        let before = Instant::now();
        let err = connector.create_connection().await.err().unwrap();
        let elapsed = before.elapsed();

        assert_eq!(
            err,
            BleError::DiscoveryTimeout {
                address: None,
                name: Some("missing".into()),
                timeout_ms: 100,
            }
        );
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(150));
        assert_eq!(connector.phase(), CentralState::DiscoveryTimedOut);
    }

    async fn advertising_peripheral(
        network: &Arc<SimBleNetwork>,
        characteristics: Vec<Uuid>,
    ) -> SimPeripheral {
        let peripheral = network.create_peripheral();
        peripheral
            .add_service(GattService {
                uuid: DEFAULT_SERVICE_UUID,
                characteristics: characteristics
                    .into_iter()
                    .map(|uuid| GattCharacteristic {
                        uuid,
                        descriptors: vec![CLIENT_CHARACTERISTIC_CONFIG],
                    })
                    .collect(),
            })
            .await
            .unwrap();
        peripheral
            .start_advertising(&Advertisement {
                local_name: "p".into(),
                service_uuids: vec![DEFAULT_SERVICE_UUID],
            })
            .await
            .unwrap();
        peripheral
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_characteristics_tear_link_down() {
        let network = SimBleNetwork::new();
        let _peripheral =
            advertising_peripheral(&network, vec![DEFAULT_READ_CHARACTERISTIC_UUID]).await;
        let connector = connector(&network, CentralConfig::default());

        let err = connector.create_connection().await.err().unwrap();
        assert!(matches!(err, BleError::CharacteristicsMissing { .. }));
        assert!(!err.is_retryable());
        assert_eq!(connector.phase(), CentralState::CharacteristicsMissing);
        assert_eq!(network.link_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_connect_status_fails_attempt() {
        let network = SimBleNetwork::new();
        let _peripheral = advertising_peripheral(
            &network,
            vec![DEFAULT_READ_CHARACTERISTIC_UUID, from_config_write()],
        )
        .await;
        let central = Arc::new(network.create_central());
        central.fail_next_connect(133);
        let connector = CentralConnector::new(CentralConfig::default(), central).unwrap();

        assert_eq!(
            connector.create_connection().await.err().unwrap(),
            BleError::FatalLinkError { status: 133 }
        );
        assert_eq!(connector.phase(), CentralState::FatalLinkError(133));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_leaves_connector_reusable() {
        let network = SimBleNetwork::new();
        let _peripheral = advertising_peripheral(
            &network,
            vec![DEFAULT_READ_CHARACTERISTIC_UUID, from_config_write()],
        )
        .await;
        let central = Arc::new(network.create_central());
        central.reject_next_connect("transient");
        let config = CentralConfig {
            discovery_timeout_ms: 200,
            ..CentralConfig::default()
        };
        let connector = CentralConnector::new(config, central).unwrap();

        assert_eq!(
            connector.create_connection().await.err().unwrap(),
            BleError::ConnectionError("transient".into())
        );
        assert_eq!(connector.phase(), CentralState::Idle);
        assert_eq!(connector.matched_peer(), None);

        // Neither entry point reports a running attempt.
        assert_eq!(connector.discover().await.unwrap().len(), 1);
        // The retry gets as far as the subscription, which nobody answers here.
        assert!(matches!(
            connector.create_connection().await,
            Err(BleError::DiscoveryTimeout { .. })
        ));
        assert_eq!(connector.phase(), CentralState::DiscoveryTimedOut);
    }

    fn from_config_write() -> Uuid {
        CentralConfig::default().write_characteristic_uuid
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_subscription_fails_attempt() {
        let network = SimBleNetwork::new();
        let peripheral = advertising_peripheral(
            &network,
            vec![DEFAULT_READ_CHARACTERISTIC_UUID, from_config_write()],
        )
        .await;
        let mut events = peripheral.events();
        let central: Arc<SimCentral> = Arc::new(network.create_central());
        let connector =
            CentralConnector::new(CentralConfig::default(), central.clone()).unwrap();

        // Refuse every descriptor write.
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let PeripheralEvent::WriteRequest { request, .. } = event {
                    peripheral
                        .send_response(
                            &request.peer,
                            request.request_id,
                            GattStatus::Failure,
                            0,
                            &[],
                        )
                        .await
                        .unwrap();
                }
            }
        });

        assert!(matches!(
            connector.create_connection().await,
            Err(BleError::SubscribeFailed(_))
        ));
        assert_eq!(connector.phase(), CentralState::SubscribeFailed);
        assert_eq!(network.link_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discover_lists_each_peer_once() {
        let network = SimBleNetwork::new();
        let first = advertising_peripheral(&network, vec![]).await;
        let second = advertising_peripheral(&network, vec![]).await;
        let config = CentralConfig {
            discovery_timeout_ms: 200,
            ..CentralConfig::default()
        };
        let connector = connector(&network, config);

        let found = connector.discover().await.unwrap();
        let mut addresses: Vec<PeerAddress> = found.into_iter().map(|p| p.address).collect();
        addresses.sort_by_key(|a| a.to_string());
        let mut expected = vec![first.address().clone(), second.address().clone()];
        expected.sort_by_key(|a| a.to_string());
        assert_eq!(addresses, expected);
        assert_eq!(connector.phase(), CentralState::Idle);
    }
}
