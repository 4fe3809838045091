//! End-to-end tests: a central and a peripheral talking over the simulator.

use std::sync::Arc;
use std::time::Duration;

use blerpc::ble::gatt::REMOTE_TERMINATED;
use blerpc::ble::simulated::{SimBleNetwork, SimCentral, SimPeripheral};
use blerpc::{
    BleError, CentralConfig, CentralConnector, CentralState, Connection, PeripheralConfig,
    PeripheralRegistry,
};
use tokio::task::JoinHandle;

fn message_of(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i * 31 % 256) as u8).collect()
}

struct Rig {
    network: Arc<SimBleNetwork>,
    peripheral: Arc<SimPeripheral>,
    central: Arc<SimCentral>,
    registry: Arc<PeripheralRegistry>,
    connector: Arc<CentralConnector>,
}

async fn rig(central: CentralConfig, peripheral: PeripheralConfig) -> Rig {
    let network = SimBleNetwork::new();
    let sim_peripheral = Arc::new(network.create_peripheral());
    let registry = PeripheralRegistry::start(peripheral, sim_peripheral.clone())
        .await
        .unwrap();
    let sim_central = Arc::new(network.create_central());
    let connector = CentralConnector::new(central, sim_central.clone()).unwrap();
    Rig {
        network,
        peripheral: sim_peripheral,
        central: sim_central,
        registry,
        connector,
    }
}

/// Accept one central and echo every message until it leaves.
fn spawn_echo(registry: &Arc<PeripheralRegistry>) -> JoinHandle<Result<usize, BleError>> {
    let registry = Arc::clone(registry);
    tokio::spawn(async move {
        let connection = registry.create_connection().await?;
        let mut echoed = 0;
        loop {
            match connection.receive_message().await {
                Ok(message) => match connection.send_message(&message).await {
                    Ok(()) => echoed += 1,
                    // The central may leave as soon as it has the reply, while
                    // the last chunk still waits for its acknowledgment.
                    Err(BleError::Closed) if connection.is_closed() => return Ok(echoed + 1),
                    Err(e) => return Err(e),
                },
                Err(e) if e.is_end_of_stream() => return Ok(echoed),
                Err(e) => return Err(e),
            }
        }
    })
}

#[tokio::test(start_paused = true)]
async fn test_echo_messages_of_every_size() {
    let rig = rig(CentralConfig::default(), PeripheralConfig::default()).await;
    let echo = spawn_echo(&rig.registry);

    let connection = rig.connector.create_connection().await.unwrap();
    assert_eq!(rig.connector.phase(), CentralState::Ready);
    assert!(!rig.peripheral.is_advertising());

    let sizes = [0usize, 1, 19, 20, 21, 127, 128, 1000, 10000];
    for size in sizes {
        let message = message_of(size);
        connection.send_message(&message).await.unwrap();
        assert_eq!(
            connection.receive_message().await.unwrap(),
            message,
            "size {}",
            size
        );
    }

    connection.close().await.unwrap();
    assert!(connection.is_closed());
    assert_eq!(echo.await.unwrap().unwrap(), sizes.len());
}

#[tokio::test(start_paused = true)]
async fn test_connector_reuses_established_connection() {
    let rig = rig(CentralConfig::default(), PeripheralConfig::default()).await;
    let _echo = spawn_echo(&rig.registry);

    let first = rig.connector.create_connection().await.unwrap();
    let second = rig.connector.create_connection().await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(rig.network.link_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_close_tears_down_and_resumes_advertising() {
    let rig = rig(CentralConfig::default(), PeripheralConfig::default()).await;
    let echo = spawn_echo(&rig.registry);

    let connection = rig.connector.create_connection().await.unwrap();
    connection.send_message(b"ping").await.unwrap();
    assert_eq!(connection.receive_message().await.unwrap(), b"ping");

    connection.close().await.unwrap();
    connection.close().await.unwrap();
    assert_eq!(rig.network.link_count(), 0);
    assert_eq!(
        connection.send_message(b"late").await,
        Err(BleError::Closed)
    );
    assert_eq!(echo.await.unwrap().unwrap(), 1);

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(rig.registry.connected_peers().is_empty());
    assert!(rig.registry.is_advertising());
    assert!(rig.peripheral.is_advertising());

    // A fresh attempt finds the peripheral again.
    let _echo = spawn_echo(&rig.registry);
    let again = rig.connector.create_connection().await.unwrap();
    assert!(!Arc::ptr_eq(&connection, &again));
    again.send_message(b"pong").await.unwrap();
    assert_eq!(again.receive_message().await.unwrap(), b"pong");
}

#[tokio::test(start_paused = true)]
async fn test_retry_after_transport_error_connects() {
    let rig = rig(CentralConfig::default(), PeripheralConfig::default()).await;
    let _echo = spawn_echo(&rig.registry);

    rig.central.reject_next_connect("transient");
    assert_eq!(
        rig.connector.create_connection().await.err().unwrap(),
        BleError::ConnectionError("transient".into())
    );
    assert_eq!(rig.connector.phase(), CentralState::Idle);
    assert!(rig.connector.discover().await.is_ok());

    let connection = rig.connector.create_connection().await.unwrap();
    assert_eq!(rig.connector.phase(), CentralState::Ready);
    connection.send_message(b"again").await.unwrap();
    assert_eq!(connection.receive_message().await.unwrap(), b"again");
}

#[tokio::test(start_paused = true)]
async fn test_dropped_link_while_connecting_rescans() {
    let rig = rig(CentralConfig::default(), PeripheralConfig::default()).await;
    let _echo = spawn_echo(&rig.registry);

    // The first link attempt ends in a non-fatal disconnect.
    rig.central.fail_next_connect(REMOTE_TERMINATED);
    let connection = rig.connector.create_connection().await.unwrap();
    assert_eq!(rig.connector.phase(), CentralState::Ready);
    assert_eq!(rig.network.link_count(), 1);

    connection.send_message(b"second try").await.unwrap();
    assert_eq!(connection.receive_message().await.unwrap(), b"second try");
}

#[tokio::test(start_paused = true)]
async fn test_peripheral_drop_invalidates_central_connection() {
    let rig = rig(CentralConfig::default(), PeripheralConfig::default()).await;
    let accepted = {
        let registry = Arc::clone(&rig.registry);
        tokio::spawn(async move { registry.create_connection().await })
    };

    let connection = rig.connector.create_connection().await.unwrap();
    let Ok(Ok(peripheral_side)) = accepted.await else {
        panic!("peripheral did not accept the link");
    };

    peripheral_side.close().await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(rig.connector.phase(), CentralState::Idle);
    assert_eq!(
        connection.receive_message().await,
        Err(BleError::EndOfStream)
    );
    assert_eq!(rig.network.link_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_name_filter_and_raw_framing() {
    let central = CentralConfig {
        target_name: Some("bench".into()),
        delimited: false,
        read_timeout_ms: 200,
        ..CentralConfig::default()
    };
    let peripheral = PeripheralConfig {
        advertised_name: "bench".into(),
        delimited: false,
        ..PeripheralConfig::default()
    };
    let rig = rig(central, peripheral).await;
    let accepted = {
        let registry = Arc::clone(&rig.registry);
        tokio::spawn(async move { registry.create_connection().await })
    };

    let connection = rig.connector.create_connection().await.unwrap();
    assert_eq!(
        rig.connector.matched_peer().and_then(|p| p.name).as_deref(),
        Some("bench")
    );
    let Ok(Ok(peripheral_side)) = accepted.await else {
        panic!("peripheral did not accept the link");
    };

    // One message per stream: the reader returns what arrived before the
    // read timeout ends the stream.
    let message = message_of(45);
    peripheral_side.send_message(&message).await.unwrap();
    assert_eq!(connection.receive_message().await.unwrap(), message);
}

#[tokio::test(start_paused = true)]
async fn test_unmatched_name_times_out() {
    let central = CentralConfig {
        target_name: Some("elsewhere".into()),
        discovery_timeout_ms: 500,
        ..CentralConfig::default()
    };
    let rig = rig(central, PeripheralConfig::default()).await;

    let err = rig.connector.create_connection().await.err().unwrap();
    assert!(matches!(err, BleError::DiscoveryTimeout { timeout_ms: 500, .. }));
    assert!(err.is_retryable());
    assert_eq!(rig.network.link_count(), 0);
    assert!(rig.peripheral.is_advertising());
}
