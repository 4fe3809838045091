//! Connection object of the central role
//!
//! Owns the link's reader/writer pair and the subscription handshake on the
//! peripheral's read characteristic. Events for the link are routed here by
//! the connector's dispatcher.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::ble::gatt::{DescriptorValue, GATT_SUCCESS};
use crate::ble::transport::{CentralTransport, PeerAddress};
use crate::ble::BleError;
use crate::connection::{Connection, Framing, MessageStream};
use crate::stream::{ChunkReader, ChunkSink, ChunkWriter, RetryPolicy};
use crate::uuid_util::CLIENT_CHARACTERISTIC_CONFIG;

/// Ceiling on each teardown wait (unsubscribe ack, disconnect event).
pub const CLOSE_WAIT: Duration = Duration::from_secs(5);

/// Writes outbound chunks to the peripheral's write characteristic.
struct CharacteristicSink {
    transport: Arc<dyn CentralTransport>,
    peer: PeerAddress,
    characteristic: Uuid,
}

#[async_trait]
impl ChunkSink for CharacteristicSink {
    async fn send_chunk(&self, chunk: &[u8]) -> bool {
        self.transport
            .write_characteristic(&self.peer, self.characteristic, chunk)
            .await
    }
}

#[derive(Default)]
struct LinkStatus {
    /// Last descriptor acknowledgment: the value, or the failing status.
    subscription: Option<Result<DescriptorValue, i32>>,
    disconnected: bool,
    closing: bool,
    closed: bool,
}

pub struct CentralConnection {
    peer: PeerAddress,
    read_characteristic: Uuid,
    write_characteristic: Uuid,
    transport: Arc<dyn CentralTransport>,
    stream: MessageStream,
    status: Mutex<LinkStatus>,
    changed: Notify,
}

impl CentralConnection {
    pub(crate) fn new(
        peer: PeerAddress,
        read_characteristic: Uuid,
        write_characteristic: Uuid,
        transport: Arc<dyn CentralTransport>,
        framing: Framing,
        read_timeout: Duration,
    ) -> Self {
        let sink = Arc::new(CharacteristicSink {
            transport: Arc::clone(&transport),
            peer: peer.clone(),
            characteristic: write_characteristic,
        });
        let reader = Arc::new(ChunkReader::new(read_timeout));
        let writer = Arc::new(ChunkWriter::new(sink));
        Self {
            peer,
            read_characteristic,
            write_characteristic,
            transport,
            stream: MessageStream::new(reader, writer, framing),
            status: Mutex::new(LinkStatus::default()),
            changed: Notify::new(),
        }
    }

    fn status(&self) -> MutexGuard<'_, LinkStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn peer(&self) -> &PeerAddress {
        &self.peer
    }

    pub fn read_characteristic(&self) -> Uuid {
        self.read_characteristic
    }

    pub fn write_characteristic(&self) -> Uuid {
        self.write_characteristic
    }

    pub fn stream(&self) -> &MessageStream {
        &self.stream
    }

    pub fn is_disconnected(&self) -> bool {
        self.status().disconnected
    }

    /// Inbound chunk notified on the read characteristic.
    pub(crate) fn on_characteristic_changed(&self, characteristic: Uuid, value: &[u8]) -> bool {
        if characteristic != self.read_characteristic {
            return false;
        }
        self.stream.reader().feed(value);
        true
    }

    /// The peer acknowledged a chunk written to the write characteristic.
    pub(crate) fn on_characteristic_written(&self, characteristic: Uuid, status: i32) -> bool {
        if characteristic != self.write_characteristic {
            return false;
        }
        if status != GATT_SUCCESS {
            log::warn!("Chunk write to {} failed with status {}", self.peer, status);
            return false;
        }
        self.stream.writer().notify_written();
        true
    }

    /// The peer acknowledged a subscription descriptor write.
    pub(crate) fn on_descriptor_written(
        &self,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
        status: i32,
    ) -> Option<DescriptorValue> {
        if characteristic != self.read_characteristic || descriptor != CLIENT_CHARACTERISTIC_CONFIG {
            return None;
        }
        let outcome = if status == GATT_SUCCESS {
            match DescriptorValue::from_bytes(value) {
                Some(value) => Ok(value),
                None => {
                    log::warn!("Unexpected descriptor value {:02X?} from {}", value, self.peer);
                    return None;
                }
            }
        } else {
            Err(status)
        };
        self.status().subscription = Some(outcome);
        self.changed.notify_waiters();
        outcome.ok()
    }

    /// The link went down. Blocked stream calls fail from here on.
    pub(crate) fn notify_disconnected(&self) {
        self.status().disconnected = true;
        self.stream.close();
        self.changed.notify_waiters();
    }

    async fn wait_status<T>(&self, mut check: impl FnMut(&LinkStatus) -> Option<T>) -> T {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let ready = {
                let status = self.status();
                check(&*status)
            };
            if let Some(value) = ready {
                return value;
            }
            notified.await;
        }
    }

    /// Post a subscription value to the peer, retrying rejected writes.
    async fn write_subscription(&self, value: DescriptorValue) -> Result<(), BleError> {
        self.status().subscription = None;
        let retry = RetryPolicy::default();
        for attempt in 1..=retry.attempts {
            if self
                .transport
                .write_descriptor(
                    &self.peer,
                    self.read_characteristic,
                    CLIENT_CHARACTERISTIC_CONFIG,
                    &value.as_bytes(),
                )
                .await
            {
                log::debug!("Descriptor written ({:?})", value);
                return Ok(());
            }
            log::warn!(
                "Descriptor write rejected (attempt {}/{})",
                attempt,
                retry.attempts
            );
            if attempt < retry.attempts {
                tokio::time::sleep(retry.backoff).await;
            }
        }
        Err(BleError::SubscribeFailed(format!(
            "descriptor write rejected {} times",
            retry.attempts
        )))
    }

    /// Enable notifications on the read characteristic and wait for the
    /// peer's acknowledgment. Fails with [`BleError::Disconnected`] if the
    /// link drops meanwhile.
    pub(crate) async fn subscribe(&self) -> Result<(), BleError> {
        log::info!("Subscribing to {} on {}", self.read_characteristic, self.peer);
        if !self
            .transport
            .set_notify(&self.peer, self.read_characteristic, true)
            .await
        {
            log::warn!("Local notification delivery not enabled for {}", self.read_characteristic);
        }
        self.write_subscription(DescriptorValue::EnableNotification)
            .await?;

        let outcome = self
            .wait_status(|s| {
                if s.disconnected {
                    return Some(None);
                }
                s.subscription.map(Some)
            })
            .await;
        match outcome {
            Some(Ok(value)) if value.is_enabled() => {
                log::info!("Subscribed successfully");
                Ok(())
            }
            Some(Ok(_)) => Err(BleError::SubscribeFailed(
                "peer acknowledged the disable value".into(),
            )),
            Some(Err(status)) => Err(BleError::SubscribeFailed(format!(
                "descriptor write failed with status {}",
                status
            ))),
            None => Err(BleError::Disconnected),
        }
    }

    /// Drop the connection without the teardown handshake.
    pub(crate) fn abandon(&self) {
        self.stream.close();
        let mut status = self.status();
        status.closing = true;
        status.closed = true;
    }
}

#[async_trait]
impl Connection for CentralConnection {
    async fn send_message(&self, message: &[u8]) -> Result<(), BleError> {
        if self.is_closed() {
            return Err(BleError::Closed);
        }
        self.stream.send(message).await
    }

    async fn receive_message(&self) -> Result<Vec<u8>, BleError> {
        self.stream.receive().await
    }

    async fn close(&self) -> Result<(), BleError> {
        {
            let mut status = self.status();
            if status.closing {
                return Ok(());
            }
            status.closing = true;
        }
        log::info!("Start closing connection to {}", self.peer);

        if !self.is_disconnected() {
            self.transport
                .set_notify(&self.peer, self.read_characteristic, false)
                .await;
            match self.write_subscription(DescriptorValue::Disable).await {
                Ok(()) => {
                    let unsubscribed = tokio::time::timeout(
                        CLOSE_WAIT,
                        self.wait_status(|s| {
                            (s.disconnected || matches!(s.subscription, Some(Ok(DescriptorValue::Disable))))
                                .then_some(())
                        }),
                    )
                    .await;
                    if unsubscribed.is_err() {
                        log::warn!("Waited too long for the unsubscribe acknowledgment");
                    }
                }
                Err(e) => log::warn!("Failed to unsubscribe: {}", e),
            }
        }

        self.stream.close();

        if !self.is_disconnected() {
            log::debug!("Disconnecting from {}", self.peer);
            if let Err(e) = self.transport.disconnect(&self.peer).await {
                log::warn!("Disconnect from {} failed: {}", self.peer, e);
            }
            let disconnected =
                tokio::time::timeout(CLOSE_WAIT, self.wait_status(|s| s.disconnected.then_some(())))
                    .await;
            if disconnected.is_err() {
                log::warn!("Waited too long until actually disconnected");
            }
        }

        self.transport.close(&self.peer).await;
        self.status().closed = true;
        log::info!("Connection to {} closed", self.peer);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.status().closed
    }
}
