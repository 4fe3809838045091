//! Connection object of the peripheral role

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;

use super::PeripheralRegistry;
use crate::ble::transport::{PeerAddress, PeripheralTransport};
use crate::ble::BleError;
use crate::connection::{Connection, Framing, MessageStream};
use crate::stream::{ChunkReader, ChunkSink, ChunkWriter, RetryPolicy};

/// Notifies outbound chunks to one subscribed central.
///
/// Retries live in the registry's notifier, so the writer on top of this
/// sink makes a single attempt per chunk.
struct PeerNotifier {
    registry: Weak<PeripheralRegistry>,
    peer: PeerAddress,
}

#[async_trait]
impl ChunkSink for PeerNotifier {
    async fn send_chunk(&self, chunk: &[u8]) -> bool {
        match self.registry.upgrade() {
            Some(registry) => registry.notify_peer(&self.peer, chunk).await,
            None => false,
        }
    }
}

/// One accepted central, as seen by the RPC layer.
pub struct PeripheralConnection {
    peer: PeerAddress,
    transport: Arc<dyn PeripheralTransport>,
    stream: MessageStream,
    closed: AtomicBool,
}

impl PeripheralConnection {
    pub(crate) fn new(
        peer: PeerAddress,
        registry: Weak<PeripheralRegistry>,
        transport: Arc<dyn PeripheralTransport>,
        framing: Framing,
        read_timeout: Duration,
    ) -> Self {
        let sink = Arc::new(PeerNotifier {
            registry,
            peer: peer.clone(),
        });
        let reader = Arc::new(ChunkReader::new(read_timeout));
        let writer = Arc::new(ChunkWriter::new(sink).with_retry(RetryPolicy::single()));
        Self {
            peer,
            transport,
            stream: MessageStream::new(reader, writer, framing),
            closed: AtomicBool::new(false),
        }
    }

    pub fn peer(&self) -> &PeerAddress {
        &self.peer
    }

    pub fn stream(&self) -> &MessageStream {
        &self.stream
    }

    /// The central left. Blocked stream calls fail from here on.
    pub(crate) fn notify_disconnected(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.stream.close();
    }
}

#[async_trait]
impl Connection for PeripheralConnection {
    async fn send_message(&self, message: &[u8]) -> Result<(), BleError> {
        if self.is_closed() {
            return Err(BleError::Closed);
        }
        self.stream.send(message).await
    }

    async fn receive_message(&self) -> Result<Vec<u8>, BleError> {
        self.stream.receive().await
    }

    /// Close the streams and force the central off the link. The registry
    /// drops the link once the platform reports the disconnect.
    async fn close(&self) -> Result<(), BleError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        log::info!("Closing connection from {}", self.peer);
        self.stream.close();
        self.transport.cancel_connection(&self.peer).await
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
