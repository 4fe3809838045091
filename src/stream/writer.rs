//! Outbound half of a link: carves messages into acknowledged chunks.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};

use crate::ble::BleError;

/// Default unencrypted ATT payload size.
pub const MAX_CHUNK_SIZE: usize = 20;

/// Attempts made for a rejected chunk before the write fails.
pub const SEND_ATTEMPTS: u32 = 3;

pub const RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// How long a sent chunk may wait for its acknowledgment.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Bounded retry of a platform operation that reports rejection as `false`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    /// One attempt, no backoff. For sinks that already retry internally.
    pub const fn single() -> Self {
        Self {
            attempts: 1,
            backoff: Duration::ZERO,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: SEND_ATTEMPTS,
            backoff: RETRY_BACKOFF,
        }
    }
}

/// Role-specific delivery of one chunk.
///
/// The central writes the chunk to the remote write characteristic; the
/// peripheral notifies it to the subscribed central.
#[async_trait]
pub trait ChunkSink: Send + Sync {
    /// Returns whether the platform accepted the chunk.
    async fn send_chunk(&self, chunk: &[u8]) -> bool;
}

#[derive(Default)]
struct WriterState {
    staged: Vec<u8>,
    /// Bytes of `staged` the transport acknowledged.
    acked: usize,
    /// Chunk sent and not yet acknowledged.
    in_flight: Option<Vec<u8>>,
    /// Number of chunks carved so far, across writes.
    sequence: u64,
    writing: bool,
    closed: bool,
}

/// Blocking message writer over a chunked, acknowledged transport.
///
/// One write may be in progress at a time; a concurrent `write` fails with
/// [`BleError::WriteInProgress`] instead of touching the staged message.
pub struct ChunkWriter {
    state: Mutex<WriterState>,
    acked: Notify,
    sink: Arc<dyn ChunkSink>,
    retry: RetryPolicy,
    chunk_size: usize,
    ack_timeout: Duration,
}

impl ChunkWriter {
    pub fn new(sink: Arc<dyn ChunkSink>) -> Self {
        Self {
            state: Mutex::new(WriterState::default()),
            acked: Notify::new(),
            sink,
            retry: RetryPolicy::default(),
            chunk_size: MAX_CHUNK_SIZE,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_ack_timeout(mut self, ack_timeout: Duration) -> Self {
        self.ack_timeout = ack_timeout;
        self
    }

    fn state(&self) -> MutexGuard<'_, WriterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Send `data` and wait until every chunk has been acknowledged.
    pub async fn write(&self, data: &[u8]) -> Result<(), BleError> {
        {
            let mut state = self.state();
            if state.closed {
                return Err(BleError::Closed);
            }
            if state.writing {
                return Err(BleError::WriteInProgress);
            }
            state.writing = true;
            state.staged = data.to_vec();
            state.acked = 0;
            state.in_flight = None;
        }
        log::debug!("write() {} bytes", data.len());

        let result = self.drive().await;

        let mut state = self.state();
        state.staged.clear();
        state.acked = 0;
        state.in_flight = None;
        state.writing = false;
        result
    }

    async fn drive(&self) -> Result<(), BleError> {
        loop {
            let chunk = {
                let mut state = self.state();
                if state.closed {
                    return Err(BleError::Closed);
                }
                if state.acked >= state.staged.len() {
                    return Ok(());
                }
                let end = (state.acked + self.chunk_size).min(state.staged.len());
                let chunk = state.staged[state.acked..end].to_vec();
                state.in_flight = Some(chunk.clone());
                state.sequence += 1;
                chunk
            };

            log::debug!("Sending chunk: {} bytes", chunk.len());
            self.send_with_retry(&chunk).await?;
            self.wait_acknowledged().await?;
        }
    }

    async fn send_with_retry(&self, chunk: &[u8]) -> Result<(), BleError> {
        for attempt in 1..=self.retry.attempts {
            if self.sink.send_chunk(chunk).await {
                return Ok(());
            }
            log::warn!(
                "Chunk rejected by transport (attempt {}/{})",
                attempt,
                self.retry.attempts
            );
            if attempt < self.retry.attempts {
                tokio::time::sleep(self.retry.backoff).await;
            }
            if self.is_closed() {
                return Err(BleError::Closed);
            }
        }
        Err(BleError::TransportWriteFailure {
            attempts: self.retry.attempts,
        })
    }

    async fn wait_acknowledged(&self) -> Result<(), BleError> {
        let deadline = Instant::now() + self.ack_timeout;
        loop {
            let notified = self.acked.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.state();
                if state.closed {
                    return Err(BleError::Closed);
                }
                if state.in_flight.is_none() {
                    return Ok(());
                }
            }

            if timeout_at(deadline, notified).await.is_err() {
                return Err(BleError::AckTimeout {
                    timeout_ms: self.ack_timeout.as_millis() as u64,
                });
            }
        }
    }

    /// The transport confirmed the in-flight chunk was sent.
    pub fn notify_written(&self) {
        {
            let mut state = self.state();
            if !state.writing {
                return;
            }
            match state.in_flight.take() {
                Some(chunk) => state.acked += chunk.len(),
                None => return,
            }
        }
        self.acked.notify_waiters();
    }

    /// Sequence number of the in-flight chunk, if it carries `chunk`.
    pub fn in_flight_sequence(&self, chunk: &[u8]) -> Option<u64> {
        let state = self.state();
        match &state.in_flight {
            Some(in_flight) if in_flight.as_slice() == chunk => Some(state.sequence),
            _ => None,
        }
    }

    /// Acknowledge the chunk numbered `sequence`. Stale acknowledgments,
    /// for a chunk already acknowledged by another path, are dropped.
    pub fn notify_chunk_written(&self, sequence: u64) {
        if self.state().sequence != sequence {
            log::debug!("Dropping stale acknowledgment for chunk {}", sequence);
            return;
        }
        self.notify_written();
    }

    /// The chunk currently waiting for acknowledgment, if any.
    pub fn current_chunk(&self) -> Option<Vec<u8>> {
        self.state().in_flight.clone()
    }

    pub fn is_writing(&self) -> bool {
        self.state().writing
    }

    /// Writes block until acknowledged, so there is nothing to flush.
    pub fn flush(&self) -> Result<(), BleError> {
        if self.is_closed() {
            return Err(BleError::Closed);
        }
        Ok(())
    }

    /// Discard unacknowledged state and fail any blocked write. Idempotent.
    pub fn close(&self) {
        {
            let mut state = self.state();
            if state.closed {
                return;
            }
            state.closed = true;
            state.staged = Vec::new();
            state.acked = 0;
            state.in_flight = None;
        }
        self.acked.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }
}
