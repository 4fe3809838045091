//! Inbound half of a link: reassembles notified chunks into a byte stream.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};

use crate::ble::BleError;

/// Default read deadline. Peers may pause for seconds between chunks.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Default)]
struct ReaderState {
    buffer: Vec<u8>,
    /// Index of the next byte to hand out. Never exceeds `buffer.len()`.
    read_pos: usize,
    closed: bool,
}

impl ReaderState {
    fn available(&self) -> usize {
        self.buffer.len() - self.read_pos
    }

    fn take(&mut self, n: usize) -> Vec<u8> {
        let out = self.buffer[self.read_pos..self.read_pos + n].to_vec();
        self.read_pos += n;
        if self.read_pos == self.buffer.len() {
            self.buffer.clear();
            self.read_pos = 0;
        }
        out
    }
}

/// Byte stream fed by transport events and drained by the RPC layer.
///
/// `feed` never blocks and may be called from the event dispatcher; the
/// read side waits until enough bytes arrived, the reader is closed, or the
/// read deadline passes.
pub struct ChunkReader {
    state: Mutex<ReaderState>,
    data_ready: Notify,
    timeout: Duration,
}

impl ChunkReader {
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: Mutex::new(ReaderState::default()),
            data_ready: Notify::new(),
            timeout,
        }
    }

    fn state(&self) -> MutexGuard<'_, ReaderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an inbound chunk.
    pub fn feed(&self, chunk: &[u8]) {
        {
            let mut state = self.state();
            if state.closed {
                log::debug!("Dropping {} bytes fed into a closed reader", chunk.len());
                return;
            }
            state.buffer.extend_from_slice(chunk);
        }
        log::debug!("Fed {} bytes", chunk.len());
        self.data_ready.notify_waiters();
    }

    /// Bytes buffered and not yet read.
    pub fn available(&self) -> usize {
        self.state().available()
    }

    /// `(read cursor, write cursor)`. Both return to zero once drained.
    pub fn cursors(&self) -> (usize, usize) {
        let state = self.state();
        (state.read_pos, state.buffer.len())
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Read a single byte.
    pub async fn read(&self) -> Result<u8, BleError> {
        let byte = self.read_exact(1).await?;
        Ok(byte[0])
    }

    /// Read exactly `n` bytes.
    ///
    /// Fails with [`BleError::EndOfStream`] once closed and with
    /// [`BleError::StreamTimeout`] when the deadline passes. A timeout never
    /// yields a partial result.
    pub async fn read_exact(&self, n: usize) -> Result<Vec<u8>, BleError> {
        let deadline = Instant::now() + self.timeout;
        loop {
            let notified = self.data_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state();
                if state.closed {
                    return Err(BleError::EndOfStream);
                }
                if state.available() >= n {
                    return Ok(state.take(n));
                }
            }

            if timeout_at(deadline, notified).await.is_err() {
                let available = self.available();
                log::error!("Failed to read {} bytes, only {} available", n, available);
                return Err(BleError::StreamTimeout {
                    wanted: n,
                    available,
                    timeout_ms: self.timeout.as_millis() as u64,
                });
            }
        }
    }

    /// Release the buffer and wake every blocked read. Idempotent.
    pub fn close(&self) {
        {
            let mut state = self.state();
            if state.closed {
                return;
            }
            state.closed = true;
            state.buffer = Vec::new();
            state.read_pos = 0;
        }
        self.data_ready.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }
}

impl Default for ChunkReader {
    fn default() -> Self {
        Self::new(DEFAULT_READ_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_read_exact_across_chunks() {
        let reader = ChunkReader::default();
        reader.feed(b"hel");
        reader.feed(b"lo world");
        assert_eq!(reader.read_exact(5).await.unwrap(), b"hello");
        assert_eq!(reader.read().await.unwrap(), b' ');
        assert_eq!(reader.available(), 5);
    }

    #[tokio::test]
    async fn test_cursors_reset_when_drained() {
        let reader = ChunkReader::default();
        reader.feed(&[1u8; 30]);
        assert_eq!(reader.cursors(), (0, 30));

        reader.read_exact(10).await.unwrap();
        assert_eq!(reader.cursors(), (10, 30));

        reader.read_exact(20).await.unwrap();
        assert_eq!(reader.cursors(), (0, 0));

        reader.feed(&[2u8; 3]);
        assert_eq!(reader.cursors(), (0, 3));
    }

    #[tokio::test]
    async fn test_blocked_read_wakes_on_feed() {
        let reader = Arc::new(ChunkReader::default());
        let r = Arc::clone(&reader);
        let handle = tokio::spawn(async move { r.read_exact(4).await });

        tokio::task::yield_now().await;
        reader.feed(&[1, 2]);
        tokio::task::yield_now().await;
        reader.feed(&[3, 4]);

        assert_eq!(handle.await.unwrap().unwrap(), vec![1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_end_of_stream_not_partial() {
        let reader = ChunkReader::new(Duration::from_millis(200));
        reader.feed(&[9; 3]);

        let before = Instant::now();
        let err = reader.read_exact(4).await.unwrap_err();
        assert!(before.elapsed() >= Duration::from_millis(200));
        assert!(err.is_end_of_stream());
        assert!(matches!(
            err,
            BleError::StreamTimeout {
                wanted: 4,
                available: 3,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_close_unblocks_reader_and_is_idempotent() {
        let reader = Arc::new(ChunkReader::default());
        let r = Arc::clone(&reader);
        let handle = tokio::spawn(async move { r.read_exact(1).await });

        tokio::task::yield_now().await;
        reader.close();
        reader.close();

        assert_eq!(handle.await.unwrap(), Err(BleError::EndOfStream));
        assert!(reader.is_closed());
        assert_eq!(reader.cursors(), (0, 0));

        // Late chunks are dropped.
        reader.feed(b"late");
        assert_eq!(reader.available(), 0);
        assert_eq!(reader.read().await, Err(BleError::EndOfStream));
    }

    #[tokio::test]
    async fn test_zero_length_read() {
        let reader = ChunkReader::default();
        assert_eq!(reader.read_exact(0).await.unwrap(), Vec::<u8>::new());
    }
}
