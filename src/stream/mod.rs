//! Blocking byte stream over a chunked notify/write transport
//!
//! Each link owns one [`ChunkReader`] (inbound chunks reassembled into a
//! stream) and one [`ChunkWriter`] (outbound messages carved into chunks and
//! pushed one at a time, each waiting for its acknowledgment).

pub mod reader;
pub mod writer;

pub use reader::{ChunkReader, DEFAULT_READ_TIMEOUT};
pub use writer::{
    ChunkSink, ChunkWriter, RetryPolicy, DEFAULT_ACK_TIMEOUT, MAX_CHUNK_SIZE, RETRY_BACKOFF,
    SEND_ATTEMPTS,
};
