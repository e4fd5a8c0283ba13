//! Per-connection outgoing buffer
//!
//! Each connection has at most one pending byte buffer. The broker
//! never blocks on a slow peer: unsent bytes accumulate here, and
//! `last_progress` only moves when bytes actually reach the socket. A
//! non-empty buffer that makes no progress within the stall limit marks
//! the connection for killing.

use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::time::Instant;

/// Pending outgoing bytes plus the time of the last write progress
#[derive(Debug)]
pub struct SendBuffer {
    pending: BytesMut,
    last_progress: Instant,
}

impl SendBuffer {
    /// Create an empty buffer
    pub fn new(now: Instant) -> Self {
        Self {
            pending: BytesMut::new(),
            last_progress: now,
        }
    }

    /// Append bytes to the buffer.
    ///
    /// Filling an empty buffer restarts the progress clock; the stall
    /// limit measures time spent failing to drain, not time idle.
    pub fn push(&mut self, bytes: &[u8], now: Instant) {
        if self.pending.is_empty() {
            self.last_progress = now;
        }
        self.pending.extend_from_slice(bytes);
    }

    /// Record that the kernel accepted `n` bytes.
    ///
    /// A zero-byte write (would-block) leaves `last_progress` alone, so
    /// the stall clock keeps running.
    pub fn advance(&mut self, n: usize, now: Instant) {
        self.pending.advance(n);
        if n > 0 {
            self.last_progress = now;
        }
    }

    /// The unsent bytes
    pub fn chunk(&self) -> &[u8] {
        &self.pending
    }

    /// Whether nothing is pending
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Number of pending bytes
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether a non-empty buffer has gone too long without progress
    pub fn is_stalled(&self, limit: Duration, now: Instant) -> bool {
        !self.pending.is_empty() && now.duration_since(self.last_progress) > limit
    }

    /// Instant at which the buffer counts as stalled
    pub fn stall_deadline(&self, limit: Duration) -> Instant {
        self.last_progress + limit
    }
}
