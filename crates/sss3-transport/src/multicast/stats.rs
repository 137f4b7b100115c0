//! Data plane counters

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

/// Counters shared between the session owner and the data plane
#[derive(Debug, Default)]
pub struct DataPlaneStats {
    frames_received: AtomicU64,
    frames_sent: AtomicU64,
    /// Datagrams of the wrong size
    discarded: AtomicU64,
    dropped_messages: AtomicU64,
    timeouts: AtomicU64,
    sequence_gaps: AtomicU64,
    sends_dropped: AtomicU64,
    last_id: Mutex<Option<u32>>,
}

/// Point-in-time copy of [`DataPlaneStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub frames_received: u64,
    pub frames_sent: u64,
    pub discarded: u64,
    pub dropped_messages: u64,
    pub timeouts: u64,
    pub sequence_gaps: u64,
    pub sends_dropped: u64,
}

impl DataPlaneStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a decoded inbound frame; returns `true` if its id broke the sequence
    pub fn record_frame(&self, id: u32) -> bool {
        self.frames_received.fetch_add(1, Ordering::Relaxed);

        let mut last = self.last_id.lock();
        let gap = matches!(*last, Some(prev) if prev.wrapping_add(1) != id);
        *last = Some(id);
        if gap {
            self.sequence_gaps.fetch_add(1, Ordering::Relaxed);
        }
        gap
    }

    pub fn record_discard(&self) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a receive timeout; returns the new timeout total
    pub fn record_timeout(&self) -> u64 {
        self.dropped_messages.fetch_add(1, Ordering::Relaxed);
        self.timeouts.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_send_dropped(&self) {
        self.sends_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            dropped_messages: self.dropped_messages.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            sequence_gaps: self.sequence_gaps.load(Ordering::Relaxed),
            sends_dropped: self.sends_dropped.load(Ordering::Relaxed),
        }
    }

    /// Clear all counters, e.g. between sessions
    pub fn reset(&self) {
        for counter in [
            &self.frames_received,
            &self.frames_sent,
            &self.discarded,
            &self.dropped_messages,
            &self.timeouts,
            &self.sequence_gaps,
            &self.sends_dropped,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        *self.last_id.lock() = None;
    }
}
