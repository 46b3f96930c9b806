//! Countable anomaly events.
//!
//! High-frequency noise (unknown frames, dropped updates, checksum retries)
//! is counted, not logged per occurrence; a periodic timer dumps the nonzero
//! counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

#[derive(Default)]
pub struct AnomalyCounters {
    pub unknown_message: AtomicU64,
    pub malformed_message: AtomicU64,
    pub error_frame: AtomicU64,
    pub unknown_symbol: AtomicU64,
    pub dropped_sequence: AtomicU64,
    pub rejected_update: AtomicU64,
    pub crossed_book: AtomicU64,
    pub checksum_mismatch: AtomicU64,
    pub checksum_resubscribe: AtomicU64,
    pub price_band_anomaly: AtomicU64,
    pub stale_snapshot: AtomicU64,
    pub order_rejected: AtomicU64,
    pub unhandled_transition: AtomicU64,
}

impl AnomalyCounters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn entries(&self) -> [(&'static str, &AtomicU64); 13] {
        [
            ("unknown_message", &self.unknown_message),
            ("malformed_message", &self.malformed_message),
            ("error_frame", &self.error_frame),
            ("unknown_symbol", &self.unknown_symbol),
            ("dropped_sequence", &self.dropped_sequence),
            ("rejected_update", &self.rejected_update),
            ("crossed_book", &self.crossed_book),
            ("checksum_mismatch", &self.checksum_mismatch),
            ("checksum_resubscribe", &self.checksum_resubscribe),
            ("price_band_anomaly", &self.price_band_anomaly),
            ("stale_snapshot", &self.stale_snapshot),
            ("order_rejected", &self.order_rejected),
            ("unhandled_transition", &self.unhandled_transition),
        ]
    }

    /// Snapshot of all nonzero counters.
    pub fn nonzero(&self) -> Vec<(&'static str, u64)> {
        self.entries()
            .into_iter()
            .map(|(name, counter)| (name, counter.load(Ordering::Relaxed)))
            .filter(|(_, value)| *value > 0)
            .collect()
    }

    /// Log nonzero counters; wired to a periodic timer.
    pub fn dump(&self) {
        let nonzero = self.nonzero();
        if !nonzero.is_empty() {
            info!(?nonzero, "anomaly counters");
        }
    }
}

/// Increment helper; `Relaxed` is enough for statistics.
pub fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}
