//! Process-wide event counters
//!
//! One writer (the probe reader, or the fake generator when the probe is
//! down) bumps these; everything else snapshots them. All counters are
//! monotonic u64s, so relaxed loads are fine; the signal conditioner
//! tolerates small cross-field tearing.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Totals {
    pub events_total: AtomicU64,
    pub events_dropped: AtomicU64,

    pub exec_total: AtomicU64,
    pub net_rx_bytes_total: AtomicU64,
    pub net_tx_bytes_total: AtomicU64,
    pub sched_switch_total: AtomicU64,
    pub blk_read_bytes_total: AtomicU64,
    pub blk_write_bytes_total: AtomicU64,
}

/// Point-in-time copy of [`Totals`], safe to hold across computation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TotalsSnapshot {
    pub events_total: u64,
    pub events_dropped: u64,
    pub exec_total: u64,
    pub net_rx_bytes_total: u64,
    pub net_tx_bytes_total: u64,
    pub sched_switch_total: u64,
    pub blk_read_bytes_total: u64,
    pub blk_write_bytes_total: u64,
}

impl Totals {
    pub fn snapshot(&self) -> TotalsSnapshot {
        TotalsSnapshot {
            events_total: self.events_total.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            exec_total: self.exec_total.load(Ordering::Relaxed),
            net_rx_bytes_total: self.net_rx_bytes_total.load(Ordering::Relaxed),
            net_tx_bytes_total: self.net_tx_bytes_total.load(Ordering::Relaxed),
            sched_switch_total: self.sched_switch_total.load(Ordering::Relaxed),
            blk_read_bytes_total: self.blk_read_bytes_total.load(Ordering::Relaxed),
            blk_write_bytes_total: self.blk_write_bytes_total.load(Ordering::Relaxed),
        }
    }

    /// Fold one probe sample's deltas into the totals.
    pub fn apply_sample(&self, s: &khor_common::SamplePayload) {
        self.exec_total.fetch_add(s.exec_count, Ordering::Relaxed);
        self.net_rx_bytes_total.fetch_add(s.net_rx_bytes, Ordering::Relaxed);
        self.net_tx_bytes_total.fetch_add(s.net_tx_bytes, Ordering::Relaxed);
        self.sched_switch_total.fetch_add(s.sched_switches, Ordering::Relaxed);
        self.blk_read_bytes_total.fetch_add(s.blk_read_bytes, Ordering::Relaxed);
        self.blk_write_bytes_total.fetch_add(s.blk_write_bytes, Ordering::Relaxed);
        self.events_dropped.fetch_add(s.lost_events, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_sample_accumulates() {
        let t = Totals::default();
        let s = khor_common::SamplePayload {
            exec_count: 2,
            net_rx_bytes: 1024,
            net_tx_bytes: 512,
            sched_switches: 9,
            blk_read_bytes: 4096,
            blk_write_bytes: 8192,
            blk_issue_count: 3,
            lost_events: 1,
        };
        t.apply_sample(&s);
        t.apply_sample(&s);

        let snap = t.snapshot();
        assert_eq!(snap.exec_total, 4);
        assert_eq!(snap.net_rx_bytes_total, 2048);
        assert_eq!(snap.sched_switch_total, 18);
        assert_eq!(snap.events_dropped, 2);
    }
}
