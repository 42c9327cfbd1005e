//! Signal conditioning: monotonic counters → perceptual 0..1 signals
//!
//! Consecutive totals snapshots become per-second rates, which are then
//! log-normalized against fixed anchors and exponentially smoothed. The
//! anchors are not calibrations; they shape a consistent dynamic range
//! across the several orders of magnitude the raw rates span.

use crate::metrics::TotalsSnapshot;
use serde::Serialize;

const ANCHOR_EXEC_S: f64 = 250.0;
const ANCHOR_RX_KBS: f64 = 50_000.0;
const ANCHOR_TX_KBS: f64 = 50_000.0;
const ANCHOR_CSW_S: f64 = 120_000.0;
const ANCHOR_IO_KBS: f64 = 80_000.0;

/// Per-second rates derived from two totals snapshots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SignalRates {
    pub exec_s: f64,
    pub rx_kbs: f64,
    pub tx_kbs: f64,
    pub csw_s: f64,
    pub blk_r_kbs: f64,
    pub blk_w_kbs: f64,
}

/// Bounded, smoothed signals in [0, 1].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Signal01 {
    pub exec: f64,
    pub rx: f64,
    pub tx: f64,
    pub csw: f64,
    pub io: f64,
}

impl Signal01 {
    pub fn activity(&self) -> f64 {
        self.exec.max(self.rx).max(self.tx).max(self.csw).max(self.io)
    }
}

fn clamp01(v: f64) -> f64 {
    v.clamp(0.0, 1.0)
}

fn norm_log(v: f64, anchor: f64) -> f64 {
    let v = v.max(0.0);
    let anchor = anchor.max(1e-9);
    clamp01(v.ln_1p() / anchor.ln_1p())
}

fn ema(prev: f64, x: f64, alpha01: f64) -> f64 {
    // alpha=0 -> no smoothing; the 0.98 cap keeps the signal from freezing
    // entirely even at alpha=1.
    let alpha = clamp01(alpha01) * 0.98;
    alpha * prev + (1.0 - alpha) * x
}

/// Converts monotonically increasing counters into rates and 0..1 signals.
#[derive(Debug, Default)]
pub struct SignalConditioner {
    prev: Option<TotalsSnapshot>,
    rates: SignalRates,
    value01: Signal01,
}

impl SignalConditioner {
    /// Advance by one sample. The first call only stores `cur` as the
    /// baseline and leaves both outputs at zero. `dt_s <= 0` is treated as
    /// 0.1 s so a frame is always produced without dividing by zero.
    pub fn update(&mut self, cur: TotalsSnapshot, dt_s: f64, smoothing01: f64) {
        let prev = match self.prev {
            Some(p) => p,
            None => {
                self.prev = Some(cur);
                self.rates = SignalRates::default();
                self.value01 = Signal01::default();
                return;
            }
        };

        let dt_s = if dt_s <= 0.0 { 0.1 } else { dt_s };

        let d = |cur: u64, prev: u64| cur.saturating_sub(prev) as f64;
        self.rates = SignalRates {
            exec_s: d(cur.exec_total, prev.exec_total) / dt_s,
            rx_kbs: d(cur.net_rx_bytes_total, prev.net_rx_bytes_total) / dt_s / 1024.0,
            tx_kbs: d(cur.net_tx_bytes_total, prev.net_tx_bytes_total) / dt_s / 1024.0,
            csw_s: d(cur.sched_switch_total, prev.sched_switch_total) / dt_s,
            blk_r_kbs: d(cur.blk_read_bytes_total, prev.blk_read_bytes_total) / dt_s / 1024.0,
            blk_w_kbs: d(cur.blk_write_bytes_total, prev.blk_write_bytes_total) / dt_s / 1024.0,
        };

        let exec01 = norm_log(self.rates.exec_s, ANCHOR_EXEC_S);
        let rx01 = norm_log(self.rates.rx_kbs, ANCHOR_RX_KBS);
        let tx01 = norm_log(self.rates.tx_kbs, ANCHOR_TX_KBS);
        let csw01 = norm_log(self.rates.csw_s, ANCHOR_CSW_S);
        let io01 = norm_log(self.rates.blk_r_kbs + self.rates.blk_w_kbs, ANCHOR_IO_KBS);

        self.value01 = Signal01 {
            exec: ema(self.value01.exec, exec01, smoothing01),
            rx: ema(self.value01.rx, rx01, smoothing01),
            tx: ema(self.value01.tx, tx01, smoothing01),
            csw: ema(self.value01.csw, csw01, smoothing01),
            io: ema(self.value01.io, io01, smoothing01),
        };

        self.prev = Some(cur);
    }

    pub fn rates(&self) -> SignalRates {
        self.rates
    }

    pub fn value01(&self) -> Signal01 {
        self.value01
    }
}
