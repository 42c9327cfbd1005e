//! Wire types shared between the khor kernel probe and userspace.
//!
//! Everything here is `#[repr(C)]` and fixed-size: the probe writes these
//! records into a ring buffer and an array map, and the daemon reads them
//! back, so both compilation domains must agree on the exact byte layout.
//! No pointers, no implicit padding.

#![cfg_attr(not(feature = "userspace"), no_std)]

/// Probe class bits for [`ProbeConfig::enabled_mask`].
pub const PROBE_EXEC: u32 = 1 << 0;
pub const PROBE_NET: u32 = 1 << 1;
pub const PROBE_SCHED: u32 = 1 << 2;
pub const PROBE_BLOCK: u32 = 1 << 3;

/// Event kind carried in [`ProbeEvent::kind`]. Only the aggregate sample
/// record exists; per-event kinds from earlier revisions are gone.
pub const EVENT_KIND_SAMPLE: u32 = 4;

/// Ring buffer size in bytes (16 MiB).
pub const EVENTS_RINGBUF_BYTES: u32 = 1 << 24;

/// Counter deltas accumulated per CPU since the previous flush.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SamplePayload {
    pub exec_count: u64,
    pub net_rx_bytes: u64,
    pub net_tx_bytes: u64,
    pub sched_switches: u64,
    pub blk_read_bytes: u64,
    pub blk_write_bytes: u64,
    pub blk_issue_count: u64,
    /// Ring-buffer reservation failures since the last successful flush.
    pub lost_events: u64,
}

impl SamplePayload {
    /// True when at least one field carries data worth flushing.
    pub fn any(&self) -> bool {
        self.exec_count != 0
            || self.net_rx_bytes != 0
            || self.net_tx_bytes != 0
            || self.sched_switches != 0
            || self.blk_read_bytes != 0
            || self.blk_write_bytes != 0
            || self.blk_issue_count != 0
            || self.lost_events != 0
    }
}

/// One fixed-size record on the events ring buffer.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct ProbeEvent {
    pub ts_ns: u64,
    pub pid: u32,
    pub tgid: u32,
    pub kind: u32,
    pub cpu: u32,
    /// Command name of the task that triggered the flush, null-padded.
    pub comm: [u8; 16],
    pub sample: SamplePayload,
}

/// Value of the single-entry "KHOR_CFG" array map (userspace → kernel).
///
/// `enabled_mask == 0` means all classes; `sample_interval_ms == 0` means the
/// default 200 ms. Zero filter fields disable the respective filter.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProbeConfig {
    pub enabled_mask: u32,
    pub sample_interval_ms: u32,
    pub tgid_allow: u32,
    pub tgid_deny: u32,
    pub cgroup_id: u64,
}

// Layout must match bit-exactly across the two compilation domains.
const _: () = assert!(core::mem::size_of::<SamplePayload>() == 64);
const _: () = assert!(core::mem::size_of::<ProbeEvent>() == 104);
const _: () = assert!(core::mem::align_of::<ProbeEvent>() == 8);
const _: () = assert!(core::mem::size_of::<ProbeConfig>() == 24);

#[cfg(feature = "userspace")]
unsafe impl aya::Pod for SamplePayload {}

#[cfg(feature = "userspace")]
unsafe impl aya::Pod for ProbeEvent {}

#[cfg(feature = "userspace")]
unsafe impl aya::Pod for ProbeConfig {}
