//! In-kernel probe programs
//!
//! Six tracepoints feed one per-CPU accumulator. Each hit passes filter
//! admission, bumps its counter, and may flush: when the configured interval
//! has elapsed and anything accumulated, the accumulator is emitted as one
//! fixed-size sample record on the events ring buffer and reset. A failed
//! ring reservation bumps `lost_events`, reported on the next flush.
//!
//! Per-CPU accumulation keeps the hot paths free of cross-CPU atomics; the
//! userspace reader reconstructs global totals by summing the deltas.

#![no_std]
#![no_main]

use aya_ebpf::{
    helpers::{
        bpf_get_current_cgroup_id, bpf_get_current_comm, bpf_get_current_pid_tgid,
        bpf_get_smp_processor_id, bpf_ktime_get_ns,
    },
    macros::{map, tracepoint},
    maps::{Array, PerCpuArray, RingBuf},
    programs::TracePointContext,
};
use khor_common::{
    ProbeConfig, ProbeEvent, SamplePayload, EVENTS_RINGBUF_BYTES, EVENT_KIND_SAMPLE, PROBE_BLOCK,
    PROBE_EXEC, PROBE_NET, PROBE_SCHED,
};

const ALL_CLASSES: u32 = PROBE_EXEC | PROBE_NET | PROBE_SCHED | PROBE_BLOCK;
const DEFAULT_INTERVAL_MS: u64 = 200;

// Tracepoint field offsets past the common header.
const NET_DEV_LEN_OFFSET: usize = 16; // net:net_dev_template -> len
const BLOCK_NR_SECTOR_OFFSET: usize = 24; // block:block_rq_completion -> nr_sector
const BLOCK_RWBS_OFFSET: usize = 32; // block:block_rq_completion -> rwbs[8]

#[map]
static EVENTS: RingBuf = RingBuf::with_byte_size(EVENTS_RINGBUF_BYTES, 0);

#[map]
static KHOR_CFG: Array<ProbeConfig> = Array::with_max_entries(1, 0);

#[repr(C)]
struct CpuAccum {
    last_flush_ns: u64,
    acc: SamplePayload,
}

#[map]
static ACCUM: PerCpuArray<CpuAccum> = PerCpuArray::with_max_entries(1, 0);

fn config() -> ProbeConfig {
    KHOR_CFG.get(0).copied().unwrap_or_default()
}

fn enabled_mask(cfg: &ProbeConfig) -> u32 {
    if cfg.enabled_mask == 0 {
        ALL_CLASSES
    } else {
        cfg.enabled_mask
    }
}

fn interval_ns(cfg: &ProbeConfig) -> u64 {
    let ms = if cfg.sample_interval_ms == 0 {
        DEFAULT_INTERVAL_MS
    } else {
        cfg.sample_interval_ms as u64
    };
    ms * 1_000_000
}

/// Filter admission happens before any accumulation.
fn pass_filters(cfg: &ProbeConfig) -> bool {
    let tgid = (bpf_get_current_pid_tgid() >> 32) as u32;

    if cfg.tgid_allow != 0 && tgid != cfg.tgid_allow {
        return false;
    }
    if cfg.tgid_deny != 0 && tgid == cfg.tgid_deny {
        return false;
    }
    if cfg.cgroup_id != 0 && unsafe { bpf_get_current_cgroup_id() } != cfg.cgroup_id {
        return false;
    }
    true
}

fn emit_sample(acc: &mut CpuAccum, now: u64) {
    let Some(mut entry) = EVENTS.reserve::<ProbeEvent>(0) else {
        acc.acc.lost_events += 1;
        return;
    };

    let pid_tgid = bpf_get_current_pid_tgid();
    entry.write(ProbeEvent {
        ts_ns: now,
        pid: pid_tgid as u32,
        tgid: (pid_tgid >> 32) as u32,
        kind: EVENT_KIND_SAMPLE,
        cpu: unsafe { bpf_get_smp_processor_id() },
        comm: bpf_get_current_comm().unwrap_or([0; 16]),
        sample: acc.acc,
    });
    entry.submit(0);
}

fn maybe_flush(acc: &mut CpuAccum, cfg: &ProbeConfig, now: u64) {
    if acc.last_flush_ns == 0 {
        acc.last_flush_ns = now;
        return;
    }
    if now - acc.last_flush_ns < interval_ns(cfg) {
        return;
    }

    if acc.acc.any() {
        emit_sample(acc, now);
    }

    acc.acc = SamplePayload::default();
    acc.last_flush_ns = now;
}

/// Shared tail of every tracepoint: admission, accumulate, maybe flush.
fn record(class: u32, update: impl FnOnce(&mut SamplePayload)) {
    let cfg = config();
    if !pass_filters(&cfg) {
        return;
    }
    if enabled_mask(&cfg) & class == 0 {
        return;
    }

    let Some(acc) = ACCUM.get_ptr_mut(0) else {
        return;
    };
    let acc = unsafe { &mut *acc };

    update(&mut acc.acc);
    maybe_flush(acc, &cfg, unsafe { bpf_ktime_get_ns() });
}

#[tracepoint]
pub fn khor_exec(_ctx: TracePointContext) -> u32 {
    record(PROBE_EXEC, |acc| acc.exec_count += 1);
    0
}

#[tracepoint]
pub fn khor_net_rx(ctx: TracePointContext) -> u32 {
    let len = unsafe { ctx.read_at::<u32>(NET_DEV_LEN_OFFSET) }.unwrap_or(0);
    record(PROBE_NET, |acc| acc.net_rx_bytes += len as u64);
    0
}

#[tracepoint]
pub fn khor_net_tx(ctx: TracePointContext) -> u32 {
    let len = unsafe { ctx.read_at::<u32>(NET_DEV_LEN_OFFSET) }.unwrap_or(0);
    record(PROBE_NET, |acc| acc.net_tx_bytes += len as u64);
    0
}

#[tracepoint]
pub fn khor_sched_switch(_ctx: TracePointContext) -> u32 {
    record(PROBE_SCHED, |acc| acc.sched_switches += 1);
    0
}

#[tracepoint]
pub fn khor_block_issue(_ctx: TracePointContext) -> u32 {
    record(PROBE_BLOCK, |acc| acc.blk_issue_count += 1);
    0
}

#[tracepoint]
pub fn khor_block_complete(ctx: TracePointContext) -> u32 {
    let nr_sector = unsafe { ctx.read_at::<u32>(BLOCK_NR_SECTOR_OFFSET) }.unwrap_or(0);
    // rwbs is a short string like "R", "W", "WS".
    let rwbs = unsafe { ctx.read_at::<[u8; 8]>(BLOCK_RWBS_OFFSET) }.unwrap_or([0; 8]);
    let bytes = nr_sector as u64 * 512;

    record(PROBE_BLOCK, |acc| match rwbs[0] {
        b'R' => acc.blk_read_bytes += bytes,
        b'W' => acc.blk_write_bytes += bytes,
        _ => {}
    });
    0
}

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}

#[link_section = "license"]
#[no_mangle]
static LICENSE: [u8; 13] = *b"Dual BSD/GPL\0";
