//! Kernel probe collector
//!
//! Loads the compiled probe object, writes the config map, attaches the
//! tracepoints and drains the events ring buffer into the shared totals.
//! Every failure here is soft: the daemon keeps running and reports the
//! error through its health status. Attaching needs CAP_BPF/CAP_PERFMON or
//! root; that is the operator's concern.

use crate::metrics::Totals;
use aya::maps::{Array, MapData, RingBuf};
use aya::programs::TracePoint;
use aya::Ebpf;
use khor_common::{ProbeConfig, ProbeEvent, EVENT_KIND_SAMPLE};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

/// How long the poller may sleep when the ring is empty; bounds both event
/// latency and stop latency.
const POLL_IDLE: Duration = Duration::from_millis(50);

/// (program, tracepoint category, tracepoint name)
const TRACEPOINTS: &[(&str, &str, &str)] = &[
    ("khor_exec", "syscalls", "sys_enter_execve"),
    ("khor_net_rx", "net", "netif_receive_skb"),
    ("khor_net_tx", "net", "net_dev_queue"),
    ("khor_sched_switch", "sched", "sched_switch"),
    ("khor_block_issue", "block", "block_rq_issue"),
    ("khor_block_complete", "block", "block_rq_complete"),
];

/// Probe section of the config, already bounds-checked by the config layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSettings {
    pub enabled: bool,
    pub enabled_mask: u32,
    pub sample_interval_ms: u32,
    pub tgid_allow: u32,
    pub tgid_deny: u32,
    pub cgroup_id: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ProbeStatus {
    pub enabled: bool,
    pub ok: bool,
    pub err_code: i32,
    pub error: String,
}

impl ProbeSettings {
    fn to_wire(self) -> ProbeConfig {
        ProbeConfig {
            // All-bits-set means "everything", which the kernel side spells 0.
            enabled_mask: if self.enabled_mask == u32::MAX { 0 } else { self.enabled_mask },
            sample_interval_ms: self.sample_interval_ms,
            tgid_allow: self.tgid_allow,
            tgid_deny: self.tgid_deny,
            cgroup_id: self.cgroup_id,
        }
    }
}

struct Running {
    // Keeps the programs attached; links detach when this drops.
    _ebpf: Ebpf,
    cfg_map: Array<MapData, ProbeConfig>,
    stop: Arc<AtomicBool>,
    poller: Option<thread::JoinHandle<()>>,
}

#[derive(Default)]
pub struct ProbeCollector {
    running: Mutex<Option<Running>>,
    status: Mutex<ProbeStatus>,
}

impl ProbeCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Candidate locations for the compiled probe object, most specific
    /// first.
    fn object_candidates() -> Vec<PathBuf> {
        let mut out = Vec::new();
        if let Ok(p) = std::env::var("KHOR_BPF_OBJECT") {
            if !p.is_empty() {
                out.push(PathBuf::from(p));
            }
        }
        if let Ok(exe) = std::env::current_exe() {
            if let Some(dir) = exe.parent() {
                out.push(dir.join("khor-ebpf.o"));
            }
        }
        out.push(PathBuf::from("khor-ebpf/target/bpfel-unknown-none/release/khor-ebpf"));
        out
    }

    fn set_status(&self, enabled: bool, ok: bool, err_code: i32, error: &str) {
        *self.status.lock().unwrap() = ProbeStatus {
            enabled,
            ok,
            err_code,
            error: error.to_string(),
        };
    }

    pub fn status(&self) -> ProbeStatus {
        self.status.lock().unwrap().clone()
    }

    pub fn is_running(&self) -> bool {
        self.status.lock().unwrap().ok
    }

    /// Load, configure, attach and start polling. Failures leave the
    /// collector stopped with a populated status; only `enabled: false` is a
    /// successful no-op.
    pub fn start(
        &self,
        cfg: &ProbeSettings,
        totals: Arc<Totals>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.stop();

        if !cfg.enabled {
            self.set_status(false, false, 0, "disabled by config");
            return Ok(());
        }

        match self.try_start(cfg, totals) {
            Ok(running) => {
                *self.running.lock().unwrap() = Some(running);
                self.set_status(true, true, 0, "");
                info!("probe collector attached");
                Ok(())
            }
            Err(e) => {
                let msg = e.to_string();
                self.set_status(true, false, -1, &msg);
                Err(e)
            }
        }
    }

    fn try_start(
        &self,
        cfg: &ProbeSettings,
        totals: Arc<Totals>,
    ) -> Result<Running, Box<dyn std::error::Error + Send + Sync>> {
        let candidates = Self::object_candidates();
        let object = candidates
            .iter()
            .find(|p| p.exists())
            .ok_or_else(|| {
                format!(
                    "probe object not found (tried {}); set KHOR_BPF_OBJECT",
                    candidates
                        .iter()
                        .map(|p| p.display().to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                )
            })?;

        let mut ebpf = Ebpf::load_file(object)
            .map_err(|e| format!("probe load failed: {e} (need CAP_BPF/CAP_PERFMON or root)"))?;

        // Write the initial config before attaching so the very first event
        // already observes the desired filters.
        let cfg_map = ebpf
            .take_map("KHOR_CFG")
            .ok_or("probe config map not found")?;
        let mut cfg_map: Array<MapData, ProbeConfig> = Array::try_from(cfg_map)?;
        cfg_map.set(0, cfg.to_wire(), 0)?;

        for (prog_name, category, name) in TRACEPOINTS {
            let program = ebpf
                .program_mut(prog_name)
                .ok_or_else(|| format!("probe program {prog_name} not found"))?;
            let tp: &mut TracePoint = program.try_into()?;
            tp.load()?;
            tp.attach(category, name)
                .map_err(|e| format!("failed to attach {category}/{name}: {e}"))?;
        }

        let events = ebpf.take_map("EVENTS").ok_or("probe events map not found")?;
        let ring: RingBuf<MapData> = RingBuf::try_from(events)?;

        let stop = Arc::new(AtomicBool::new(false));
        let poller = {
            let stop = stop.clone();
            thread::Builder::new()
                .name("khor-probe".into())
                .spawn(move || poll_loop(ring, totals, stop))?
        };

        Ok(Running {
            _ebpf: ebpf,
            cfg_map,
            stop,
            poller: Some(poller),
        })
    }

    pub fn stop(&self) {
        let running = self.running.lock().unwrap().take();
        if let Some(mut running) = running {
            running.stop.store(true, Ordering::Release);
            if let Some(poller) = running.poller.take() {
                let _ = poller.join();
            }
            info!("probe collector detached");
        }
        let mut status = self.status.lock().unwrap();
        status.ok = false;
    }

    /// Live config update; safe while the poller runs. Mask, interval and
    /// filters apply to the next kernel-side event.
    pub fn apply_config(&self, cfg: &ProbeSettings) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut guard = self.running.lock().unwrap();
        let running = guard.as_mut().ok_or("probe not running")?;
        running.cfg_map.set(0, cfg.to_wire(), 0)?;
        Ok(())
    }
}

impl Drop for ProbeCollector {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Single consumer of the events ring. Drains everything available, then
/// naps briefly so stop latency stays within one poll period.
fn poll_loop(mut ring: RingBuf<MapData>, totals: Arc<Totals>, stop: Arc<AtomicBool>) {
    let mut bad_records = 0u64;
    while !stop.load(Ordering::Acquire) {
        let mut drained = false;
        while let Some(item) = ring.next() {
            drained = true;
            handle_record(&item, &totals, &mut bad_records);
        }
        if !drained {
            thread::sleep(POLL_IDLE);
        }
    }
}

fn handle_record(data: &[u8], totals: &Totals, bad_records: &mut u64) {
    if data.len() < std::mem::size_of::<ProbeEvent>() {
        // Rate-limited complaint; a short record means a layout mismatch.
        *bad_records += 1;
        if bad_records.is_power_of_two() {
            warn!(len = data.len(), count = *bad_records, "short probe record");
        }
        return;
    }

    // The ring hands back raw bytes; the layout is pinned by khor-common.
    let ev = unsafe { std::ptr::read_unaligned(data.as_ptr() as *const ProbeEvent) };

    totals.events_total.fetch_add(1, Ordering::Relaxed);
    if ev.kind == EVENT_KIND_SAMPLE {
        totals.apply_sample(&ev.sample);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_config_translates_all_mask() {
        let settings = ProbeSettings {
            enabled: true,
            enabled_mask: u32::MAX,
            sample_interval_ms: 200,
            tgid_allow: 0,
            tgid_deny: 0,
            cgroup_id: 0,
        };
        assert_eq!(settings.to_wire().enabled_mask, 0, "all-bits mask becomes kernel-side 0");

        let narrowed = ProbeSettings { enabled_mask: khor_common::PROBE_EXEC, ..settings };
        assert_eq!(narrowed.to_wire().enabled_mask, khor_common::PROBE_EXEC);
    }

    #[test]
    fn sample_records_accumulate_into_totals() {
        let totals = Totals::default();
        let ev = ProbeEvent {
            ts_ns: 1,
            pid: 2,
            tgid: 3,
            kind: EVENT_KIND_SAMPLE,
            cpu: 0,
            comm: [0; 16],
            sample: khor_common::SamplePayload {
                exec_count: 5,
                net_rx_bytes: 100,
                lost_events: 2,
                ..Default::default()
            },
        };
        let bytes: [u8; std::mem::size_of::<ProbeEvent>()] =
            unsafe { std::mem::transmute(ev) };

        let mut bad = 0u64;
        handle_record(&bytes, &totals, &mut bad);
        handle_record(&bytes, &totals, &mut bad);

        let snap = totals.snapshot();
        assert_eq!(snap.events_total, 2);
        assert_eq!(snap.exec_total, 10);
        assert_eq!(snap.net_rx_bytes_total, 200);
        assert_eq!(snap.events_dropped, 4);
        assert_eq!(bad, 0);
    }

    #[test]
    fn non_sample_records_only_bump_the_event_count() {
        let totals = Totals::default();
        let ev = ProbeEvent {
            ts_ns: 1,
            pid: 2,
            tgid: 3,
            kind: 99,
            cpu: 0,
            comm: [0; 16],
            sample: khor_common::SamplePayload {
                exec_count: 5,
                ..Default::default()
            },
        };
        let bytes: [u8; std::mem::size_of::<ProbeEvent>()] =
            unsafe { std::mem::transmute(ev) };

        let mut bad = 0u64;
        handle_record(&bytes, &totals, &mut bad);
        let snap = totals.snapshot();
        assert_eq!(snap.events_total, 1);
        assert_eq!(snap.exec_total, 0, "unknown kinds carry no counters");
    }

    #[test]
    fn short_records_are_rejected() {
        let totals = Totals::default();
        let mut bad = 0u64;
        handle_record(&[0u8; 8], &totals, &mut bad);
        assert_eq!(bad, 1);
        assert_eq!(totals.snapshot().events_total, 0);
    }

    #[test]
    fn missing_object_is_a_soft_failure() {
        std::env::set_var("KHOR_BPF_OBJECT", "/nonexistent/khor-ebpf.o");
        let collector = ProbeCollector::new();
        let settings = ProbeSettings {
            enabled: true,
            enabled_mask: u32::MAX,
            sample_interval_ms: 200,
            tgid_allow: 0,
            tgid_deny: 0,
            cgroup_id: 0,
        };
        let result = collector.start(&settings, Arc::new(Totals::default()));
        assert!(result.is_err());

        let status = collector.status();
        assert!(status.enabled);
        assert!(!status.ok);
        assert!(!status.error.is_empty());
        std::env::remove_var("KHOR_BPF_OBJECT");
    }

    #[test]
    fn disabled_probe_is_a_successful_noop() {
        let collector = ProbeCollector::new();
        let settings = ProbeSettings {
            enabled: false,
            enabled_mask: 0,
            sample_interval_ms: 200,
            tgid_allow: 0,
            tgid_deny: 0,
            cgroup_id: 0,
        };
        collector
            .start(&settings, Arc::new(Totals::default()))
            .expect("disabled probe should not error");
        assert!(!collector.status().ok);
        assert_eq!(collector.status().error, "disabled by config");
    }
}
