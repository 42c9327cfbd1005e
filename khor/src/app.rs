//! Coordinator: lifecycles, periodic loops, control surface
//!
//! Owns every component, the three periodic loops (sampler, sequencer, fake
//! generator) and one shared stop flag. Each loop observes the flag at its
//! natural suspension point, so stopping completes within one period without
//! ever touching the audio callback. The control-surface operations here are
//! what the HTTP layer routes to.

use crate::audio::{AudioDeviceInfo, AudioEngine, AudioSettings};
use crate::config::Config;
use crate::metrics::{Totals, TotalsSnapshot};
use crate::midi_out::MidiSink;
use crate::music::{MusicConfig, MusicEngine, NoteEvent};
use crate::osc_out::OscSink;
use crate::probe::{ProbeCollector, ProbeSettings};
use crate::signals::{Signal01, SignalConditioner, SignalRates};
use crate::sync::AtomicF64;
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

const SAMPLER_PERIOD: Duration = Duration::from_millis(100);
const FAKE_PERIOD: Duration = Duration::from_millis(250);
const HISTORY_CAP: usize = 600;

/// (name, density, smoothing, hint)
const PRESETS: &[(&str, f64, f64, &str)] = &[
    ("ambient", 0.20, 0.92, "slow, sparse, more reverb"),
    ("percussive", 0.80, 0.35, "tight envelope, scheduler-driven rhythm"),
    ("arp", 0.55, 0.60, "network-driven arpeggio + exec stabs"),
    ("drone", 0.10, 0.95, "IO controls timbre; sustained tones"),
];

/// Hot controls, readable from any loop without taking the config lock.
struct Controls {
    bpm: AtomicF64,
    key_midi: AtomicU8,
    density: AtomicF64,
    smoothing: AtomicF64,
}

#[derive(Debug, Default)]
struct SigState {
    conditioner: SignalConditioner,
    rates: SignalRates,
    value01: Signal01,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct HistSample {
    pub ts_ms: u64,
    #[serde(flatten)]
    pub rates: SignalRates,
}

#[derive(Debug, Serialize)]
pub struct ControlsSnapshot {
    pub bpm: f64,
    pub key_midi: u8,
    pub density: f64,
    pub smoothing: f64,
}

#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    pub ts_ms: u64,
    pub totals: TotalsSnapshot,
    pub rates: SignalRates,
    pub controls: ControlsSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<HistSample>>,
}

#[derive(Debug, Serialize)]
pub struct AudioHealth {
    pub enabled: bool,
    pub ok: bool,
    pub backend: String,
    pub device: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct MidiHealth {
    pub enabled: bool,
    pub ok: bool,
    pub port: String,
    pub channel: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct OscHealth {
    pub enabled: bool,
    pub ok: bool,
    pub host: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ProbeHealth {
    pub enabled: bool,
    pub ok: bool,
    pub err_code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct FeatureEcho {
    pub fake: bool,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub ts_ms: u64,
    pub config_path: String,
    pub audio: AudioHealth,
    pub midi: MidiHealth,
    pub osc: OscHealth,
    pub bpf: ProbeHealth,
    pub features: FeatureEcho,
}

#[derive(Debug, Serialize)]
pub struct PresetInfo {
    pub name: String,
    pub hint: String,
}

#[derive(Debug, Serialize)]
pub struct PresetsResponse {
    pub presets: Vec<PresetInfo>,
}

#[derive(Debug, Serialize)]
pub struct ConfigPutResponse {
    pub ok: bool,
    pub restart_required: bool,
    #[serde(flatten)]
    pub config: Config,
}

/// Control-surface failure, carrying the HTTP status the thin layer should
/// answer with.
#[derive(Debug)]
pub struct ApiError {
    pub status: u16,
    pub message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self { status: 400, message: message.into() }
    }

    fn conflict(message: impl Into<String>) -> Self {
        Self { status: 409, message: message.into() }
    }
}

pub struct App {
    config_path: PathBuf,
    cfg: Mutex<Config>,
    controls: Controls,
    totals: Arc<Totals>,

    audio: AudioEngine,
    audio_err: Mutex<String>,
    midi: MidiSink,
    midi_err: Mutex<String>,
    osc: OscSink,
    osc_err: Mutex<String>,
    probe: ProbeCollector,

    sig: Mutex<SigState>,
    history: Mutex<VecDeque<HistSample>>,

    stop: Arc<AtomicBool>,
    running: AtomicBool,
    fake_running: Arc<AtomicBool>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

fn unix_ms_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn audio_settings(cfg: &Config) -> AudioSettings {
    AudioSettings {
        backend: cfg.audio.backend.clone(),
        device: cfg.audio.device.clone(),
        sample_rate: cfg.audio.sample_rate,
        master_gain: cfg.audio.master_gain,
    }
}

fn probe_settings(cfg: &Config) -> ProbeSettings {
    ProbeSettings {
        enabled: cfg.features.bpf,
        enabled_mask: cfg.bpf.enabled_mask,
        sample_interval_ms: cfg.bpf.sample_interval_ms,
        tgid_allow: cfg.bpf.tgid_allow,
        tgid_deny: cfg.bpf.tgid_deny,
        cgroup_id: cfg.bpf.cgroup_id,
    }
}

impl App {
    pub fn new(config_path: PathBuf, cfg: Config) -> Arc<Self> {
        let controls = Controls {
            bpm: AtomicF64::new(cfg.music.bpm),
            key_midi: AtomicU8::new(cfg.music.key_midi),
            density: AtomicF64::new(cfg.music.density),
            smoothing: AtomicF64::new(cfg.music.smoothing),
        };
        Arc::new(Self {
            config_path,
            cfg: Mutex::new(cfg),
            controls,
            totals: Arc::new(Totals::default()),
            audio: AudioEngine::new(),
            audio_err: Mutex::new(String::new()),
            midi: MidiSink::new(),
            midi_err: Mutex::new(String::new()),
            osc: OscSink::new(),
            osc_err: Mutex::new(String::new()),
            probe: ProbeCollector::new(),
            sig: Mutex::new(SigState::default()),
            history: Mutex::new(VecDeque::new()),
            stop: Arc::new(AtomicBool::new(false)),
            running: AtomicBool::new(false),
            fake_running: Arc::new(AtomicBool::new(false)),
            threads: Mutex::new(Vec::new()),
        })
    }

    pub fn config_path(&self) -> &PathBuf {
        &self.config_path
    }

    pub fn config_snapshot(&self) -> Config {
        self.cfg.lock().unwrap().clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop.store(false, Ordering::Release);

        let cfg = self.config_snapshot();
        self.controls.bpm.store(cfg.music.bpm);
        self.controls.key_midi.store(cfg.music.key_midi, Ordering::Release);
        self.controls.density.store(cfg.music.density);
        self.controls.smoothing.store(cfg.music.smoothing);

        // Sink and probe failures are soft: they land in health, the rest of
        // the daemon keeps going.
        if cfg.features.audio {
            self.start_audio(&cfg);
        }
        if cfg.features.midi {
            self.start_midi(&cfg);
        }
        if cfg.features.osc {
            self.start_osc(&cfg);
        }
        if let Err(e) = self.probe.start(&probe_settings(&cfg), self.totals.clone()) {
            warn!("probe unavailable: {e}");
        }

        if cfg.features.fake && !self.probe.status().ok {
            self.spawn_fake();
        }

        let mut threads = self.threads.lock().unwrap();
        {
            let app = self.clone();
            threads.push(
                thread::Builder::new()
                    .name("khor-sampler".into())
                    .spawn(move || app.sampler_loop())
                    .expect("spawn sampler thread"),
            );
        }
        {
            let app = self.clone();
            threads.push(
                thread::Builder::new()
                    .name("khor-sequencer".into())
                    .spawn(move || app.sequencer_loop())
                    .expect("spawn sequencer thread"),
            );
        }
        info!("app started");
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.stop.store(true, Ordering::Release);
        self.fake_running.store(false, Ordering::Release);

        let threads: Vec<_> = self.threads.lock().unwrap().drain(..).collect();
        for t in threads {
            let _ = t.join();
        }

        self.probe.stop();
        self.osc.stop();
        self.midi.stop();
        self.audio.stop();
        info!("app stopped");
    }

    fn start_audio(&self, cfg: &Config) {
        match self.audio.start(&audio_settings(cfg)) {
            Ok(()) => self.audio_err.lock().unwrap().clear(),
            Err(e) => {
                warn!("audio unavailable: {e}");
                *self.audio_err.lock().unwrap() = e.to_string();
            }
        }
    }

    fn start_midi(&self, cfg: &Config) {
        match self.midi.start(&cfg.midi.port, cfg.midi.channel) {
            Ok(()) => self.midi_err.lock().unwrap().clear(),
            Err(e) => {
                warn!("midi unavailable: {e}");
                *self.midi_err.lock().unwrap() = e.to_string();
            }
        }
    }

    fn start_osc(&self, cfg: &Config) {
        match self.osc.start(&cfg.osc.host, cfg.osc.port) {
            Ok(()) => self.osc_err.lock().unwrap().clear(),
            Err(e) => {
                warn!("osc unavailable: {e}");
                *self.osc_err.lock().unwrap() = e.to_string();
            }
        }
    }

    fn spawn_fake(&self) {
        if self.fake_running.swap(true, Ordering::AcqRel) {
            return;
        }
        let totals = self.totals.clone();
        let stop = self.stop.clone();
        let fake_running = self.fake_running.clone();
        let handle = thread::Builder::new()
            .name("khor-fake".into())
            .spawn(move || fake_loop(totals, stop, fake_running))
            .expect("spawn fake thread");
        self.threads.lock().unwrap().push(handle);
        info!("fake metrics generator active");
    }

    fn sampler_loop(&self) {
        let mut last = Instant::now();
        while !self.stop.load(Ordering::Acquire) {
            thread::sleep(SAMPLER_PERIOD);
            let now = Instant::now();
            let dt_s = now.duration_since(last).as_secs_f64();
            last = now;

            let totals = self.totals.snapshot();
            let smoothing = self.controls.smoothing.load().clamp(0.0, 1.0);

            let rates = {
                let mut sig = self.sig.lock().unwrap();
                sig.conditioner.update(totals, dt_s, smoothing);
                sig.rates = sig.conditioner.rates();
                sig.value01 = sig.conditioner.value01();
                sig.rates
            };

            let mut history = self.history.lock().unwrap();
            history.push_back(HistSample { ts_ms: unix_ms_now(), rates });
            while history.len() > HISTORY_CAP {
                history.pop_front();
            }
        }
    }

    fn sequencer_loop(&self) {
        let mut engine = MusicEngine::default();
        let mut osc_signal_tick = 0u32;
        let mut osc_metrics_tick = 0u32;
        let mut next = Instant::now();

        while !self.stop.load(Ordering::Acquire) {
            let bpm = self.controls.bpm.load();
            let tick_ms = MusicEngine::tick_ms(bpm);
            next += Duration::from_secs_f64(tick_ms / 1000.0);
            let now = Instant::now();
            match next.checked_duration_since(now) {
                Some(wait) => thread::sleep(wait),
                None => next = now, // fell behind; resync rather than burst
            }
            if self.stop.load(Ordering::Acquire) {
                break;
            }

            let cfg = self.config_snapshot();
            let (s01, rates) = {
                let sig = self.sig.lock().unwrap();
                (sig.value01, sig.rates)
            };

            let mc = MusicConfig {
                bpm,
                key_midi: self.controls.key_midi.load(Ordering::Relaxed),
                scale: cfg.music.scale.clone(),
                preset: cfg.music.preset.clone(),
                density: self.controls.density.load().clamp(0.0, 1.0),
            };

            let frame = engine.tick(&s01, &mc);

            if cfg.features.audio && self.audio.is_running() {
                self.audio.set_filter(frame.synth.cutoff01, frame.synth.resonance01);
                self.audio.set_fx(frame.synth.delay_mix01, frame.synth.reverb_mix01);
            }

            for note in &frame.notes {
                if cfg.features.audio && self.audio.is_running() {
                    self.audio.submit_note(*note);
                }
                if cfg.features.midi && self.midi.is_running() {
                    self.midi.send_note(note);
                }
                if cfg.features.osc && self.osc.is_running() {
                    self.osc.send_note(note);
                }
            }

            if cfg.features.midi && self.midi.is_running() {
                self.midi.send_signals_cc(&s01, frame.synth.cutoff01);
            }

            if cfg.features.osc && self.osc.is_running() {
                // Throttle the telemetry spam.
                if osc_signal_tick & 3 == 0 {
                    self.osc.send_signals(&s01);
                }
                osc_signal_tick = osc_signal_tick.wrapping_add(1);
                if osc_metrics_tick & 7 == 0 {
                    self.osc.send_metrics(&rates);
                }
                osc_metrics_tick = osc_metrics_tick.wrapping_add(1);
            }
        }
    }

    // ---- control surface ----

    pub fn api_health(&self) -> HealthResponse {
        let cfg = self.config_snapshot();
        let probe_status = self.probe.status();

        let non_empty = |s: String| if s.is_empty() { None } else { Some(s) };

        HealthResponse {
            ts_ms: unix_ms_now(),
            config_path: self.config_path.display().to_string(),
            audio: AudioHealth {
                enabled: cfg.features.audio,
                ok: self.audio.is_running(),
                backend: {
                    let b = self.audio.backend_name();
                    if b.is_empty() { "none".into() } else { b }
                },
                device: {
                    let d = self.audio.device_name();
                    if d.is_empty() { "none".into() } else { d }
                },
                error: non_empty(self.audio_err.lock().unwrap().clone()),
            },
            midi: MidiHealth {
                enabled: cfg.features.midi,
                ok: self.midi.is_running(),
                port: cfg.midi.port.clone(),
                channel: cfg.midi.channel,
                error: non_empty(self.midi_err.lock().unwrap().clone()),
            },
            osc: OscHealth {
                enabled: cfg.features.osc,
                ok: self.osc.is_running(),
                host: cfg.osc.host.clone(),
                port: cfg.osc.port,
                error: non_empty(self.osc_err.lock().unwrap().clone()),
            },
            bpf: ProbeHealth {
                enabled: cfg.features.bpf,
                ok: probe_status.ok,
                err_code: probe_status.err_code,
                error: non_empty(probe_status.error),
            },
            features: FeatureEcho { fake: cfg.features.fake },
        }
    }

    pub fn api_metrics(&self, include_history: bool) -> MetricsResponse {
        let rates = self.sig.lock().unwrap().rates;
        MetricsResponse {
            ts_ms: unix_ms_now(),
            totals: self.totals.snapshot(),
            rates,
            controls: ControlsSnapshot {
                bpm: self.controls.bpm.load(),
                key_midi: self.controls.key_midi.load(Ordering::Relaxed),
                density: self.controls.density.load(),
                smoothing: self.controls.smoothing.load(),
            },
            history: include_history
                .then(|| self.history.lock().unwrap().iter().copied().collect()),
        }
    }

    pub fn api_presets(&self) -> PresetsResponse {
        PresetsResponse {
            presets: PRESETS
                .iter()
                .map(|(name, _, _, hint)| PresetInfo {
                    name: (*name).into(),
                    hint: (*hint).into(),
                })
                .collect(),
        }
    }

    pub fn api_select_preset(&self, name: &str) -> Result<(), ApiError> {
        let Some((_, density, smoothing, _)) = PRESETS.iter().find(|(n, ..)| *n == name) else {
            return Err(ApiError::bad_request(format!("unknown preset: {name}")));
        };

        let next = {
            let mut cfg = self.cfg.lock().unwrap();
            cfg.music.preset = name.to_string();
            cfg.music.density = *density;
            cfg.music.smoothing = *smoothing;
            cfg.clone()
        };
        self.controls.density.store(*density);
        self.controls.smoothing.store(*smoothing);

        self.persist(&next);
        Ok(())
    }

    pub fn api_test_note(&self, midi: i32, vel: f64, dur_s: f64) -> Result<(), ApiError> {
        let ev = NoteEvent {
            midi: midi.clamp(0, 127) as u8,
            velocity: vel.clamp(0.0, 1.0) as f32,
            dur_s: dur_s.clamp(0.02, 3.0) as f32,
        };

        let cfg = self.config_snapshot();
        let mut any = false;
        if cfg.features.audio && self.audio.is_running() {
            self.audio.submit_note(ev);
            any = true;
        }
        if cfg.features.midi && self.midi.is_running() {
            self.midi.send_note(&ev);
            any = true;
        }
        if cfg.features.osc && self.osc.is_running() {
            self.osc.send_note(&ev);
            any = true;
        }

        if any {
            Ok(())
        } else {
            Err(ApiError::conflict("no outputs enabled/available for test_note"))
        }
    }

    pub fn api_audio_devices(&self) -> Result<Vec<AudioDeviceInfo>, ApiError> {
        let cfg = self.config_snapshot();
        AudioEngine::enumerate_devices(&cfg.audio.backend)
            .map_err(|e| ApiError { status: 500, message: e.to_string() })
    }

    pub fn api_audio_set_device(&self, device: &str) -> Result<(), ApiError> {
        let next = {
            let mut cfg = self.cfg.lock().unwrap();
            cfg.audio.device = device.to_string();
            cfg.clone()
        };
        self.persist(&next);

        if next.features.audio {
            match self.audio.restart(&audio_settings(&next)) {
                Ok(()) => self.audio_err.lock().unwrap().clear(),
                Err(e) => {
                    *self.audio_err.lock().unwrap() = e.to_string();
                }
            }
        }
        Ok(())
    }

    /// Deep-merge `patch` onto the current config, revalidate, live-apply,
    /// persist. Returns the full post-patch config plus whether a daemon
    /// restart is needed for the rest.
    pub fn api_put_config(&self, patch: &Value) -> Result<ConfigPutResponse, ApiError> {
        let prev = self.config_snapshot();
        let next = prev.merged_with(patch).map_err(ApiError::bad_request)?;

        let restart_required = prev.listen != next.listen || prev.ui != next.ui;

        // Always live: the music controls.
        self.controls.bpm.store(next.music.bpm);
        self.controls.key_midi.store(next.music.key_midi, Ordering::Release);
        self.controls.density.store(next.music.density);
        self.controls.smoothing.store(next.music.smoothing);

        // Audio: gain is hot; backend/device/rate need a device restart.
        self.audio.set_master_gain(next.audio.master_gain);
        let audio_enable_changed = prev.features.audio != next.features.audio;
        let audio_restart_needed = prev.audio.backend != next.audio.backend
            || prev.audio.sample_rate != next.audio.sample_rate
            || prev.audio.device != next.audio.device;
        if audio_enable_changed {
            if next.features.audio {
                self.start_audio(&next);
            } else {
                self.audio.stop();
            }
        } else if next.features.audio && audio_restart_needed {
            match self.audio.restart(&audio_settings(&next)) {
                Ok(()) => self.audio_err.lock().unwrap().clear(),
                Err(e) => *self.audio_err.lock().unwrap() = e.to_string(),
            }
        }

        // MIDI: any change recycles the port.
        let midi_changed = prev.features.midi != next.features.midi
            || prev.midi != next.midi;
        if midi_changed {
            self.midi.stop();
            if next.features.midi {
                self.start_midi(&next);
            }
        }

        // OSC: any change recycles the socket.
        let osc_changed = prev.features.osc != next.features.osc || prev.osc != next.osc;
        if osc_changed {
            self.osc.stop();
            if next.features.osc {
                self.start_osc(&next);
            }
        }

        // Probe: enable toggles restart it; mask/interval/filters hot-apply.
        if prev.features.bpf != next.features.bpf {
            self.probe.stop();
            if let Err(e) = self.probe.start(&probe_settings(&next), self.totals.clone()) {
                warn!("probe unavailable: {e}");
            }
        } else if next.features.bpf && prev.bpf != next.bpf {
            if let Err(e) = self.probe.apply_config(&probe_settings(&next)) {
                warn!("probe config update failed: {e}");
            }
        }

        // Fake generator follows probe availability.
        let want_fake = next.features.fake && !self.probe.status().ok;
        if want_fake {
            self.spawn_fake();
        } else {
            self.fake_running.store(false, Ordering::Release);
        }

        {
            let mut cfg = self.cfg.lock().unwrap();
            *cfg = next.clone();
        }
        self.persist(&next);

        Ok(ConfigPutResponse { ok: true, restart_required, config: next })
    }

    fn persist(&self, cfg: &Config) {
        if let Err(e) = cfg.save(&self.config_path) {
            warn!("failed to persist config to {}: {e}", self.config_path.display());
        }
    }
}

impl Drop for App {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Synthetic totals so the system stays audible with no probe attached.
fn fake_loop(totals: Arc<Totals>, stop: Arc<AtomicBool>, fake_running: Arc<AtomicBool>) {
    let mut rng = rand::thread_rng();
    while !stop.load(Ordering::Acquire) && fake_running.load(Ordering::Acquire) {
        thread::sleep(FAKE_PERIOD);
        totals.exec_total.fetch_add(1, Ordering::Relaxed);
        totals
            .net_rx_bytes_total
            .fetch_add(1000 + rng.gen_range(0..60_000), Ordering::Relaxed);
        totals
            .net_tx_bytes_total
            .fetch_add(1000 + rng.gen_range(0..40_000), Ordering::Relaxed);
        totals
            .sched_switch_total
            .fetch_add(5 + rng.gen_range(0..200), Ordering::Relaxed);
        totals
            .blk_read_bytes_total
            .fetch_add(4096 * rng.gen_range(0..8), Ordering::Relaxed);
        totals
            .blk_write_bytes_total
            .fetch_add(4096 * rng.gen_range(0..6), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_config_path(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("khor-app-test-{}-{}.json", std::process::id(), name));
        p
    }

    fn offline_config() -> Config {
        let mut cfg = Config::default();
        cfg.features.audio = false;
        cfg.features.bpf = false;
        cfg.features.midi = false;
        cfg.features.osc = false;
        cfg
    }

    #[test]
    fn preset_select_updates_controls_and_persists() {
        let path = temp_config_path("preset");
        let app = App::new(path.clone(), offline_config());

        app.api_select_preset("percussive").unwrap();
        let metrics = app.api_metrics(false);
        assert_eq!(metrics.controls.density, 0.80);
        assert_eq!(metrics.controls.smoothing, 0.35);

        let persisted = Config::load(&path).unwrap();
        assert_eq!(persisted.music.preset, "percussive");
        assert_eq!(persisted.music.density, 0.80);
        assert_eq!(persisted.music.smoothing, 0.35);

        assert!(app.api_select_preset("nope").is_err());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_note_fails_with_no_sinks() {
        let app = App::new(temp_config_path("nosink"), offline_config());
        let err = app.api_test_note(64, 0.5, 0.5).unwrap_err();
        assert_eq!(err.status, 409);
    }

    #[test]
    fn put_config_flags_listen_changes_as_restart_required() {
        let path = temp_config_path("putcfg");
        let app = App::new(path.clone(), offline_config());

        let resp = app
            .api_put_config(&json!({"music": {"bpm": 140.0}}))
            .unwrap();
        assert!(!resp.restart_required);
        assert_eq!(resp.config.music.bpm, 140.0);
        assert_eq!(app.api_metrics(false).controls.bpm, 140.0);

        let resp = app
            .api_put_config(&json!({"listen": {"port": 18080}}))
            .unwrap();
        assert!(resp.restart_required, "listen changes only apply after restart");

        let err = app.api_put_config(&json!(42)).unwrap_err();
        assert_eq!(err.status, 400);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn degraded_probe_activates_fake_generator() {
        let path = temp_config_path("degraded");
        let mut cfg = offline_config();
        cfg.features.bpf = true; // no capability to attach in tests
        cfg.features.fake = true;
        let app = App::new(path.clone(), cfg);

        app.start();
        let health = app.api_health();
        assert!(health.bpf.enabled);
        assert!(!health.bpf.ok, "attach must fail without privileges/object");
        assert!(health.bpf.error.is_some());

        // The fake generator feeds totals; the sampler turns them into
        // rates within a few periods.
        thread::sleep(Duration::from_millis(700));
        let metrics = app.api_metrics(true);
        assert!(metrics.totals.exec_total > 0, "fake generator should bump totals");
        assert!(
            metrics.history.as_ref().map(|h| h.len()).unwrap_or(0) > 2,
            "sampler should be appending history"
        );

        app.stop();
        assert!(!app.is_running());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn sequencer_runs_and_stops_cleanly() {
        let path = temp_config_path("seq");
        let mut cfg = offline_config();
        cfg.music.preset = "drone".into();
        let app = App::new(path.clone(), cfg);

        app.start();
        thread::sleep(Duration::from_millis(400));
        app.stop();

        // Stopping twice is a no-op.
        app.stop();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn history_is_bounded() {
        let app = App::new(temp_config_path("hist"), offline_config());
        {
            let mut history = app.history.lock().unwrap();
            for i in 0..2000u64 {
                history.push_back(HistSample { ts_ms: i, rates: SignalRates::default() });
                while history.len() > HISTORY_CAP {
                    history.pop_front();
                }
            }
            assert_eq!(history.len(), HISTORY_CAP);
            assert_eq!(history.front().unwrap().ts_ms, 1400);
        }
    }
}
