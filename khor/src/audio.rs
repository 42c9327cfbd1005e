//! Real-time audio output
//!
//! The renderer is a plain struct driven by whatever owns the output: the
//! cpal callback in normal operation, or a discard-buffer thread for the
//! `null` backend. Notes arrive over a wait-free SPSC ring and hot synth
//! parameters over atomics, so the callback never blocks and never touches a
//! lock.

use crate::dsp::{midi_to_hz, Adsr, AdsrStage, DelayLine, Reverb, Svf};
use crate::music::NoteEvent;
use crate::sync::{AtomicF32, SpscRing};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use serde::Serialize;
use std::f32::consts::PI;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{error, info};

const MAX_VOICES: usize = 24;
const NOTE_QUEUE_CAPACITY: u32 = 1024;
const DELAY_SECONDS: f32 = 0.26;
const DELAY_FEEDBACK: f32 = 0.28;
const LIMITER_THRESHOLD: f32 = 0.95;

/// Settings the engine needs to open a device, taken from the audio config
/// section.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioSettings {
    /// "" (default) | "pulseaudio" | "alsa" | "jack" | "null".
    pub backend: String,
    /// "" (default) | case-insensitive name substring | "id:<hex>".
    pub device: String,
    pub sample_rate: u32,
    pub master_gain: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct AudioDeviceInfo {
    pub id: String,
    pub name: String,
    pub is_default: bool,
}

/// State shared between the control side and the render side.
struct Shared {
    queue: SpscRing<NoteEvent>,
    queue_drops: AtomicU64,
    master_gain: AtomicF32,
    cutoff01: AtomicF32,
    resonance01: AtomicF32,
    delay_mix01: AtomicF32,
    reverb_mix01: AtomicF32,
}

impl Shared {
    fn new() -> Self {
        Self {
            queue: SpscRing::new(NOTE_QUEUE_CAPACITY),
            queue_drops: AtomicU64::new(0),
            master_gain: AtomicF32::new(0.25),
            cutoff01: AtomicF32::new(0.65),
            resonance01: AtomicF32::new(0.25),
            delay_mix01: AtomicF32::new(0.10),
            reverb_mix01: AtomicF32::new(0.15),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Voice {
    active: bool,
    midi: u8,
    phase: f32,
    phase_inc: f32,
    velocity: f32,
    samples_until_release: i32,
    env: Adsr,
    filter: Svf,
}

impl Default for Voice {
    fn default() -> Self {
        Self {
            active: false,
            midi: 0,
            phase: 0.0,
            phase_inc: 0.0,
            velocity: 0.7,
            samples_until_release: 0,
            env: Adsr::default(),
            filter: Svf::default(),
        }
    }
}

/// The fixed DSP graph: voice bank → per-voice SVF → delay/reverb bus →
/// limiter → saturator. Owned by exactly one render thread.
pub struct Renderer {
    sample_rate: u32,
    shared: Arc<Shared>,
    voices: [Voice; MAX_VOICES],
    delay: DelayLine,
    reverb: Reverb,
    limiter_gain: f32,
}

impl Renderer {
    fn new(sample_rate: u32, shared: Arc<Shared>) -> Self {
        Self {
            sample_rate,
            shared,
            voices: [Voice::default(); MAX_VOICES],
            delay: DelayLine::new(sample_rate, DELAY_SECONDS, DELAY_FEEDBACK),
            reverb: Reverb::new(sample_rate),
            limiter_gain: 1.0,
        }
    }

    fn note_on(&mut self, ev: NoteEvent) {
        let midi = ev.midi.min(127);
        let velocity = ev.velocity.clamp(0.0, 1.0);
        let dur_s = ev.dur_s.max(0.01);

        // Free voice if there is one, otherwise steal the quietest.
        let slot = match self.voices.iter().position(|v| !v.active) {
            Some(i) => i,
            None => {
                let mut best = 0usize;
                let mut best_value = f32::INFINITY;
                for (i, v) in self.voices.iter().enumerate() {
                    if v.env.value < best_value {
                        best_value = v.env.value;
                        best = i;
                    }
                }
                best
            }
        };

        let v = &mut self.voices[slot];
        let hz = midi_to_hz(midi);
        v.active = true;
        v.midi = midi;
        v.phase = 0.0;
        v.phase_inc = 2.0 * PI * hz / self.sample_rate as f32;
        v.velocity = velocity;
        v.samples_until_release = (dur_s * self.sample_rate as f32) as i32;
        v.env.note_on();
        v.filter = Svf::default();
    }

    /// Render `out.len() / 2` interleaved stereo frames.
    pub fn render(&mut self, out: &mut [f32]) {
        let sr = self.sample_rate as f32;
        out.fill(0.0);

        // Drain the note queue once per call, before rendering.
        while let Some(ev) = self.shared.queue.pop() {
            self.note_on(ev);
        }

        // Hot parameters are read once per block.
        let cutoff = self.shared.cutoff01.load().clamp(0.0, 1.0);
        let res = self.shared.resonance01.load().clamp(0.0, 1.0);
        let dm = self.shared.delay_mix01.load().clamp(0.0, 1.0);
        let rm = self.shared.reverb_mix01.load().clamp(0.0, 1.0);
        let mg = self.shared.master_gain.load().clamp(0.0, 2.0);

        // Exponential cutoff mapping: ~80 Hz .. ~9 kHz.
        let fc = 80.0 * 2f32.powf(cutoff * 6.8);
        let g = (PI * fc / sr).tan();
        let q = 0.55 + (1.0 - res) * 7.0;
        let k = 1.0 / q.max(0.3);

        let wet = (dm + rm).clamp(0.0, 1.0);
        let dry_gain = 1.0 - wet * 0.85;

        for frame in out.chunks_exact_mut(2) {
            let mut l = 0.0f32;
            let mut r = 0.0f32;

            for v in self.voices.iter_mut() {
                if !v.active {
                    continue;
                }

                // Sine with a little triangle folded in.
                let s = v.phase.sin();
                let tri = (2.0 / PI) * v.phase.sin().asin();
                let osc = 0.88 * s + 0.18 * tri;

                v.phase += v.phase_inc;
                if v.phase > 2.0 * PI {
                    v.phase -= 2.0 * PI;
                }

                if v.samples_until_release > 0 {
                    v.samples_until_release -= 1;
                }
                if v.samples_until_release == 0 {
                    v.env.note_off(sr);
                }

                let env = v.env.tick(sr);
                if v.env.stage == AdsrStage::Off {
                    v.active = false;
                    continue;
                }

                let mut sample = osc * env * v.velocity;
                sample = v.filter.process(sample, g, k);

                // Deterministic pseudo-random pan over MIDI number.
                let pan = 0.5 + 0.25 * (v.midi as f32 * 0.37).sin();
                l += sample * (1.0 - pan);
                r += sample * pan;
            }

            // Send/return FX bus.
            let mut dl = l;
            let mut dr = r;
            self.delay.process(&mut dl, &mut dr);

            let mut rv_l = l;
            let mut rv_r = r;
            self.reverb.process(&mut rv_l, &mut rv_r);

            let mut o_l = l * dry_gain + dl * dm + rv_l * rm;
            let mut o_r = r * dry_gain + dr * dm + rv_r * rm;

            o_l *= mg;
            o_r *= mg;

            // Peak-aware limiter with a fixed per-sample release.
            let peak = o_l.abs().max(o_r.abs());
            if peak * self.limiter_gain > LIMITER_THRESHOLD && peak > 1e-6 {
                let target = LIMITER_THRESHOLD / peak;
                self.limiter_gain = self.limiter_gain.min(target);
            } else {
                // Literal coefficient, not a time constant: audible parity
                // across sample rates matters more here.
                self.limiter_gain += (1.0 - self.limiter_gain) * 0.0008;
                self.limiter_gain = self.limiter_gain.min(1.0);
            }

            o_l *= self.limiter_gain;
            o_r *= self.limiter_gain;

            frame[0] = soft_sat(o_l);
            frame[1] = soft_sat(o_r);
        }
    }

    pub fn active_voices(&self) -> usize {
        self.voices.iter().filter(|v| v.active).count()
    }
}

fn soft_sat(x: f32) -> f32 {
    x / (1.0 + x.abs())
}

struct Running {
    stop: Arc<AtomicBool>,
    worker: Option<thread::JoinHandle<()>>,
    backend: String,
    device: String,
}

/// Owns the output device lifecycle and the control-side handles.
///
/// The cpal stream is not `Send`, so it lives entirely on a dedicated worker
/// thread; `start` handshakes the open result back over a channel.
pub struct AudioEngine {
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
    is_running: AtomicBool,
}

impl Default for AudioEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioEngine {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared::new()),
            running: Mutex::new(None),
            is_running: AtomicBool::new(false),
        }
    }

    pub fn start(&self, cfg: &AudioSettings) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.stop();

        let mut backend = cfg.backend.clone();
        if let Ok(env_backend) = std::env::var("KHOR_AUDIO_BACKEND") {
            if !env_backend.is_empty() {
                backend = env_backend;
            }
        }

        self.shared.master_gain.store(cfg.master_gain.clamp(0.0, 2.0));

        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(String, String), String>>();

        let shared = self.shared.clone();
        let worker_stop = stop.clone();
        let settings = AudioSettings { backend: backend.clone(), ..cfg.clone() };

        let worker = thread::Builder::new()
            .name("khor-audio".into())
            .spawn(move || audio_worker(settings, shared, worker_stop, ready_tx))?;

        // The worker reports once the device (or null loop) is up.
        let (backend_name, device_name) = match ready_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(Ok(names)) => names,
            Ok(Err(msg)) => {
                stop.store(true, Ordering::Release);
                let _ = worker.join();
                return Err(msg.into());
            }
            Err(_) => {
                stop.store(true, Ordering::Release);
                let _ = worker.join();
                return Err("audio device startup timed out".into());
            }
        };

        info!(backend = %backend_name, device = %device_name, sample_rate = cfg.sample_rate, "audio started");

        *self.running.lock().unwrap() = Some(Running {
            stop,
            worker: Some(worker),
            backend: backend_name,
            device: device_name,
        });
        self.is_running.store(true, Ordering::Release);
        Ok(())
    }

    pub fn stop(&self) {
        let running = self.running.lock().unwrap().take();
        if let Some(mut running) = running {
            running.stop.store(true, Ordering::Release);
            if let Some(worker) = running.worker.take() {
                let _ = worker.join();
            }
            info!("audio stopped");
        }
        self.is_running.store(false, Ordering::Release);
    }

    pub fn restart(&self, cfg: &AudioSettings) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.stop();
        self.start(cfg)
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    pub fn backend_name(&self) -> String {
        self.running.lock().unwrap().as_ref().map(|r| r.backend.clone()).unwrap_or_default()
    }

    pub fn device_name(&self) -> String {
        self.running.lock().unwrap().as_ref().map(|r| r.device.clone()).unwrap_or_default()
    }

    /// Producer side of the note ring. A full queue drops the note and bumps
    /// the counter; an audible under-run beats stalling the sequencer.
    pub fn submit_note(&self, ev: NoteEvent) {
        if !self.is_running() {
            return;
        }
        if !self.shared.queue.push(ev) {
            self.shared.queue_drops.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn queue_drops(&self) -> u64 {
        self.shared.queue_drops.load(Ordering::Relaxed)
    }

    pub fn set_master_gain(&self, gain: f32) {
        self.shared.master_gain.store(gain.clamp(0.0, 2.0));
    }

    pub fn set_filter(&self, cutoff01: f32, resonance01: f32) {
        self.shared.cutoff01.store(cutoff01);
        self.shared.resonance01.store(resonance01);
    }

    pub fn set_fx(&self, delay_mix01: f32, reverb_mix01: f32) {
        self.shared.delay_mix01.store(delay_mix01);
        self.shared.reverb_mix01.store(reverb_mix01);
    }

    /// Enumerate playback devices for the configured backend.
    pub fn enumerate_devices(
        backend: &str,
    ) -> Result<Vec<AudioDeviceInfo>, Box<dyn std::error::Error + Send + Sync>> {
        if backend.eq_ignore_ascii_case("null") {
            return Ok(vec![AudioDeviceInfo {
                id: device_id("null"),
                name: "null".into(),
                is_default: true,
            }]);
        }

        let host = resolve_host(backend)?;
        let default_name = host.default_output_device().and_then(|d| d.name().ok());

        let mut out = Vec::new();
        for device in host.output_devices()? {
            let name = device.name()?;
            out.push(AudioDeviceInfo {
                id: device_id(&name),
                is_default: Some(&name) == default_name.as_ref(),
                name,
            });
        }
        Ok(out)
    }
}

impl Drop for AudioEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Opaque device id: hex over the enumerated name bytes.
fn device_id(name: &str) -> String {
    let mut s = String::with_capacity(name.len() * 2);
    for b in name.as_bytes() {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

fn resolve_host(backend: &str) -> Result<cpal::Host, Box<dyn std::error::Error + Send + Sync>> {
    if backend.is_empty()
        || backend.eq_ignore_ascii_case("pulseaudio")
        || backend.eq_ignore_ascii_case("pulse")
    {
        // cpal has no separate Pulse host; the platform default routes
        // through Pulse where one is running.
        return Ok(cpal::default_host());
    }

    for id in cpal::available_hosts() {
        if id.name().eq_ignore_ascii_case(backend) {
            return Ok(cpal::host_from_id(id)?);
        }
    }
    Err(format!("unknown audio backend: {backend}").into())
}

/// Device pick order: `id:<hex>` exact, then case-insensitive name substring,
/// then the host default, then the first enumerated device.
fn pick_device(
    host: &cpal::Host,
    want: &str,
) -> Result<(cpal::Device, String), Box<dyn std::error::Error + Send + Sync>> {
    let devices: Vec<cpal::Device> = host.output_devices()?.collect();

    if let Some(hex) = want.strip_prefix("id:") {
        for device in host.output_devices()? {
            if let Ok(name) = device.name() {
                if device_id(&name) == hex {
                    return Ok((device, name));
                }
            }
        }
        return Err(format!("no audio device with id {hex}").into());
    }

    if !want.is_empty() {
        let needle = want.to_ascii_lowercase();
        for device in host.output_devices()? {
            if let Ok(name) = device.name() {
                if name.to_ascii_lowercase().contains(&needle) {
                    return Ok((device, name));
                }
            }
        }
    }

    if let Some(device) = host.default_output_device() {
        let name = device.name().unwrap_or_else(|_| "default".into());
        return Ok((device, name));
    }

    let device = devices
        .into_iter()
        .next()
        .ok_or("no audio output devices found")?;
    let name = device.name().unwrap_or_else(|_| "unknown".into());
    Ok((device, name))
}

fn audio_worker(
    cfg: AudioSettings,
    shared: Arc<Shared>,
    stop: Arc<AtomicBool>,
    ready: mpsc::Sender<Result<(String, String), String>>,
) {
    if cfg.backend.eq_ignore_ascii_case("null") {
        let _ = ready.send(Ok(("null".into(), "null".into())));
        null_render_loop(cfg.sample_rate, shared, &stop);
        return;
    }

    let host = match resolve_host(&cfg.backend) {
        Ok(h) => h,
        Err(e) => {
            let _ = ready.send(Err(e.to_string()));
            return;
        }
    };

    let (device, device_name) = match pick_device(&host, &cfg.device) {
        Ok(d) => d,
        Err(e) => {
            let _ = ready.send(Err(e.to_string()));
            return;
        }
    };

    let stream_config = cpal::StreamConfig {
        channels: 2,
        sample_rate: cpal::SampleRate(cfg.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let mut renderer = Renderer::new(cfg.sample_rate, shared);
    let stream = match device.build_output_stream(
        &stream_config,
        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            renderer.render(data);
        },
        |err| error!("audio stream error: {err}"),
        None,
    ) {
        Ok(s) => s,
        Err(e) => {
            let _ = ready.send(Err(format!("failed to open audio stream: {e}")));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready.send(Err(format!("failed to start audio stream: {e}")));
        return;
    }

    let backend_name = host.id().name().to_string();
    let _ = ready.send(Ok((backend_name, device_name)));

    // The stream renders from its own callback; this thread just keeps it
    // alive until stop.
    while !stop.load(Ordering::Acquire) {
        thread::sleep(Duration::from_millis(50));
    }
    drop(stream);
}

/// Headless rendering for the `null` backend: pull the renderer at roughly
/// realtime pace and discard the samples.
fn null_render_loop(sample_rate: u32, shared: Arc<Shared>, stop: &AtomicBool) {
    let mut renderer = Renderer::new(sample_rate, shared);
    let frames = (sample_rate / 100).max(1) as usize; // ~10 ms blocks
    let mut buf = vec![0.0f32; frames * 2];
    while !stop.load(Ordering::Acquire) {
        renderer.render(&mut buf);
        thread::sleep(Duration::from_millis(10));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_renderer(sr: u32) -> Renderer {
        Renderer::new(sr, Arc::new(Shared::new()))
    }

    fn note(midi: u8, dur_s: f32) -> NoteEvent {
        NoteEvent { midi, velocity: 0.8, dur_s }
    }

    #[test]
    fn notes_produce_audio() {
        let mut r = test_renderer(48_000);
        r.note_on(note(60, 0.5));
        let mut buf = vec![0.0f32; 4800 * 2];
        r.render(&mut buf);
        let peak = buf.iter().fold(0.0f32, |m, s| m.max(s.abs()));
        assert!(peak > 0.0, "a triggered voice should produce output");
        assert!(peak <= 1.0, "the saturator bounds output to (-1, 1), got {peak}");
    }

    #[test]
    fn voices_release_and_free() {
        let mut r = test_renderer(8_000);
        r.note_on(note(60, 0.05));
        assert_eq!(r.active_voices(), 1);
        // 0.05 s note + 0.14 s release tail at 8 kHz ≈ 1520 samples.
        let mut buf = vec![0.0f32; 4096 * 2];
        r.render(&mut buf);
        assert_eq!(r.active_voices(), 0, "voice should free itself after the release tail");
    }

    #[test]
    fn bank_overflow_steals_the_quietest_voice() {
        let mut r = test_renderer(8_000);

        // One short note that will be deep into its release…
        r.note_on(note(30, 0.01));
        // …and the rest sustained.
        for i in 0..(MAX_VOICES - 1) {
            r.note_on(note(60 + i as u8, 10.0));
        }
        assert_eq!(r.active_voices(), MAX_VOICES);

        // Render past the short note's hold so its envelope is releasing and
        // clearly the quietest.
        let mut buf = vec![0.0f32; 800 * 2];
        r.render(&mut buf);
        let quiet_slot = 0usize;
        assert_eq!(r.voices[quiet_slot].midi, 30);
        let quiet_env = r.voices[quiet_slot].env.value;
        for v in r.voices.iter().skip(1) {
            assert!(v.env.value > quiet_env, "sustained voices should be louder");
        }

        r.note_on(note(100, 1.0));
        assert_eq!(r.active_voices(), MAX_VOICES, "bank size never exceeds the fixed limit");
        assert_eq!(r.voices[quiet_slot].midi, 100, "the quietest voice is the one stolen");
    }

    #[test]
    fn queue_overflow_drops_and_counts() {
        let engine = AudioEngine::new();
        let settings = AudioSettings {
            backend: "null".into(),
            device: String::new(),
            sample_rate: 48_000,
            master_gain: 0.25,
        };
        engine.start(&settings).expect("null backend always starts");

        // The null loop drains every ~10 ms; a tight burst of far more than
        // capacity must overflow in between drains.
        let mut submitted = 0u64;
        while submitted < 100_000 && engine.queue_drops() == 0 {
            engine.submit_note(note(60, 0.1));
            submitted += 1;
        }
        assert!(engine.queue_drops() > 0, "overflow must be counted, not block");
        engine.stop();
        assert!(!engine.is_running());
    }

    #[test]
    fn silent_renderer_emits_silence() {
        let mut r = test_renderer(48_000);
        let mut buf = vec![1.0f32; 512 * 2];
        r.render(&mut buf);
        assert!(buf.iter().all(|s| *s == 0.0), "no voices means hard zero output");
    }

    #[test]
    fn limiter_keeps_hot_signals_bounded() {
        let shared = Arc::new(Shared::new());
        shared.master_gain.store(2.0);
        let mut r = Renderer::new(48_000, shared);
        for i in 0..MAX_VOICES {
            r.note_on(NoteEvent { midi: 40 + i as u8, velocity: 1.0, dur_s: 5.0 });
        }
        let mut buf = vec![0.0f32; 48_000 * 2];
        r.render(&mut buf);
        let peak = buf.iter().fold(0.0f32, |m, s| m.max(s.abs()));
        assert!(peak < 1.0, "limiter + saturator must keep output under 1.0, got {peak}");
    }

    #[test]
    fn device_id_is_stable_hex() {
        assert_eq!(device_id("abc"), "616263");
    }
}
