//! Deterministic 16th-note sequencer
//!
//! One `tick` per 16th note at the current BPM. Given the smoothed signals
//! and a preset, each tick emits zero or more notes plus a synth-parameter
//! snapshot. All randomness comes from a splitmix-style mixer seeded by the
//! grid position and the quantized signals, so identical inputs always
//! produce identical frames.

use crate::signals::Signal01;

/// A note to be played by whichever sinks are running.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NoteEvent {
    pub midi: u8,
    pub velocity: f32,
    pub dur_s: f32,
}

impl Default for NoteEvent {
    fn default() -> Self {
        Self { midi: 60, velocity: 0.7, dur_s: 0.25 }
    }
}

/// Synth parameters the sequencer drives alongside the notes, all 0..1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SynthParams {
    pub cutoff01: f32,
    pub resonance01: f32,
    pub delay_mix01: f32,
    pub reverb_mix01: f32,
}

impl Default for SynthParams {
    fn default() -> Self {
        Self { cutoff01: 0.65, resonance01: 0.25, delay_mix01: 0.10, reverb_mix01: 0.15 }
    }
}

/// Everything the engine needs per tick, snapshotted by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct MusicConfig {
    pub bpm: f64,
    pub key_midi: u8,
    pub scale: String,
    pub preset: String,
    pub density: f64,
}

impl Default for MusicConfig {
    fn default() -> Self {
        Self {
            bpm: 110.0,
            key_midi: 62, // D4
            scale: "pentatonic_minor".into(),
            preset: "ambient".into(),
            density: 0.35,
        }
    }
}

/// One tick's output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MusicFrame {
    pub notes: Vec<NoteEvent>,
    pub synth: SynthParams,
}

const PENTATONIC_MINOR: &[i32] = &[0, 3, 5, 7, 10];
const NATURAL_MINOR: &[i32] = &[0, 2, 3, 5, 7, 8, 10];
const DORIAN: &[i32] = &[0, 2, 3, 5, 7, 9, 10];

fn scale_degrees(name: &str) -> &'static [i32] {
    match name {
        "pentatonic_minor" | "penta_minor" | "pentatonic" => PENTATONIC_MINOR,
        "natural_minor" | "minor" => NATURAL_MINOR,
        "dorian" => DORIAN,
        _ => PENTATONIC_MINOR,
    }
}

fn splitmix64(x: &mut u64) -> u64 {
    *x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    let mut z = *x;
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

fn frand01(state: &mut u64) -> f64 {
    // 53 bits of mantissa.
    (splitmix64(state) >> 11) as f64 * (1.0 / 9_007_199_254_740_992.0)
}

fn quant(v: f64) -> u64 {
    (v * 1_000_000.0).round() as i64 as u64
}

fn clamp01(v: f64) -> f64 {
    v.clamp(0.0, 1.0)
}

fn pick_note(key_midi: u8, scale: &[i32], degree: i32, octave: i32) -> u8 {
    if scale.is_empty() {
        return key_midi.min(127);
    }
    let degree = degree.rem_euclid(scale.len() as i32) as usize;
    let midi = key_midi as i32 + scale[degree] + octave * 12;
    midi.clamp(0, 127) as u8
}

fn push_note(out: &mut Vec<NoteEvent>, midi: u8, velocity: f64, dur_s: f64) {
    out.push(NoteEvent {
        midi: midi.min(127),
        velocity: clamp01(velocity) as f32,
        dur_s: dur_s.max(0.02) as f32,
    });
}

#[derive(Debug, Default)]
pub struct MusicEngine {
    bar: u64,
    step: u32, // 0..15
}

impl MusicEngine {
    /// Milliseconds per 16th note at `bpm`, clamped to 25..500. Out-of-range
    /// BPM falls back to 110.
    pub fn tick_ms(bpm: f64) -> f64 {
        let bpm = if bpm > 1.0 && bpm < 400.0 { bpm } else { 110.0 };
        (60_000.0 / bpm / 4.0).clamp(25.0, 500.0)
    }

    pub fn position(&self) -> (u64, u32) {
        (self.bar, self.step)
    }

    fn advance(&mut self) {
        self.step = (self.step + 1) & 15;
        if self.step == 0 {
            self.bar += 1;
        }
    }

    pub fn tick(&mut self, s: &Signal01, cfg: &MusicConfig) -> MusicFrame {
        let dens = clamp01(cfg.density);
        let key = cfg.key_midi.min(127);

        let scale = scale_degrees(&cfg.scale);
        let activity = s.activity();

        let mut out = MusicFrame::default();
        out.notes.reserve(8);

        // Baseline mapping: IO opens the filter, exec adds resonance.
        let mut sp = SynthParams::default();
        sp.cutoff01 = clamp01(0.30 + 0.60 * s.io + 0.15 * (s.rx + s.tx) * 0.5) as f32;
        sp.resonance01 = clamp01(0.18 + 0.55 * s.exec) as f32;

        // Quiet system, non-drone preset: advance the clock, emit nothing.
        if cfg.preset != "drone" && activity < 0.03 {
            self.advance();
            out.synth = sp;
            return out;
        }

        let mut seed: u64 = 0x6a09_e667_f3bc_c909;
        seed ^= self.bar.wrapping_mul(0x9e37_79b9_7f4a_7c15);
        seed ^= (self.step as u64).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        seed ^= quant(s.exec).wrapping_mul(0x94d0_49bb_1331_11eb);
        seed ^= quant(s.rx).wrapping_mul(0x2545_f491_4f6c_dd1d);
        seed ^= quant(s.tx).wrapping_mul(0x7f4a_7c15_9e37_79b9);
        seed ^= quant(s.csw).wrapping_mul(0x1ce4_e5b9_bf58_476d);
        seed ^= quant(s.io).wrapping_mul(0x1331_11eb_94d0_49bb);

        match cfg.preset.as_str() {
            "percussive" => {
                sp.cutoff01 = clamp01(0.62 + 0.30 * s.io) as f32;
                sp.reverb_mix01 = clamp01(0.10 + 0.15 * s.rx) as f32;
                sp.delay_mix01 = clamp01(0.06 + 0.10 * s.tx) as f32;

                // Kick-like low note on downbeats, driven by exec.
                if self.step % 4 == 0 {
                    let p_kick = dens * (0.05 + 0.95 * s.exec) * 0.65;
                    if frand01(&mut seed) < p_kick {
                        let midi = (key as i32 - 24).clamp(0, 127) as u8;
                        push_note(&mut out.notes, midi, 0.35 + 0.55 * s.exec, 0.08);
                    }
                }

                // Clicks from scheduler activity.
                let p_click = dens * (0.10 + 0.90 * s.csw) * 0.95;
                if frand01(&mut seed) < p_click {
                    let deg = (frand01(&mut seed) * scale.len() as f64) as i32;
                    let midi = pick_note(key, scale, deg, 3 + (self.step & 1) as i32);
                    push_note(&mut out.notes, midi, 0.18 + 0.75 * s.csw, 0.05);
                }

                // Network adds mid hits.
                let p_mid = dens * (0.10 + 0.90 * (s.rx + s.tx) * 0.5) * 0.35;
                if frand01(&mut seed) < p_mid {
                    let deg = (frand01(&mut seed) * scale.len() as f64) as i32;
                    let midi = pick_note(key, scale, deg, 2);
                    push_note(&mut out.notes, midi, 0.10 + 0.60 * (s.rx + s.tx) * 0.5, 0.07);
                }
            }
            "arp" => {
                sp.reverb_mix01 = clamp01(0.18 + 0.20 * s.rx) as f32;
                sp.delay_mix01 = clamp01(0.22 + 0.35 * s.tx) as f32;

                const PATTERN: [i32; 4] = [0, 1, 2, 1];
                let pdeg = PATTERN[(self.step & 3) as usize];
                let gate = (s.rx + s.tx) * 0.5;
                let p_arp = dens * (0.20 + 0.80 * gate);
                if gate > 0.05 && frand01(&mut seed) < p_arp {
                    let midi = pick_note(key, scale, pdeg, 2 + ((self.step >> 2) & 1) as i32);
                    push_note(&mut out.notes, midi, 0.12 + 0.75 * gate, 0.12);
                }

                // Exec adds chord stabs on bar start.
                if self.step == 0 {
                    let p_stab = dens * (0.10 + 0.90 * s.exec) * 0.6;
                    if frand01(&mut seed) < p_stab {
                        let root = pick_note(key, scale, 0, 1);
                        let up = pick_note(key, scale, 2, 1);
                        push_note(&mut out.notes, root, 0.45, 0.20);
                        push_note(&mut out.notes, up, 0.30, 0.20);
                    }
                }
            }
            "drone" => {
                sp.reverb_mix01 = clamp01(0.45 + 0.25 * s.rx) as f32;
                sp.delay_mix01 = clamp01(0.05 + 0.10 * s.tx) as f32;
                sp.cutoff01 = clamp01(0.18 + 0.78 * s.io) as f32;
                sp.resonance01 = clamp01(0.30 + 0.55 * s.exec) as f32;

                // Sustain a low root by retriggering each bar.
                if self.step == 0 {
                    let midi = (key as i32 - 24).clamp(0, 127) as u8;
                    push_note(&mut out.notes, midi, 0.08 + 0.28 * s.io, 2.3);
                }
                if self.step == 8 && activity > 0.10 {
                    let midi = (key as i32 - 12).clamp(0, 127) as u8;
                    push_note(&mut out.notes, midi, 0.05 + 0.20 * activity, 1.6);
                }

                // Network sprinkles on top.
                let p_top = dens * (0.05 + 0.95 * (s.rx + s.tx) * 0.5) * 0.25;
                if frand01(&mut seed) < p_top {
                    let deg = (frand01(&mut seed) * scale.len() as f64) as i32;
                    let midi = pick_note(key, scale, deg, 3);
                    push_note(&mut out.notes, midi, 0.05 + 0.35 * (s.rx + s.tx) * 0.5, 0.40);
                }
            }
            _ => {
                // ambient
                sp.reverb_mix01 = clamp01(0.38 + 0.35 * s.rx) as f32;
                sp.delay_mix01 = clamp01(0.10 + 0.22 * s.tx) as f32;

                let p_note = dens * (0.12 + 0.88 * activity) * 0.35;
                if frand01(&mut seed) < p_note {
                    let deg = (frand01(&mut seed) * scale.len() as f64) as i32;
                    let oct = (frand01(&mut seed) * 3.0) as i32; // 0..2
                    let midi = pick_note(key, scale, deg, oct);
                    let vel = 0.12 + 0.70 * (0.65 * s.rx + 0.35 * s.tx);
                    let dur = (0.20 + 0.70 * (0.40 + 0.60 * s.rx) * (0.30 + 0.70 * dens))
                        .clamp(0.10, 1.10);
                    push_note(&mut out.notes, midi, vel, dur);
                }

                // Exec accents: gentle dyads.
                let p_exec = dens * s.exec * 0.18;
                if frand01(&mut seed) < p_exec {
                    let root = pick_note(key, scale, 0, 1);
                    let fifth = pick_note(key, scale, 2, 1);
                    push_note(&mut out.notes, root, 0.42, 0.35);
                    push_note(&mut out.notes, fifth, 0.30, 0.35);
                }
            }
        }

        out.synth = sp;
        self.advance();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signals(exec: f64, rx: f64, tx: f64, csw: f64, io: f64) -> Signal01 {
        Signal01 { exec, rx, tx, csw, io }
    }

    #[test]
    fn tick_ms_clamps_and_falls_back() {
        assert_eq!(MusicEngine::tick_ms(110.0), 60_000.0 / 110.0 / 4.0);
        assert_eq!(MusicEngine::tick_ms(0.0), 60_000.0 / 110.0 / 4.0, "bad bpm uses 110");
        assert_eq!(MusicEngine::tick_ms(600.0), 60_000.0 / 110.0 / 4.0, "bad bpm uses 110");
        assert_eq!(MusicEngine::tick_ms(2.0), 500.0, "slow bpm clamps to 500ms");
        assert!(MusicEngine::tick_ms(399.0) >= 25.0);
    }

    #[test]
    fn cursor_advances_mod_16() {
        let mut eng = MusicEngine::default();
        let cfg = MusicConfig::default();
        let z = Signal01::default();
        for i in 0..35u32 {
            assert_eq!(eng.position(), ((i / 16) as u64, i % 16));
            eng.tick(&z, &cfg);
        }
        assert_eq!(eng.position(), (2, 3));
    }

    #[test]
    fn silence_gate_emits_nothing_for_ambient() {
        let mut eng = MusicEngine::default();
        let cfg = MusicConfig {
            preset: "ambient".into(),
            density: 0.5,
            ..Default::default()
        };
        let z = Signal01::default();
        for _ in 0..64 {
            let frame = eng.tick(&z, &cfg);
            assert!(frame.notes.is_empty(), "silent system must stay silent");
        }
        assert_eq!(eng.position(), (4, 0), "the clock still advances");
    }

    #[test]
    fn identical_inputs_produce_identical_frames() {
        let cfg = MusicConfig {
            preset: "percussive".into(),
            density: 0.9,
            ..Default::default()
        };
        let s = signals(0.6, 0.4, 0.3, 0.8, 0.2);

        let mut a = MusicEngine::default();
        let mut b = MusicEngine::default();
        for _ in 0..64 {
            assert_eq!(a.tick(&s, &cfg), b.tick(&s, &cfg));
        }
    }

    #[test]
    fn drone_baseline_at_zero_signals() {
        let mut eng = MusicEngine::default();
        let cfg = MusicConfig {
            preset: "drone".into(),
            key_midi: 62,
            density: 0.0,
            ..Default::default()
        };
        let z = Signal01::default();

        // Step 0: exactly one low root, two octaves down, 2.3 s.
        let frame = eng.tick(&z, &cfg);
        assert_eq!(frame.notes.len(), 1);
        assert_eq!(frame.notes[0].midi, 38);
        assert!((frame.notes[0].dur_s - 2.3).abs() < 1e-6);

        // Steps 1..7: nothing.
        for step in 1..8 {
            let frame = eng.tick(&z, &cfg);
            assert!(frame.notes.is_empty(), "unexpected note at step {step}");
        }

        // Step 8 needs activity > 0.10; zero signals stay silent.
        let frame = eng.tick(&z, &cfg);
        assert!(frame.notes.is_empty());
    }

    #[test]
    fn drone_fifth_appears_at_step_8_with_activity() {
        let mut eng = MusicEngine::default();
        let cfg = MusicConfig {
            preset: "drone".into(),
            key_midi: 62,
            density: 0.0,
            ..Default::default()
        };
        let s = signals(0.0, 0.0, 0.0, 0.0, 0.5);

        let mut found = None;
        for step in 0..16 {
            let frame = eng.tick(&s, &cfg);
            if step == 8 {
                found = frame.notes.first().copied();
            }
        }
        let n = found.expect("step 8 should emit the octave-down note");
        assert_eq!(n.midi, 50);
        assert!((n.dur_s - 1.6).abs() < 1e-6);
    }

    #[test]
    fn notes_stay_in_midi_range_across_presets() {
        let s = signals(1.0, 1.0, 1.0, 1.0, 1.0);
        for preset in ["ambient", "percussive", "arp", "drone"] {
            for key in [0u8, 5, 64, 120, 127] {
                let mut eng = MusicEngine::default();
                let cfg = MusicConfig {
                    preset: preset.into(),
                    key_midi: key,
                    density: 1.0,
                    ..Default::default()
                };
                for _ in 0..64 {
                    for n in eng.tick(&s, &cfg).notes {
                        assert!(n.midi <= 127);
                        assert!((0.0..=1.0).contains(&n.velocity));
                        assert!(n.dur_s > 0.0);
                    }
                }
            }
        }
    }

    #[test]
    fn unknown_scale_falls_back_to_pentatonic_minor() {
        assert_eq!(scale_degrees("no_such_scale"), PENTATONIC_MINOR);
        assert_eq!(scale_degrees("dorian"), DORIAN);
        assert_eq!(scale_degrees("natural_minor"), NATURAL_MINOR);
    }

    #[test]
    fn arp_gates_on_network() {
        // Plenty of network traffic: the arp should fire often.
        let s = signals(0.0, 0.9, 0.9, 0.0, 0.0);
        let cfg = MusicConfig {
            preset: "arp".into(),
            density: 1.0,
            ..Default::default()
        };
        let mut eng = MusicEngine::default();
        let mut notes = 0usize;
        for _ in 0..64 {
            notes += eng.tick(&s, &cfg).notes.len();
        }
        assert!(notes > 16, "busy network should drive the arp, got {notes} notes");
    }
}
