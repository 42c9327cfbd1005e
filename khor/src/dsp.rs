//! DSP building blocks for the synth voice path and the FX bus
//!
//! Linear-stage ADSR, a TPT state-variable filter, a stereo delay line and a
//! Freeverb-style reverb. Everything processes one sample at a time and owns
//! no heap beyond its delay buffers, so it is safe to run inside the audio
//! callback.

pub fn midi_to_hz(midi: u8) -> f32 {
    440.0 * 2f32.powf((midi as i32 - 69) as f32 / 12.0)
}

/// ADSR envelope with linear stages.
///
/// The release decrement is computed from the envelope value at note-off, so
/// the tail always lasts `r_s` regardless of where in the envelope the
/// release begins.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Adsr {
    pub a_s: f32,
    pub d_s: f32,
    pub s_level: f32,
    pub r_s: f32,

    pub stage: AdsrStage,
    pub value: f32,
    release_step: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdsrStage {
    Off,
    Attack,
    Decay,
    Sustain,
    Release,
}

impl Default for Adsr {
    fn default() -> Self {
        Self {
            a_s: 0.005,
            d_s: 0.080,
            s_level: 0.55,
            r_s: 0.140,
            stage: AdsrStage::Off,
            value: 0.0,
            release_step: 0.0,
        }
    }
}

impl Adsr {
    pub fn note_on(&mut self) {
        self.stage = AdsrStage::Attack;
        self.value = 0.0;
        self.release_step = 0.0;
    }

    pub fn note_off(&mut self, sr: f32) {
        if matches!(self.stage, AdsrStage::Off | AdsrStage::Release) {
            return;
        }
        self.stage = AdsrStage::Release;
        let steps = (self.r_s * sr).max(1.0);
        self.release_step = self.value / steps;
    }

    pub fn tick(&mut self, sr: f32) -> f32 {
        const EPS: f32 = 1e-6;
        match self.stage {
            AdsrStage::Off => self.value = 0.0,
            AdsrStage::Attack => {
                let steps = (self.a_s * sr).max(1.0);
                self.value += 1.0 / steps;
                if self.value >= 1.0 {
                    self.value = 1.0;
                    self.stage = AdsrStage::Decay;
                }
            }
            AdsrStage::Decay => {
                let steps = (self.d_s * sr).max(1.0);
                self.value -= (1.0 - self.s_level) / steps;
                if self.value <= self.s_level {
                    self.value = self.s_level;
                    self.stage = AdsrStage::Sustain;
                }
            }
            AdsrStage::Sustain => {}
            AdsrStage::Release => {
                self.value -= if self.release_step > 0.0 {
                    self.release_step
                } else {
                    1.0 / (self.r_s * sr).max(1.0)
                };
                if self.value <= EPS {
                    self.value = 0.0;
                    self.stage = AdsrStage::Off;
                }
            }
        }
        self.value
    }

    pub fn is_active(&self) -> bool {
        self.stage != AdsrStage::Off
    }
}

/// TPT state-variable filter, low-pass tap.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Svf {
    ic1eq: f32,
    ic2eq: f32,
}

impl Svf {
    /// `g = tan(pi * fc / sr)`, `k = 1 / q`; both precomputed by the caller
    /// once per block.
    pub fn process(&mut self, input: f32, g: f32, k: f32) -> f32 {
        let a1 = 1.0 / (1.0 + g * (g + k));
        let a2 = g * a1;
        let a3 = g * a2;

        let v3 = input - self.ic2eq;
        let v1 = a1 * self.ic1eq + a2 * v3;
        let v2 = self.ic2eq + a2 * self.ic1eq + a3 * v3;

        self.ic1eq = 2.0 * v1 - self.ic1eq;
        self.ic2eq = 2.0 * v2 - self.ic2eq;

        v2
    }
}

/// Stereo feedback delay with a 2-second maximum.
#[derive(Debug, Default)]
pub struct DelayLine {
    buf_l: Vec<f32>,
    buf_r: Vec<f32>,
    idx: usize,
    delay_samp: usize,
    feedback: f32,
}

impl DelayLine {
    pub fn new(sr: u32, delay_s: f32, feedback: f32) -> Self {
        let max_samp = (sr as usize) * 2;
        let delay_samp = ((delay_s * sr as f32) as usize).clamp(1, max_samp - 1);
        Self {
            buf_l: vec![0.0; max_samp],
            buf_r: vec![0.0; max_samp],
            idx: 0,
            delay_samp,
            feedback: feedback.clamp(0.0, 0.95),
        }
    }

    /// Replaces the dry pair with the delayed pair, feeding back internally.
    pub fn process(&mut self, l: &mut f32, r: &mut f32) {
        if self.buf_l.is_empty() {
            return;
        }
        let n = self.buf_l.len();
        let read = (self.idx + n - self.delay_samp) % n;

        let dl = self.buf_l[read];
        let dr = self.buf_r[read];

        self.buf_l[self.idx] = *l + dl * self.feedback;
        self.buf_r[self.idx] = *r + dr * self.feedback;

        self.idx += 1;
        if self.idx >= n {
            self.idx = 0;
        }

        *l = dl;
        *r = dr;
    }
}

#[derive(Debug, Default, Clone)]
struct Comb {
    buf: Vec<f32>,
    idx: usize,
    feedback: f32,
    damp1: f32,
    damp2: f32,
    filterstore: f32,
}

impl Comb {
    fn new(len: usize, feedback: f32, damp: f32) -> Self {
        Self {
            buf: vec![0.0; len.max(1)],
            idx: 0,
            feedback,
            damp1: damp,
            damp2: 1.0 - damp,
            filterstore: 0.0,
        }
    }

    fn process(&mut self, input: f32) -> f32 {
        let output = self.buf[self.idx];
        self.filterstore = output * self.damp2 + self.filterstore * self.damp1;
        self.buf[self.idx] = input + self.filterstore * self.feedback;
        self.idx += 1;
        if self.idx >= self.buf.len() {
            self.idx = 0;
        }
        output
    }
}

#[derive(Debug, Default, Clone)]
struct Allpass {
    buf: Vec<f32>,
    idx: usize,
    feedback: f32,
}

impl Allpass {
    fn new(len: usize) -> Self {
        Self { buf: vec![0.0; len.max(1)], idx: 0, feedback: 0.5 }
    }

    fn process(&mut self, input: f32) -> f32 {
        let bufout = self.buf[self.idx];
        let output = -input + bufout;
        self.buf[self.idx] = input + bufout * self.feedback;
        self.idx += 1;
        if self.idx >= self.buf.len() {
            self.idx = 0;
        }
        output
    }
}

/// Small Freeverb-style network: four parallel combs into two series
/// allpasses per channel, with the classic 23-sample stereo offset. Delay
/// lengths are scaled from the 44.1 kHz reference to the actual sample rate.
#[derive(Debug, Default)]
pub struct Reverb {
    comb_l: Vec<Comb>,
    comb_r: Vec<Comb>,
    ap_l: Vec<Allpass>,
    ap_r: Vec<Allpass>,
}

impl Reverb {
    pub fn new(sr: u32) -> Self {
        let scale = sr as f32 / 44_100.0;
        let sc = |v: i32| -> usize { ((v as f32 * scale).round() as i32).max(16) as usize };

        const COMB_REF: [i32; 4] = [1116, 1188, 1277, 1356];
        const AP_REF: [i32; 2] = [556, 441];
        const STEREO_SPREAD: i32 = 23;

        Self {
            comb_l: COMB_REF.iter().map(|&n| Comb::new(sc(n), 0.78, 0.22)).collect(),
            comb_r: COMB_REF.iter().map(|&n| Comb::new(sc(n + STEREO_SPREAD), 0.78, 0.22)).collect(),
            ap_l: AP_REF.iter().map(|&n| Allpass::new(sc(n))).collect(),
            ap_r: AP_REF.iter().map(|&n| Allpass::new(sc(n + STEREO_SPREAD))).collect(),
        }
    }

    /// Replaces the dry pair with the wet pair.
    pub fn process(&mut self, l: &mut f32, r: &mut f32) {
        let input_l = *l;
        let input_r = *r;

        let mut acc_l = 0.0;
        let mut acc_r = 0.0;
        for c in &mut self.comb_l {
            acc_l += c.process(input_l);
        }
        for c in &mut self.comb_r {
            acc_r += c.process(input_r);
        }
        acc_l *= 0.25;
        acc_r *= 0.25;

        for a in &mut self.ap_l {
            acc_l = a.process(acc_l);
        }
        for a in &mut self.ap_r {
            acc_r = a.process(acc_r);
        }

        *l = acc_l;
        *r = acc_r;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    #[test]
    fn adsr_boundary_profile() {
        let mut e = Adsr {
            a_s: 0.01,
            d_s: 0.01,
            s_level: 0.5,
            r_s: 0.02,
            ..Default::default()
        };
        let sr = 1000.0;

        e.note_on();
        let mut peak = 0.0f32;
        for _ in 0..40 {
            peak = peak.max(e.tick(sr));
        }
        assert!(peak >= 0.95, "attack should peak within 40 samples, got {peak}");

        for _ in 0..50 {
            e.tick(sr);
        }
        assert!(
            (e.value - 0.5).abs() < 0.08,
            "should settle near sustain 0.5, got {}",
            e.value
        );

        e.note_off(sr);
        for _ in 0..80 {
            e.tick(sr);
        }
        assert_eq!(e.stage, AdsrStage::Off, "release should finish within 80 samples");
        assert!(e.value <= 1e-6);
    }

    #[test]
    fn adsr_release_length_is_independent_of_release_point() {
        // Release from mid-attack: the tail must still take ~r_s.
        let mut e = Adsr {
            a_s: 0.1,
            d_s: 0.1,
            s_level: 0.5,
            r_s: 0.05,
            ..Default::default()
        };
        let sr = 1000.0;
        e.note_on();
        for _ in 0..20 {
            e.tick(sr); // ~0.2 of the way up
        }
        e.note_off(sr);
        let mut ticks = 0;
        while e.is_active() && ticks < 1000 {
            e.tick(sr);
            ticks += 1;
        }
        assert!(
            (40..=60).contains(&ticks),
            "release from a low value should still take ~50 samples, took {ticks}"
        );
    }

    #[test]
    fn svf_low_pass_attenuates_high_frequencies() {
        let sr = 48_000.0f32;
        let fc = 500.0f32;
        let g = (PI * fc / sr).tan();
        let k = 1.0 / 0.707;

        let measure = |freq: f32| -> f32 {
            let mut f = Svf::default();
            let mut peak = 0.0f32;
            for i in 0..4800 {
                let x = (2.0 * PI * freq * i as f32 / sr).sin();
                let y = f.process(x, g, k);
                if i > 2400 {
                    peak = peak.max(y.abs());
                }
            }
            peak
        };

        let low = measure(100.0);
        let high = measure(8000.0);
        assert!(low > 0.8, "passband should be close to unity, got {low}");
        assert!(high < 0.1, "stopband should be well attenuated, got {high}");
    }

    #[test]
    fn delay_line_echoes_after_the_configured_time() {
        let sr = 1000u32;
        let mut d = DelayLine::new(sr, 0.1, 0.0); // 100 samples, no feedback
        let mut first_echo = None;
        for i in 0..300 {
            let mut l = if i == 0 { 1.0 } else { 0.0 };
            let mut r = 0.0;
            d.process(&mut l, &mut r);
            if l.abs() > 0.5 && first_echo.is_none() {
                first_echo = Some(i);
            }
        }
        assert_eq!(first_echo, Some(100), "impulse should come back after 100 samples");
    }

    #[test]
    fn reverb_produces_a_decaying_tail() {
        let mut rv = Reverb::new(48_000);
        // Feed an impulse, then silence.
        let mut early = 0.0f32;
        let mut late = 0.0f32;
        for i in 0..96_000 {
            let mut l = if i == 0 { 1.0 } else { 0.0 };
            let mut r = l;
            rv.process(&mut l, &mut r);
            let mag = l.abs().max(r.abs());
            if i < 24_000 {
                early = early.max(mag);
            } else if i > 72_000 {
                late = late.max(mag);
            }
        }
        assert!(early > 0.0, "the tail should contain energy");
        assert!(late < early, "the tail must decay, early={early} late={late}");
    }

    #[test]
    fn midi_to_hz_reference_points() {
        assert!((midi_to_hz(69) - 440.0).abs() < 1e-3);
        assert!((midi_to_hz(57) - 220.0).abs() < 1e-3);
        assert!((midi_to_hz(81) - 880.0).abs() < 1e-2);
    }
}
