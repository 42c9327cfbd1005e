//! Daemon configuration
//!
//! One JSON file, sectioned the way the control plane patches it. Every
//! field has a default so a missing file, a partial file and a partial patch
//! all behave the same: whatever is absent keeps its current value. Bounds
//! are enforced by clamping after every merge.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub version: u32,
    pub listen: ListenConfig,
    pub ui: UiConfig,
    pub features: FeatureFlags,
    pub bpf: ProbeSection,
    pub music: MusicSection,
    pub audio: AudioSection,
    pub midi: MidiSection,
    pub osc: OscSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UiConfig {
    pub serve: bool,
    pub dir: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureFlags {
    pub bpf: bool,
    pub audio: bool,
    pub midi: bool,
    pub osc: bool,
    pub fake: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeSection {
    pub enabled_mask: u32,
    pub sample_interval_ms: u32,
    pub tgid_allow: u32,
    pub tgid_deny: u32,
    pub cgroup_id: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MusicSection {
    pub bpm: f64,
    pub key_midi: u8,
    pub scale: String,
    pub preset: String,
    pub density: f64,
    pub smoothing: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioSection {
    pub backend: String,
    pub device: String,
    pub sample_rate: u32,
    pub master_gain: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MidiSection {
    pub port: String,
    pub channel: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OscSection {
    pub host: String,
    pub port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: 1,
            listen: ListenConfig::default(),
            ui: UiConfig::default(),
            features: FeatureFlags::default(),
            bpf: ProbeSection::default(),
            music: MusicSection::default(),
            audio: AudioSection::default(),
            midi: MidiSection::default(),
            osc: OscSection::default(),
        }
    }
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self { host: "127.0.0.1".into(), port: 17321 }
    }
}

impl Default for UiConfig {
    fn default() -> Self {
        Self { serve: true, dir: String::new() }
    }
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self { bpf: true, audio: true, midi: false, osc: false, fake: false }
    }
}

impl Default for ProbeSection {
    fn default() -> Self {
        Self {
            enabled_mask: u32::MAX,
            sample_interval_ms: 200,
            tgid_allow: 0,
            tgid_deny: 0,
            cgroup_id: 0,
        }
    }
}

impl Default for MusicSection {
    fn default() -> Self {
        Self {
            bpm: 110.0,
            key_midi: 62, // D4
            scale: "pentatonic_minor".into(),
            preset: "ambient".into(),
            density: 0.35,
            smoothing: 0.85,
        }
    }
}

impl Default for AudioSection {
    fn default() -> Self {
        Self {
            backend: String::new(),
            device: String::new(),
            sample_rate: 48_000,
            master_gain: 0.25,
        }
    }
}

impl Default for MidiSection {
    fn default() -> Self {
        Self { port: "khor".into(), channel: 1 }
    }
}

impl Default for OscSection {
    fn default() -> Self {
        Self { host: "127.0.0.1".into(), port: 9000 }
    }
}

impl Config {
    /// Clamp every bounded field into its valid range.
    pub fn validate(&mut self) {
        if self.listen.port == 0 {
            self.listen.port = ListenConfig::default().port;
        }
        self.bpf.sample_interval_ms = self.bpf.sample_interval_ms.clamp(10, 5000);
        self.music.bpm = self.music.bpm.clamp(1.0, 400.0);
        self.music.key_midi = self.music.key_midi.min(127);
        self.music.density = self.music.density.clamp(0.0, 1.0);
        self.music.smoothing = self.music.smoothing.clamp(0.0, 1.0);
        self.audio.sample_rate = self.audio.sample_rate.clamp(8_000, 192_000);
        self.audio.master_gain = self.audio.master_gain.clamp(0.0, 2.0);
        self.midi.channel = self.midi.channel.clamp(1, 16);
        if self.osc.port == 0 {
            self.osc.port = OscSection::default().port;
        }
    }

    /// Apply a JSON patch: objects merge recursively, everything else
    /// replaces. Unknown keys are carried along harmlessly; type mismatches
    /// surface as a deserialization error.
    pub fn merged_with(&self, patch: &Value) -> Result<Config, String> {
        if !patch.is_object() {
            return Err("config patch must be a JSON object".into());
        }
        let mut base = serde_json::to_value(self).map_err(|e| e.to_string())?;
        merge_json(&mut base, patch);
        let mut next: Config =
            serde_json::from_value(base).map_err(|e| format!("invalid config patch: {e}"))?;
        next.validate();
        Ok(next)
    }

    /// Default on-disk location: `$XDG_CONFIG_HOME/khor/config.json`, else
    /// `$HOME/.config/khor/config.json`, else relative to the cwd.
    pub fn default_path() -> PathBuf {
        if let Ok(dir) = std::env::var("XDG_CONFIG_HOME") {
            if !dir.is_empty() {
                return PathBuf::from(dir).join("khor").join("config.json");
            }
        }
        if let Ok(home) = std::env::var("HOME") {
            if !home.is_empty() {
                return PathBuf::from(home)
                    .join(".config")
                    .join("khor")
                    .join("config.json");
            }
        }
        PathBuf::from("khor-config.json")
    }

    /// Load from `path`. A missing file yields the defaults; a present but
    /// malformed file is an error.
    pub fn load(path: &Path) -> Result<Config, Box<dyn std::error::Error + Send + Sync>> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Config::default());
            }
            Err(e) => return Err(format!("failed to read {}: {e}", path.display()).into()),
        };
        let mut cfg: Config = serde_json::from_str(&content)
            .map_err(|e| format!("failed to parse {}: {e}", path.display()))?;
        cfg.validate();
        Ok(cfg)
    }

    pub fn save(&self, path: &Path) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

fn merge_json(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (k, v) in patch_map {
                match base_map.get_mut(k) {
                    Some(slot) => merge_json(slot, v),
                    None => {
                        base_map.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (base, patch) => *base = patch.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_path(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("khor-config-test-{}-{}", std::process::id(), name));
        p
    }

    #[test]
    fn round_trip_preserves_config() {
        let mut cfg = Config::default();
        cfg.music.bpm = 132.0;
        cfg.music.preset = "arp".into();
        cfg.features.osc = true;
        cfg.osc.host = "192.168.1.20".into();

        let json = serde_json::to_string_pretty(&cfg).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg, back);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let parsed: Config =
            serde_json::from_str(r#"{"music": {"bpm": 95.0}}"#).unwrap();
        assert_eq!(parsed.music.bpm, 95.0);
        assert_eq!(parsed.music.preset, "ambient");
        assert_eq!(parsed.listen.port, 17321);
        assert!(parsed.features.audio);
    }

    #[test]
    fn validate_clamps_bounds() {
        let mut cfg = Config::default();
        cfg.music.bpm = 9999.0;
        cfg.music.density = -2.0;
        cfg.music.smoothing = 7.0;
        cfg.bpf.sample_interval_ms = 1;
        cfg.audio.sample_rate = 1000;
        cfg.audio.master_gain = 5.0;
        cfg.midi.channel = 0;
        cfg.validate();

        assert_eq!(cfg.music.bpm, 400.0);
        assert_eq!(cfg.music.density, 0.0);
        assert_eq!(cfg.music.smoothing, 1.0);
        assert_eq!(cfg.bpf.sample_interval_ms, 10);
        assert_eq!(cfg.audio.sample_rate, 8_000);
        assert_eq!(cfg.audio.master_gain, 2.0);
        assert_eq!(cfg.midi.channel, 1);
    }

    #[test]
    fn patch_merges_deeply_and_keeps_the_rest() {
        let cfg = Config::default();
        let next = cfg
            .merged_with(&json!({
                "music": {"preset": "percussive", "density": 0.8},
                "features": {"osc": true}
            }))
            .unwrap();

        assert_eq!(next.music.preset, "percussive");
        assert_eq!(next.music.density, 0.8);
        assert!(next.features.osc);
        // Untouched fields survive.
        assert_eq!(next.music.bpm, 110.0);
        assert_eq!(next.listen.host, "127.0.0.1");
    }

    #[test]
    fn patch_rejects_non_objects_and_bad_types() {
        let cfg = Config::default();
        assert!(cfg.merged_with(&json!([1, 2, 3])).is_err());
        assert!(cfg.merged_with(&json!({"music": {"bpm": "fast"}})).is_err());
    }

    #[test]
    fn patch_clamps_out_of_range_values() {
        let cfg = Config::default();
        let next = cfg.merged_with(&json!({"music": {"bpm": 100000.0}})).unwrap();
        assert_eq!(next.music.bpm, 400.0);
    }

    #[test]
    fn missing_file_loads_defaults() {
        let cfg = Config::load(Path::new("/nonexistent/khor/config.json")).unwrap();
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn malformed_file_is_an_error() {
        let path = temp_path("malformed");
        std::fs::write(&path, "{not json").unwrap();
        assert!(Config::load(&path).is_err());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn save_then_load_round_trips() {
        let path = temp_path("roundtrip");
        let mut cfg = Config::default();
        cfg.music.preset = "drone".into();
        cfg.music.density = 0.10;
        cfg.save(&path).unwrap();

        let back = Config::load(&path).unwrap();
        assert_eq!(back, cfg);
        let _ = std::fs::remove_file(&path);
    }
}
