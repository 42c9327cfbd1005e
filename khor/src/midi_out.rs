//! MIDI output sink
//!
//! Opens a virtual sequencer port other MIDI software can subscribe to.
//! Note-ons go out immediately; the matching note-off is scheduled on a
//! pending list swept by a small worker thread, so note durations don't
//! block the sequencer. Signal CCs are throttled to one burst per 80 ms.

use crate::music::NoteEvent;
use crate::signals::Signal01;
use midir::os::unix::VirtualOutput;
use midir::{MidiOutput, MidiOutputConnection};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::info;

const CC_THROTTLE: Duration = Duration::from_millis(80);
const OFF_SWEEP_PERIOD: Duration = Duration::from_millis(5);

const CC_EXEC: u8 = 20;
const CC_RX: u8 = 21;
const CC_TX: u8 = 22;
const CC_CSW: u8 = 23;
const CC_IO: u8 = 24;
const CC_CUTOFF: u8 = 74;

fn to_7bit(v01: f32) -> u8 {
    (v01.clamp(0.0, 1.0) * 127.0).round() as u8
}

struct PendingOff {
    due: Instant,
    midi: u8,
}

struct Running {
    conn: Arc<Mutex<MidiOutputConnection>>,
    offs: Arc<Mutex<Vec<PendingOff>>>,
    stop: Arc<AtomicBool>,
    sweeper: Option<thread::JoinHandle<()>>,
    port_name: String,
    channel: u8, // 0-based
    last_cc: Mutex<Option<Instant>>,
}

#[derive(Default)]
pub struct MidiSink {
    running: Mutex<Option<Running>>,
    is_running: AtomicBool,
}

impl MidiSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// `channel_1_16` is the human-facing 1..16 channel number.
    pub fn start(
        &self,
        port_name: &str,
        channel_1_16: u8,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.stop();

        let port_name = if port_name.is_empty() { "khor" } else { port_name };
        let channel = channel_1_16.clamp(1, 16) - 1;

        let output = MidiOutput::new("khor").map_err(|e| format!("midi init failed: {e}"))?;
        let conn = output
            .create_virtual(port_name)
            .map_err(|e| format!("failed to create virtual MIDI port {port_name}: {e}"))?;
        let conn = Arc::new(Mutex::new(conn));

        let offs: Arc<Mutex<Vec<PendingOff>>> = Arc::new(Mutex::new(Vec::new()));
        let stop = Arc::new(AtomicBool::new(false));

        let sweeper = {
            let conn = conn.clone();
            let offs = offs.clone();
            let stop = stop.clone();
            thread::Builder::new()
                .name("khor-midi-off".into())
                .spawn(move || note_off_sweeper(conn, offs, stop, channel))?
        };

        info!(port = %port_name, channel = channel_1_16, "midi sink started");
        *self.running.lock().unwrap() = Some(Running {
            conn,
            offs,
            stop,
            sweeper: Some(sweeper),
            port_name: port_name.to_string(),
            channel,
            last_cc: Mutex::new(None),
        });
        self.is_running.store(true, Ordering::Release);
        Ok(())
    }

    pub fn stop(&self) {
        let running = self.running.lock().unwrap().take();
        if let Some(mut running) = running {
            running.stop.store(true, Ordering::Release);
            if let Some(sweeper) = running.sweeper.take() {
                let _ = sweeper.join();
            }
            info!("midi sink stopped");
        }
        self.is_running.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    pub fn port_name(&self) -> Option<String> {
        self.running.lock().unwrap().as_ref().map(|r| r.port_name.clone())
    }

    /// Note-on now, note-off after `dur_s` via the sweeper.
    pub fn send_note(&self, ev: &NoteEvent) {
        let guard = self.running.lock().unwrap();
        let Some(r) = guard.as_ref() else { return };

        let midi = ev.midi.min(127);
        let vel = to_7bit(ev.velocity);
        let due = Instant::now() + Duration::from_secs_f32(ev.dur_s.max(0.02));

        {
            let mut offs = r.offs.lock().unwrap();
            offs.push(PendingOff { due, midi });
        }
        // Pending list released before the send.
        let _ = r
            .conn
            .lock()
            .unwrap()
            .send(&[0x90 | r.channel, midi, vel]);
    }

    /// Mirror the smoothed signals (and the current cutoff) as CCs.
    pub fn send_signals_cc(&self, s: &Signal01, cutoff01: f32) {
        let guard = self.running.lock().unwrap();
        let Some(r) = guard.as_ref() else { return };

        {
            let mut last = r.last_cc.lock().unwrap();
            if let Some(prev) = *last {
                if prev.elapsed() < CC_THROTTLE {
                    return;
                }
            }
            *last = Some(Instant::now());
        }

        let mut conn = r.conn.lock().unwrap();
        for (cc, v) in [
            (CC_EXEC, s.exec as f32),
            (CC_RX, s.rx as f32),
            (CC_TX, s.tx as f32),
            (CC_CSW, s.csw as f32),
            (CC_IO, s.io as f32),
            (CC_CUTOFF, cutoff01),
        ] {
            let _ = conn.send(&[0xB0 | r.channel, cc, to_7bit(v)]);
        }
    }
}

fn note_off_sweeper(
    conn: Arc<Mutex<MidiOutputConnection>>,
    offs: Arc<Mutex<Vec<PendingOff>>>,
    stop: Arc<AtomicBool>,
    channel: u8,
) {
    while !stop.load(Ordering::Acquire) {
        let now = Instant::now();
        let due: Vec<u8> = {
            let mut offs = offs.lock().unwrap();
            let mut due = Vec::new();
            offs.retain(|off| {
                if off.due <= now {
                    due.push(off.midi);
                    false
                } else {
                    true
                }
            });
            due
        };

        if !due.is_empty() {
            let mut conn = conn.lock().unwrap();
            for midi in due {
                let _ = conn.send(&[0x80 | channel, midi, 0]);
            }
        }

        thread::sleep(OFF_SWEEP_PERIOD);
    }

    // Flush remaining offs so no note hangs past stop.
    let mut conn = conn.lock().unwrap();
    for off in offs.lock().unwrap().drain(..) {
        let _ = conn.send(&[0x80 | channel, off.midi, 0]);
    }
}
