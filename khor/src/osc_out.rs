//! OSC output sink
//!
//! Fire-and-forget OSC 1.0 messages over UDP: one `/khor/note` per note, and
//! throttled `/khor/signal` / `/khor/metrics` telemetry for external patches
//! to feed on. Sends are nonblocking; a full socket buffer just loses a
//! packet, which is the right trade for telemetry.

use crate::music::NoteEvent;
use crate::signals::{Signal01, SignalRates};
use rosc::{encoder, OscMessage, OscPacket, OscType};
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::info;

pub const NOTE_ADDR: &str = "/khor/note";
pub const SIGNAL_ADDR: &str = "/khor/signal";
pub const METRICS_ADDR: &str = "/khor/metrics";

pub fn encode_note(ev: &NoteEvent) -> Result<Vec<u8>, rosc::OscError> {
    encoder::encode(&OscPacket::Message(OscMessage {
        addr: NOTE_ADDR.into(),
        args: vec![
            OscType::Int(ev.midi.min(127) as i32),
            OscType::Float(ev.velocity.clamp(0.0, 1.0)),
            OscType::Float(ev.dur_s.max(0.0)),
        ],
    }))
}

pub fn encode_signal(name: &str, value01: f32) -> Result<Vec<u8>, rosc::OscError> {
    encoder::encode(&OscPacket::Message(OscMessage {
        addr: SIGNAL_ADDR.into(),
        args: vec![
            OscType::String(name.into()),
            OscType::Float(value01.clamp(0.0, 1.0)),
        ],
    }))
}

pub fn encode_metrics(r: &SignalRates) -> Result<Vec<u8>, rosc::OscError> {
    encoder::encode(&OscPacket::Message(OscMessage {
        addr: METRICS_ADDR.into(),
        args: vec![
            OscType::Float(r.exec_s as f32),
            OscType::Float(r.rx_kbs as f32),
            OscType::Float(r.tx_kbs as f32),
            OscType::Float(r.csw_s as f32),
            OscType::Float(r.blk_r_kbs as f32),
            OscType::Float(r.blk_w_kbs as f32),
        ],
    }))
}

struct Running {
    socket: UdpSocket,
    target: SocketAddr,
    host: String,
    port: u16,
}

#[derive(Default)]
pub struct OscSink {
    running: Mutex<Option<Running>>,
    is_running: AtomicBool,
}

impl OscSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self, host: &str, port: u16) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.stop();

        if port == 0 {
            return Err("invalid OSC port".into());
        }

        let target = (host, port)
            .to_socket_addrs()
            .map_err(|e| format!("failed to resolve OSC host {host}: {e}"))?
            .next()
            .ok_or_else(|| format!("failed to resolve OSC host {host}"))?;

        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.set_nonblocking(true)?;

        info!(%host, port, "osc sink started");
        *self.running.lock().unwrap() = Some(Running {
            socket,
            target,
            host: host.to_string(),
            port,
        });
        self.is_running.store(true, Ordering::Release);
        Ok(())
    }

    pub fn stop(&self) {
        if self.running.lock().unwrap().take().is_some() {
            info!("osc sink stopped");
        }
        self.is_running.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    pub fn target(&self) -> Option<(String, u16)> {
        self.running.lock().unwrap().as_ref().map(|r| (r.host.clone(), r.port))
    }

    fn send(&self, payload: &[u8]) {
        let guard = self.running.lock().unwrap();
        if let Some(r) = guard.as_ref() {
            // EAGAIN and friends are transient; telemetry loss is fine.
            let _ = r.socket.send_to(payload, r.target);
        }
    }

    pub fn send_note(&self, ev: &NoteEvent) {
        if let Ok(payload) = encode_note(ev) {
            self.send(&payload);
        }
    }

    pub fn send_signals(&self, s: &Signal01) {
        for (name, v) in [
            ("exec", s.exec),
            ("rx", s.rx),
            ("tx", s.tx),
            ("csw", s.csw),
            ("io", s.io),
        ] {
            if let Ok(payload) = encode_signal(name, v as f32) {
                self.send(&payload);
            }
        }
    }

    pub fn send_metrics(&self, r: &SignalRates) {
        if let Ok(payload) = encode_metrics(r) {
            self.send(&payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rosc::decoder;

    fn decode(bytes: &[u8]) -> OscMessage {
        let (rest, packet) = decoder::decode_udp(bytes).expect("valid OSC packet");
        assert!(rest.is_empty());
        match packet {
            OscPacket::Message(m) => m,
            OscPacket::Bundle(_) => panic!("expected a message, got a bundle"),
        }
    }

    #[test]
    fn note_round_trip() {
        let ev = NoteEvent { midi: 64, velocity: 0.5, dur_s: 0.25 };
        let bytes = encode_note(&ev).unwrap();
        assert_eq!(bytes.len() % 4, 0, "OSC messages are 4-byte aligned");

        let msg = decode(&bytes);
        assert_eq!(msg.addr, "/khor/note");
        assert_eq!(
            msg.args,
            vec![OscType::Int(64), OscType::Float(0.5), OscType::Float(0.25)]
        );
    }

    #[test]
    fn note_arguments_are_normalized() {
        let ev = NoteEvent { midi: 200, velocity: 1.7, dur_s: -3.0 };
        let msg = decode(&encode_note(&ev).unwrap());
        assert_eq!(
            msg.args,
            vec![OscType::Int(127), OscType::Float(1.0), OscType::Float(0.0)]
        );
    }

    #[test]
    fn signal_round_trip() {
        let bytes = encode_signal("exec", 0.75).unwrap();
        assert_eq!(bytes.len() % 4, 0);
        let msg = decode(&bytes);
        assert_eq!(msg.addr, "/khor/signal");
        assert_eq!(
            msg.args,
            vec![OscType::String("exec".into()), OscType::Float(0.75)]
        );
    }

    #[test]
    fn metrics_round_trip() {
        let rates = SignalRates {
            exec_s: 100.0,
            rx_kbs: 10.0,
            tx_kbs: 5.0,
            csw_s: 1234.0,
            blk_r_kbs: 7.5,
            blk_w_kbs: 2.5,
        };
        let msg = decode(&encode_metrics(&rates).unwrap());
        assert_eq!(msg.addr, "/khor/metrics");
        assert_eq!(msg.args.len(), 6);
        assert_eq!(msg.args[0], OscType::Float(100.0));
        assert_eq!(msg.args[5], OscType::Float(2.5));
    }

    #[test]
    fn sink_starts_against_localhost() {
        let sink = OscSink::new();
        sink.start("127.0.0.1", 19000).expect("UDP needs no listener");
        assert!(sink.is_running());
        assert_eq!(sink.target(), Some(("127.0.0.1".into(), 19000)));

        // Sends are fire-and-forget even with nobody listening.
        sink.send_note(&NoteEvent::default());
        sink.send_signals(&Signal01::default());

        sink.stop();
        assert!(!sink.is_running());
    }

    #[test]
    fn sink_rejects_port_zero() {
        let sink = OscSink::new();
        assert!(sink.start("127.0.0.1", 0).is_err());
        assert!(!sink.is_running());
    }
}
