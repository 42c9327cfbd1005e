//! # khor: kernel activity, sonified
//!
//! khor turns coarse Linux kernel activity into music. In-kernel probes
//! aggregate counters (process executions, network bytes, scheduler
//! switches, block I/O) and flush them through a ring buffer; the daemon
//! conditions those counters into smoothed 0..1 signals, drives a
//! deterministic 16th-note sequencer, and renders the result through an
//! internal polyphonic synth, optionally mirrored to MIDI and OSC. A small
//! HTTP control plane exposes health, metrics, config and presets to a thin
//! UI.
//!
//! The pipeline, end to end:
//!
//! ```text
//! kernel probes -> ring buffer -> totals (atomics) -> signal conditioner
//!     -> music engine -> [audio | MIDI | OSC] fan-out
//! ```
//!
//! Module map:
//!
//! - [`probe`]: loads/attaches the probe object, drains the event ring
//! - [`metrics`]: process-wide atomic totals
//! - [`signals`]: rates plus log-normalized, smoothed signals
//! - [`music`]: the deterministic sequencer and its presets
//! - [`dsp`] / [`audio`]: envelopes, filters, FX and the device callback
//! - [`midi_out`] / [`osc_out`]: external sinks
//! - [`sync`]: the SPSC note ring and hot-parameter atomics
//! - [`app`]: lifecycles, periodic loops, control surface
//! - [`config`] / [`http`]: persisted config and the thin control plane

pub mod app;
pub mod audio;
pub mod config;
pub mod dsp;
pub mod http;
pub mod metrics;
pub mod midi_out;
pub mod music;
pub mod osc_out;
pub mod probe;
pub mod signals;
pub mod sync;
