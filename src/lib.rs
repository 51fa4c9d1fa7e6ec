//! Real-time MIDI sequencer core.
//!
//! A façade over the three engine crates:
//!
//! - [`midi`]: the context-free event model, event selectors, sysex
//!   patterns and the MTC parser
//! - [`io`]: device ports, wire parsing, output buffering and the poll
//!   loop
//! - [`core`]: pools, tracks, frame tracking, conversion, the transport
//!   multiplexer and the filter chain
//!
//! The typical embedding attaches devices to a [`Mux`], implements
//! [`Song`] for its playback/record layer, and drives everything from
//! [`Mux::run`] with a [`Poller`].

pub use segno_core as core;
pub use segno_midi as midi;
pub use segno_midi_io as io;

pub use segno_core::{
    Filt, FiltDst, Loc, Metro, MetroMode, Mixout, Mux, MuxPhase, Norm, Pool, Song, StateList,
    StatePool, TimoQueue, Track,
};
pub use segno_midi::{Cmd, ConvFlags, Ev, EvPat, EvSpec, MtcParser, PatSet, Phase};
pub use segno_midi_io::{DevList, DevOps, MidiDev, Mode, Poller};
