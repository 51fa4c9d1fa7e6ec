//! The collaborator seam between the transport and the song layer.
//!
//! The modules are chained mux -> norm -> filt -> song -> mixout -> mux.
//! The song side (playback cursors, recording, locating) is not part of
//! this crate; it plugs in through this trait and talks back through the
//! `Mux` reference every callback receives.

use segno_midi::Ev;

use crate::mux::Mux;

/// How a relocation position is expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Loc {
    /// Measure number.
    Meas,
    /// MTC/MMC absolute time, in MTC ticks.
    Mtc,
    /// MIDI song position pointer units.
    Spp,
}

/// Callbacks invoked by the transport. All have empty defaults so
/// implementors pick the ones they need.
pub trait Song {
    /// The first tick after a start fired: playback begins now.
    fn startcb(&mut self, mux: &mut Mux) {
        let _ = mux;
    }

    /// The transport stopped.
    fn stopcb(&mut self, mux: &mut Mux) {
        let _ = mux;
    }

    /// A tick fired while running: advance playback cursors.
    fn movecb(&mut self, mux: &mut Mux) {
        let _ = mux;
    }

    /// A filtered input event arrived.
    fn evcb(&mut self, mux: &mut Mux, ev: &Ev) {
        let _ = (mux, ev);
    }

    /// A system-exclusive message arrived that matched no pattern.
    fn sysexcb(&mut self, mux: &mut Mux, unit: usize, data: Vec<u8>) {
        let _ = (mux, unit, data);
    }

    /// Relocate to `pos` (in `loc` units) and return the offset into the
    /// first tick, in 1/24 µs. The offset must be smaller than one tick.
    fn gotocb(&mut self, mux: &mut Mux, loc: Loc, pos: u32) -> u32 {
        let _ = (mux, loc, pos);
        0
    }
}

/// A song that ignores everything; handy as a placeholder.
pub struct NullSong;

impl Song for NullSong {}
