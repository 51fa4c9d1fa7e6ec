//! The metronome.
//!
//! Clicks are plain notes sent to a drum channel on beat boundaries, the
//! first beat of a measure getting the accented note. The note-off is
//! scheduled through the engine timeout wheel a click length after the
//! note-on.

use segno_midi::{Ev, EV_NOFF_DEFAULTVEL};

/// Click length in 1/24 µs (30 ms).
pub const METRO_CLICKLEN: u32 = 24 * 1000 * 30;

pub const METRO_DEV: u8 = 0;
pub const METRO_CHAN: u8 = 9;
pub const METRO_HI_NOTE: u32 = 67;
pub const METRO_HI_VEL: u32 = 127;
pub const METRO_LO_NOTE: u32 = 68;
pub const METRO_LO_VEL: u32 = 90;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MetroMode {
    #[default]
    Off,
    /// Click only while recording.
    Rec,
    /// Click while playing or recording.
    On,
}

/// A click to play: the note-on, plus the note-off of a previous click
/// that is still sounding and must be closed first.
pub struct MetroClick {
    pub on: Ev,
    pub prev_off: Option<Ev>,
}

pub struct Metro {
    pub mode: MetroMode,
    pub dev: u8,
    pub ch: u8,
    pub hi: (u32, u32),
    pub lo: (u32, u32),
    pub clicklen: u32,
    pending: Option<Ev>,
}

impl Default for Metro {
    fn default() -> Self {
        Self::new()
    }
}

impl Metro {
    pub fn new() -> Metro {
        Metro {
            mode: MetroMode::Off,
            dev: METRO_DEV,
            ch: METRO_CHAN,
            hi: (METRO_HI_NOTE, METRO_HI_VEL),
            lo: (METRO_LO_NOTE, METRO_LO_VEL),
            clicklen: METRO_CLICKLEN,
            pending: None,
        }
    }

    fn enabled(&self, recording: bool) -> bool {
        match self.mode {
            MetroMode::Off => false,
            MetroMode::Rec => recording,
            MetroMode::On => true,
        }
    }

    /// Called on every tick with the position within the measure.
    /// Returns the click due, if any.
    pub fn tic(&mut self, beat: u32, tic: u32, recording: bool) -> Option<MetroClick> {
        if !self.enabled(recording) || tic != 0 {
            return None;
        }
        let (num, vel) = if beat == 0 { self.hi } else { self.lo };
        let prev_off = self.pending.take();
        let on = Ev::note_on(self.dev, self.ch, num, vel);
        self.pending = Some(Ev::note_off(self.dev, self.ch, num, EV_NOFF_DEFAULTVEL));
        Some(MetroClick { on, prev_off })
    }

    /// The click length elapsed: the note-off to send, if a click is
    /// sounding.
    pub fn timeout(&mut self) -> Option<Ev> {
        self.pending.take()
    }

    /// Transport stopped: close a sounding click immediately.
    pub fn shut(&mut self) -> Option<Ev> {
        self.pending.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_off_by_default() {
        let mut m = Metro::new();
        assert!(m.tic(0, 0, true).is_none());
    }

    #[test]
    fn test_accents_measure_start() {
        let mut m = Metro::new();
        m.mode = MetroMode::On;
        let click = m.tic(0, 0, false).unwrap();
        assert_eq!(click.on.note_num(), METRO_HI_NOTE);
        assert!(click.prev_off.is_none());
        let off = m.timeout().unwrap();
        assert_eq!(off.note_num(), METRO_HI_NOTE);
        let click = m.tic(1, 0, false).unwrap();
        assert_eq!(click.on.note_num(), METRO_LO_NOTE);
    }

    #[test]
    fn test_no_click_mid_beat() {
        let mut m = Metro::new();
        m.mode = MetroMode::On;
        assert!(m.tic(0, 5, false).is_none());
    }

    #[test]
    fn test_rec_mode_needs_recording() {
        let mut m = Metro::new();
        m.mode = MetroMode::Rec;
        assert!(m.tic(0, 0, false).is_none());
        assert!(m.tic(0, 0, true).is_some());
    }

    #[test]
    fn test_overlapping_click_closed_first() {
        let mut m = Metro::new();
        m.mode = MetroMode::On;
        m.tic(0, 0, false);
        // the next click arrives before the off timeout fired
        let click = m.tic(1, 0, false).unwrap();
        let prev = click.prev_off.unwrap();
        assert_eq!(prev.note_num(), METRO_HI_NOTE);
        // the pending off now belongs to the new click
        assert_eq!(m.timeout().unwrap().note_num(), METRO_LO_NOTE);
    }
}
