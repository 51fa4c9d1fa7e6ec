//! Output priority mixing.
//!
//! Several sources submit events for the same outputs: live input echoed
//! through, playing tracks, per-channel configuration. A state list keyed
//! on the output frames arbitrates: the source with the lowest priority id
//! wins, and taking over an open frame first emits the event that cancels
//! it. Terminated states of stateless controllers are kept for roughly a
//! second, so for instance a controller moved by hand keeps masking the
//! same controller played from a track.

use smallvec::SmallVec;
use tracing::debug;

use segno_midi::{Ev, Phase};

use crate::state::{StateFlags, StateList, StatePool};

/// Source priorities, lowest wins.
pub const PRIO_INPUT: u32 = 0;
pub const PRIO_TRACK: u32 = 1;
pub const PRIO_CHAN: u32 = 2;

/// Aging period of the mixer state list, in 1/24 µs.
pub const MIXOUT_TIMO: u32 = 1_000_000;

/// Rounds of the aging timeout a terminated stateless frame survives.
pub const MIXOUT_MAXTICS: u32 = 24;

#[derive(Default)]
pub struct Mixout {
    slist: StateList,
}

impl Mixout {
    pub fn new() -> Mixout {
        Mixout {
            slist: StateList::new(),
        }
    }

    /// Submit an event from the source with priority `prio`. Returns the
    /// events to actually send: possibly a cancel for a kicked frame,
    /// then the event itself unless it lost arbitration or belongs to a
    /// nested or bogus frame.
    pub fn putev(&mut self, pool: &mut StatePool, ev: &Ev, prio: u32) -> SmallVec<[Ev; 2]> {
        let mut out = SmallVec::new();
        if let Some(os) = self.slist.lookup(pool, ev) {
            let tag = pool[os].tag;
            if tag != prio {
                if tag < prio {
                    debug!(%ev, prio, owner = tag, "ignored, frame owned by higher source");
                    return out;
                }
                if let Some(ca) = pool[os].cancel() {
                    debug!(%ev, prio, owner = tag, "kicking older frame");
                    self.slist.update(pool, &ca);
                    out.push(ca);
                }
            }
        }
        let os = self.slist.update(pool, ev);
        let s = &mut pool[os];
        s.tag = prio;
        s.tic = 0;
        if s.flags.intersects(StateFlags::BOGUS | StateFlags::NESTED) {
            debug!(%ev, "nested or bogus output frame, suppressed");
        } else {
            out.push(*ev);
        }
        out
    }

    /// Periodic aging pass; the caller re-arms the [`MIXOUT_TIMO`]
    /// timeout.
    pub fn timocb(&mut self, pool: &mut StatePool) {
        let mut cur = self.slist.first_id();
        while let Some(id) = cur {
            cur = pool[id].next_id();
            let phase = pool[id].phase;
            if phase == Phase::LAST {
                self.slist.rm(pool, id);
                pool.free(id);
            } else if phase == Phase::FIRST | Phase::LAST {
                if pool[id].tic >= MIXOUT_MAXTICS {
                    self.slist.rm(pool, id);
                    pool.free(id);
                } else {
                    pool[id].flags.remove(StateFlags::CHANGED);
                    pool[id].tic += 1;
                }
            }
        }
    }

    /// Cancel every open output frame, returning the events to send, and
    /// the device/channel pairs that were active.
    pub fn shut(&mut self, pool: &mut StatePool) -> (SmallVec<[Ev; 8]>, SmallVec<[(u8, u8); 8]>) {
        let mut cancels: SmallVec<[Ev; 8]> = SmallVec::new();
        let mut chans: SmallVec<[(u8, u8); 8]> = SmallVec::new();
        let mut cur = self.slist.first_id();
        while let Some(id) = cur {
            cur = pool[id].next_id();
            let st = &pool[id];
            if st.ev.cmd.is_voice() && !chans.contains(&(st.ev.dev, st.ev.ch)) {
                chans.push((st.ev.dev, st.ev.ch));
            }
            if let Some(ca) = st.cancel() {
                cancels.push(ca);
            }
        }
        for ca in &cancels {
            self.slist.update(pool, ca);
        }
        (cancels, chans)
    }

    pub fn done(&mut self, pool: &mut StatePool) {
        self.slist.done(pool);
    }

    pub fn states(&self) -> &StateList {
        &self.slist
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::Pool;
    use segno_midi::EV_NOFF_DEFAULTVEL;

    fn pool() -> StatePool {
        Pool::new("state", 64)
    }

    #[test]
    fn test_single_source_passes() {
        let mut p = pool();
        let mut m = Mixout::new();
        let ev = Ev::note_on(0, 0, 60, 100);
        assert_eq!(m.putev(&mut p, &ev, PRIO_TRACK).as_slice(), &[ev]);
    }

    #[test]
    fn test_lower_priority_kicks_higher() {
        let mut p = pool();
        let mut m = Mixout::new();
        m.putev(&mut p, &Ev::note_on(0, 0, 60, 100), PRIO_TRACK);
        // live input takes over: the track's note is canceled first
        let out = m.putev(&mut p, &Ev::note_on(0, 0, 60, 90), PRIO_INPUT);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], Ev::note_off(0, 0, 60, EV_NOFF_DEFAULTVEL));
        assert_eq!(out[1], Ev::note_on(0, 0, 60, 90));
    }

    #[test]
    fn test_higher_priority_is_ignored() {
        let mut p = pool();
        let mut m = Mixout::new();
        m.putev(&mut p, &Ev::xctl(0, 0, 7, 100), PRIO_INPUT);
        let out = m.putev(&mut p, &Ev::xctl(0, 0, 7, 50), PRIO_TRACK);
        assert!(out.is_empty(), "track must not override live input");
    }

    #[test]
    fn test_stateless_states_age_out() {
        let mut p = pool();
        let mut m = Mixout::new();
        m.putev(&mut p, &Ev::xctl(0, 0, 7, 100), PRIO_INPUT);
        for _ in 0..=MIXOUT_MAXTICS {
            m.timocb(&mut p);
        }
        // the mask has expired: the track wins again
        let out = m.putev(&mut p, &Ev::xctl(0, 0, 7, 50), PRIO_TRACK);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_terminated_frames_purged() {
        let mut p = pool();
        let mut m = Mixout::new();
        m.putev(&mut p, &Ev::note_on(0, 0, 60, 100), PRIO_TRACK);
        m.putev(&mut p, &Ev::note_off(0, 0, 60, 0), PRIO_TRACK);
        m.timocb(&mut p);
        assert!(m.states().is_empty());
        assert_eq!(p.used(), 0);
    }

    #[test]
    fn test_shut_cancels_and_reports_channels() {
        let mut p = pool();
        let mut m = Mixout::new();
        m.putev(&mut p, &Ev::note_on(1, 3, 60, 100), PRIO_TRACK);
        m.putev(&mut p, &Ev::note_on(1, 3, 62, 100), PRIO_TRACK);
        m.putev(&mut p, &Ev::bend(0, 0, 0x3000), PRIO_INPUT);
        let (cancels, chans) = m.shut(&mut p);
        assert_eq!(cancels.len(), 3);
        assert_eq!(chans.len(), 2);
        assert!(chans.contains(&(1, 3)) && chans.contains(&(0, 0)));
        // everything is terminated now
        let (cancels, _) = m.shut(&mut p);
        assert!(cancels.is_empty());
    }
}
