//! The input normalizer.
//!
//! Every accepted input event is tracked here before it reaches the
//! filter, so the rest of the engine can query what the performer is
//! currently holding. Nested duplicates (a second note-on for a note that
//! is already down) are swallowed, and on shutdown every open frame is
//! canceled so nothing keeps sounding.

use smallvec::SmallVec;
use tracing::debug;

use segno_midi::{Ev, Phase};

use crate::state::{StateFlags, StateList, StatePool};

#[derive(Default)]
pub struct Norm {
    slist: StateList,
}

impl Norm {
    pub fn new() -> Norm {
        Norm {
            slist: StateList::new(),
        }
    }

    /// Track one input event. Returns false when the event must not
    /// propagate (it belongs to a nested duplicate frame).
    pub fn evcb(&mut self, pool: &mut StatePool, ev: &Ev) -> bool {
        let st = self.slist.update(pool, ev);
        if pool[st].flags.contains(StateFlags::NESTED) {
            debug!(%ev, "nested input frame, not forwarded");
            return false;
        }
        true
    }

    /// Cancel events for every open input frame, oldest last. The caller
    /// feeds them back through the normal input chain.
    pub fn shut(&mut self, pool: &StatePool) -> SmallVec<[Ev; 8]> {
        let mut evs = SmallVec::new();
        for st in self.slist.iter(pool) {
            if !st.phase.contains(Phase::LAST) {
                if let Some(ca) = st.cancel() {
                    evs.push(ca);
                }
            }
        }
        evs
    }

    pub fn outdate(&mut self, pool: &mut StatePool) {
        self.slist.outdate(pool);
    }

    pub fn done(&mut self, pool: &mut StatePool) {
        self.slist.done(pool);
    }

    /// The live projection of the input stream.
    pub fn states(&self) -> &StateList {
        &self.slist
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::Pool;
    use segno_midi::EV_NOFF_DEFAULTVEL;

    #[test]
    fn test_forwards_and_tracks() {
        let mut p = Pool::new("state", 64);
        let mut n = Norm::new();
        assert!(n.evcb(&mut p, &Ev::note_on(0, 0, 60, 100)));
        assert!(n
            .states()
            .lookup(&p, &Ev::note_on(0, 0, 60, 0))
            .is_some());
        assert!(n.evcb(&mut p, &Ev::note_off(0, 0, 60, 0)));
        n.outdate(&mut p);
        assert!(n.states().is_empty());
    }

    #[test]
    fn test_nested_note_on_swallowed() {
        let mut p = Pool::new("state", 64);
        let mut n = Norm::new();
        assert!(n.evcb(&mut p, &Ev::note_on(0, 0, 60, 100)));
        assert!(!n.evcb(&mut p, &Ev::note_on(0, 0, 60, 90)));
        // the first off closes the nested frame and is swallowed with it
        assert!(!n.evcb(&mut p, &Ev::note_off(0, 0, 60, 0)));
        // the second off closes the original frame and goes through
        assert!(n.evcb(&mut p, &Ev::note_off(0, 0, 60, 0)));
    }

    #[test]
    fn test_shut_cancels_open_frames() {
        let mut p = Pool::new("state", 64);
        let mut n = Norm::new();
        n.evcb(&mut p, &Ev::note_on(0, 0, 60, 100));
        n.evcb(&mut p, &Ev::note_on(0, 1, 62, 100));
        n.evcb(&mut p, &Ev::pc(0, 0, 5));
        let cancels = n.shut(&p);
        assert_eq!(cancels.len(), 2);
        assert!(cancels
            .iter()
            .all(|ev| ev.note_vel() == EV_NOFF_DEFAULTVEL));
        // feeding the cancels back closes the frames
        for ev in cancels {
            n.evcb(&mut p, &ev);
        }
        n.outdate(&mut p);
        // only the stateless program change remains
        assert_eq!(n.states().iter(&p).count(), 1);
    }
}
