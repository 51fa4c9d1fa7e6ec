//! The frame tracker.
//!
//! States hold the live projection of an event stream: which notes are
//! sounding, the last value of every controller, the current bend. A
//! [`StateList`] carries one such projection; the real-time paths keep one
//! per stream side. In a typical performance the list length stays around
//! the number of sounding notes, so a linear scan is fast enough; the
//! average lookup is one or two iterations.

use bitflags::bitflags;
use tracing::{debug, error, warn};

use segno_midi::{
    ctl_defval, Cmd, Ev, EvSpec, Phase, EV_BEND_DEFAULT, EV_CAT_DEFAULT, EV_NOFF_DEFAULTVEL,
};

use crate::pool::Pool;
use crate::track::SeqevId;

pub type StateId = u32;
pub type StatePool = Pool<State>;

/// Default state pool capacity, roughly the maximum number of
/// simultaneously tracked frames across all lists.
pub const MAXNSTATES: usize = 10_000;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StateFlags: u8 {
        /// Just created, never attached to.
        const NEW = 1 << 0;
        /// Written within the current tick.
        const CHANGED = 1 << 1;
        /// Frame started mid-stream (continuation without a first event).
        const BOGUS = 1 << 2;
        /// A first event arrived while an identical frame was still open.
        const NESTED = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct State {
    /// Last event attached to the frame.
    pub ev: Ev,
    /// Current phase of `ev` within the frame.
    pub phase: Phase,
    pub flags: StateFlags,

    // scratch fields for higher layers; never touched by the list itself
    pub tag: u32,
    pub tic: u32,
    pub pos: Option<SeqevId>,

    pub(crate) next: Option<StateId>,
}

impl State {
    pub(crate) fn with_flags(flags: StateFlags) -> State {
        State {
            ev: Ev::null(),
            phase: Phase::empty(),
            flags,
            tag: 0,
            tic: 0,
            pos: None,
            next: None,
        }
    }

    pub fn next_id(&self) -> Option<StateId> {
        self.next
    }

    /// The event that would undo this frame, as if it never existed:
    /// a note-off for the note family, the release value for channel
    /// pressure, the default for an extended controller, center for the
    /// bender. `None` when the frame is already terminated.
    pub fn cancel(&self) -> Option<Ev> {
        if self.phase.contains(Phase::LAST) {
            return None;
        }
        let ev = &self.ev;
        Some(match ev.cmd {
            Cmd::NON | Cmd::KAT => {
                Ev::note_off(ev.dev, ev.ch, ev.note_num(), EV_NOFF_DEFAULTVEL)
            }
            Cmd::CAT => Ev::chan_aftertouch(ev.dev, ev.ch, EV_CAT_DEFAULT),
            Cmd::XCTL => Ev::xctl(
                ev.dev,
                ev.ch,
                ev.ctl_num(),
                ctl_defval(ev.ctl_num()).unwrap_or(0),
            ),
            Cmd::BEND => Ev::bend(ev.dev, ev.ch, EV_BEND_DEFAULT),
            _ => {
                // everything else is stateless and terminates itself
                error!(ev = %self.ev, "cancel of unknown event type");
                panic!("state: cancel of unknown event type");
            }
        })
    }

    /// The event re-establishing the frame's last value for a listener
    /// that tuned in late. Notes cannot be re-sounded silently and bogus
    /// or terminated frames have nothing to restore.
    pub fn restore(&self) -> Option<Ev> {
        if self.flags.contains(StateFlags::BOGUS) || self.ev.cmd.is_note() {
            return None;
        }
        if self.phase.contains(Phase::LAST) && !self.phase.contains(Phase::FIRST) {
            return None;
        }
        Some(self.ev)
    }

    pub fn in_spec(&self, spec: &EvSpec) -> bool {
        spec.matches(&self.ev)
    }
}

#[derive(Debug, Default)]
pub struct StateList {
    first: Option<StateId>,
    changed: bool,
}

impl StateList {
    pub fn new() -> StateList {
        StateList {
            first: None,
            changed: false,
        }
    }

    pub fn first_id(&self) -> Option<StateId> {
        self.first
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }

    pub fn add(&mut self, pool: &mut StatePool, id: StateId) {
        pool[id].next = self.first;
        self.first = Some(id);
    }

    pub fn rm(&mut self, pool: &mut StatePool, id: StateId) {
        let next = pool[id].next;
        if self.first == Some(id) {
            self.first = next;
            return;
        }
        let mut cur = self.first;
        while let Some(c) = cur {
            if pool[c].next == Some(id) {
                pool[c].next = next;
                return;
            }
            cur = pool[c].next;
        }
        warn!("state not found in list");
    }

    /// First state whose frame key matches `ev`.
    pub fn lookup(&self, pool: &StatePool, ev: &Ev) -> Option<StateId> {
        let mut cur = self.first;
        while let Some(id) = cur {
            if pool[id].ev.same_frame(ev) {
                return Some(id);
            }
            cur = pool[id].next;
        }
        None
    }

    /// Update the frame state for a newly received event, creating the
    /// state if this is the frame's first event. Terminated and bogus
    /// matches are purged and replaced rather than reused.
    pub fn update(&mut self, pool: &mut StatePool, ev: &Ev) -> StateId {
        let mut phase = ev.phase();

        let mut cur = self.first;
        let mut st = loop {
            let Some(id) = cur else {
                let id = pool.alloc(State::with_flags(StateFlags::NEW));
                self.add(pool, id);
                break id;
            };
            let next = pool[id].next;
            if pool[id].ev.same_frame(ev) {
                let s = &pool[id];
                if s.phase != Phase::LAST && !s.flags.contains(StateFlags::BOGUS) {
                    pool[id].flags.remove(StateFlags::NEW);
                    break id;
                }
                self.rm(pool, id);
                pool.free(id);
            }
            cur = next;
        };

        if phase == Phase::FIRST {
            if pool[st].flags != StateFlags::NEW {
                // a first event while the frame is open: stack a nested
                // state in front of it
                st = pool.alloc(State::with_flags(StateFlags::NEW | StateFlags::NESTED));
                self.add(pool, st);
                debug!(%ev, "nested frame, stacked");
            }
        } else if phase == Phase::NEXT || phase == Phase::LAST {
            if pool[st].flags == StateFlags::NEW {
                pool[st].flags.insert(StateFlags::BOGUS);
                phase.insert(Phase::FIRST);
                phase.remove(Phase::NEXT);
                debug!(%ev, "missing first event");
            }
        } else if phase == Phase::FIRST | Phase::NEXT {
            if pool[st].flags == StateFlags::NEW {
                phase.remove(Phase::NEXT);
            } else {
                phase.remove(Phase::FIRST);
            }
        } else if phase == Phase::FIRST | Phase::LAST {
            // stateless, nothing to reconcile
        } else {
            error!(%ev, ?phase, "bad phase");
            panic!("statelist: bad phase");
        }

        let s = &mut pool[st];
        s.ev = *ev;
        s.phase = phase;
        s.flags.insert(StateFlags::CHANGED);
        self.changed = true;
        st
    }

    /// End-of-tick sweep: drop frames that are over, clear the change
    /// marks on the rest. States with both FIRST and LAST set are kept so
    /// the current value of stateless controllers stays queryable.
    pub fn outdate(&mut self, pool: &mut StatePool) {
        if !self.changed {
            return;
        }
        self.changed = false;
        let mut cur = self.first;
        while let Some(id) = cur {
            let next = pool[id].next;
            if pool[id].phase == Phase::LAST {
                self.rm(pool, id);
                pool.free(id);
            } else {
                pool[id].flags.remove(StateFlags::CHANGED);
            }
            cur = next;
        }
    }

    /// Duplicate into a fresh list sharing the same pool.
    pub fn dup(&self, pool: &mut StatePool) -> StateList {
        let mut dst = StateList::new();
        let mut cur = self.first;
        while let Some(id) = cur {
            let copy = pool[id];
            cur = copy.next;
            let nid = pool.alloc(State { next: None, ..copy });
            dst.add(pool, nid);
        }
        dst
    }

    /// Remove and free every state.
    pub fn drain(&mut self, pool: &mut StatePool) {
        let mut cur = self.first;
        while let Some(id) = cur {
            cur = pool[id].next;
            pool.free(id);
        }
        self.first = None;
        self.changed = false;
    }

    /// Drain, warning about frames that were never terminated; those come
    /// from stream inconsistencies. Controller context states (plain CTL)
    /// are scratch and exempt.
    pub fn done(&mut self, pool: &mut StatePool) {
        let mut cur = self.first;
        while let Some(id) = cur {
            let st = &pool[id];
            if !st.phase.contains(Phase::LAST) && st.ev.cmd != Cmd::CTL {
                warn!(ev = %st.ev, "unterminated frame");
            }
            cur = st.next;
        }
        self.drain(pool);
    }

    pub fn iter<'a>(&self, pool: &'a StatePool) -> StateIter<'a> {
        StateIter {
            pool,
            cur: self.first,
        }
    }
}

pub struct StateIter<'a> {
    pool: &'a StatePool,
    cur: Option<StateId>,
}

impl<'a> Iterator for StateIter<'a> {
    type Item = &'a State;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.cur?;
        let st = &self.pool[id];
        self.cur = st.next;
        Some(st)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> StatePool {
        Pool::new("state", 64)
    }

    #[test]
    fn test_note_on_off_round_trip() {
        let mut p = pool();
        let mut sl = StateList::new();

        let st = sl.update(&mut p, &Ev::note_on(0, 0, 60, 100));
        assert_eq!(p[st].phase, Phase::FIRST);
        assert!(p[st].flags.contains(StateFlags::NEW | StateFlags::CHANGED));

        let found = sl.lookup(&p, &Ev::note_on(0, 0, 60, 0)).unwrap();
        assert_eq!(found, st);

        let st2 = sl.update(&mut p, &Ev::note_off(0, 0, 60, 0));
        assert_eq!(st, st2);
        assert!(!p[st2].flags.contains(StateFlags::NEW));
        assert_eq!(p[st2].phase, Phase::LAST);

        sl.outdate(&mut p);
        assert!(sl.is_empty());
        assert_eq!(p.used(), 0);
    }

    #[test]
    fn test_bogus_frame() {
        let mut p = pool();
        let mut sl = StateList::new();
        let st = sl.update(&mut p, &Ev::note_off(0, 0, 60, 0));
        assert!(p[st].flags.contains(StateFlags::BOGUS | StateFlags::NEW));
        assert_eq!(p[st].phase, Phase::FIRST | Phase::LAST);
        sl.outdate(&mut p);
        assert!(!sl.is_empty(), "FIRST|LAST states are retained");
    }

    #[test]
    fn test_bogus_next_becomes_first() {
        let mut p = pool();
        let mut sl = StateList::new();
        let st = sl.update(&mut p, &Ev::key_aftertouch(0, 0, 60, 5));
        assert!(p[st].flags.contains(StateFlags::BOGUS));
        assert_eq!(p[st].phase, Phase::FIRST);
    }

    #[test]
    fn test_stateless_update_has_no_nesting() {
        let mut p = pool();
        let mut sl = StateList::new();
        sl.update(&mut p, &Ev::pc(0, 0, 10));
        let st = sl.update(&mut p, &Ev::pc(0, 0, 20));
        assert_eq!(p[st].phase, Phase::FIRST | Phase::LAST);
        assert!(!p[st].flags.contains(StateFlags::NESTED));
        // one state only
        assert_eq!(sl.iter(&p).count(), 1);
        assert_eq!(p[st].ev.pc_prog(), 20);
    }

    #[test]
    fn test_nested_frames_stack() {
        let mut p = pool();
        let mut sl = StateList::new();
        sl.update(&mut p, &Ev::note_on(0, 0, 60, 100));
        let nested = sl.update(&mut p, &Ev::note_on(0, 0, 60, 90));
        assert!(p[nested].flags.contains(StateFlags::NESTED));
        assert_eq!(sl.iter(&p).count(), 2);
        // the nested state is at the head, so the off matches it first
        let off = sl.update(&mut p, &Ev::note_off(0, 0, 60, 0));
        assert_eq!(off, nested);
        sl.outdate(&mut p);
        assert_eq!(sl.iter(&p).count(), 1);
    }

    #[test]
    fn test_continuous_controller_first_next() {
        let mut p = pool();
        let mut sl = StateList::new();
        let st = sl.update(&mut p, &Ev::bend(0, 0, 0x3000));
        assert_eq!(p[st].phase, Phase::FIRST);
        let st = sl.update(&mut p, &Ev::bend(0, 0, 0x3100));
        assert_eq!(p[st].phase, Phase::NEXT);
        let st = sl.update(&mut p, &Ev::bend(0, 0, EV_BEND_DEFAULT));
        assert_eq!(p[st].phase, Phase::LAST);
        sl.outdate(&mut p);
        assert!(sl.is_empty());
    }

    #[test]
    fn test_terminated_state_replaced_on_new_first() {
        let mut p = pool();
        let mut sl = StateList::new();
        sl.update(&mut p, &Ev::note_on(0, 0, 60, 100));
        sl.update(&mut p, &Ev::note_off(0, 0, 60, 0));
        // no outdate in between: the dead state is purged by the update
        let st = sl.update(&mut p, &Ev::note_on(0, 0, 60, 80));
        assert!(p[st].flags.contains(StateFlags::NEW));
        assert!(!p[st].flags.contains(StateFlags::NESTED));
        assert_eq!(sl.iter(&p).count(), 1);
    }

    #[test]
    fn test_outdate_clears_changed() {
        let mut p = pool();
        let mut sl = StateList::new();
        let st = sl.update(&mut p, &Ev::note_on(0, 0, 60, 100));
        sl.outdate(&mut p);
        assert!(!p[st].flags.contains(StateFlags::CHANGED));
    }

    #[test]
    fn test_dup_agrees_on_lookup() {
        let mut p = pool();
        let mut src = StateList::new();
        src.update(&mut p, &Ev::note_on(0, 0, 60, 100));
        src.update(&mut p, &Ev::xctl(0, 0, 7, 300));
        src.update(&mut p, &Ev::bend(0, 1, 0x2100));
        let dst = src.dup(&mut p);
        for probe in [
            Ev::note_on(0, 0, 60, 0),
            Ev::xctl(0, 0, 7, 0),
            Ev::bend(0, 1, 0),
        ] {
            let a = src.lookup(&p, &probe).map(|id| p[id]);
            let b = dst.lookup(&p, &probe).map(|id| p[id]);
            let (a, b) = (a.unwrap(), b.unwrap());
            assert_eq!(a.ev, b.ev);
            assert_eq!(a.phase, b.phase);
            assert_eq!(
                a.flags - StateFlags::CHANGED,
                b.flags - StateFlags::CHANGED
            );
        }
    }

    #[test]
    fn test_cancel_events() {
        let mut p = pool();
        let mut sl = StateList::new();
        let st = sl.update(&mut p, &Ev::note_on(0, 3, 60, 100));
        assert_eq!(
            p[st].cancel(),
            Some(Ev::note_off(0, 3, 60, EV_NOFF_DEFAULTVEL))
        );
        let st = sl.update(&mut p, &Ev::bend(1, 2, 0x3000));
        assert_eq!(p[st].cancel(), Some(Ev::bend(1, 2, EV_BEND_DEFAULT)));
        let st = sl.update(&mut p, &Ev::xctl(0, 0, 1, 900));
        assert_eq!(p[st].cancel(), Some(Ev::xctl(0, 0, 1, 0)));
        // terminated frames need nothing
        let st = sl.update(&mut p, &Ev::note_off(0, 3, 60, 0));
        assert_eq!(p[st].cancel(), None);
    }

    #[test]
    fn test_restore_events() {
        let mut p = pool();
        let mut sl = StateList::new();
        // notes are never restored
        let st = sl.update(&mut p, &Ev::note_on(0, 0, 60, 100));
        assert_eq!(p[st].restore(), None);
        // a stateless controller restores its last value
        let st = sl.update(&mut p, &Ev::xctl(0, 0, 7, 321));
        assert_eq!(p[st].restore(), Some(Ev::xctl(0, 0, 7, 321)));
        // bogus frames restore nothing
        let st = sl.update(&mut p, &Ev::key_aftertouch(0, 0, 61, 5));
        assert_eq!(p[st].restore(), None);
    }

    #[test]
    fn test_after_update_stream_no_pure_last_remains() {
        let mut p = pool();
        let mut sl = StateList::new();
        let stream = [
            Ev::note_on(0, 0, 60, 100),
            Ev::note_on(0, 0, 62, 90),
            Ev::note_off(0, 0, 60, 0),
            Ev::bend(0, 0, 0x2800),
            Ev::bend(0, 0, EV_BEND_DEFAULT),
            Ev::pc(0, 0, 3),
        ];
        for ev in &stream {
            sl.update(&mut p, ev);
        }
        sl.outdate(&mut p);
        for st in sl.iter(&p) {
            assert_ne!(st.phase, Phase::LAST);
        }
    }
}
