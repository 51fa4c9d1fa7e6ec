//! The input filter: per-channel rewrite rules.
//!
//! Rules are an ordered list of (source selector, action) pairs: the first
//! rule whose selector matches decides whether the event is dropped or
//! rewritten (device, channel, note transposition); an event matching no
//! rule passes unchanged. Frames must route consistently: once a note-on
//! is mapped by a rule, its aftertouch and note-off follow the same rule
//! even if the rule list was edited in between, which is what the embedded
//! state list is for.

use tracing::debug;

use segno_midi::{Ev, EvSpec, Phase};

use crate::state::{StateFlags, StateList, StatePool};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FiltDst {
    /// Replacement device, if any.
    pub dev: Option<u8>,
    /// Replacement channel, if any.
    pub ch: Option<u8>,
    /// Transposition applied to note numbers.
    pub keyplus: i8,
}

impl FiltDst {
    pub fn to_chan(dev: u8, ch: u8) -> FiltDst {
        FiltDst {
            dev: Some(dev),
            ch: Some(ch),
            keyplus: 0,
        }
    }

    pub fn transpose(keyplus: i8) -> FiltDst {
        FiltDst {
            dev: None,
            ch: None,
            keyplus,
        }
    }

    fn apply(&self, ev: &Ev) -> Ev {
        let mut out = *ev;
        if let Some(dev) = self.dev {
            out.dev = dev;
        }
        if let Some(ch) = self.ch {
            out.ch = ch;
        }
        if self.keyplus != 0 && out.cmd.is_note() {
            out.v0 = (out.v0 as i32 + self.keyplus as i32).clamp(0, 127) as u32;
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FiltRule {
    pub src: EvSpec,
    /// `None` drops matching events.
    pub dst: Option<FiltDst>,
}

// frame routing decisions remembered in the state tag
const TAG_PASS: u32 = 0;
const TAG_DROP: u32 = u32::MAX;

pub struct Filt {
    rules: Vec<FiltRule>,
    slist: StateList,
}

impl Default for Filt {
    fn default() -> Self {
        Self::new()
    }
}

impl Filt {
    pub fn new() -> Filt {
        Filt {
            rules: Vec::new(),
            slist: StateList::new(),
        }
    }

    pub fn add_rule(&mut self, src: EvSpec, dst: Option<FiltDst>) {
        self.rules.push(FiltRule { src, dst });
    }

    pub fn clear_rules(&mut self) {
        self.rules.clear();
    }

    pub fn rules(&self) -> &[FiltRule] {
        &self.rules
    }

    fn choose(&self, ev: &Ev) -> u32 {
        match self.rules.iter().position(|r| r.src.matches(ev)) {
            Some(i) => match self.rules[i].dst {
                Some(_) => i as u32 + 1,
                None => TAG_DROP,
            },
            None => TAG_PASS,
        }
    }

    fn route(&self, tag: u32, ev: &Ev) -> Option<Ev> {
        match tag {
            TAG_PASS => Some(*ev),
            TAG_DROP => None,
            k => match self.rules.get(k as usize - 1).and_then(|r| r.dst) {
                Some(dst) => Some(dst.apply(ev)),
                // the rule vanished mid-frame: complete the frame unmapped
                None => Some(*ev),
            },
        }
    }

    /// Filter one event. Stateless events route fresh each time; framed
    /// events remember the decision made at their first event.
    pub fn apply(&mut self, pool: &mut StatePool, ev: &Ev) -> Option<Ev> {
        if ev.phase() == Phase::FIRST | Phase::LAST {
            let tag = self.choose(ev);
            if tag == TAG_DROP {
                debug!(%ev, "dropped by rule");
            }
            return self.route(tag, ev);
        }
        let st = self.slist.update(pool, ev);
        let tag = if pool[st].flags.contains(StateFlags::NEW) {
            let tag = self.choose(ev);
            pool[st].tag = tag;
            tag
        } else {
            pool[st].tag
        };
        if tag == TAG_DROP {
            debug!(%ev, "dropped by rule");
        }
        self.route(tag, ev)
    }

    pub fn outdate(&mut self, pool: &mut StatePool) {
        self.slist.outdate(pool);
    }

    pub fn done(&mut self, pool: &mut StatePool) {
        self.slist.done(pool);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::Pool;
    use segno_midi::Cmd;

    fn pool() -> StatePool {
        Pool::new("state", 64)
    }

    #[test]
    fn test_no_rules_passes_everything() {
        let mut p = pool();
        let mut f = Filt::new();
        let ev = Ev::note_on(0, 0, 60, 100);
        assert_eq!(f.apply(&mut p, &ev), Some(ev));
    }

    #[test]
    fn test_channel_rewrite() {
        let mut p = pool();
        let mut f = Filt::new();
        f.add_rule(
            EvSpec::any().on_chan(0, 0),
            Some(FiltDst::to_chan(1, 5)),
        );
        let out = f.apply(&mut p, &Ev::note_on(0, 0, 60, 100)).unwrap();
        assert_eq!((out.dev, out.ch), (1, 5));
        // other channels untouched
        let out = f.apply(&mut p, &Ev::note_on(0, 3, 60, 100)).unwrap();
        assert_eq!((out.dev, out.ch), (0, 3));
    }

    #[test]
    fn test_drop_rule() {
        let mut p = pool();
        let mut f = Filt::new();
        f.add_rule(EvSpec::cmd(Cmd::XCTL), None);
        assert_eq!(f.apply(&mut p, &Ev::xctl(0, 0, 7, 100)), None);
        assert!(f.apply(&mut p, &Ev::note_on(0, 0, 60, 100)).is_some());
    }

    #[test]
    fn test_first_match_wins() {
        let mut p = pool();
        let mut f = Filt::new();
        f.add_rule(EvSpec::note(), Some(FiltDst::transpose(12)));
        f.add_rule(EvSpec::any(), None);
        let out = f.apply(&mut p, &Ev::note_on(0, 0, 60, 100)).unwrap();
        assert_eq!(out.note_num(), 72);
    }

    #[test]
    fn test_transpose_clamps() {
        let mut p = pool();
        let mut f = Filt::new();
        f.add_rule(EvSpec::note(), Some(FiltDst::transpose(120)));
        let out = f.apply(&mut p, &Ev::note_on(0, 0, 60, 100)).unwrap();
        assert_eq!(out.note_num(), 127);
    }

    #[test]
    fn test_frame_follows_rule_chosen_at_first() {
        let mut p = pool();
        let mut f = Filt::new();
        f.add_rule(EvSpec::note().on_chan(0, 0), Some(FiltDst::to_chan(2, 7)));
        let on = f.apply(&mut p, &Ev::note_on(0, 0, 60, 100)).unwrap();
        assert_eq!((on.dev, on.ch), (2, 7));
        // rules change while the note is held
        f.clear_rules();
        let off = f.apply(&mut p, &Ev::note_off(0, 0, 60, 0)).unwrap();
        assert_eq!((off.dev, off.ch), (2, 7), "note-off must follow the note-on");
    }

    #[test]
    fn test_drop_covers_whole_frame() {
        let mut p = pool();
        let mut f = Filt::new();
        f.add_rule(EvSpec::note().with_v0(0, 59), None);
        assert_eq!(f.apply(&mut p, &Ev::note_on(0, 0, 40, 100)), None);
        // the note-off's number is in range anyway, but the point is the
        // frame decision sticks
        assert_eq!(f.apply(&mut p, &Ev::note_off(0, 0, 40, 0)), None);
        assert!(f.apply(&mut p, &Ev::note_on(0, 0, 80, 100)).is_some());
    }

    #[test]
    fn test_stateless_rules_reconsidered_each_event() {
        let mut p = pool();
        let mut f = Filt::new();
        let pc = Ev::pc(0, 0, 10);
        f.add_rule(EvSpec::cmd(Cmd::PC), None);
        assert_eq!(f.apply(&mut p, &pc), None);
        f.clear_rules();
        assert_eq!(f.apply(&mut p, &pc), Some(pc));
    }
}
