//! Range-based event selectors.
//!
//! An [`EvSpec`] names a set of events: a command class plus inclusive
//! ranges on device, channel and the value fields. Specs are the source
//! side of filter rules and the predicate used when iterating tracks or
//! state lists for serialization.

use crate::ev::{Cmd, Ev, EvFlags, EV_UNDEF};

/// Command class matched by a spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecCmd {
    /// Matches nothing.
    Empty,
    /// Matches any event.
    Any,
    /// Matches the whole note family.
    Note,
    /// Matches one specific command.
    Cmd(Cmd),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvSpec {
    pub cmd: SpecCmd,
    pub dev_min: u8,
    pub dev_max: u8,
    pub ch_min: u8,
    pub ch_max: u8,
    pub v0_min: u32,
    pub v0_max: u32,
    pub v1_min: u32,
    pub v1_max: u32,
}

impl EvSpec {
    /// Spec matching every event on every device and channel.
    pub fn any() -> EvSpec {
        EvSpec {
            cmd: SpecCmd::Any,
            dev_min: 0,
            dev_max: u8::MAX,
            ch_min: 0,
            ch_max: 15,
            v0_min: 0,
            v0_max: EV_UNDEF,
            v1_min: 0,
            v1_max: EV_UNDEF,
        }
    }

    pub fn empty() -> EvSpec {
        EvSpec {
            cmd: SpecCmd::Empty,
            ..EvSpec::any()
        }
    }

    pub fn note() -> EvSpec {
        EvSpec {
            cmd: SpecCmd::Note,
            ..EvSpec::any()
        }
    }

    pub fn cmd(cmd: Cmd) -> EvSpec {
        EvSpec {
            cmd: SpecCmd::Cmd(cmd),
            ..EvSpec::any()
        }
    }

    pub fn with_dev(mut self, min: u8, max: u8) -> EvSpec {
        self.dev_min = min;
        self.dev_max = max;
        self
    }

    pub fn with_ch(mut self, min: u8, max: u8) -> EvSpec {
        self.ch_min = min;
        self.ch_max = max;
        self
    }

    pub fn with_v0(mut self, min: u32, max: u32) -> EvSpec {
        self.v0_min = min;
        self.v0_max = max;
        self
    }

    pub fn with_v1(mut self, min: u32, max: u32) -> EvSpec {
        self.v1_min = min;
        self.v1_max = max;
        self
    }

    /// Single device/channel convenience form.
    pub fn on_chan(self, dev: u8, ch: u8) -> EvSpec {
        self.with_dev(dev, dev).with_ch(ch, ch)
    }

    pub fn matches(&self, ev: &Ev) -> bool {
        let info = ev.cmd.info();
        match self.cmd {
            SpecCmd::Empty => return false,
            SpecCmd::Any => {
                // value ranges are not meaningful across commands
                return self.matches_chan(ev, info.flags);
            }
            SpecCmd::Note => {
                if !ev.cmd.is_note() {
                    return false;
                }
            }
            SpecCmd::Cmd(c) => {
                if ev.cmd != c {
                    return false;
                }
            }
        }
        if info.nparams >= 1 && (ev.v0 < self.v0_min || ev.v0 > self.v0_max) {
            return false;
        }
        if info.nparams >= 2 && (ev.v1 < self.v1_min || ev.v1 > self.v1_max) {
            return false;
        }
        self.matches_chan(ev, info.flags)
    }

    fn matches_chan(&self, ev: &Ev, flags: EvFlags) -> bool {
        if flags.contains(EvFlags::HAS_DEV) && (ev.dev < self.dev_min || ev.dev > self.dev_max) {
            return false;
        }
        if flags.contains(EvFlags::HAS_CH) && (ev.ch < self.ch_min || ev.ch > self.ch_max) {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_any_and_empty() {
        let ev = Ev::note_on(2, 5, 60, 100);
        assert!(EvSpec::any().matches(&ev));
        assert!(!EvSpec::empty().matches(&ev));
    }

    #[test]
    fn test_note_class() {
        let spec = EvSpec::note().on_chan(0, 0);
        assert!(spec.matches(&Ev::note_on(0, 0, 60, 100)));
        assert!(spec.matches(&Ev::note_off(0, 0, 60, 0)));
        assert!(!spec.matches(&Ev::ctl(0, 0, 7, 1)));
        assert!(!spec.matches(&Ev::note_on(0, 1, 60, 100)));
    }

    #[test]
    fn test_value_ranges() {
        let spec = EvSpec::note().with_v0(60, 72);
        assert!(spec.matches(&Ev::note_on(0, 0, 60, 100)));
        assert!(spec.matches(&Ev::note_on(0, 0, 72, 100)));
        assert!(!spec.matches(&Ev::note_on(0, 0, 59, 100)));
        assert!(!spec.matches(&Ev::note_on(0, 0, 73, 100)));
    }

    #[test]
    fn test_meta_ignores_chan_ranges() {
        // tempo carries neither device nor channel
        let spec = EvSpec::cmd(Cmd::TEMPO).on_chan(9, 9);
        assert!(spec.matches(&Ev::tempo(500_000)));
    }

    #[test]
    fn test_device_range() {
        let spec = EvSpec::any().with_dev(1, 2);
        assert!(!spec.matches(&Ev::note_on(0, 0, 60, 100)));
        assert!(spec.matches(&Ev::note_on(1, 0, 60, 100)));
        assert!(spec.matches(&Ev::note_on(2, 0, 60, 100)));
    }
}
