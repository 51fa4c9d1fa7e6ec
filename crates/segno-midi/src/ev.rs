//! The uniform event record.
//!
//! Standard MIDI messages are not context free: the meaning of a data-entry
//! controller depends on the last NRPN/RPN preamble, a program change on the
//! last bank select, and the fine half of a 14-bit controller on its coarse
//! half. Dealing with that context would complicate every consumer (tracks,
//! filters, state tracking), so the engine works on self-contained events:
//! extended controllers (XCTL, 14-bit values), extended program changes
//! (XPC, with bank), NRPN/RPN, plus the plain voice messages, tempo and
//! time-signature records, and user-defined sysex pattern slots.

use core::fmt;

use bitflags::bitflags;

/// Value used where a 14-bit field is unknown (for instance an XPC with no
/// bank context).
pub const EV_UNDEF: u32 = 0xffff;

/// Velocity substituted when a note-on with velocity 0 is normalized to a
/// note-off, and when a note frame is canceled.
pub const EV_NOFF_DEFAULTVEL: u32 = 100;

/// Channel aftertouch release value.
pub const EV_CAT_DEFAULT: u32 = 0;

/// Pitch-bend center (14-bit).
pub const EV_BEND_DEFAULT: u32 = 0x2000;

/// Event command tag. An opaque index into the [`EvInfo`] table; the named
/// constants below are the complete command set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cmd(u8);

impl Cmd {
    pub const NULL: Cmd = Cmd(0);
    pub const TEMPO: Cmd = Cmd(1);
    pub const TIMESIG: Cmd = Cmd(2);
    pub const NRPN: Cmd = Cmd(3);
    pub const RPN: Cmd = Cmd(4);
    pub const XCTL: Cmd = Cmd(5);
    pub const XPC: Cmd = Cmd(6);
    pub const NOFF: Cmd = Cmd(7);
    pub const NON: Cmd = Cmd(8);
    pub const KAT: Cmd = Cmd(9);
    pub const CAT: Cmd = Cmd(10);
    pub const BEND: Cmd = Cmd(11);
    pub const PC: Cmd = Cmd(12);
    pub const CTL: Cmd = Cmd(13);

    /// First user sysex pattern slot; slots occupy `PAT0 .. PAT0 + NPAT`.
    pub const PAT0: Cmd = Cmd(16);

    /// Number of sysex pattern slots.
    pub const NPAT: usize = 16;

    /// Total size of the command space (table length).
    pub const NUM: usize = 32;

    /// Command for the given sysex pattern slot.
    #[inline]
    pub fn pat(slot: usize) -> Cmd {
        debug_assert!(slot < Self::NPAT);
        Cmd(Self::PAT0.0 + slot as u8)
    }

    /// Slot number if this is a pattern command.
    #[inline]
    pub fn pat_slot(self) -> Option<usize> {
        if self.is_sx() {
            Some((self.0 - Self::PAT0.0) as usize)
        } else {
            None
        }
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Channel voice commands, including the context-free extensions.
    #[inline]
    pub fn is_voice(self) -> bool {
        self.0 >= Self::NRPN.0 && self.0 <= Self::CTL.0
    }

    /// Note family: these three commands share one frame key.
    #[inline]
    pub fn is_note(self) -> bool {
        self.0 >= Self::NOFF.0 && self.0 <= Self::KAT.0
    }

    /// User-defined sysex pattern commands.
    #[inline]
    pub fn is_sx(self) -> bool {
        self.0 >= Self::PAT0.0 && (self.0 as usize) < Self::PAT0.0 as usize + Self::NPAT
    }

    #[inline]
    pub fn is_meta(self) -> bool {
        self == Self::TEMPO || self == Self::TIMESIG
    }

    pub fn info(self) -> &'static EvInfo {
        &EVINFO[self.index()]
    }

    pub fn name(self) -> &'static str {
        self.info().name
    }
}

bitflags! {
    /// Role of an event within its frame. A frame is the logical span
    /// bounded by a FIRST and a matching LAST event, such as a held note.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Phase: u8 {
        const FIRST = 1 << 0;
        const NEXT = 1 << 1;
        const LAST = 1 << 2;
    }
}

bitflags! {
    /// Which context-free conversions a device side has enabled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ConvFlags: u8 {
        /// Fold bank select into extended program changes.
        const XPC = 1 << 0;
        /// Assemble NRPN controller runs.
        const NRPN = 1 << 1;
        /// Assemble RPN controller runs.
        const RPN = 1 << 2;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EvFlags: u8 {
        /// The event carries a device number.
        const HAS_DEV = 1 << 0;
        /// The event carries a channel number.
        const HAS_CH = 1 << 1;
        /// `v0` discriminates the frame key (controller or parameter number).
        const KEY_V0 = 1 << 2;
    }
}

/// Static description of a command: name, parameter count, and which
/// fields it carries.
pub struct EvInfo {
    pub name: &'static str,
    pub nparams: u8,
    pub flags: EvFlags,
}

const fn ei(name: &'static str, nparams: u8, flags: EvFlags) -> EvInfo {
    EvInfo {
        name,
        nparams,
        flags,
    }
}

const DEVCH: EvFlags = EvFlags::HAS_DEV.union(EvFlags::HAS_CH);
const DEVCH_V0: EvFlags = DEVCH.union(EvFlags::KEY_V0);

static EVINFO: [EvInfo; Cmd::NUM] = [
    ei("nil", 0, EvFlags::empty()),
    ei("tempo", 1, EvFlags::empty()),
    ei("timesig", 2, EvFlags::empty()),
    ei("nrpn", 2, DEVCH_V0),
    ei("rpn", 2, DEVCH_V0),
    ei("xctl", 2, DEVCH_V0),
    ei("xpc", 2, DEVCH),
    ei("noff", 2, DEVCH),
    ei("non", 2, DEVCH),
    ei("kat", 2, DEVCH),
    ei("cat", 1, DEVCH),
    ei("bend", 1, DEVCH),
    ei("pc", 1, DEVCH),
    ei("ctl", 2, DEVCH_V0),
    ei("nil", 0, EvFlags::empty()),
    ei("nil", 0, EvFlags::empty()),
    // sysex pattern slots; parameter usage is defined by the registered
    // pattern, both value fields are reported so serializers keep them
    ei("pat0", 2, EvFlags::HAS_DEV),
    ei("pat1", 2, EvFlags::HAS_DEV),
    ei("pat2", 2, EvFlags::HAS_DEV),
    ei("pat3", 2, EvFlags::HAS_DEV),
    ei("pat4", 2, EvFlags::HAS_DEV),
    ei("pat5", 2, EvFlags::HAS_DEV),
    ei("pat6", 2, EvFlags::HAS_DEV),
    ei("pat7", 2, EvFlags::HAS_DEV),
    ei("pat8", 2, EvFlags::HAS_DEV),
    ei("pat9", 2, EvFlags::HAS_DEV),
    ei("pat10", 2, EvFlags::HAS_DEV),
    ei("pat11", 2, EvFlags::HAS_DEV),
    ei("pat12", 2, EvFlags::HAS_DEV),
    ei("pat13", 2, EvFlags::HAS_DEV),
    ei("pat14", 2, EvFlags::HAS_DEV),
    ei("pat15", 2, EvFlags::HAS_DEV),
];

/// 14-bit default value of a controller, if it has one. Controllers with a
/// default form frames (they can be canceled back to the default);
/// controllers without one are stateless.
pub fn ctl_defval(num: u32) -> Option<u32> {
    match num {
        // mod wheel
        1 => Some(0),
        // sustain pedal
        64 => Some(0),
        _ => None,
    }
}

/// A self-contained MIDI action.
///
/// `v0`/`v1` are interpreted per command, see the accessors. For tempo
/// events `v0` is the tick length in 1/24 µs; for time signatures `v0` is
/// beats per measure and `v1` ticks per beat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ev {
    pub cmd: Cmd,
    pub dev: u8,
    pub ch: u8,
    pub v0: u32,
    pub v1: u32,
}

impl Ev {
    pub fn null() -> Ev {
        Ev {
            cmd: Cmd::NULL,
            dev: 0,
            ch: 0,
            v0: 0,
            v1: 0,
        }
    }

    fn voice(cmd: Cmd, dev: u8, ch: u8, v0: u32, v1: u32) -> Ev {
        Ev {
            cmd,
            dev,
            ch,
            v0,
            v1,
        }
    }

    pub fn note_on(dev: u8, ch: u8, num: u32, vel: u32) -> Ev {
        Self::voice(Cmd::NON, dev, ch, num, vel)
    }

    pub fn note_off(dev: u8, ch: u8, num: u32, vel: u32) -> Ev {
        Self::voice(Cmd::NOFF, dev, ch, num, vel)
    }

    pub fn key_aftertouch(dev: u8, ch: u8, num: u32, val: u32) -> Ev {
        Self::voice(Cmd::KAT, dev, ch, num, val)
    }

    pub fn chan_aftertouch(dev: u8, ch: u8, val: u32) -> Ev {
        Self::voice(Cmd::CAT, dev, ch, val, 0)
    }

    /// Plain 7-bit controller as found on the wire.
    pub fn ctl(dev: u8, ch: u8, num: u32, val: u32) -> Ev {
        Self::voice(Cmd::CTL, dev, ch, num, val)
    }

    /// Extended controller; `val` is 14-bit.
    pub fn xctl(dev: u8, ch: u8, num: u32, val: u32) -> Ev {
        Self::voice(Cmd::XCTL, dev, ch, num, val)
    }

    /// Pitch bend; `val` is 14-bit, center is [`EV_BEND_DEFAULT`].
    pub fn bend(dev: u8, ch: u8, val: u32) -> Ev {
        Self::voice(Cmd::BEND, dev, ch, val, 0)
    }

    /// Plain program change as found on the wire.
    pub fn pc(dev: u8, ch: u8, prog: u32) -> Ev {
        Self::voice(Cmd::PC, dev, ch, prog, 0)
    }

    /// Extended program change; `bank` may be [`EV_UNDEF`].
    pub fn xpc(dev: u8, ch: u8, prog: u32, bank: u32) -> Ev {
        Self::voice(Cmd::XPC, dev, ch, prog, bank)
    }

    pub fn nrpn(dev: u8, ch: u8, num: u32, val: u32) -> Ev {
        Self::voice(Cmd::NRPN, dev, ch, num, val)
    }

    pub fn rpn(dev: u8, ch: u8, num: u32, val: u32) -> Ev {
        Self::voice(Cmd::RPN, dev, ch, num, val)
    }

    pub fn tempo(usec24: u32) -> Ev {
        Ev {
            cmd: Cmd::TEMPO,
            dev: 0,
            ch: 0,
            v0: usec24,
            v1: 0,
        }
    }

    pub fn timesig(beats: u32, tics: u32) -> Ev {
        Ev {
            cmd: Cmd::TIMESIG,
            dev: 0,
            ch: 0,
            v0: beats,
            v1: tics,
        }
    }

    pub fn pat(slot: usize, dev: u8, v0: u32, v1: u32) -> Ev {
        Ev {
            cmd: Cmd::pat(slot),
            dev,
            ch: 0,
            v0,
            v1,
        }
    }

    #[inline]
    pub fn note_num(&self) -> u32 {
        self.v0
    }

    #[inline]
    pub fn note_vel(&self) -> u32 {
        self.v1
    }

    #[inline]
    pub fn ctl_num(&self) -> u32 {
        self.v0
    }

    #[inline]
    pub fn ctl_val(&self) -> u32 {
        self.v1
    }

    #[inline]
    pub fn bend_val(&self) -> u32 {
        self.v0
    }

    #[inline]
    pub fn cat_val(&self) -> u32 {
        self.v0
    }

    #[inline]
    pub fn pc_prog(&self) -> u32 {
        self.v0
    }

    #[inline]
    pub fn pc_bank(&self) -> u32 {
        self.v1
    }

    #[inline]
    pub fn tempo_usec24(&self) -> u32 {
        self.v0
    }

    #[inline]
    pub fn timesig_beats(&self) -> u32 {
        self.v0
    }

    #[inline]
    pub fn timesig_tics(&self) -> u32 {
        self.v1
    }

    /// Role of this event within its frame, determined by the command and
    /// the values alone.
    pub fn phase(&self) -> Phase {
        match self.cmd {
            Cmd::NON => Phase::FIRST,
            Cmd::KAT => Phase::NEXT,
            Cmd::NOFF => Phase::LAST,
            Cmd::CAT => {
                if self.cat_val() == EV_CAT_DEFAULT {
                    Phase::LAST
                } else {
                    Phase::FIRST | Phase::NEXT
                }
            }
            Cmd::BEND => {
                if self.bend_val() == EV_BEND_DEFAULT {
                    Phase::LAST
                } else {
                    Phase::FIRST | Phase::NEXT
                }
            }
            Cmd::XCTL => match ctl_defval(self.ctl_num()) {
                Some(d) if self.ctl_val() == d => Phase::LAST,
                Some(_) => Phase::FIRST | Phase::NEXT,
                None => Phase::FIRST | Phase::LAST,
            },
            _ => Phase::FIRST | Phase::LAST,
        }
    }

    /// Whether `other` belongs to the frame keyed by `self`. The key is the
    /// command family plus its discriminating fields: note number for the
    /// note family, controller or parameter number for controllers,
    /// device/channel for voice events, the command alone for meta events.
    pub fn same_frame(&self, other: &Ev) -> bool {
        if self.cmd.is_note() {
            return other.cmd.is_note()
                && self.note_num() == other.note_num()
                && self.dev == other.dev
                && self.ch == other.ch;
        }
        if self.cmd != other.cmd {
            return false;
        }
        let info = self.cmd.info();
        if info.flags.contains(EvFlags::HAS_DEV) && self.dev != other.dev {
            return false;
        }
        if info.flags.contains(EvFlags::HAS_CH) && self.ch != other.ch {
            return false;
        }
        if info.flags.contains(EvFlags::KEY_V0) && self.v0 != other.v0 {
            return false;
        }
        true
    }
}

impl fmt::Display for Ev {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let info = self.cmd.info();
        write!(f, "{}", info.name)?;
        if info.flags.contains(EvFlags::HAS_DEV) {
            write!(f, " {}", self.dev)?;
        }
        if info.flags.contains(EvFlags::HAS_CH) {
            write!(f, " {}", self.ch)?;
        }
        if info.nparams >= 1 {
            write!(f, " {:#x}", self.v0)?;
        }
        if info.nparams >= 2 {
            write!(f, " {:#x}", self.v1)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_note_phases() {
        assert_eq!(Ev::note_on(0, 0, 60, 100).phase(), Phase::FIRST);
        assert_eq!(Ev::key_aftertouch(0, 0, 60, 10).phase(), Phase::NEXT);
        assert_eq!(Ev::note_off(0, 0, 60, 0).phase(), Phase::LAST);
    }

    #[test]
    fn test_continuous_phases() {
        assert_eq!(Ev::bend(0, 0, 0x1000).phase(), Phase::FIRST | Phase::NEXT);
        assert_eq!(Ev::bend(0, 0, EV_BEND_DEFAULT).phase(), Phase::LAST);
        assert_eq!(
            Ev::chan_aftertouch(0, 0, 30).phase(),
            Phase::FIRST | Phase::NEXT
        );
        assert_eq!(Ev::chan_aftertouch(0, 0, 0).phase(), Phase::LAST);
    }

    #[test]
    fn test_xctl_phase_depends_on_default() {
        // mod wheel has a defined default, so it forms frames
        assert_eq!(Ev::xctl(0, 0, 1, 500).phase(), Phase::FIRST | Phase::NEXT);
        assert_eq!(Ev::xctl(0, 0, 1, 0).phase(), Phase::LAST);
        // volume has no default: stateless
        assert_eq!(
            Ev::xctl(0, 0, 7, 500).phase(),
            Phase::FIRST | Phase::LAST
        );
    }

    #[test]
    fn test_stateless_phases() {
        assert_eq!(Ev::pc(0, 0, 5).phase(), Phase::FIRST | Phase::LAST);
        assert_eq!(Ev::tempo(500_000).phase(), Phase::FIRST | Phase::LAST);
        assert_eq!(Ev::nrpn(0, 0, 0x82, 100).phase(), Phase::FIRST | Phase::LAST);
    }

    #[test]
    fn test_note_family_shares_a_key() {
        let on = Ev::note_on(0, 3, 60, 100);
        assert!(on.same_frame(&Ev::note_off(0, 3, 60, 0)));
        assert!(on.same_frame(&Ev::key_aftertouch(0, 3, 60, 5)));
        assert!(!on.same_frame(&Ev::note_off(0, 3, 61, 0)));
        assert!(!on.same_frame(&Ev::note_off(0, 4, 60, 0)));
        assert!(!on.same_frame(&Ev::note_off(1, 3, 60, 0)));
    }

    #[test]
    fn test_controller_key_includes_number() {
        let a = Ev::xctl(0, 0, 1, 100);
        assert!(a.same_frame(&Ev::xctl(0, 0, 1, 200)));
        assert!(!a.same_frame(&Ev::xctl(0, 0, 2, 100)));
        assert!(!a.same_frame(&Ev::ctl(0, 0, 1, 100)));
    }

    #[test]
    fn test_meta_key_is_command_only() {
        assert!(Ev::tempo(500_000).same_frame(&Ev::tempo(250_000)));
        assert!(!Ev::tempo(500_000).same_frame(&Ev::timesig(4, 24)));
    }

    #[test]
    fn test_classification() {
        assert!(Ev::note_on(0, 0, 60, 1).cmd.is_voice());
        assert!(Ev::ctl(0, 0, 7, 1).cmd.is_voice());
        assert!(!Ev::tempo(500_000).cmd.is_voice());
        assert!(Ev::pat(0, 0, 0, 0).cmd.is_sx());
        assert!(Cmd::pat(15).is_sx());
        assert_eq!(Cmd::pat(3).pat_slot(), Some(3));
        assert_eq!(Cmd::NON.pat_slot(), None);
    }
}
