//! Context-free MIDI event model.
//!
//! This crate defines the event vocabulary shared by the whole engine: the
//! uniform [`Ev`] record with its command table and frame phases, range
//! selectors ([`EvSpec`]), user sysex patterns ([`EvPat`]), the MTC
//! quarter-frame parser, and the protocol constants and time units.

pub mod defs;
mod ev;
mod evspec;
pub mod mtc;
mod pattern;

pub use ev::{
    ctl_defval, Cmd, ConvFlags, Ev, EvFlags, EvInfo, Phase, EV_BEND_DEFAULT, EV_CAT_DEFAULT,
    EV_NOFF_DEFAULTVEL, EV_UNDEF,
};
pub use mtc::{FrameRate, MtcOut, MtcParser, MtcState, MTC_PERIOD, MTC_SEC};
pub use evspec::{EvSpec, SpecCmd};
pub use pattern::{EvPat, PatError, PatSet, PatTok};
