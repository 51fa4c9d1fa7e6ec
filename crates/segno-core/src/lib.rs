//! The sequencer core: everything that moves MIDI events through time.
//!
//! Leaves first: fixed-capacity [`pool`]s back the real-time data
//! structures; [`track`] is the delta-timed event list used for songs and
//! runtime buffers; [`state`] tracks which frames (notes, controllers,
//! bend) are currently live; [`timeout`] schedules callbacks on the
//! 1/24 µs clock. On top of those, [`conv`] translates between wire-level
//! and context-free events, [`norm`]/[`filt`]/[`mixout`] form the input
//! and output processing chain, and [`mux`] is the transport phase
//! machine and device multiplexer tying it all together. The song layer
//! plugs in through the [`song::Song`] trait.

pub mod conv;
pub mod filt;
pub mod metro;
pub mod mixout;
pub mod mux;
pub mod norm;
pub mod pool;
pub mod song;
pub mod state;
pub mod timeout;
pub mod track;

pub use conv::{packev, unpackev, CONV_NUMREV};
pub use filt::{Filt, FiltDst, FiltRule};
pub use metro::{Metro, MetroMode};
pub use mixout::{Mixout, MIXOUT_MAXTICS, MIXOUT_TIMO, PRIO_CHAN, PRIO_INPUT, PRIO_TRACK};
pub use mux::{Mux, MuxPhase, MUX_START_DELAY};
pub use norm::Norm;
pub use pool::Pool;
pub use song::{Loc, NullSong, Song};
pub use state::{State, StateFlags, StateId, StateList, StatePool, MAXNSTATES};
pub use timeout::TimoQueue;
pub use track::{Seqev, SeqevId, SeqevPool, Track, MAXNSEQEVS};
