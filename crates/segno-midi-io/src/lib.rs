//! MIDI device I/O for the segno engine.
//!
//! Ports, their wire-level parsers and output buffers, the device
//! registry, and the poll-loop driver. Everything here is byte-level; the
//! semantic work (conversion, filtering, transport) lives in `segno-core`.

pub mod backend;
pub mod backends {
    pub mod mem;
    pub mod raw;
}
mod device;
pub mod error;
mod poll;

pub use backend::DevOps;
pub use device::{
    DevList, MidiDev, MidiIn, MidiInVec, Mode, BUFLEN, INBUFLEN, ISENSTO, OSENSTO,
};
pub use error::{Error, Result};
pub use poll::{install_sigint, request_quit, Poller, Wake, TICK_PERIOD};
