//! Error types for the MIDI I/O subsystem.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no such device unit: {0}")]
    BadUnit(usize),

    #[error("device unit {0} is already attached")]
    UnitInUse(usize),

    #[error("poll error: {0}")]
    Poll(#[from] nix::errno::Errno),
}

pub type Result<T> = std::result::Result<T, Error>;
