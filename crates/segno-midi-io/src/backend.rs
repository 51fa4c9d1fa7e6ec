//! The device back-end contract.
//!
//! A back-end hides one platform's way of moving MIDI bytes: a character
//! device, a sequencer API, or an in-memory loopback. It is free to
//! multiplex its own sub-streams; the only obligations are non-blocking
//! reads and writes and honest error reporting so the caller can mark the
//! port failed.

use std::io;

use nix::libc;

pub trait DevOps {
    /// Open the underlying port. Returns false on permanent failure.
    fn open(&mut self) -> bool;

    /// Close the underlying port. Must be idempotent.
    fn close(&mut self);

    /// Read available bytes without blocking. `Ok(0)` means nothing is
    /// pending; an error is permanent and fails the device.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write bytes without blocking, returning how many were accepted.
    /// An error is permanent and fails the device.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Number of poll descriptors this back-end needs.
    fn nfds(&self) -> usize;

    /// Fill `pfds` (of length `nfds()`) with descriptors to watch for
    /// `events`; returns the number filled.
    fn pollfd(&self, pfds: &mut [libc::pollfd], events: i16) -> usize;

    /// Combined returned events from the descriptors filled above.
    fn revents(&self, pfds: &[libc::pollfd]) -> i16;
}
