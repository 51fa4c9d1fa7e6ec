//! In-memory loopback back-end.
//!
//! Used by the integration tests and anywhere a scripted port is handy:
//! input bytes are queued through the handle, output bytes are captured
//! for inspection. The handle and the back-end share state, so tests keep
//! the handle after the back-end has been boxed into a device.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;

use nix::libc;

use crate::backend::DevOps;

#[derive(Default)]
struct MemIo {
    input: VecDeque<u8>,
    output: Vec<u8>,
    open: bool,
    fail_reads: bool,
    fail_writes: bool,
}

pub struct MemDev {
    io: Rc<RefCell<MemIo>>,
}

/// Test-side handle to a [`MemDev`].
#[derive(Clone)]
pub struct MemHandle {
    io: Rc<RefCell<MemIo>>,
}

impl MemDev {
    pub fn new() -> (MemDev, MemHandle) {
        let io = Rc::new(RefCell::new(MemIo::default()));
        (MemDev { io: io.clone() }, MemHandle { io })
    }
}

impl MemHandle {
    /// Queue bytes to be returned by the next reads.
    pub fn push_input(&self, bytes: &[u8]) {
        self.io.borrow_mut().input.extend(bytes);
    }

    /// Take everything written so far.
    pub fn take_output(&self) -> Vec<u8> {
        std::mem::take(&mut self.io.borrow_mut().output)
    }

    pub fn output_len(&self) -> usize {
        self.io.borrow().output.len()
    }

    pub fn is_open(&self) -> bool {
        self.io.borrow().open
    }

    /// Make the next read fail, simulating a dead port.
    pub fn fail_reads(&self) {
        self.io.borrow_mut().fail_reads = true;
    }

    /// Make the next write fail.
    pub fn fail_writes(&self) {
        self.io.borrow_mut().fail_writes = true;
    }
}

impl DevOps for MemDev {
    fn open(&mut self) -> bool {
        self.io.borrow_mut().open = true;
        true
    }

    fn close(&mut self) {
        self.io.borrow_mut().open = false;
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut io = self.io.borrow_mut();
        if io.fail_reads {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "port lost"));
        }
        let mut n = 0;
        while n < buf.len() {
            match io.input.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut io = self.io.borrow_mut();
        if io.fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "port lost"));
        }
        io.output.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn nfds(&self) -> usize {
        0
    }

    fn pollfd(&self, _pfds: &mut [libc::pollfd], _events: i16) -> usize {
        0
    }

    fn revents(&self, _pfds: &[libc::pollfd]) -> i16 {
        if self.io.borrow().input.is_empty() {
            0
        } else {
            libc::POLLIN
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback() {
        let (mut dev, handle) = MemDev::new();
        assert!(dev.open());
        assert!(handle.is_open());

        handle.push_input(&[0x90, 60, 100]);
        let mut buf = [0u8; 16];
        assert_eq!(dev.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], &[0x90, 60, 100]);
        assert_eq!(dev.read(&mut buf).unwrap(), 0);

        dev.write(&[0xf8]).unwrap();
        assert_eq!(handle.take_output(), vec![0xf8]);
        assert!(handle.take_output().is_empty());
    }

    #[test]
    fn test_failure_injection() {
        let (mut dev, handle) = MemDev::new();
        dev.open();
        handle.fail_reads();
        assert!(dev.read(&mut [0u8; 4]).is_err());
    }
}
