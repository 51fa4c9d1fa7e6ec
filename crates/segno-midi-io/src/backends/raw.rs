//! Raw character-device back-end (`/dev/midiN`, `/dev/snd/midi...`).

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;

use nix::libc;
use tracing::warn;

use crate::backend::DevOps;
use crate::device::Mode;

pub struct RawDev {
    path: PathBuf,
    mode: Mode,
    file: Option<File>,
}

impl RawDev {
    pub fn new(path: impl Into<PathBuf>, mode: Mode) -> RawDev {
        RawDev {
            path: path.into(),
            mode,
            file: None,
        }
    }
}

fn ignore_wouldblock(res: io::Result<usize>) -> io::Result<usize> {
    match res {
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
        other => other,
    }
}

impl DevOps for RawDev {
    fn open(&mut self) -> bool {
        let res = File::options()
            .read(self.mode.contains(Mode::IN))
            .write(self.mode.contains(Mode::OUT))
            .custom_flags(libc::O_NONBLOCK)
            .open(&self.path);
        match res {
            Ok(f) => {
                self.file = Some(f);
                true
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to open midi device");
                false
            }
        }
    }

    fn close(&mut self) {
        self.file = None;
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.file.as_mut() {
            Some(f) => ignore_wouldblock(f.read(buf)),
            None => Ok(0),
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.file.as_mut() {
            Some(f) => ignore_wouldblock(f.write(buf)),
            None => Ok(buf.len()),
        }
    }

    fn nfds(&self) -> usize {
        usize::from(self.file.is_some())
    }

    fn pollfd(&self, pfds: &mut [libc::pollfd], events: i16) -> usize {
        match self.file.as_ref() {
            Some(f) => {
                pfds[0] = libc::pollfd {
                    fd: f.as_raw_fd(),
                    events,
                    revents: 0,
                };
                1
            }
            None => 0,
        }
    }

    fn revents(&self, pfds: &[libc::pollfd]) -> i16 {
        pfds.first().map_or(0, |p| p.revents)
    }
}
