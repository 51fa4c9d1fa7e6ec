//! The event-loop driver: a periodic timer descriptor, `poll(2)` over the
//! device descriptors, and the monotonic clock.
//!
//! The loop wakes on device readability or on the timer tick. On each wake
//! the caller learns which devices are readable and how much monotonic
//! time elapsed, already converted to 1/24 µs. Deltas of a second or more
//! are suspend/resume artifacts and are discarded so the timeout wheel is
//! not stormed after wake-up.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use nix::libc;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};
use smallvec::SmallVec;
use tracing::warn;

use segno_midi::defs::MAX_DEVS;

use crate::device::DevList;
use crate::error::Result;

/// Default timer period: one wake-up per millisecond.
pub const TICK_PERIOD: Duration = Duration::from_millis(1);

/// Deltas this large (1/24 µs) are discarded as suspend artifacts.
const HUGE_DELTA: u64 = 24_000_000;

static QUIT: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_sig: i32) {
    QUIT.store(true, Ordering::Relaxed);
}

/// Install the SIGINT handler that requests a clean exit. The flag is
/// consumed by [`Poller::wait`].
pub fn install_sigint() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(on_sigint),
        SaFlags::SA_RESTART,
        SigSet::all(),
    );
    unsafe { sigaction(Signal::SIGINT, &action) }?;
    Ok(())
}

/// Request a clean exit, as the signal handler would.
pub fn request_quit() {
    QUIT.store(true, Ordering::Relaxed);
}

/// Result of one wake-up.
#[derive(Debug, Default)]
pub struct Wake {
    /// Monotonic time since the previous wake, in 1/24 µs. Zero when the
    /// delta was discarded as a suspend artifact.
    pub elapsed_usec24: u32,
    /// Units whose descriptors reported input or hangup.
    pub ready: SmallVec<[usize; MAX_DEVS]>,
    /// A SIGINT arrived since the last wake.
    pub quit: bool,
}

pub struct Poller {
    timer: TimerFd,
    last: Instant,
}

impl Poller {
    pub fn new(period: Duration) -> Result<Poller> {
        let timer = TimerFd::new(
            ClockId::CLOCK_MONOTONIC,
            TimerFlags::TFD_NONBLOCK | TimerFlags::TFD_CLOEXEC,
        )?;
        timer.set(
            Expiration::Interval(TimeSpec::from_duration(period)),
            TimerSetTimeFlags::empty(),
        )?;
        Ok(Poller {
            timer,
            last: Instant::now(),
        })
    }

    /// Block until a device is readable or the timer fires.
    pub fn wait(&mut self, devs: &DevList) -> Result<Wake> {
        use std::os::fd::{AsFd, AsRawFd};

        let mut pfds: SmallVec<[libc::pollfd; MAX_DEVS + 1]> = SmallVec::new();
        pfds.push(libc::pollfd {
            fd: self.timer.as_fd().as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        });
        let mut spans: SmallVec<[(usize, usize, usize); MAX_DEVS]> = SmallVec::new();
        for dev in devs.iter() {
            if !dev.mode.contains(crate::device::Mode::IN) || dev.eof {
                continue;
            }
            let n = dev.nfds();
            if n == 0 {
                // descriptor-less back-end (loopback): readable when it
                // says so
                if dev.revents(&[]) & libc::POLLIN != 0 {
                    spans.push((dev.unit, 0, 0));
                }
                continue;
            }
            let base = pfds.len();
            pfds.resize(
                base + n,
                libc::pollfd {
                    fd: -1,
                    events: 0,
                    revents: 0,
                },
            );
            dev.pollfd(&mut pfds[base..base + n], libc::POLLIN);
            spans.push((dev.unit, base, n));
        }

        let res = unsafe { libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, -1) };
        let mut wake = Wake {
            quit: QUIT.swap(false, Ordering::Relaxed),
            ..Wake::default()
        };
        if res < 0 {
            let err = nix::errno::Errno::last();
            if err != nix::errno::Errno::EINTR {
                return Err(err.into());
            }
            // interrupted by a signal: a zero-descriptor wake
        } else {
            if pfds[0].revents & libc::POLLIN != 0 {
                // drain the expiration count
                let mut buf = [0u8; 8];
                unsafe {
                    libc::read(pfds[0].fd, buf.as_mut_ptr().cast(), buf.len());
                }
            }
            for &(unit, base, n) in &spans {
                let revents = if n == 0 {
                    libc::POLLIN
                } else {
                    devs.get(unit).map_or(0, |d| d.revents(&pfds[base..base + n]))
                };
                if revents & (libc::POLLIN | libc::POLLHUP) != 0 {
                    wake.ready.push(unit);
                }
            }
        }

        let now = Instant::now();
        let nanos = now.duration_since(self.last).as_nanos() as u64;
        self.last = now;
        let usec24 = nanos * 24 / 1000;
        if usec24 >= HUGE_DELTA {
            warn!(usec24, "ignored huge clock delta");
        } else {
            wake.elapsed_usec24 = usec24 as u32;
        }
        Ok(wake)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::mem::MemDev;
    use crate::device::{DevList, MidiDev, Mode};

    #[test]
    fn test_timer_wakes_and_reports_elapsed() {
        let devs = DevList::new();
        let mut poller = Poller::new(Duration::from_millis(1)).unwrap();
        // first wake may be nearly immediate; accumulate a few
        let mut total: u64 = 0;
        for _ in 0..5 {
            let wake = poller.wait(&devs).unwrap();
            total += wake.elapsed_usec24 as u64;
        }
        // five 1 ms periods are 120_000 units; allow generous scheduling
        // slack in both directions
        assert!(total > 24_000, "elapsed only {total}");
        assert!(total < HUGE_DELTA);
    }

    #[test]
    fn test_loopback_device_reported_ready() {
        let mut devs = DevList::new();
        let (ops, handle) = MemDev::new();
        let mut dev = MidiDev::new(0, Mode::IN | Mode::OUT, Box::new(ops));
        dev.open();
        devs.attach(dev).unwrap();
        handle.push_input(&[0xf8]);
        let mut poller = Poller::new(Duration::from_millis(1)).unwrap();
        let wake = poller.wait(&devs).unwrap();
        assert_eq!(wake.ready.as_slice(), &[0]);
    }
}
